//! Byte-stream tokenizer.
//!
//! Tokens are maximal runs of non-separator bytes (space, tab, comma,
//! newline, EOF are separators; `#` introduces a line comment). Quoted
//! tokens (`"…"` strings, `'c'` characters) are collected verbatim,
//! including their delimiters — unescaping is the job of whoever binds the
//! token to an [`crate::operand::Operand`] or a `string` literal, not the
//! lexer.

pub mod cursor;

pub use cursor::SliceSource;

use crate::error::EngineError;
use std::io::Read;

/// Anything that can hand back one byte at a time with one byte of
/// pushback, matching `getchar()`/`ungetc()` over stdin.
pub trait ByteStream {
    fn getchar(&mut self) -> Option<u8>;
    fn ungetc(&mut self, b: u8);
}

/// Wraps a buffered reader (normally locked stdin) with a single-byte
/// pushback slot.
pub struct ByteSource<R: Read> {
    inner: R,
    pushback: Option<u8>,
}

impl<R: Read> ByteSource<R> {
    pub fn new(inner: R) -> Self {
        ByteSource {
            inner,
            pushback: None,
        }
    }
}

impl<R: Read> ByteStream for ByteSource<R> {
    fn getchar(&mut self) -> Option<u8> {
        if let Some(b) = self.pushback.take() {
            return Some(b);
        }
        let mut buf = [0u8; 1];
        match self.inner.read(&mut buf) {
            Ok(1) => Some(buf[0]),
            _ => None,
        }
    }

    fn ungetc(&mut self, b: u8) {
        debug_assert!(self.pushback.is_none(), "pushback slot already occupied");
        self.pushback = Some(b);
    }
}

fn is_whitespace(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b',')
}

fn is_separator(c: Option<u8>) -> bool {
    match c {
        None => true,
        Some(b) => matches!(b, b' ' | b'\t' | b',' | b'\n'),
    }
}

/// Consume bytes up to and including the next `\n`.
pub fn skip_until_newline(src: &mut dyn ByteStream) -> Result<(), EngineError> {
    loop {
        match src.getchar() {
            None => return Err(EngineError::UnexpectedEof),
            Some(b'\n') => return Ok(()),
            Some(_) => continue,
        }
    }
}

/// Skip spaces/tabs/commas; a `#` starts a line comment, consumed up to
/// (not including) the terminating `\n`, which is then pushed back so it
/// still acts as a command terminator.
pub fn skip_whitespace(src: &mut dyn ByteStream) -> Result<(), EngineError> {
    loop {
        let c = src.getchar().ok_or(EngineError::UnexpectedEof)?;
        if is_whitespace(c) {
            continue;
        }
        if c == b'#' {
            skip_until_newline(src)?;
            src.ungetc(b'\n');
        } else {
            src.ungetc(c);
        }
        return Ok(());
    }
}

fn lex_quoted(src: &mut dyn ByteStream, quote: u8) -> Result<Vec<u8>, EngineError> {
    let mut buf = vec![quote];
    loop {
        let c = src.getchar().ok_or(EngineError::UnexpectedEof)?;
        buf.push(c);
        if c == b'\\' {
            let esc = src.getchar().ok_or(EngineError::UnexpectedEof)?;
            buf.push(esc);
            continue;
        }
        if c == quote {
            return Ok(buf);
        }
    }
}

/// Read the next token, or `None` for a blank line (the terminating `\n` is
/// pushed back, not consumed). Bounded to 31 bytes, matching the fixed
/// opcode/token buffer; excess bytes are simply dropped, not an error.
pub fn token(src: &mut dyn ByteStream) -> Result<Option<String>, EngineError> {
    skip_whitespace(src)?;

    match src.getchar().ok_or(EngineError::UnexpectedEof)? {
        b'"' => {
            let bytes = lex_quoted(src, b'"')?;
            return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
        }
        b'\'' => {
            let bytes = lex_quoted(src, b'\'')?;
            return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
        }
        b => src.ungetc(b),
    }

    let mut buf = Vec::new();
    loop {
        let c = src.getchar().ok_or(EngineError::UnexpectedEof)?;
        if is_separator(Some(c)) {
            src.ungetc(c);
            break;
        }
        if buf.len() < 31 {
            buf.push(c);
        }
    }

    if buf.is_empty() {
        Ok(None)
    } else {
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }
}

/// Strip the surrounding quotes from a `"…"` token and apply the string
/// literal's escape rule: `\"` becomes `"`; any other `\x` keeps both the
/// backslash and `x` verbatim.
pub fn unescape_string_literal(tok: &str) -> Vec<u8> {
    let body = tok.strip_prefix('"').and_then(|s| s.strip_suffix('"')).unwrap_or(tok);
    let mut out = Vec::new();
    let mut bytes = body.bytes().peekable();
    while let Some(b) = bytes.next() {
        if b == b'\\' {
            if let Some(&next) = bytes.peek() {
                bytes.next();
                if next == b'"' {
                    out.push(b'"');
                } else {
                    out.push(b'\\');
                    out.push(next);
                }
                continue;
            }
            out.push(b'\\');
        } else {
            out.push(b);
        }
    }
    out
}

#[cfg(test)]
mod inline_tests {
    use super::*;

    #[test]
    fn tokens_are_separated_by_whitespace_and_commas() {
        let mut src = SliceSource::from_str("add r0, r1 r2\n");
        assert_eq!(token(&mut src).unwrap().as_deref(), Some("add"));
        assert_eq!(token(&mut src).unwrap().as_deref(), Some("r0"));
        assert_eq!(token(&mut src).unwrap().as_deref(), Some("r1"));
        assert_eq!(token(&mut src).unwrap().as_deref(), Some("r2"));
    }

    #[test]
    fn hash_starts_a_line_comment() {
        let mut src = SliceSource::from_str("add # a comment\nr0\n");
        assert_eq!(token(&mut src).unwrap().as_deref(), Some("add"));
        assert_eq!(token(&mut src).unwrap().as_deref(), Some("r0"));
    }

    #[test]
    fn blank_line_yields_none_without_consuming_the_newline_twice() {
        let mut src = SliceSource::from_str("\nadd\n");
        assert_eq!(token(&mut src).unwrap(), None);
        assert_eq!(src.getchar(), Some(b'\n'));
        assert_eq!(token(&mut src).unwrap().as_deref(), Some("add"));
    }

    #[test]
    fn quoted_string_is_returned_with_delimiters() {
        let mut src = SliceSource::from_str("\"hi there\" rest\n");
        assert_eq!(token(&mut src).unwrap().as_deref(), Some("\"hi there\""));
    }

    #[test]
    fn escaped_quote_does_not_terminate_the_string() {
        let mut src = SliceSource::from_str("\"he said \\\"hi\\\"\"\n");
        let tok = token(&mut src).unwrap().unwrap();
        assert_eq!(unescape_string_literal(&tok), b"he said \"hi\"");
    }

    #[test]
    fn mid_token_eof_is_fatal() {
        let mut src = SliceSource::from_str("add");
        assert!(matches!(token(&mut src), Err(EngineError::UnexpectedEof)));
    }
}
