//! An in-memory [`ByteStream`] over a byte slice, for tests and any
//! non-stdin input.

use super::ByteStream;

pub struct SliceSource<'a> {
    bytes: &'a [u8],
    pos: usize,
    pushback: Option<u8>,
}

impl<'a> SliceSource<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        SliceSource {
            bytes,
            pos: 0,
            pushback: None,
        }
    }

    pub fn from_str(s: &'a str) -> Self {
        Self::new(s.as_bytes())
    }
}

impl ByteStream for SliceSource<'_> {
    fn getchar(&mut self) -> Option<u8> {
        if let Some(b) = self.pushback.take() {
            return Some(b);
        }
        let b = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn ungetc(&mut self, b: u8) {
        debug_assert!(self.pushback.is_none(), "pushback slot already occupied");
        self.pushback = Some(b);
    }
}
