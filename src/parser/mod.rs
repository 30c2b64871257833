//! Command-level parsing: tokens group into an opcode, an optional resolved
//! symbol, and up to four operands. `if`/`while` additionally parse a
//! `op1 relop op2` comparison ahead of their block.

use crate::error::EngineError;
use crate::lexer::{token, ByteStream};
use crate::operand::{parse_operand, Operand};
use crate::symtab::{Symbol, SymbolTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relop {
    Eq,
    Ne,
    Lt,
    Gt,
    LtEq,
    GtEq,
    LtU,
    GtU,
    LtEqU,
    GtEqU,
    CmpNz,
}

pub fn parse_relop(tok: Option<&str>) -> Relop {
    match tok {
        Some("==") => Relop::Eq,
        Some("!=") => Relop::Ne,
        Some("<") => Relop::Lt,
        Some(">") => Relop::Gt,
        Some("<=") => Relop::LtEq,
        Some(">=") => Relop::GtEq,
        Some("u<") => Relop::LtU,
        Some("u>") => Relop::GtU,
        Some("u<=") => Relop::LtEqU,
        Some("u>=") => Relop::GtEqU,
        _ => Relop::CmpNz,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Compare {
    pub op1: Operand,
    pub rel: Relop,
    pub op2: Operand,
}

/// Reads `op1 relop op2`. If `op2` isn't a register and the relop wasn't
/// explicit, the whole comparison is invalidated — a bare `if r0` is the
/// only form allowed to skip `op2`.
pub fn parse_comparison(src: &mut dyn ByteStream, symtab: &SymbolTable) -> Result<Compare, EngineError> {
    let t1 = token(src)?;
    let op1 = parse_operand(t1.as_deref(), symtab);
    let t2 = token(src)?;
    let rel = parse_relop(t2.as_deref());
    let t3 = token(src)?;
    let op2 = parse_operand(t3.as_deref(), symtab);

    let op1 = if !op2.is_register() && rel != Relop::CmpNz {
        Operand::Invalid
    } else {
        op1
    };

    Ok(Compare { op1, rel, op2 })
}

#[derive(Debug, Clone)]
pub struct Command {
    pub opcode: String,
    pub sym: Option<Symbol>,
    pub operand: [Operand; 4],
}

/// Read up to `n` operand tokens. Exposed beyond this module for the
/// `define`/`var`/`array`/`const` immediate words, whose own argument list
/// has the same shape as a command's.
pub(crate) fn parse_operands(src: &mut dyn ByteStream, symtab: &SymbolTable, n: usize) -> Result<[Operand; 4], EngineError> {
    let mut operand = [Operand::Invalid; 4];
    for slot in operand.iter_mut().take(n) {
        if let Some(t) = token(src)? {
            *slot = parse_operand(Some(&t), symtab);
        }
    }
    Ok(operand)
}

/// Read one command: an opcode, its resolved symbol (if any), and — unless
/// the opcode is an immediate word, which takes no operands — up to four
/// operands terminated by a newline.
///
/// A blank line is silently skipped. Garbage trailing a well-formed operand
/// list is reported and the rest of the line is discarded, matching the
/// "Bad command" recovery in the original reader loop.
pub fn parse_command(src: &mut dyn ByteStream, symtab: &SymbolTable) -> Result<Command, EngineError> {
    let opcode = match token(src)? {
        Some(t) => t,
        None => {
            // token() only returns an empty token when it immediately hit
            // the line terminator; re-reading it here distinguishes a
            // blank line (just keep going) from anything else.
            return match src.getchar() {
                Some(b'\n') => parse_command(src, symtab),
                _ => Err(EngineError::UnexpectedEof),
            };
        }
    };

    let sym = symtab.lookup(&opcode).cloned();
    if let Some(s) = &sym {
        if s.kind == crate::symtab::SymKind::WordPtr {
            return Ok(Command {
                opcode,
                sym: Some(s.clone()),
                operand: [Operand::Invalid; 4],
            });
        }
    }

    let operand = parse_operands(src, symtab, 4)?;
    crate::lexer::skip_whitespace(src)?;

    match src.getchar() {
        Some(b'\n') => {}
        None => return Err(EngineError::UnexpectedEof),
        Some(_) => {
            crate::error::report("Bad command");
            crate::lexer::skip_until_newline(src)?;
            return parse_command(src, symtab);
        }
    }

    Ok(Command { opcode, sym, operand })
}

/// Scan a PREFIX of register operands only, matching the original's
/// early-exit-on-first-non-register scan.
pub fn get_clobbers(cmd: &Command) -> u8 {
    let mut clobbers = 0u8;
    for op in &cmd.operand {
        match op {
            Operand::Register(r) => clobbers |= 1 << r,
            _ => break,
        }
    }
    clobbers
}
