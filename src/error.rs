//! Error types for the engine.
//!
//! Mirrors the fatal/recoverable split used throughout the interpreter loop:
//! anything that would leave compiled code in an inconsistent state is
//! fatal; anything line-local (a bad command, an unresolved symbol at top
//! level) is reported and the read loop simply continues.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Cannot allocate core memory")]
    CoreAllocationFailed,

    #[error("arena exhausted")]
    ArenaExhausted,

    #[error("Unexpected end of file")]
    UnexpectedEof,

    #[error("bad operand in if/while: expected a register")]
    BadConditionOperand,

    #[error("unknown symbol '{0}' inside a block")]
    UnknownSymbolInBlock(String),

    #[error("'end'/'else' with nothing open")]
    UnmatchedEnd,

    #[error("Assertion failed: 0x{a:x} != 0x{b:x}")]
    AssertionFailed { a: u32, b: u32 },
}

/// Report a line-local, recoverable diagnostic: printed to stderr (matching
/// the language's own error channel) and logged at `warn` so it also shows
/// up under `RUST_LOG=debug` tooling.
pub fn report(msg: &str) {
    eprintln!("{msg}");
    log::warn!("{msg}");
}

/// Print a fatal diagnostic and terminate the process, matching `die()`.
pub fn die(err: &EngineError) -> ! {
    log::error!("{err}");
    eprintln!("{err}");
    std::process::exit(1);
}
