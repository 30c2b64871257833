//! # eigth
//!
//! An interactive, on-the-fly JIT compiler and runtime for a stack-free,
//! register-oriented command language. Each line read is compiled straight
//! into machine code (native AArch64, or a portable bytecode interpreter
//! everywhere else) and, outside of a `define` body, run immediately.
//!
//! ## Pipeline
//!
//! 1. **Lexer** — splits a line into whitespace/comma-separated tokens.
//! 2. **Parser** — groups tokens into a command: an opcode, its resolved
//!    symbol, and up to four operands.
//! 3. **Engine** — dispatches the command: `WordPtr` immediates (`define`,
//!    `if`, `while`, `var`, ...) run at parse time; everything else is
//!    compiled by the active [`encoder::Backend`] and, at top level, run.
//! 4. **Executor** — hands a compiled address to the backend that produced
//!    it.
//!
//! ```rust,no_run
//! use eigth::engine::Engine;
//! use eigth::lexer::ByteSource;
//!
//! let stdin = std::io::stdin();
//! let mut engine = Engine::new(Box::new(ByteSource::new(stdin.lock()))).unwrap();
//! engine.run();
//! ```

pub mod arena;
pub mod debug;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod executor;
pub mod lexer;
pub mod operand;
pub mod ops;
pub mod parser;
pub mod regset;
pub mod symtab;
