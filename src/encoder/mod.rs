//! Code-emission backend abstraction.
//!
//! `Backend` covers only pure code generation — turning a [`Command`] or
//! [`Compare`] into words written to the arena. Running the generated code
//! (`enter`/`exec`) and disassembling it live outside the trait: both need
//! `&mut Engine` in ways that don't fit a trait object cleanly (the native
//! backend reaches the engine through a thread-local, the VM backend takes
//! it as a plain argument), so they're free functions dispatched by
//! [`crate::executor`] instead.

pub mod vm;

#[cfg(target_arch = "aarch64")]
pub mod native;

use crate::arena::Arena;
use crate::error::EngineError;
use crate::parser::{Command, Compare};
use crate::symtab::SymKind;

/// Address of the branch instruction an `if`/`while` needs patched once its
/// target is known.
pub type Fixup = u32;

pub trait Backend {
    /// Save clobbered registers, wire up argument registers, build a frame.
    fn assemble_preamble(&self, arena: &mut Arena, ip: u32, cmd: &Command, clobbers: u8) -> Result<u32, EngineError>;
    /// Move a call's operands into argument slots, emit the call/exec, move
    /// the result back.
    fn assemble_word(&self, arena: &mut Arena, ip: u32, word: &Command) -> Result<u32, EngineError>;
    fn assemble_postamble(&self, arena: &mut Arena, ip: u32, cmd: &Command, clobbers: u8) -> Result<u32, EngineError>;
    fn assemble_ret(&self, arena: &mut Arena, ip: u32) -> Result<u32, EngineError>;
    fn assemble_if(&self, arena: &mut Arena, ip: u32, cmp: &Compare) -> Result<(u32, Fixup), EngineError>;
    fn assemble_else(&self, arena: &mut Arena, ip: u32, fixup: Fixup) -> Result<(u32, Fixup), EngineError>;
    fn assemble_while(&self, arena: &mut Arena, ip: u32, cmp: &Compare) -> Result<(u32, Fixup), EngineError> {
        self.assemble_if(arena, ip, cmp)
    }
    fn assemble_endwhile(&self, arena: &mut Arena, ip: u32, fixup: Fixup) -> Result<u32, EngineError>;
    fn fixup_if(&self, arena: &mut Arena, ip: u32, fixup: Fixup);
}

pub(crate) fn sym_call_target(sym: &crate::symtab::Symbol) -> u32 {
    debug_assert!(matches!(
        sym.kind,
        SymKind::FuncPtr | SymKind::WordPtr | SymKind::ExecPtr
    ));
    sym.value
}

#[cfg(target_arch = "aarch64")]
pub type ActiveBackend = native::NativeBackend;
#[cfg(not(target_arch = "aarch64"))]
pub type ActiveBackend = vm::VmBackend;
