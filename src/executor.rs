//! Dispatches a compiled address to whichever backend produced it.

use crate::engine::Engine;

pub fn enter(engine: &mut Engine, start: u32) {
    #[cfg(target_arch = "aarch64")]
    crate::encoder::native::enter(engine, start);

    #[cfg(not(target_arch = "aarch64"))]
    crate::encoder::vm::vm_exec(engine, start);
}
