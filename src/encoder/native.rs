//! Native AArch64 code generator.
//!
//! Each compiled word is a normal AArch64 function reachable with `bl`, so
//! calls to host ops go straight to a real function pointer rather than
//! through an index table — but that means host ops need a conventional
//! `extern "C"` signature, which can't carry a `&mut Engine`. Each op is
//! wrapped in a small trampoline that recovers the currently-running
//! engine from a thread-local, mirroring the file-static `memp`/`regs`
//! globals the original C runtime relies on for the same reason.

use super::{Backend, Fixup};
use crate::arena::Arena;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::operand::Operand;
use crate::parser::{Command, Compare, Relop};
use crate::regset::RegisterFile;
use std::cell::RefCell;

fn reg(x: u32) -> u32 {
    if x < 8 {
        x + 19
    } else if x < 12 {
        x - 8
    } else {
        31
    }
}

fn arg(x: u32) -> u32 {
    x
}

fn bits(val: u32, width: u32, shift: u32) -> u32 {
    (((1u32 << width) - 1) & val) << shift
}

const XFP: u32 = 29;
const XLR: u32 = 30;
const XSP: u32 = 31;
const WZR: u32 = 31;

#[derive(Clone, Copy)]
#[allow(dead_code)]
enum Cond {
    Eq = 0,
    Ne = 1,
    Lt = 11,
    Gt = 12,
    Le = 13,
    Ge = 10,
    Lo = 3,
    Hs = 2,
    Ls = 9,
    Hi = 8,
    Al = 14,
}

fn op_b(offset: u32) -> u32 {
    0x14000000 | bits(offset, 26, 0)
}
fn op_b_cond(cond: u32, offset: u32) -> u32 {
    0x54000000 | bits(offset, 19, 5) | bits(cond, 4, 0)
}
fn op_bl(offset: u32) -> u32 {
    0x94000000 | bits(offset, 26, 0)
}
fn op_subs_reg_w(rd: u32, rn: u32, rm: u32) -> u32 {
    0x6b000000 | bits(rm, 5, 16) | bits(rn, 5, 5) | bits(rd, 5, 0)
}
fn op_cmp_reg_w(rn: u32, rm: u32) -> u32 {
    op_subs_reg_w(WZR, rn, rm)
}
fn op_ldp_post_x(rt: u32, rt2: u32, rn: u32, imm7: u32) -> u32 {
    0xa8c00000 | bits(imm7, 7, 15) | bits(rt2, 5, 10) | bits(rn, 5, 5) | bits(rt, 5, 0)
}
fn op_stp_pre_x(rt: u32, rt2: u32, rn: u32, imm7: u32) -> u32 {
    0xa9800000 | bits(imm7, 7, 15) | bits(rt2, 5, 10) | bits(rn, 5, 5) | bits(rt, 5, 0)
}
fn op_ldr_post_w(rt: u32, rn: u32, imm9: u32) -> u32 {
    0xb8400400 | bits(imm9, 9, 12) | bits(rn, 5, 5) | bits(rt, 5, 0)
}
fn op_str_pre_w(rt: u32, rn: u32, imm9: u32) -> u32 {
    0xb8000c00 | bits(imm9, 9, 12) | bits(rn, 5, 5) | bits(rt, 5, 0)
}
fn op_add_imm_x(rt: u32, rn: u32, imm12: u32) -> u32 {
    0x91000000 | bits(imm12, 12, 10) | bits(rn, 5, 5) | bits(rt, 5, 0)
}
fn op_mov_sp(rd: u32, rn: u32) -> u32 {
    op_add_imm_x(rd, rn, 0)
}
fn op_movz_w(rd: u32, imm16: u32, lsl: u32) -> u32 {
    0x52800000 | bits(lsl >> 4, 2, 21) | bits(imm16, 16, 5) | bits(rd, 5, 0)
}
fn op_movk_w(rd: u32, imm16: u32, lsl: u32) -> u32 {
    0x72800000 | bits(lsl >> 4, 2, 21) | bits(imm16, 16, 5) | bits(rd, 5, 0)
}
fn op_mov_imm_w(rd: u32, imm16: u32) -> u32 {
    op_movz_w(rd, imm16, 0)
}
fn op_orr_reg_w(rt: u32, rn: u32, rm: u32, shift: u32, imm6: u32) -> u32 {
    0x2a000000 | bits(shift, 2, 22) | bits(rm, 5, 16) | bits(imm6, 6, 10) | bits(rn, 5, 5) | bits(rt, 5, 0)
}
fn op_mov_reg_w(rd: u32, rn: u32) -> u32 {
    op_orr_reg_w(rd, rn, WZR, 0, 0)
}
fn op_ret(rn: u32) -> u32 {
    0xd65f0000 | bits(rn, 5, 5)
}

fn translate_condition_code(rel: Relop) -> u32 {
    match rel {
        Relop::Eq => Cond::Eq as u32,
        Relop::Ne => Cond::Ne as u32,
        Relop::Lt => Cond::Lt as u32,
        Relop::Gt => Cond::Gt as u32,
        Relop::LtEq => Cond::Le as u32,
        Relop::GtEq => Cond::Ge as u32,
        Relop::LtU => Cond::Lo as u32,
        Relop::GtU => Cond::Hi as u32,
        Relop::LtEqU => Cond::Ls as u32,
        Relop::GtEqU => Cond::Hs as u32,
        Relop::CmpNz => Cond::Al as u32,
    }
}

fn reg_value(op: Operand) -> u32 {
    match op {
        Operand::Register(r) => reg(r as u32),
        other => unreachable!("comparison operand must be a register, got {other:?}"),
    }
}

pub struct NativeBackend;

impl NativeBackend {
    fn emit(arena: &mut Arena, ip: u32, word: u32) -> Result<u32, EngineError> {
        arena.write(ip, word);
        Ok(ip + 4)
    }

    fn assemble_prologue(arena: &mut Arena, ip: u32, narg: u32, op: Operand) -> Result<u32, EngineError> {
        match op {
            Operand::Register(r) => Self::emit(arena, ip, op_mov_reg_w(arg(narg), reg(r as u32))),
            Operand::Immediate(v) => {
                let mut ip = Self::emit(arena, ip, op_mov_imm_w(arg(narg), v & 0xffff))?;
                if v >> 16 != 0 {
                    ip = Self::emit(arena, ip, op_movk_w(arg(narg), (v >> 16) & 0xffff, 16))?;
                }
                Ok(ip)
            }
            Operand::Argument(n) => Self::emit(arena, ip, op_mov_reg_w(arg(narg), arg(n as u32))),
            Operand::Invalid => {
                unreachable!("invalid operand reached call-site code generation")
            }
        }
    }

    fn assemble_epilogue(arena: &mut Arena, ip: u32, op: Operand) -> Result<u32, EngineError> {
        match op {
            Operand::Register(r) => Self::emit(arena, ip, op_mov_reg_w(reg(r as u32), arg(0))),
            _ => Ok(ip),
        }
    }
}

impl Backend for NativeBackend {
    fn assemble_preamble(&self, arena: &mut Arena, ip: u32, cmd: &Command, clobbers: u8) -> Result<u32, EngineError> {
        let mut clobbers = clobbers;
        for op in &cmd.operand {
            match op {
                Operand::Register(r) => clobbers |= 1 << r,
                _ => break,
            }
        }

        let mut ip = ip;
        for i in 0..8u32 {
            if clobbers & (1 << i) != 0 {
                ip = Self::emit(arena, ip, op_str_pre_w(reg(i), XSP, (-16i32) as u32 & 0x1ff))?;
            }
        }
        ip = Self::emit(arena, ip, op_stp_pre_x(XFP, XLR, XSP, (-2i32) as u32 & 0x7f))?;
        ip = Self::emit(arena, ip, op_mov_sp(XFP, XSP))?;

        for (i, op) in cmd.operand.iter().enumerate() {
            match op {
                Operand::Register(r) => ip = Self::emit(arena, ip, op_mov_reg_w(reg(*r as u32), arg(i as u32)))?,
                _ => break,
            }
        }
        Ok(ip)
    }

    fn assemble_word(&self, arena: &mut Arena, ip: u32, word: &Command) -> Result<u32, EngineError> {
        let sym = word
            .sym
            .as_ref()
            .expect("assemble_word requires a resolved symbol");

        let mut ip = ip;
        for (narg, op) in word.operand.iter().enumerate() {
            if matches!(op, Operand::Invalid) {
                break;
            }
            ip = Self::assemble_prologue(arena, ip, narg as u32, *op)?;
        }

        debug_assert!(matches!(
            sym.kind,
            crate::symtab::SymKind::FuncPtr | crate::symtab::SymKind::ExecPtr
        ));
        // For both kinds `value` is a real callable address: an `ExecPtr`'s
        // own compiled entry point, or a `FuncPtr`'s trampoline address (see
        // `ops::rebind_native_symbols`).
        let offset = sym.value.wrapping_sub(ip).wrapping_div(4);
        ip = Self::emit(arena, ip, op_bl(offset))?;

        Self::assemble_epilogue(arena, ip, word.operand[0])
    }

    fn assemble_postamble(&self, arena: &mut Arena, ip: u32, cmd: &Command, clobbers: u8) -> Result<u32, EngineError> {
        let mut clobbers = clobbers;
        for op in &cmd.operand {
            match op {
                Operand::Register(r) => clobbers |= 1 << r,
                _ => break,
            }
        }

        let mut ip = ip;
        if let Operand::Register(r) = cmd.operand[0] {
            ip = Self::emit(arena, ip, op_mov_reg_w(arg(0), reg(r as u32)))?;
        }
        ip = Self::emit(arena, ip, op_ldp_post_x(XFP, XLR, XSP, 2))?;
        for i in (0..8u32).rev() {
            if clobbers & (1 << i) != 0 {
                ip = Self::emit(arena, ip, op_ldr_post_w(reg(i), XSP, 16))?;
            }
        }
        self.assemble_ret(arena, ip)
    }

    fn assemble_ret(&self, arena: &mut Arena, ip: u32) -> Result<u32, EngineError> {
        Self::emit(arena, ip, op_ret(XLR))
    }

    fn assemble_if(&self, arena: &mut Arena, ip: u32, cmp: &Compare) -> Result<(u32, Fixup), EngineError> {
        if cmp.rel == Relop::CmpNz {
            let ip = Self::emit(arena, ip, op_cmp_reg_w(reg_value(cmp.op1), WZR))?;
            let fixup = ip;
            let ip = Self::emit(arena, ip, op_b_cond(Cond::Eq as u32, 0))?;
            Ok((ip, fixup))
        } else {
            let ip = Self::emit(arena, ip, op_cmp_reg_w(reg_value(cmp.op1), reg_value(cmp.op2)))?;
            let fixup = ip;
            let ip = Self::emit(arena, ip, op_b_cond(translate_condition_code(cmp.rel) ^ 1, 0))?;
            Ok((ip, fixup))
        }
    }

    fn assemble_else(&self, arena: &mut Arena, ip: u32, fixup: Fixup) -> Result<(u32, Fixup), EngineError> {
        let oldip = ip;
        let new_ip = Self::emit(arena, ip, op_b_cond(Cond::Al as u32, 0))?;
        self.fixup_if(arena, new_ip, fixup);
        Ok((new_ip, oldip))
    }

    fn assemble_endwhile(&self, arena: &mut Arena, ip: u32, fixup: Fixup) -> Result<u32, EngineError> {
        let back_offset = (fixup as i64 - ip as i64) / 4 - 1;
        arena.write(ip, op_b(back_offset as u32 & 0x03ff_ffff));
        let new_ip = ip + 4;
        self.fixup_if(arena, new_ip, fixup);
        Ok(new_ip)
    }

    fn fixup_if(&self, arena: &mut Arena, ip: u32, fixup: Fixup) {
        let offset = (ip as i64 - fixup as i64) / 4;
        let word = arena.read(fixup) | bits(offset as u32, 19, 5);
        arena.write(fixup, word);
    }
}

/// TODO: no disassembler for the native backend yet, matching the upstream
/// stub.
pub fn native_disassemble(_engine: &Engine, _start: u32) -> String {
    "TODO: Cannot disassemble yet\n".to_string()
}

thread_local! {
    static CURRENT_ENGINE: RefCell<*mut Engine> = const { RefCell::new(std::ptr::null_mut()) };
}

/// Run compiled native code starting at `start`, exchanging `engine.regs`
/// with the live w19-w26 register window around the call the way the
/// original's inline-asm `exec()` does.
pub fn enter(engine: &mut Engine, start: u32) {
    CURRENT_ENGINE.with(|cell| *cell.borrow_mut() = engine as *mut Engine);

    let entry: extern "C" fn() = unsafe { std::mem::transmute(start as usize) };
    let regs_ptr: *mut RegisterFile = &mut engine.regs;

    #[cfg(target_arch = "aarch64")]
    unsafe {
        std::arch::asm!(
            "mov x27, {regs}",
            "ldp w19, w20, [x27, 0]",
            "ldp w21, w22, [x27, 8]",
            "ldp w23, w24, [x27, 16]",
            "ldp w25, w26, [x27, 24]",
            "blr {entry}",
            "stp w19, w20, [x27, 0]",
            "stp w21, w22, [x27, 8]",
            "stp w23, w24, [x27, 16]",
            "stp w25, w26, [x27, 24]",
            regs = in(reg) regs_ptr,
            entry = in(reg) entry,
            out("x19") _, out("x20") _, out("x21") _, out("x22") _,
            out("x23") _, out("x24") _, out("x25") _, out("x26") _,
            out("x0") _, out("x1") _, out("x2") _, out("x3") _,
            out("x27") _, out("x30") _,
            clobber_abi("C"),
        );
    }

    CURRENT_ENGINE.with(|cell| *cell.borrow_mut() = std::ptr::null_mut());
}

/// Recover the engine a trampoline is running under. Only valid while
/// inside [`enter`]; used by `extern "C"` trampolines generated for host
/// ops (see `ops::register_ops`) since a raw `bl` target can't carry a
/// `&mut Engine` argument.
///
/// # Safety
/// Must only be called from a trampoline invoked (directly or transitively)
/// by `enter`.
pub unsafe fn with_current_engine<R>(f: impl FnOnce(&mut Engine) -> R) -> R {
    let ptr = CURRENT_ENGINE.with(|cell| *cell.borrow());
    debug_assert!(!ptr.is_null(), "no engine bound — called outside enter()");
    f(&mut *ptr)
}
