//! Portable bytecode backend.
//!
//! A tiny instruction set — branches, calls, moves, and a two-slot stack —
//! sufficient to sequence calls into the host-op table and into other
//! compiled words. Everything else (arithmetic, I/O, the compiler's own
//! meta-ops) is a host call. Unlike the native backend, a `CALL` here can't
//! embed a raw function pointer in a 32-bit word, so it stores an index
//! into [`crate::engine::Engine::ops_table`] instead; `EXEC` targets are
//! real arena addresses, which do fit (the arena lives in the low 4 MiB the
//! mmap hint requests).

use super::{Backend, Fixup};
use crate::arena::Arena;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::operand::Operand;
use crate::parser::{Command, Compare, Relop};
use crate::regset::{ARG0, ZERO};
use crate::symtab::SymKind;

const F1SHIFT: u32 = 28;
const F1MASK: u32 = 0xf;
const F2SHIFT: u32 = 24;
const F2MASK: u32 = 0xf;
const F3SHIFT: u32 = 8;
const F3MASK: u32 = 0xffff;
const F23SHIFT: u32 = 8;
const F23MASK: u32 = 0xfffff;
const OPMASK: u32 = 0xff;

const BEQ: u32 = 0;
const BNE: u32 = 1;
const BLT: u32 = 2;
const BLTU: u32 = 3;
const BGE: u32 = 4;
const BGEU: u32 = 5;
const CALL0: u32 = 6;
const CALL1: u32 = 7;
const CALL2: u32 = 8;
const CALL3: u32 = 9;
const CALL4: u32 = 10;
const EXEC0: u32 = 11;
const EXEC1: u32 = 12;
const EXEC2: u32 = 13;
const EXEC3: u32 = 14;
const EXEC4: u32 = 15;
const MOV: u32 = 16;
const MOV16: u32 = 17;
const MOVHI: u32 = 18;
const POP: u32 = 19;
const PUSH: u32 = 20;
const RET: u32 = 21;

fn asm3(opcode: u32, f1: u32, f2: u32, f3: u32) -> u32 {
    ((f1 & F1MASK) << F1SHIFT) | ((f2 & F2MASK) << F2SHIFT) | ((f3 & F3MASK) << F3SHIFT) | opcode
}

fn asm23(opcode: u32, f1: u32, f23: u32) -> u32 {
    opcode | ((f1 & F1MASK) << F1SHIFT) | ((f23 & F23MASK) << F23SHIFT)
}

fn asm2(opcode: u32, f1: u32, f2: u32) -> u32 {
    asm3(opcode, f1, f2, 0)
}

fn asm1(opcode: u32, f1: u32) -> u32 {
    asm3(opcode, f1, 0, 0)
}

fn arg(x: u32) -> u32 {
    ARG0 as u32 + x
}

fn rzero() -> u32 {
    ZERO as u32
}

fn reg_value(op: Operand) -> u32 {
    match op {
        Operand::Register(r) => r as u32,
        other => unreachable!("comparison operand must be a register, got {other:?}"),
    }
}

pub struct VmBackend;

impl VmBackend {
    fn emit(arena: &mut Arena, ip: u32, word: u32) -> Result<u32, EngineError> {
        arena.write(ip, word);
        Ok(ip + 4)
    }

    fn assemble_prologue(arena: &mut Arena, ip: u32, narg: u32, op: Operand) -> Result<u32, EngineError> {
        match op {
            Operand::Register(r) => Self::emit(arena, ip, asm2(MOV, arg(narg), r as u32)),
            Operand::Immediate(v) => {
                let mut ip = Self::emit(arena, ip, asm23(MOV16, arg(narg), v & 0xffff))?;
                if v >> 16 != 0 {
                    ip = Self::emit(arena, ip, asm23(MOVHI, arg(narg), (v >> 16) & 0xffff))?;
                }
                Ok(ip)
            }
            Operand::Argument(n) => Self::emit(arena, ip, asm2(MOV, arg(narg), arg(n as u32))),
            Operand::Invalid => {
                unreachable!("invalid operand reached call-site code generation")
            }
        }
    }

    fn assemble_epilogue(arena: &mut Arena, ip: u32, op: Operand) -> Result<u32, EngineError> {
        match op {
            Operand::Register(r) => Self::emit(arena, ip, asm2(MOV, r as u32, arg(0))),
            _ => Ok(ip),
        }
    }
}

impl Backend for VmBackend {
    fn assemble_preamble(&self, arena: &mut Arena, ip: u32, cmd: &Command, clobbers: u8) -> Result<u32, EngineError> {
        let mut clobbers = clobbers;
        for op in &cmd.operand {
            match op {
                Operand::Register(r) => clobbers |= 1 << r,
                _ => break,
            }
        }

        let mut ip = ip;
        for i in 0..8 {
            if clobbers & (1 << i) != 0 {
                ip = Self::emit(arena, ip, asm1(PUSH, i as u32))?;
            }
        }
        for (i, op) in cmd.operand.iter().enumerate() {
            match op {
                Operand::Register(r) => ip = Self::emit(arena, ip, asm2(MOV, *r as u32, arg(i as u32)))?,
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
        debug_assert!(matches!(
            sym.kind,
            SymKind::FuncPtr | SymKind::WordPtr | SymKind::ExecPtr
        ));

        let mut ip = ip;
        let mut narg = 0u32;
        for op in &word.operand {
            if matches!(op, Operand::Invalid) {
                break;
            }
            ip = Self::assemble_prologue(arena, ip, narg, *op)?;
            narg += 1;
        }

        let is_exec = sym.kind == SymKind::ExecPtr;
        let opcode = match narg {
            0 => if is_exec { EXEC0 } else { CALL0 },
            1 => if is_exec { EXEC1 } else { CALL1 },
            2 => if is_exec { EXEC2 } else { CALL2 },
            3 => if is_exec { EXEC3 } else { CALL3 },
            4 => if is_exec { EXEC4 } else { CALL4 },
            _ => unreachable!("at most four operands"),
        };
        ip = Self::emit(arena, ip, opcode)?;
        ip = Self::emit(arena, ip, sym.value)?;
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
            ip = Self::emit(arena, ip, asm2(MOV, arg(0), r as u32))?;
        }
        for i in (0..8).rev() {
            if clobbers & (1 << i) != 0 {
                ip = Self::emit(arena, ip, asm1(POP, i as u32))?;
            }
        }
        self.assemble_ret(arena, ip)
    }

    fn assemble_ret(&self, arena: &mut Arena, ip: u32) -> Result<u32, EngineError> {
        Self::emit(arena, ip, RET)
    }

    fn assemble_if(&self, arena: &mut Arena, ip: u32, cmp: &Compare) -> Result<(u32, Fixup), EngineError> {
        let fixup = ip;
        let a = reg_value(cmp.op1);
        let word = match cmp.rel {
            Relop::Eq => asm3(BNE, a, reg_value(cmp.op2), 0),
            Relop::Ne => asm3(BEQ, a, reg_value(cmp.op2), 0),
            Relop::Lt => asm3(BGE, a, reg_value(cmp.op2), 0),
            Relop::Gt => asm3(BGE, reg_value(cmp.op2), a, 0),
            Relop::LtEq => asm3(BLT, reg_value(cmp.op2), a, 0),
            Relop::GtEq => asm3(BLT, a, reg_value(cmp.op2), 0),
            Relop::LtU => asm3(BGEU, a, reg_value(cmp.op2), 0),
            Relop::GtU => asm3(BGEU, reg_value(cmp.op2), a, 0),
            Relop::LtEqU => asm3(BLTU, reg_value(cmp.op2), a, 0),
            Relop::GtEqU => asm3(BLTU, a, reg_value(cmp.op2), 0),
            Relop::CmpNz => asm3(BEQ, a, rzero(), 0),
        };
        let ip = Self::emit(arena, ip, word)?;
        Ok((ip, fixup))
    }

    fn assemble_else(&self, arena: &mut Arena, ip: u32, fixup: Fixup) -> Result<(u32, Fixup), EngineError> {
        let oldip = ip;
        let new_ip = Self::emit(arena, ip, asm3(BEQ, rzero(), rzero(), 0))?;
        self.fixup_if(arena, new_ip, fixup);
        Ok((new_ip, oldip))
    }

    fn assemble_endwhile(&self, arena: &mut Arena, ip: u32, fixup: Fixup) -> Result<u32, EngineError> {
        let back_offset = (fixup as i64 - ip as i64) / 4 - 1;
        arena.write(ip, asm3(BEQ, rzero(), rzero(), back_offset as u32));
        let new_ip = ip + 4;
        self.fixup_if(arena, new_ip, fixup);
        Ok(new_ip)
    }

    fn fixup_if(&self, arena: &mut Arena, ip: u32, fixup: Fixup) {
        let offset = (ip as i64 - fixup as i64) / 4 - 1;
        let bits = (offset as i32 as u32) & F3MASK;
        let word = arena.read(fixup) | (bits << F3SHIFT);
        arena.write(fixup, word);
    }
}

/// Run compiled bytecode starting at `start` until `RET`. The result (if
/// any) is left in `engine.regs`' `arg0` slot, matching the original's use
/// of a single global register file as the calling convention.
pub fn vm_exec(engine: &mut Engine, start: u32) {
    let mut ip = start;
    loop {
        let op = engine.arena.read(ip);
        ip += 4;
        let f1 = (op >> F1SHIFT) & F1MASK;
        let f2 = (op >> F2SHIFT) & F2MASK;
        let f3 = (op >> F3SHIFT) & F3MASK;
        let f23 = (op >> F23SHIFT) & F23MASK;
        let offset = f3 as i16 as i32;

        match op & OPMASK {
            BEQ => {
                if engine.regs.get(f1 as usize) == engine.regs.get(f2 as usize) {
                    ip = (ip as i64 + offset as i64 * 4) as u32;
                }
            }
            BNE => {
                if engine.regs.get(f1 as usize) != engine.regs.get(f2 as usize) {
                    ip = (ip as i64 + offset as i64 * 4) as u32;
                }
            }
            BLT => {
                if (engine.regs.get(f1 as usize) as i32) < (engine.regs.get(f2 as usize) as i32) {
                    ip = (ip as i64 + offset as i64 * 4) as u32;
                }
            }
            BLTU => {
                if engine.regs.get(f1 as usize) < engine.regs.get(f2 as usize) {
                    ip = (ip as i64 + offset as i64 * 4) as u32;
                }
            }
            BGE => {
                if (engine.regs.get(f1 as usize) as i32) >= (engine.regs.get(f2 as usize) as i32) {
                    ip = (ip as i64 + offset as i64 * 4) as u32;
                }
            }
            BGEU => {
                if engine.regs.get(f1 as usize) >= engine.regs.get(f2 as usize) {
                    ip = (ip as i64 + offset as i64 * 4) as u32;
                }
            }
            CALL0 | CALL1 | CALL2 | CALL3 | CALL4 => {
                let target = engine.arena.read(ip);
                ip += 4;
                let f = engine.ops_table[target as usize];
                let args = engine.regs.arg_slice();
                let result = f(engine, args);
                engine.regs.set_arg(0, result);
            }
            EXEC0 | EXEC1 | EXEC2 | EXEC3 | EXEC4 => {
                let target = engine.arena.read(ip);
                ip += 4;
                vm_exec(engine, target);
            }
            MOV => {
                let v = engine.regs.get(f2 as usize);
                engine.regs.set(f1 as usize, v);
            }
            MOV16 => engine.regs.set(f1 as usize, f23),
            MOVHI => {
                let v = engine.regs.get(f1 as usize);
                engine.regs.set(f1 as usize, v | (f23 << 16));
            }
            POP => {
                let sp = engine.regs.sp();
                let v = engine.arena.read(sp);
                engine.regs.set(f1 as usize, v);
                engine.regs.set_sp(sp + 4);
            }
            PUSH => {
                let sp = engine.regs.sp() - 4;
                engine.arena.write(sp, engine.regs.get(f1 as usize));
                engine.regs.set_sp(sp);
            }
            RET => return,
            other => unreachable!("bad vm opcode {other}"),
        }
    }
}

fn reg_name(r: u32) -> String {
    match r {
        0..=7 => format!("r{r}"),
        8..=11 => format!("arg{}", r - 8),
        12 => "rZ".to_string(),
        _ => "INVALID".to_string(),
    }
}

/// Render one instruction at `ip`, returning the mnemonic line and the
/// address of the next instruction, or `None` once `RET` is reached.
fn trace_one(engine: &Engine, ip: u32) -> (String, Option<u32>) {
    let op = engine.arena.read(ip);
    let mut next = ip + 4;
    let f1 = (op >> F1SHIFT) & F1MASK;
    let f2 = (op >> F2SHIFT) & F2MASK;
    let f3 = (op >> F3SHIFT) & F3MASK;
    let f23 = (op >> F23SHIFT) & F23MASK;
    let off = f3 as i16;

    let line = match op & OPMASK {
        BEQ if f2 == rzero() && f1 == rzero() => format!("\tb\t{off}"),
        BEQ if f2 == rzero() => format!("\tbez\t{}, {off}", reg_name(f1)),
        BEQ => format!("\tbeq\t{}, {}, {off}", reg_name(f1), reg_name(f2)),
        BNE => format!("\tbne\t{}, {}, {off}", reg_name(f1), reg_name(f2)),
        BLT => format!("\tblt\t{f1}, {f2}, {off}"),
        BLTU => format!("\tbltu\t{f1}, {f2}, {off}"),
        BGE => format!("\tbge\t{f1}, {f2}, {off}"),
        BGEU => format!("\tbgeu\t{f1}, {f2}, {off}"),
        op @ (CALL0 | CALL1 | CALL2 | CALL3 | CALL4) => {
            let target = engine.arena.read(next);
            next += 4;
            let mnemonic = format!("call{}", op - CALL0);
            trace_symbol(engine, &mnemonic, target)
        }
        op @ (EXEC0 | EXEC1 | EXEC2 | EXEC3 | EXEC4) => {
            let target = engine.arena.read(next);
            next += 4;
            let mnemonic = format!("exec{}", op - EXEC0);
            trace_symbol(engine, &mnemonic, target)
        }
        MOV => format!("\tmov\t{}, {}", reg_name(f1), reg_name(f2)),
        MOV16 => format!("\tmov16\t{}, {f23}", reg_name(f1)),
        MOVHI => format!("\tmovhi\t{}, {f23}", reg_name(f1)),
        POP => format!("\tpop\t{}", reg_name(f1)),
        PUSH => format!("\tpush\t{}", reg_name(f1)),
        RET => return ("\tret".to_string(), None),
        other => format!("\t.word\t0x{other:x}"),
    };

    (line, Some(next))
}

fn trace_symbol(engine: &Engine, op: &str, target: u32) -> String {
    match engine.symtab.name_of(target) {
        Some(name) => format!("\t{op}\t{name}"),
        None => format!("\t{op}\t0x{target:x}"),
    }
}

pub fn vm_disassemble(engine: &Engine, start: u32) -> String {
    let mut out = String::new();
    let mut ip = Some(start);
    while let Some(addr) = ip {
        let (line, next) = trace_one(engine, addr);
        out.push_str(&line);
        out.push('\n');
        ip = next;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asm3_packs_fields_without_overlap() {
        let w = asm3(RET, 1, 2, 3);
        assert_eq!(w & OPMASK, RET);
        assert_eq!((w >> F1SHIFT) & F1MASK, 1);
        assert_eq!((w >> F2SHIFT) & F2MASK, 2);
        assert_eq!((w >> F3SHIFT) & F3MASK, 3);
    }

    #[test]
    fn fixup_if_patches_a_forward_branch_offset() {
        let mut arena = Arena::new().unwrap();
        let backend = VmBackend;
        let fixup = arena.alloc_words(1).unwrap();
        arena.write(fixup, asm3(BEQ, 0, 0, 0));
        let here = arena.alloc_words(3).unwrap();
        let target = here + 8;
        backend.fixup_if(&mut arena, target, fixup);
        let patched = arena.read(fixup);
        let decoded_off = ((patched >> F3SHIFT) & F3MASK) as i16;
        assert_eq!(decoded_off, 1);
    }

    proptest::proptest! {
        #[test]
        fn fixup_offset_matches_distance_in_words(words_ahead in 0u32..500) {
            let mut arena = Arena::new().unwrap();
            let backend = VmBackend;
            let fixup = arena.alloc_words(1).unwrap();
            arena.write(fixup, asm3(BEQ, 3, 4, 0));
            arena.alloc_words(words_ahead as usize).unwrap();
            let target = fixup + 4 + words_ahead * 4;

            backend.fixup_if(&mut arena, target, fixup);

            let patched = arena.read(fixup);
            proptest::prop_assert_eq!(patched & OPMASK, BEQ);
            proptest::prop_assert_eq!((patched >> F1SHIFT) & F1MASK, 3);
            proptest::prop_assert_eq!((patched >> F2SHIFT) & F2MASK, 4);
            let decoded_off = ((patched >> F3SHIFT) & F3MASK) as i16 as i32;
            proptest::prop_assert_eq!(decoded_off, words_ahead as i32);
        }

        // `assemble_endwhile`'s second argument is the *exit branch*'s own
        // address (the conditional branch `assemble_while` emitted at the
        // loop top), not the loop top itself — the loop body starts exactly
        // one word after it, which is what the `- 1` in both directions
        // accounts for.
        #[test]
        fn endwhile_backward_offset_matches_negative_distance(words_back in 1u32..500) {
            let mut arena = Arena::new().unwrap();
            let backend = VmBackend;
            let exit_fixup = arena.alloc_words(1).unwrap();
            arena.write(exit_fixup, asm3(BEQ, 1, 2, 0));
            arena.alloc_words(words_back as usize).unwrap(); // loop body
            let branch_ip = arena.alloc_words(1).unwrap();

            let new_ip = backend.assemble_endwhile(&mut arena, branch_ip, exit_fixup).unwrap();
            proptest::prop_assert_eq!(new_ip, branch_ip + 4);

            let back_branch = arena.read(branch_ip);
            let back_off = ((back_branch >> F3SHIFT) & F3MASK) as i16 as i32;
            proptest::prop_assert_eq!(back_off, -(words_back as i32 + 2));

            let patched_exit = arena.read(exit_fixup);
            let exit_off = ((patched_exit >> F3SHIFT) & F3MASK) as i16 as i32;
            proptest::prop_assert_eq!(exit_off, words_back as i32 + 1);
        }
    }
}
