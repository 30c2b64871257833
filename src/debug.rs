//! Pretty-printers for operands, symbols, commands, and the register file,
//! plus the `disassemble` word's glue into whichever backend is active.
//!
//! Formats mirror the upstream debug dump: `{ TYPE, value }` for an
//! operand, `{ "name", TYPE, 0xval }` for a symbol, `{ opcode, symbol,
//! [operands] }` for a command, `{ [r0..r7], [arg0..arg3], sp }` for a
//! register file.

use crate::engine::Engine;
use crate::operand::Operand;
use crate::regset::RegisterFile;
use crate::symtab::{SymKind, Symbol};

fn fmt_optype(op: Operand) -> &'static str {
    match op {
        Operand::Invalid => "INVALID",
        Operand::Register(_) => "REGISTER",
        Operand::Argument(_) => "ARGUMENT",
        Operand::Immediate(_) => "IMMEDIATE",
    }
}

fn operand_value(op: Operand) -> u32 {
    match op {
        Operand::Invalid => 0,
        Operand::Register(r) => r as u32,
        Operand::Argument(a) => a as u32,
        Operand::Immediate(v) => v,
    }
}

pub fn format_operand(op: Operand) -> String {
    format!("{{ {}, {} }}", fmt_optype(op), operand_value(op))
}

pub fn format_operand_array(ops: &[Operand]) -> String {
    let body: Vec<String> = ops.iter().map(|o| format_operand(*o)).collect();
    format!("[ {} ]", body.join(", "))
}

fn fmt_symtype(kind: SymKind) -> &'static str {
    match kind {
        SymKind::FuncPtr => "FUNCPTR",
        SymKind::WordPtr => "WORDPTR",
        SymKind::ExecPtr => "EXECPTR",
        SymKind::Variable => "VARIABLE",
        SymKind::Constant => "CONSTANT",
    }
}

pub fn format_symbol(sym: &Symbol) -> String {
    format!("{{ \"{}\", {}, 0x{:x} }}", sym.name, fmt_symtype(sym.kind), sym.value)
}

pub fn format_command(opcode: &str, sym: Option<&Symbol>, operand: &[Operand]) -> String {
    let sym_str = sym.map(format_symbol).unwrap_or_else(|| "(none)".to_string());
    format!("{{ {opcode}, {sym_str}, {} }}", format_operand_array(operand))
}

pub fn format_regset(regs: &RegisterFile) -> String {
    let r: Vec<String> = regs.r_slice().iter().map(|v| v.to_string()).collect();
    let arg: Vec<String> = regs.arg_slice().iter().map(|v| v.to_string()).collect();
    format!("{{ [ {} ], [ {} ], {} }}\n", r.join(", "), arg.join(", "), regs.sp())
}

/// Disassemble the word starting at `addr`, dispatching to whichever
/// backend compiled it.
pub fn disassemble_word(engine: &Engine, addr: u32) -> String {
    #[cfg(target_arch = "aarch64")]
    {
        crate::encoder::native::native_disassemble(engine, addr)
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        crate::encoder::vm::vm_disassemble(engine, addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_formats_type_and_value() {
        assert_eq!(format_operand(Operand::Register(3)), "{ REGISTER, 3 }");
        assert_eq!(format_operand(Operand::Immediate(42)), "{ IMMEDIATE, 42 }");
    }

    #[test]
    fn symbol_formats_name_type_and_hex_value() {
        let sym = Symbol {
            name: "square".into(),
            kind: SymKind::ExecPtr,
            value: 0x1000,
        };
        assert_eq!(format_symbol(&sym), "{ \"square\", EXECPTR, 0x1000 }");
    }

    #[test]
    fn regset_lists_r_then_arg_then_sp() {
        let regs = RegisterFile::new();
        let s = format_regset(&regs);
        assert!(s.starts_with("{ [ 0, 0, 0, 0, 0, 0, 0, 0 ], [ 0, 0, 0, 0 ], 0 }"));
    }
}
