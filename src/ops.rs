//! Built-in host ops.
//!
//! Most binary ops follow the `(_, a, b)` convention — operand 0 goes
//! unused, operands 1 and 2 carry the two values — inherited from the
//! calling convention's fixed four-argument-slot layout. `assert` is the
//! one exception: it reads `a` and `b` straight out of slots 0 and 1.
//! `shr`/`shra` mask off bit 31 before shifting and splice the vacated sign
//! bit (or its sign-extension) back in afterward, rather than relying on a
//! native arithmetic-shift instruction. `load` is not one of the original's
//! built-ins; it backs the tiny load-through-address word `var` compiles
//! (see `Engine::do_var`).

use crate::engine::{Engine, OpFn};
use crate::error::EngineError;
use crate::symtab::{SymKind, SymbolTable};
use std::time::Instant;

fn op_add(_engine: &mut Engine, a: [u32; 4]) -> u32 {
    a[1].wrapping_add(a[2])
}

fn op_alloc(engine: &mut Engine, a: [u32; 4]) -> u32 {
    engine
        .arena
        .alloc_bytes(a[1] as usize)
        .unwrap_or_else(|e| crate::error::die(&e))
}

fn op_and(_engine: &mut Engine, a: [u32; 4]) -> u32 {
    a[1] & a[2]
}

fn op_assert(_engine: &mut Engine, a: [u32; 4]) -> u32 {
    if a[0] != a[1] {
        crate::error::die(&EngineError::AssertionFailed { a: a[0], b: a[1] });
    }
    a[0]
}

fn op_div(_engine: &mut Engine, a: [u32; 4]) -> u32 {
    ((a[1] as i32) / (a[2] as i32)) as u32
}

fn op_dump(engine: &mut Engine, _a: [u32; 4]) -> u32 {
    print!("{}", crate::debug::format_regset(&engine.regs));
    0
}

fn op_exit(_engine: &mut Engine, a: [u32; 4]) -> u32 {
    std::process::exit(a[0] as i32)
}

fn op_hex(_engine: &mut Engine, a: [u32; 4]) -> u32 {
    println!("0x{:x}", a[0]);
    0
}

fn op_load(engine: &mut Engine, a: [u32; 4]) -> u32 {
    engine.arena.read(a[0])
}

fn op_mov(_engine: &mut Engine, a: [u32; 4]) -> u32 {
    a[1]
}

fn op_mul(_engine: &mut Engine, a: [u32; 4]) -> u32 {
    a[1].wrapping_mul(a[2])
}

fn op_or(_engine: &mut Engine, a: [u32; 4]) -> u32 {
    a[1] | a[2]
}

fn op_print(_engine: &mut Engine, a: [u32; 4]) -> u32 {
    println!("{}", a[0] as i32);
    0
}

fn op_putc(_engine: &mut Engine, a: [u32; 4]) -> u32 {
    use std::io::Write;
    let _ = std::io::stdout().write_all(&[a[0] as u8]);
    0
}

fn op_puts(engine: &mut Engine, a: [u32; 4]) -> u32 {
    use std::io::Write;
    let bytes = engine.arena.read_cstr(a[0]);
    let _ = std::io::stdout().write_all(&bytes);
    0
}

fn op_shl(_engine: &mut Engine, a: [u32; 4]) -> u32 {
    a[1] << (a[2] & 31)
}

fn op_shr(_engine: &mut Engine, a: [u32; 4]) -> u32 {
    shr_31bit(a[1], a[2] & 31, false)
}

fn op_shra(_engine: &mut Engine, a: [u32; 4]) -> u32 {
    shr_31bit(a[1], a[2] & 31, true)
}

fn shr_31bit(a: u32, b: u32, arith: bool) -> u32 {
    let sign_bit = (a >> 31) & 1;
    let partial = (!(1u32 << 31) & a) >> b;
    let sb = if arith {
        sign_bit.wrapping_neg()
    } else {
        sign_bit
    };
    partial | (sb << (31 - b))
}

fn op_sub(_engine: &mut Engine, a: [u32; 4]) -> u32 {
    a[1].wrapping_sub(a[2])
}

fn op_us(_engine: &mut Engine, _a: [u32; 4]) -> u32 {
    static BOOT: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let boot = BOOT.get_or_init(Instant::now);
    boot.elapsed().as_micros() as u32
}

fn op_words(engine: &mut Engine, _a: [u32; 4]) -> u32 {
    for name in engine.symtab.list() {
        println!("{name}");
    }
    0
}

fn op_xor(_engine: &mut Engine, a: [u32; 4]) -> u32 {
    a[1] ^ a[2]
}

/// Register every built-in in the order the upstream runtime registers
/// them, so symbol-table iteration order (`words`, `dump`) matches.
pub fn register_ops(symtab: &mut SymbolTable, ops_table: &mut Vec<OpFn>) {
    macro_rules! func {
        ($name:literal, $f:ident) => {{
            ops_table.push($f as OpFn);
            symtab.define($name, SymKind::FuncPtr, (ops_table.len() - 1) as u32);
        }};
    }
    macro_rules! word {
        ($name:literal) => {{
            symtab.define($name, SymKind::WordPtr, 0);
        }};
    }

    func!("add", op_add);
    func!("alloc", op_alloc);
    func!("assert", op_assert);
    func!("and", op_and);
    word!("define");
    word!("disassemble");
    func!("div", op_div);
    func!("dump", op_dump);
    func!("exit", op_exit);
    func!("hex", op_hex);
    word!("if");
    func!("load", op_load);
    func!("mov", op_mov);
    func!("mul", op_mul);
    func!("or", op_or);
    func!("print", op_print);
    func!("putc", op_putc);
    func!("puts", op_puts);
    func!("shl", op_shl);
    func!("shr", op_shr);
    func!("shra", op_shra);
    func!("sub", op_sub);
    func!("us", op_us);
    word!("var");
    word!("while");
    func!("words", op_words);
    func!("xor", op_xor);

    // Data-declaration words beyond the upstream `var`, layered on for the
    // richer literal/array support the interactive surface calls for.
    word!("array");
    word!("bytes");
    word!("string");
    word!("const");
}

/// On the native backend a `CALL` is a direct `bl` to a real function, so
/// every `FuncPtr` symbol's value must hold a callable address rather than
/// an `ops_table` index. Each trampoline recovers the engine from the
/// thread-local `enter` binds and forwards into the same [`OpFn`] used by
/// the portable backend, keeping one implementation of each op.
#[cfg(target_arch = "aarch64")]
pub mod native_trampolines {
    use super::*;
    use crate::encoder::native::with_current_engine;

    macro_rules! trampoline {
        ($tramp:ident, $f:ident) => {
            extern "C" fn $tramp(a0: u32, a1: u32, a2: u32, a3: u32) -> u32 {
                unsafe { with_current_engine(|engine| $f(engine, [a0, a1, a2, a3])) }
            }
        };
    }

    trampoline!(tramp_add, op_add);
    trampoline!(tramp_alloc, op_alloc);
    trampoline!(tramp_assert, op_assert);
    trampoline!(tramp_and, op_and);
    trampoline!(tramp_div, op_div);
    trampoline!(tramp_dump, op_dump);
    trampoline!(tramp_exit, op_exit);
    trampoline!(tramp_hex, op_hex);
    trampoline!(tramp_load, op_load);
    trampoline!(tramp_mov, op_mov);
    trampoline!(tramp_mul, op_mul);
    trampoline!(tramp_or, op_or);
    trampoline!(tramp_print, op_print);
    trampoline!(tramp_putc, op_putc);
    trampoline!(tramp_puts, op_puts);
    trampoline!(tramp_shl, op_shl);
    trampoline!(tramp_shr, op_shr);
    trampoline!(tramp_shra, op_shra);
    trampoline!(tramp_sub, op_sub);
    trampoline!(tramp_us, op_us);
    trampoline!(tramp_words, op_words);
    trampoline!(tramp_xor, op_xor);

    pub const TABLE: &[(&str, extern "C" fn(u32, u32, u32, u32) -> u32)] = &[
        ("add", tramp_add),
        ("alloc", tramp_alloc),
        ("assert", tramp_assert),
        ("and", tramp_and),
        ("div", tramp_div),
        ("dump", tramp_dump),
        ("exit", tramp_exit),
        ("hex", tramp_hex),
        ("load", tramp_load),
        ("mov", tramp_mov),
        ("mul", tramp_mul),
        ("or", tramp_or),
        ("print", tramp_print),
        ("putc", tramp_putc),
        ("puts", tramp_puts),
        ("shl", tramp_shl),
        ("shr", tramp_shr),
        ("shra", tramp_shra),
        ("sub", tramp_sub),
        ("us", tramp_us),
        ("words", tramp_words),
        ("xor", tramp_xor),
    ];
}

/// Rebind every `FuncPtr` symbol's value from its `ops_table` index to its
/// trampoline's address, so the native backend's `bl` reaches real code.
#[cfg(target_arch = "aarch64")]
pub fn rebind_native_symbols(symtab: &mut SymbolTable) {
    for (name, tramp) in native_trampolines::TABLE {
        if let Some(sym) = symtab.lookup(name) {
            let addr = *tramp as usize as u32;
            let kind = sym.kind;
            symtab.define(*name, kind, addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shr_matches_a_plain_logical_shift() {
        assert_eq!(shr_31bit(0x8000_0001, 1, false), 0x4000_0000);
    }

    #[test]
    fn shra_sign_extends_the_vacated_high_bits() {
        let got = shr_31bit(0x8000_0000, 4, true);
        assert_eq!(got, 0xf800_0000);
    }

    #[test]
    fn shr_of_a_positive_value_matches_a_plain_logical_shift() {
        assert_eq!(shr_31bit(0x0000_00f0, 4, false), 0x0f);
    }

    #[test]
    fn load_reads_the_word_at_the_given_address() {
        let mut engine = crate::engine::Engine::new(Box::new(crate::lexer::SliceSource::from_str(""))).unwrap();
        let addr = engine.arena.alloc_words(1).unwrap();
        engine.arena.write(addr, 0xdead_beef);
        assert_eq!(op_load(&mut engine, [addr, 0, 0, 0]), 0xdead_beef);
    }

    #[test]
    fn register_ops_binds_words_as_wordptr_and_funcs_as_funcptr() {
        let mut symtab = SymbolTable::new();
        let mut ops_table = Vec::new();
        register_ops(&mut symtab, &mut ops_table);
        assert_eq!(symtab.lookup("add").unwrap().kind, SymKind::FuncPtr);
        assert_eq!(symtab.lookup("if").unwrap().kind, SymKind::WordPtr);
        assert_eq!(symtab.lookup("var").unwrap().kind, SymKind::WordPtr);
        assert!(!ops_table.is_empty());
    }
}
