//! Operand classification: registers, arguments, immediates, and the
//! named-constant fallback.

use crate::symtab::{SymKind, SymbolTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operand {
    #[default]
    Invalid,
    Register(u8),
    Argument(u8),
    Immediate(u32),
}

impl Operand {
    pub fn is_register(self) -> bool {
        matches!(self, Operand::Register(_))
    }
}

/// Parse one token per the classification precedence: `rN` register,
/// `argN` argument, a char literal, a leading-digit numeric immediate
/// (C-style base prefixes), and finally a named-constant fallback.
pub fn parse_operand(token: Option<&str>, symtab: &SymbolTable) -> Operand {
    let Some(t) = token else {
        return Operand::Invalid;
    };

    if let Some(rest) = t.strip_prefix('r') {
        let n = parse_reg_t(rest);
        return if n < 8 {
            Operand::Register(n as u8)
        } else {
            Operand::Invalid
        };
    }

    if let Some(rest) = t.strip_prefix("arg") {
        let n = parse_reg_t(rest);
        return if n < 4 {
            Operand::Argument(n as u8)
        } else {
            Operand::Invalid
        };
    }

    if let Some(c) = parse_char_literal(t) {
        return Operand::Immediate(c);
    }

    if t.as_bytes().first().is_some_and(|b| b.is_ascii_digit()) {
        return Operand::Immediate(parse_reg_t(t));
    }

    if let Some(sym) = symtab.lookup(t) {
        if sym.kind == SymKind::Constant {
            return Operand::Immediate(sym.value);
        }
    }

    Operand::Invalid
}

/// A `'c'` literal, or `'\n' '\r' '\t'` (mapped) / `'\x'` (any other escaped
/// byte, used literally).
fn parse_char_literal(t: &str) -> Option<u32> {
    let b = t.as_bytes();
    if b.len() < 3 || b[0] != b'\'' || b[b.len() - 1] != b'\'' {
        return None;
    }
    let body = &t[1..t.len() - 1];
    if let Some(escaped) = body.strip_prefix('\\') {
        let c = *escaped.as_bytes().first()?;
        let mapped = match c {
            b'n' => b'\n',
            b'r' => b'\r',
            b't' => b'\t',
            other => other,
        };
        Some(mapped as u32)
    } else if body.len() == 1 {
        Some(body.as_bytes()[0] as u32)
    } else {
        None
    }
}

/// Mirrors `strtoll(p, &q, 0)` truncated to 32 bits: optional sign, `0x`/`0X`
/// hex, a leading-zero octal prefix, otherwise decimal. Returns
/// `u32::MAX` on a parse failure, matching the `(reg_t) -1` sentinel used
/// when no digits are consumed.
pub fn parse_reg_t(s: &str) -> u32 {
    parse_c_long(s).map(|v| v as u32).unwrap_or(u32::MAX)
}

fn parse_c_long(s: &str) -> Option<i64> {
    let (neg, rest) = match s.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };

    let (radix, digits) = if let Some(h) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        (16, h)
    } else if rest.len() > 1 && rest.starts_with('0') {
        (8, &rest[1..])
    } else {
        (10, rest)
    };

    if digits.is_empty() {
        return None;
    }

    let mut val: i64 = 0;
    let mut any = false;
    for c in digits.chars() {
        let d = c.to_digit(radix)?;
        val = val.checked_mul(radix as i64)?.checked_add(d as i64)?;
        any = true;
    }
    if !any {
        return None;
    }

    Some(if neg { -val } else { val })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_symtab() -> SymbolTable {
        SymbolTable::new()
    }

    #[test]
    fn register_indices_0_to_7_are_valid() {
        let st = empty_symtab();
        assert_eq!(parse_operand(Some("r0"), &st), Operand::Register(0));
        assert_eq!(parse_operand(Some("r7"), &st), Operand::Register(7));
    }

    #[test]
    fn register_index_8_or_above_is_invalid() {
        let st = empty_symtab();
        assert_eq!(parse_operand(Some("r8"), &st), Operand::Invalid);
    }

    #[test]
    fn argument_indices_0_to_3_are_valid() {
        let st = empty_symtab();
        assert_eq!(parse_operand(Some("arg3"), &st), Operand::Argument(3));
        assert_eq!(parse_operand(Some("arg4"), &st), Operand::Invalid);
    }

    #[test]
    fn hex_and_decimal_immediates() {
        let st = empty_symtab();
        assert_eq!(parse_operand(Some("0x2a"), &st), Operand::Immediate(42));
        assert_eq!(parse_operand(Some("42"), &st), Operand::Immediate(42));
    }

    #[test]
    fn char_literal_with_escape() {
        let st = empty_symtab();
        assert_eq!(parse_operand(Some("'\\n'"), &st), Operand::Immediate(b'\n' as u32));
        assert_eq!(parse_operand(Some("'a'"), &st), Operand::Immediate(b'a' as u32));
    }

    #[test]
    fn constant_symbol_resolves_to_its_value() {
        let mut st = empty_symtab();
        st.define("&buf", SymKind::Constant, 0x2000);
        assert_eq!(parse_operand(Some("&buf"), &st), Operand::Immediate(0x2000));
    }

    #[test]
    fn unknown_token_is_invalid() {
        let st = empty_symtab();
        assert_eq!(parse_operand(Some("bogus"), &st), Operand::Invalid);
    }

    proptest::proptest! {
        #[test]
        fn register_tokens_0_to_7_always_classify_as_that_register(n in 0u8..8) {
            let st = empty_symtab();
            let tok = format!("r{n}");
            proptest::prop_assert_eq!(parse_operand(Some(&tok), &st), Operand::Register(n));
        }

        #[test]
        fn register_tokens_at_or_above_8_are_always_invalid(n in 8u32..10_000) {
            let st = empty_symtab();
            let tok = format!("r{n}");
            proptest::prop_assert_eq!(parse_operand(Some(&tok), &st), Operand::Invalid);
        }

        #[test]
        fn decimal_immediates_round_trip_through_classification(n in 0u32..=0x7fff_ffff) {
            let st = empty_symtab();
            let tok = n.to_string();
            proptest::prop_assert_eq!(parse_operand(Some(&tok), &st), Operand::Immediate(n));
        }
    }
}
