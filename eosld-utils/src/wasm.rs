//! WebAssembly binary-format constants and primitive emitters.
//!
//! Everything here is defined by the wasm spec or by the tool-conventions
//! documents (linking, reloc and target_features custom sections). The
//! emitters append to a byte vector; sizes are computed by the caller once a
//! payload is complete.

use std::fmt::Display;

pub const WASM_MAGIC: [u8; 4] = [0x00, b'a', b's', b'm'];
pub const WASM_VERSION: u32 = 1;

pub const WASM_PAGE_SIZE: u64 = 65536;

/// Section identifier bytes, in the order sections must appear in a module.
/// The event section (exception-handling proposal) carries id 13 but sorts
/// between `global` and `export`.
pub mod section {
    pub const CUSTOM: u8 = 0;
    pub const TYPE: u8 = 1;
    pub const IMPORT: u8 = 2;
    pub const FUNCTION: u8 = 3;
    pub const TABLE: u8 = 4;
    pub const MEMORY: u8 = 5;
    pub const GLOBAL: u8 = 6;
    pub const EXPORT: u8 = 7;
    pub const START: u8 = 8;
    pub const ELEM: u8 = 9;
    pub const CODE: u8 = 10;
    pub const DATA: u8 = 11;
    pub const DATA_COUNT: u8 = 12;
    pub const EVENT: u8 = 13;
}

pub mod opcode {
    pub const IF: u8 = 0x04;
    pub const ELSE: u8 = 0x05;
    pub const END: u8 = 0x0b;
    pub const RETURN: u8 = 0x0f;
    pub const CALL: u8 = 0x10;
    pub const LOCAL_GET: u8 = 0x20;
    pub const LOCAL_SET: u8 = 0x21;
    pub const GLOBAL_GET: u8 = 0x23;
    pub const GLOBAL_SET: u8 = 0x24;
    pub const I32_LOAD: u8 = 0x28;
    pub const I64_LOAD: u8 = 0x29;
    pub const I32_STORE: u8 = 0x36;
    pub const I64_STORE: u8 = 0x37;
    pub const I32_CONST: u8 = 0x41;
    pub const I64_CONST: u8 = 0x42;
    pub const I64_EQ: u8 = 0x51;
    pub const I64_NE: u8 = 0x52;
    pub const I32_ADD: u8 = 0x6a;
    pub const I64_ADD: u8 = 0x7c;

    /// Bulk-memory operations live behind a one-byte prefix.
    pub const MISC_PREFIX: u8 = 0xfc;
    pub const MEMORY_INIT: u32 = 0x08;
    pub const DATA_DROP: u32 = 0x09;
}

/// Block type immediate for an `if` with no result value.
pub const BLOCK_TYPE_VOID: u8 = 0x40;

pub mod export_kind {
    pub const FUNCTION: u8 = 0;
    pub const TABLE: u8 = 1;
    pub const MEMORY: u8 = 2;
    pub const GLOBAL: u8 = 3;
    pub const EVENT: u8 = 4;
}

pub mod limits_flag {
    pub const HAS_MAX: u32 = 0x1;
    pub const SHARED: u32 = 0x2;
}

pub const SEGMENT_IS_PASSIVE: u32 = 0x1;

/// Relocation types from the linking tool-conventions.
pub mod reloc {
    pub const R_WASM_FUNCTION_INDEX_LEB: u8 = 0;
    pub const R_WASM_TABLE_INDEX_SLEB: u8 = 1;
    pub const R_WASM_TABLE_INDEX_I32: u8 = 2;
    pub const R_WASM_MEMORY_ADDR_LEB: u8 = 3;
    pub const R_WASM_MEMORY_ADDR_SLEB: u8 = 4;
    pub const R_WASM_MEMORY_ADDR_I32: u8 = 5;
    pub const R_WASM_TYPE_INDEX_LEB: u8 = 6;
    pub const R_WASM_GLOBAL_INDEX_LEB: u8 = 7;
    pub const R_WASM_FUNCTION_OFFSET_I32: u8 = 8;
    pub const R_WASM_SECTION_OFFSET_I32: u8 = 9;
    pub const R_WASM_EVENT_INDEX_LEB: u8 = 10;

    /// Relocation types whose entries carry an addend field.
    pub fn has_addend(ty: u8) -> bool {
        matches!(
            ty,
            R_WASM_MEMORY_ADDR_LEB
                | R_WASM_MEMORY_ADDR_SLEB
                | R_WASM_MEMORY_ADDR_I32
                | R_WASM_FUNCTION_OFFSET_I32
                | R_WASM_SECTION_OFFSET_I32
        )
    }
}

/// `linking` custom-section constants (version 2 of the conventions).
pub mod linking {
    pub const VERSION: u32 = 2;

    pub const WASM_SEGMENT_INFO: u8 = 5;
    pub const WASM_INIT_FUNCS: u8 = 6;
    pub const WASM_COMDAT_INFO: u8 = 7;
    pub const WASM_SYMBOL_TABLE: u8 = 8;

    pub const SYMTAB_FUNCTION: u8 = 0;
    pub const SYMTAB_DATA: u8 = 1;
    pub const SYMTAB_GLOBAL: u8 = 2;
    pub const SYMTAB_SECTION: u8 = 3;
    pub const SYMTAB_EVENT: u8 = 4;

    pub const WASM_SYM_BINDING_WEAK: u32 = 0x1;
    pub const WASM_SYM_BINDING_LOCAL: u32 = 0x2;
    pub const WASM_SYM_VISIBILITY_HIDDEN: u32 = 0x4;
    pub const WASM_SYM_UNDEFINED: u32 = 0x10;
}

/// Prefix bytes for entries in the `target_features` custom section.
pub mod feature_prefix {
    pub const USED: u8 = b'+';
    pub const REQUIRED: u8 = b'=';
    pub const DISALLOWED: u8 = b'-';
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValType {
    I32 = 0x7f,
    I64 = 0x7e,
    F32 = 0x7d,
    F64 = 0x7c,
}

impl ValType {
    pub fn byte(self) -> u8 {
        self as u8
    }
}

impl Display for ValType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
        };
        f.write_str(s)
    }
}

/// A function signature. Structural equality is what the output type section
/// deduplicates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl Signature {
    pub fn new(params: Vec<ValType>, results: Vec<ValType>) -> Signature {
        Signature { params, results }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(0x60);
        write_uleb128(out, self.params.len() as u64);
        for p in &self.params {
            out.push(p.byte());
        }
        write_uleb128(out, self.results.len() as u64);
        for r in &self.results {
            out.push(r.byte());
        }
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            Display::fmt(p, f)?;
        }
        write!(f, ") -> (")?;
        for (i, r) in self.results.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            Display::fmt(r, f)?;
        }
        write!(f, ")")
    }
}

/// Memory or table size bounds.
#[derive(Debug, Clone, Copy, Default)]
pub struct Limits {
    pub min: u64,
    pub max: Option<u64>,
    pub shared: bool,
}

impl Limits {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut flags = 0;
        if self.max.is_some() {
            flags |= limits_flag::HAS_MAX;
        }
        if self.shared {
            flags |= limits_flag::SHARED;
        }
        write_uleb128(out, u64::from(flags));
        write_uleb128(out, self.min);
        if let Some(max) = self.max {
            write_uleb128(out, max);
        }
    }
}

pub fn write_uleb128(out: &mut Vec<u8>, value: u64) {
    leb128::write::unsigned(out, value).expect("writing to a Vec cannot fail");
}

pub fn write_sleb128(out: &mut Vec<u8>, value: i64) {
    leb128::write::signed(out, value).expect("writing to a Vec cannot fail");
}

/// A length-prefixed UTF-8 string, as used by import/export names and custom
/// section names.
pub fn write_str(out: &mut Vec<u8>, s: &str) {
    write_uleb128(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

pub fn write_u32_le(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Size in bytes of `value` encoded as ULEB128.
pub fn uleb128_size(value: u64) -> u64 {
    let bits = u64::from(64 - value.leading_zeros());
    bits.max(1).div_ceil(7)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uleb(value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        write_uleb128(&mut out, value);
        out
    }

    fn sleb(value: i64) -> Vec<u8> {
        let mut out = Vec::new();
        write_sleb128(&mut out, value);
        out
    }

    #[test]
    fn uleb128_encoding() {
        assert_eq!(uleb(0), [0x00]);
        assert_eq!(uleb(127), [0x7f]);
        assert_eq!(uleb(128), [0x80, 0x01]);
        assert_eq!(uleb(624485), [0xe5, 0x8e, 0x26]);
    }

    #[test]
    fn sleb128_encoding() {
        assert_eq!(sleb(0), [0x00]);
        assert_eq!(sleb(-1), [0x7f]);
        assert_eq!(sleb(63), [0x3f]);
        assert_eq!(sleb(64), [0xc0, 0x00]);
        assert_eq!(sleb(-123456), [0xc0, 0xbb, 0x78]);
    }

    #[test]
    fn uleb128_size_matches_encoding() {
        for value in [0, 1, 127, 128, 16383, 16384, u64::from(u32::MAX), u64::MAX] {
            assert_eq!(uleb128_size(value), uleb(value).len() as u64, "{value}");
        }
    }

    #[test]
    fn signature_encoding() {
        let sig = Signature::new(vec![ValType::I64, ValType::I64], vec![ValType::I32]);
        let mut out = Vec::new();
        sig.encode(&mut out);
        assert_eq!(out, [0x60, 0x02, 0x7e, 0x7e, 0x01, 0x7f]);
    }

    #[test]
    fn shared_limits_require_flags() {
        let mut out = Vec::new();
        Limits {
            min: 2,
            max: Some(4),
            shared: true,
        }
        .encode(&mut out);
        assert_eq!(out, [0x03, 0x02, 0x04]);
    }
}
