use crate::error::Result;
use anyhow::bail;
use std::fmt::Debug;
use std::fmt::Display;

/// An alignment. Always a power of two, stored as the exponent, which is
/// also how wasm data segments record their alignment in object files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord)]
pub struct Alignment {
    pub exponent: u8,
}

pub const MIN: Alignment = Alignment { exponent: 0 };

/// The largest alignment an input segment may request.
pub const MAX: Alignment = Alignment { exponent: 32 };

/// The explicit stack is always 16-byte aligned.
pub const STACK: Alignment = Alignment { exponent: 4 };

impl Alignment {
    pub fn new(raw: u64) -> Result<Self> {
        if !raw.is_power_of_two() {
            bail!("invalid alignment 0x{raw:x}");
        }
        let exponent = raw.trailing_zeros();
        if exponent > u32::from(MAX.exponent) {
            bail!("unsupported alignment 0x{raw:x}");
        }
        Ok(Alignment {
            exponent: exponent as u8,
        })
    }

    pub fn from_exponent(exponent: u8) -> Alignment {
        Alignment { exponent }
    }

    pub fn value(self) -> u64 {
        1 << self.exponent
    }

    pub fn align_up(self, value: u64) -> u64 {
        value.next_multiple_of(self.value())
    }

    pub fn is_aligned(self, value: u64) -> bool {
        value % self.value() == 0
    }
}

impl Display for Alignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.value(), f)
    }
}

#[test]
fn test_align_up() {
    // Page-granular rounding, as used for the memory-section size.
    let page = Alignment::new(65536).unwrap();
    assert_eq!(page.align_up(0), 0);
    assert_eq!(page.align_up(1), 65536);
    assert_eq!(page.align_up(65536), 65536);
    assert_eq!(page.align_up(66560), 131072);
    // Stack placement rounds the data end up to 16 bytes.
    assert_eq!(STACK.align_up(1124), 1136);
    assert_eq!(STACK.align_up(1136), 1136);
}

#[test]
fn test_rejects_non_power_of_two() {
    assert!(Alignment::new(24).is_err());
    assert!(Alignment::new(0).is_err());
}

#[test]
fn test_stack_alignment_value() {
    assert_eq!(STACK.value(), 16);
    assert!(STACK.is_aligned(65536));
    assert!(!STACK.is_aligned(65537));
}
