//! Leverage common functionality across shoal primitives.

mod key;
pub use key::{CacheKey, Error as KeyError};

/// Converts bytes to a hexadecimal string.
pub fn hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes.iter() {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Converts a hexadecimal string to bytes.
pub fn from_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Rounds `value` up to the next multiple of `align` (which must be a power of two).
pub const fn align_up(value: usize, align: usize) -> usize {
    assert!(align.is_power_of_two(), "alignment must be a power of two");
    (value + align - 1) & !(align - 1)
}

/// Creates a [std::num::NonZeroUsize] from a literal, panicking (at compile time in const
/// contexts) if the value is zero.
#[macro_export]
macro_rules! NZUsize {
    ($val:expr) => {
        match ::std::num::NonZeroUsize::new($val) {
            Some(value) => value,
            None => panic!("value must be non-zero"),
        }
    };
}

/// Creates a [std::num::NonZeroU32] from a literal, panicking if the value is zero.
#[macro_export]
macro_rules! NZU32 {
    ($val:expr) => {
        match ::std::num::NonZeroU32::new($val) {
            Some(value) => value,
            None => panic!("value must be non-zero"),
        }
    };
}

/// Creates a [std::num::NonZeroU64] from a literal, panicking if the value is zero.
#[macro_export]
macro_rules! NZU64 {
    ($val:expr) => {
        match ::std::num::NonZeroU64::new($val) {
            Some(value) => value,
            None => panic!("value must be non-zero"),
        }
    };
}
