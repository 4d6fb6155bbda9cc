//! Bit-level access to 16-bit register words.
//!
//! Bit 0 is the least significant bit of the word. All ranges are inclusive.

/// A mask with the lowest `width` bits set.
const fn low_mask(width: u8) -> u16 {
    if width >= 16 { u16::MAX } else { (1 << width) - 1 }
}

/// Returns the bit at position `bit`.
pub const fn bit_value(word: u16, bit: u8) -> bool {
    debug_assert!(bit < 16);
    (word >> bit) & 1 == 1
}

/// Extracts the bits `start..=end` as a right-aligned integer.
pub const fn range_value(word: u16, start: u8, end: u8) -> u16 {
    debug_assert!(start <= end && end < 16);
    (word >> start) & low_mask(end - start + 1)
}

/// Returns `word` with the bit at position `bit` forced to `value`.
pub const fn with_bit(word: u16, bit: u8, value: bool) -> u16 {
    debug_assert!(bit < 16);
    let mask = 1 << bit;
    if value { word | mask } else { word & !mask }
}

/// Returns `word` with the `width` bits starting at `start` replaced by the low `width` bits of
/// `value`.
///
/// A zero `width` leaves the word unchanged.
pub const fn with_range(word: u16, start: u8, width: u8, value: u16) -> u16 {
    debug_assert!(start < 16);
    if width == 0 {
        return word;
    }
    let mask = low_mask(width) << start;
    (word & !mask) | ((value << start) & mask)
}
