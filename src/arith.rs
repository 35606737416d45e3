//! Overflow-checked address arithmetic.
//!
//! Every bounds check the loader performs on untrusted header fields goes
//! through these helpers; none of them ever returns a wrapped value.

/// Add two addresses, returning `None` on wraparound.
#[inline]
pub fn checked_add(a: u64, b: u64) -> Option<u64> {
    a.checked_add(b)
}

/// Returns `true` if `align` is a non-zero power of two.
#[inline]
pub fn is_valid_alignment(align: u64) -> bool {
    align.is_power_of_two()
}

/// Align `addr` down to `align`.
///
/// Returns `None` if `align` is not a non-zero power of two.
#[inline]
pub fn align_down(addr: u64, align: u64) -> Option<u64> {
    if !is_valid_alignment(align) {
        return None;
    }
    Some(addr & !(align - 1))
}

/// Align `addr` up to `align`.
///
/// Returns `None` if `align` is not a non-zero power of two or the result
/// does not fit in a `u64`.
#[inline]
pub fn align_up(addr: u64, align: u64) -> Option<u64> {
    if !is_valid_alignment(align) {
        return None;
    }
    checked_add(addr, align - 1).map(|sum| sum & !(align - 1))
}
