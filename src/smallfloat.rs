//! The SmallFloat size-class codec: maps a `u32` byte size onto one of the
//! allocator's 256 leaf bins, and back.
//!
//! Bin sizes follow a floating-point-like (exponent + mantissa) distribution
//! — a piecewise linear-then-exponential approximation of a log scale — so
//! that every size class carries roughly the same worst-case overhead
//! percentage, the same shape used for size-class binning throughout this
//! crate family, just with a fixed 3-bit mantissa / 5-bit exponent instead
//! of a generically-sized one.

const MANTISSA_BITS: u32 = 3;
const MANTISSA_VALUE: u32 = 1 << MANTISSA_BITS;
const MANTISSA_MASK: u32 = MANTISSA_VALUE - 1;

/// Rounds `size` up to the nearest bin index whose represented size is `>= size`.
///
/// Used when searching for a free region to serve an allocation: the chosen
/// bin must never be smaller than what was asked for.
#[inline]
pub(crate) fn round_up(size: u32) -> u32 {
    let (mut exp, mut mantissa) = (0u32, 0u32);

    if size < MANTISSA_VALUE {
        mantissa = size;
    } else {
        let highest_set_bit = 31 - size.leading_zeros();
        let mantissa_start_bit = highest_set_bit - MANTISSA_BITS;
        exp = mantissa_start_bit + 1;
        mantissa = (size >> mantissa_start_bit) & MANTISSA_MASK;

        let low_bits_mask = (1u32 << mantissa_start_bit) - 1;
        if size & low_bits_mask != 0 {
            // round up; this may carry the mantissa into the exponent field,
            // which is intentional and harmless since `+` (not `|`) is used below
            mantissa += 1;
        }
    }

    (exp << MANTISSA_BITS) + mantissa
}

/// Rounds `size` down to the nearest bin index whose represented size is `<= size`.
///
/// Used when a freed or split region is inserted into a bin: the bin must
/// never overstate the size of the region it holds.
#[inline]
pub(crate) fn round_down(size: u32) -> u32 {
    let (mut exp, mut mantissa) = (0u32, 0u32);

    if size < MANTISSA_VALUE {
        mantissa = size;
    } else {
        let highest_set_bit = 31 - size.leading_zeros();
        let mantissa_start_bit = highest_set_bit - MANTISSA_BITS;
        exp = mantissa_start_bit + 1;
        mantissa = (size >> mantissa_start_bit) & MANTISSA_MASK;
    }

    (exp << MANTISSA_BITS) | mantissa
}

/// Recovers the size represented by a bin index produced by [`round_up`] or
/// [`round_down`].
#[inline]
pub(crate) fn to_size(bin: u32) -> u32 {
    let exponent = bin >> MANTISSA_BITS;
    let mantissa = bin & MANTISSA_MASK;

    if exponent == 0 {
        mantissa
    } else {
        (mantissa | MANTISSA_VALUE) << (exponent - 1)
    }
}
