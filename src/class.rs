//! Size-class arithmetic.
//!
//! A chunk of class `p` spans `2^p` bytes. Every chunk begins with a
//! [`HEADER_SIZE`]-byte header, which is also the smallest unit the
//! allocator reasons about: any byte count not exceeding it maps to class 0.

use core::mem;

use crate::tree::ChunkHeader;

/// The size of the in-place header at the start of every chunk.
pub const HEADER_SIZE: usize = mem::size_of::<ChunkHeader>();

/// The number of size classes, and so of free-chunk trees.
///
/// The largest chunk an allocator can hold is `2^(NUM_CLASSES - 1)` bytes.
pub const NUM_CLASSES: usize = 30;

/// The maximum number of blocks a region is divided into.
pub const MAX_BLOCKS: usize = 30;

/// The smallest class whose chunks can hold a header.
pub const MIN_CHUNK_CLASS: usize = HEADER_SIZE.next_power_of_two().trailing_zeros() as usize;

/// Returns the smallest class `p` such that `2^p >= n`.
///
/// Returns 0 for any `n` no larger than [`HEADER_SIZE`].
///
/// ```
/// use avl_buddy::{ceiling_class, HEADER_SIZE};
///
/// assert_eq!(ceiling_class(HEADER_SIZE), 0);
/// assert_eq!(ceiling_class(4096), 12);
/// assert_eq!(ceiling_class(4097), 13);
/// ```
#[inline]
pub const fn ceiling_class(n: usize) -> usize {
    if n <= HEADER_SIZE {
        return 0;
    }

    // For n >= 2, ceil(log2(n)) is the bit length of n - 1.
    (usize::BITS - (n - 1).leading_zeros()) as usize
}

/// Returns the largest class `p` such that `2^p <= n`.
///
/// Returns 0 for any `n` no larger than [`HEADER_SIZE`].
///
/// ```
/// use avl_buddy::floor_class;
///
/// assert_eq!(floor_class(4096), 12);
/// assert_eq!(floor_class(8191), 12);
/// ```
#[inline]
pub const fn floor_class(n: usize) -> usize {
    if n <= HEADER_SIZE {
        return 0;
    }

    n.ilog2() as usize
}

/// Returns the size in bytes of a chunk of class `class`.
#[inline]
pub(crate) const fn class_size(class: usize) -> usize {
    1 << class
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fits_min_chunk() {
        assert!(class_size(MIN_CHUNK_CLASS) >= HEADER_SIZE);
        assert!(class_size(MIN_CHUNK_CLASS - 1) < HEADER_SIZE);
        assert_eq!(HEADER_SIZE % mem::align_of::<ChunkHeader>(), 0);
    }

    #[test]
    fn small_sizes_are_class_zero() {
        for n in 0..=HEADER_SIZE {
            assert_eq!(ceiling_class(n), 0);
            assert_eq!(floor_class(n), 0);
        }
    }

    #[test]
    fn exact_powers_of_two() {
        for p in MIN_CHUNK_CLASS..usize::BITS as usize {
            let n = 1usize << p;
            assert_eq!(ceiling_class(n), p, "ceiling of 2^{p}");
            assert_eq!(floor_class(n), p, "floor of 2^{p}");
        }
    }

    #[test]
    fn between_powers_of_two() {
        for p in MIN_CHUNK_CLASS..(usize::BITS as usize - 1) {
            let n = (1usize << p) + 1;
            assert_eq!(ceiling_class(n), p + 1);
            assert_eq!(floor_class(n), p);

            let m = (1usize << (p + 1)) - 1;
            assert_eq!(ceiling_class(m), p + 1);
            assert_eq!(floor_class(m), p);
        }
    }

    #[test]
    fn extremes() {
        assert_eq!(ceiling_class(usize::MAX), usize::BITS as usize);
        assert_eq!(floor_class(usize::MAX), usize::BITS as usize - 1);
        assert_eq!(ceiling_class(HEADER_SIZE + 1), MIN_CHUNK_CLASS);
    }

    #[test]
    fn request_classes() {
        // 1_000_000 bytes plus a header needs a 1 MiB chunk.
        assert_eq!(ceiling_class(1_000_000 + HEADER_SIZE), 20);
        assert_eq!(ceiling_class(250_000 + HEADER_SIZE), 18);
        assert_eq!(ceiling_class(500_000 + HEADER_SIZE), 19);
        assert_eq!(floor_class(2_359_296), 21);
    }
}
