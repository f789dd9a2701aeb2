//! A pointer-and-flag heap interface over one [`BuddyAllocator`].
//!
//! [`Heap`] exposes the allocator the way a C-style heap would: sizes are
//! signed, failures are reported as null pointers or `false`, and invalid
//! arguments are silently ignored. Every call still goes through the same
//! checks as the typed interface, so a failed call never changes any state.

use core::ptr::{self, NonNull};

#[cfg(feature = "log")]
use log::warn;

use crate::{BuddyAllocator, Raw};

/// A heap over a caller-supplied pool.
///
/// A `Heap` starts out without a pool; until [`init`](Heap::init) succeeds,
/// every allocation fails.
///
/// ```
/// use avl_buddy::Heap;
///
/// let mut pool = vec![0u64; 1 << 15];
/// let mut heap = Heap::new();
///
/// unsafe { heap.init(pool.as_mut_ptr().cast(), 1 << 18) };
///
/// let p = heap.alloc(1000);
/// assert!(!p.is_null());
/// assert!(unsafe { heap.free(p) });
///
/// let mut pending = 0;
/// heap.done(Some(&mut pending));
/// assert_eq!(pending, 0);
/// ```
#[derive(Debug, Default)]
pub struct Heap {
    buddy: Option<BuddyAllocator<Raw>>,
}

impl Heap {
    /// Creates a heap without a pool.
    pub const fn new() -> Heap {
        Heap { buddy: None }
    }

    /// Starts managing the `size` bytes at `pool`.
    ///
    /// Does nothing if `pool` is null or `size` is not positive. Otherwise,
    /// all state from a previous pool is discarded, including the
    /// outstanding-allocation count.
    ///
    /// # Safety
    ///
    /// `pool` must be valid for reads and writes for `size` bytes, and must
    /// not be accessed by other code while the heap manages it, except
    /// through pointers returned by [`alloc`](Heap::alloc). Pointers returned
    /// for a previous pool must no longer be used.
    pub unsafe fn init(&mut self, pool: *mut u8, size: isize) {
        let (Some(pool), Ok(size)) = (NonNull::new(pool), usize::try_from(size)) else {
            return;
        };

        if size == 0 {
            return;
        }

        self.buddy = match unsafe { BuddyAllocator::new_raw(pool, size) } {
            Ok(buddy) => Some(buddy),
            Err(_e) => {
                warn!("heap: cannot manage pool: {}", _e);
                None
            }
        };
    }

    /// Allocates `size` bytes.
    ///
    /// Returns null if `size` is not positive, if no pool is set, or if no
    /// free chunk is large enough.
    pub fn alloc(&mut self, size: isize) -> *mut u8 {
        let (Some(buddy), Ok(size)) = (self.buddy.as_mut(), usize::try_from(size)) else {
            return ptr::null_mut();
        };

        match buddy.allocate(size) {
            Ok(block) => block.cast::<u8>().as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    /// Releases the block at `ptr`.
    ///
    /// Returns `false`, changing nothing, if `ptr` is null or is not exactly
    /// a pointer returned by [`alloc`](Heap::alloc) that has not been freed
    /// since.
    ///
    /// # Safety
    ///
    /// If `ptr` was returned by [`alloc`](Heap::alloc), the block must not be
    /// accessed after this call.
    pub unsafe fn free(&mut self, ptr: *mut u8) -> bool {
        let (Some(buddy), Some(ptr)) = (self.buddy.as_mut(), NonNull::new(ptr)) else {
            return false;
        };

        unsafe { buddy.deallocate(ptr) }.is_ok()
    }

    /// Writes the number of outstanding allocations to `pending` and resets
    /// the count.
    ///
    /// Does nothing if `pending` is `None`. Memory is not reclaimed; blocks
    /// freed after the reset count against the next report, which can
    /// therefore be negative.
    pub fn done(&mut self, pending: Option<&mut isize>) {
        let Some(pending) = pending else {
            return;
        };

        *pending = self.buddy.as_mut().map_or(0, |buddy| buddy.take_outstanding());
    }

    #[cfg(test)]
    pub(crate) fn allocator(&self) -> Option<&BuddyAllocator<Raw>> {
        self.buddy.as_ref()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::prelude::rust_2021::*;

    use super::*;

    fn pool(size: usize) -> Vec<u64> {
        std::vec![0; (size + 7) / 8]
    }

    #[test]
    fn uninitialized_heap_refuses_everything() {
        let mut heap = Heap::new();
        let mut word = 0u64;

        assert!(heap.alloc(16).is_null());
        assert!(!unsafe { heap.free((&mut word as *mut u64).cast()) });

        let mut pending = 7;
        heap.done(Some(&mut pending));
        assert_eq!(pending, 0);
    }

    #[test]
    fn invalid_init_arguments_are_ignored() {
        let mut mem = pool(4096);
        let mut heap = Heap::new();

        unsafe {
            heap.init(ptr::null_mut(), 4096);
            assert!(heap.alloc(16).is_null());

            heap.init(mem.as_mut_ptr().cast(), 0);
            assert!(heap.alloc(16).is_null());

            heap.init(mem.as_mut_ptr().cast(), -1);
            assert!(heap.alloc(16).is_null());
        }
    }

    #[test]
    fn invalid_init_keeps_previous_pool() {
        let mut mem = pool(4096);
        let mut heap = Heap::new();

        unsafe {
            heap.init(mem.as_mut_ptr().cast(), 4096);
            let p = heap.alloc(100);
            assert!(!p.is_null());

            heap.init(ptr::null_mut(), 4096);
            assert!(heap.free(p));
        }
    }

    #[test]
    fn non_positive_sizes_and_null_frees_fail() {
        let mut mem = pool(4096);
        let mut heap = Heap::new();
        unsafe { heap.init(mem.as_mut_ptr().cast(), 4096) };

        assert!(heap.alloc(0).is_null());
        assert!(heap.alloc(-5).is_null());
        assert!(!unsafe { heap.free(ptr::null_mut()) });

        let mut pending = 1;
        heap.done(Some(&mut pending));
        assert_eq!(pending, 0);
    }

    #[test]
    fn done_without_output_keeps_count() {
        let mut mem = pool(4096);
        let mut heap = Heap::new();
        unsafe { heap.init(mem.as_mut_ptr().cast(), 4096) };

        assert!(!heap.alloc(8).is_null());
        heap.done(None);

        let mut pending = 0;
        heap.done(Some(&mut pending));
        assert_eq!(pending, 1);

        heap.done(Some(&mut pending));
        assert_eq!(pending, 0);
    }

    #[test]
    fn release_after_report_counts_against_next_report() {
        let mut mem = pool(4096);
        let mut heap = Heap::new();
        unsafe { heap.init(mem.as_mut_ptr().cast(), 4096) };

        let a = heap.alloc(10);
        assert!(!a.is_null());
        assert!(!heap.alloc(10).is_null());

        let mut pending = 0;
        heap.done(Some(&mut pending));
        assert_eq!(pending, 2);

        assert!(unsafe { heap.free(a) });
        assert!(!heap.alloc(10).is_null());

        heap.done(Some(&mut pending));
        assert_eq!(pending, 0);

        let c = heap.alloc(10);
        assert!(unsafe { heap.free(c) });
        assert!(!heap.alloc(10).is_null());
        heap.done(Some(&mut pending));
        assert_eq!(pending, 1);
    }

    #[test]
    fn reinit_discards_previous_state() {
        let mut mem = pool(4096);
        let mut heap = Heap::new();

        unsafe {
            heap.init(mem.as_mut_ptr().cast(), 4096);
            let p = heap.alloc(100);
            assert!(!p.is_null());

            heap.init(mem.as_mut_ptr().cast(), 4096);
            assert!(!heap.free(p));
        }

        let mut pending = 9;
        heap.done(Some(&mut pending));
        assert_eq!(pending, 0);
    }
}
