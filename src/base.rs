use core::{
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

#[cfg(feature = "sptr")]
use crate::polyfill::{NonNullStrict, Strict};

use crate::tree::ChunkHeader;

/// A pointer to the base of the region of memory managed by an allocator.
///
/// Every access to a chunk header goes through this pointer, so all derived
/// pointers carry the provenance of the region.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`.
    ///
    /// Returns `None` if the region would extend past the end of the address
    /// space. The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> Option<BasePtr> {
        ptr.addr().get().checked_add(extent)?;

        Some(BasePtr { ptr, extent })
    }

    #[inline]
    pub fn extent(self) -> usize {
        self.extent
    }

    /// Returns the first address past the end of the region.
    #[inline]
    pub fn limit(self) -> usize {
        self.ptr.addr().get() + self.extent
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.ptr.addr() <= addr && addr.get() < self.limit()
    }

    /// Calculates the offset from `self` to `addr`.
    #[inline]
    pub fn offset_to(self, addr: NonZeroUsize) -> usize {
        addr.get()
            .checked_sub(self.ptr.addr().get())
            .expect("address below region base")
    }

    /// Returns the address `offset` bytes past the base.
    #[inline]
    pub fn addr_at(self, offset: usize) -> NonZeroUsize {
        debug_assert!(offset < self.extent);

        // Cannot overflow or be zero: the region end was checked in `new`.
        NonZeroUsize::new(self.ptr.addr().get() + offset).expect("address at offset is null")
    }

    /// Initializes a `ChunkHeader` at the given address.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be a properly aligned address for `ChunkHeader` values.
    /// - The memory at `addr` must be within the provenance of `self` and valid
    ///   for reads and writes for `size_of::<ChunkHeader>()` bytes.
    /// - No live reference may point into the memory at `addr`.
    #[inline]
    pub unsafe fn init_header_at(self, addr: NonZeroUsize, header: ChunkHeader) {
        debug_assert!(self.contains_addr(addr));
        debug_assert!(
            header.left.map_or(true, |l| self.contains_addr(l)),
            "left link out of region"
        );
        debug_assert!(
            header.right.map_or(true, |r| self.contains_addr(r)),
            "right link out of region"
        );

        unsafe {
            self.with_addr(addr)
                .cast::<ChunkHeader>()
                .as_ptr()
                .write(header)
        };
    }

    /// Returns a mutable reference to the `ChunkHeader` at `addr`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be a properly aligned address for `ChunkHeader` values.
    /// - The memory at `addr` must contain a properly initialized `ChunkHeader`.
    /// - The memory at `addr` must be within the provenance of `self`, and no
    ///   other reference to it may be live while the returned one is used.
    #[inline]
    pub unsafe fn header_mut<'a>(self, addr: NonZeroUsize) -> &'a mut ChunkHeader {
        debug_assert!(self.contains_addr(addr));

        unsafe { self.ptr.with_addr(addr).cast::<ChunkHeader>().as_mut() }
    }

    /// Creates a new pointer with the given address.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_addr(self, addr: NonZeroUsize) -> NonNull<u8> {
        debug_assert!(self.contains_addr(addr));

        self.ptr.with_addr(addr)
    }

    #[inline]
    pub fn with_addr_and_size(self, addr: NonZeroUsize, len: usize) -> NonNull<[u8]> {
        debug_assert!(self.contains_addr(addr));

        let ptr = self.ptr.as_ptr().with_addr(addr.get());
        let raw_slice = ptr::slice_from_raw_parts_mut(ptr, len);

        unsafe { NonNull::new_unchecked(raw_slice) }
    }
}
