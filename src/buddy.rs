//! Binary-buddy allocation.
//!
//! A buddy allocator manages chunks whose sizes are powers of two. A free
//! chunk that is larger than a request is split in halves until a chunk of
//! the right class remains; the halves not handed out are kept free. When a
//! chunk is released it is merged with its buddy, the other half of the chunk
//! it was split from, for as long as that buddy is free as well.
//!
//! The managed region is first decomposed into at most [`MAX_BLOCKS`] blocks
//! of strictly decreasing power-of-two sizes. Every block is a buddy system
//! of its own; chunks are never merged across blocks, even adjacent ones.
//!
//! Chunk metadata lives in a [`HEADER_SIZE`]-byte header at the start of the
//! chunk. The usable part of an allocation begins right after it.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case |
//! |--------------------------|-----------|------------|
//! | Allocate                 | O(log n)  | O(log n)   |
//! | Deallocate               | O(log n)  | O(log n)   |
//!
//! Here n is the number of chunks; both operations also touch at most
//! [`NUM_CLASSES`] size classes.
//!
//! #### Fragmentation
//!
//! Requests are rounded up to a power of two including the header, so
//! internal fragmentation is below 50% of each chunk. Within a size class the
//! lowest-addressed free chunk is always chosen, which keeps free space at
//! high addresses contiguous.
//!
//! [`HEADER_SIZE`]: crate::HEADER_SIZE
//! [`MAX_BLOCKS`]: crate::MAX_BLOCKS
//! [`NUM_CLASSES`]: crate::NUM_CLASSES

use core::{
    alloc::Layout,
    fmt,
    mem::{self, ManuallyDrop},
    num::NonZeroUsize,
    ptr::NonNull,
};

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "sptr")]
use crate::polyfill::NonNullStrict;

#[cfg(any(feature = "alloc", test))]
use crate::Global;

use crate::{
    base::BasePtr,
    class::{
        ceiling_class, class_size, floor_class, HEADER_SIZE, MAX_BLOCKS, MIN_CHUNK_CLASS,
        NUM_CLASSES,
    },
    tree::{AvlTree, ChunkHeader},
    AllocError, AllocInitError, BackingAllocator, Raw,
};

/// Alignment of the start of the managed range, and of every chunk in it.
const REGION_ALIGN: usize = mem::align_of::<ChunkHeader>();

/// A maximal power-of-two range of the region.
#[derive(Copy, Clone, Debug)]
struct Block {
    /// Offset of the block from the (aligned) region base.
    offset: usize,
    class: u8,
}

impl Block {
    const EMPTY: Block = Block {
        offset: 0,
        class: 0,
    };
}

/// A binary-buddy allocator.
///
/// For a discussion of buddy allocation, see the [module-level
/// documentation].
///
/// The allocator is parameterized by the [`BackingAllocator`] that owns its
/// region: [`Raw`] for caller-owned memory, or [`Global`] when the region was
/// obtained with [`BuddyAllocator::try_new`].
///
/// [module-level documentation]: crate::buddy
/// [`Global`]: crate::Global
pub struct BuddyAllocator<A: BackingAllocator> {
    raw: RawBuddy,
    backing_allocator: A,
}

impl BuddyAllocator<Raw> {
    /// Constructs a new `BuddyAllocator` from a raw pointer.
    ///
    /// The start of the region is rounded up to the alignment of a chunk
    /// header. The rest is decomposed into power-of-two blocks; a tail too
    /// small to hold a header is left unused.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if the region would extend
    /// past the end of the address space.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `size` bytes, and no
    /// other code may access that memory while the allocator exists, except
    /// through blocks it has handed out.
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        size: usize,
    ) -> Result<BuddyAllocator<Raw>, AllocInitError> {
        unsafe { RawBuddy::try_new(region, size).map(|b| b.with_backing_allocator(Raw)) }
    }
}

#[cfg(any(feature = "alloc", test))]
impl BuddyAllocator<Global> {
    /// Attempts to construct a new `BuddyAllocator` over `size` bytes
    /// obtained from the global allocator.
    ///
    /// The region is returned to the global allocator when the
    /// `BuddyAllocator` is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero or too large for a [`Layout`], or if
    /// the region could not be allocated.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(size: usize) -> Result<BuddyAllocator<Global>, AllocInitError> {
        let layout = Self::region_layout(size)?;

        unsafe {
            let region = NonNull::new(alloc::alloc::alloc(layout))
                .ok_or(AllocInitError::AllocFailed(layout))?;

            match RawBuddy::try_new(region, size) {
                Ok(raw) => Ok(raw.with_backing_allocator(Global)),
                Err(e) => {
                    alloc::alloc::dealloc(region.as_ptr(), layout);
                    Err(e)
                }
            }
        }
    }
}

impl<A: BackingAllocator> BuddyAllocator<A> {
    /// Returns the layout of a region of `size` bytes as the allocator would
    /// request it from a backing allocator.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `size` is zero or does not
    /// fit a [`Layout`].
    pub fn region_layout(size: usize) -> Result<Layout, AllocInitError> {
        if size == 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        Layout::from_size_align(size, REGION_ALIGN).map_err(|_| AllocInitError::InvalidConfig)
    }

    /// Attempts to allocate a block of memory of at least `size` bytes.
    ///
    /// On success, returns a [`NonNull<[u8]>`] of length `size`. The chunk
    /// holding it is the lowest-addressed free chunk of the smallest
    /// sufficient size class. The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidArgument`] if `size` is zero, and
    /// [`AllocError::OutOfMemory`] if no free chunk is large enough. In
    /// either case the allocator is unchanged.
    ///
    /// [`NonNull<[u8]>`]: NonNull
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        let addr = self.raw.allocate(size)?;

        // The returned block inherits the provenance of the base pointer.
        Ok(self.raw.base.with_addr_and_size(addr, size))
    }

    /// Deallocates the memory referenced by `ptr`.
    ///
    /// The released chunk is merged with its buddy for as long as the buddy
    /// is free.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidPointer`], leaving the allocator
    /// unchanged, if `ptr` is not exactly a pointer returned by
    /// [`allocate`](Self::allocate) and not yet deallocated. Pointers into the
    /// middle of a block, or into another region entirely, are rejected.
    ///
    /// # Safety
    ///
    /// If `ptr` denotes a block currently allocated via this allocator, that
    /// block must not be accessed after this call.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        unsafe { self.raw.deallocate(ptr.addr()) }
    }

    /// Returns the number of allocations made since the last call to
    /// [`take_outstanding`](Self::take_outstanding), minus the number of
    /// deallocations made since then.
    ///
    /// The count is negative if more blocks were released than allocated
    /// since the last reset.
    #[inline]
    pub fn outstanding(&self) -> isize {
        self.raw.outstanding
    }

    /// Returns the outstanding-allocation count and resets it to zero.
    ///
    /// This is a reporting aid for detecting leaks at the end of an
    /// allocator's useful life. It does not reclaim any memory, so blocks
    /// still allocated at the reset are counted as -1 when they are released.
    #[inline]
    pub fn take_outstanding(&mut self) -> isize {
        mem::take(&mut self.raw.outstanding)
    }

    /// Returns the number of blocks the region was decomposed into.
    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.raw.num_blocks
    }

    /// Returns an iterator over the blocks of the region, in address order.
    pub fn blocks(&self) -> impl Iterator<Item = NonNull<[u8]>> + '_ {
        let base = self.raw.base;

        self.raw.blocks().iter().map(move |block| {
            base.with_addr_and_size(
                base.addr_at(block.offset),
                class_size(block.class.into()),
            )
        })
    }

    /// Returns the total size of all blocks, headers included.
    pub fn capacity(&self) -> usize {
        self.raw
            .blocks()
            .iter()
            .map(|block| class_size(block.class.into()))
            .sum()
    }

    /// Returns the total size of all free chunks, headers included.
    pub fn free_bytes(&self) -> usize {
        self.raw
            .free
            .iter()
            .enumerate()
            .map(|(class, tree)| tree.len() * class_size(class))
            .sum()
    }

    /// Returns a pointer to the region managed by this allocator.
    pub fn region(&self) -> NonNull<[u8]> {
        NonNull::slice_from_raw_parts(self.raw.region, self.raw.region_size)
    }

    /// Decomposes the allocator into its raw components.
    ///
    /// The returned tuple contains the region pointer and the region size, as
    /// originally supplied or allocated.
    ///
    /// # Safety
    ///
    /// All outstanding allocations are invalidated when this method is called;
    /// the returned region pointer becomes the sole owner of the region that
    /// was used to construct the allocator. If the allocator is backed by
    /// [`Global`](crate::Global), the caller becomes responsible for freeing
    /// the region with the layout given by
    /// [`region_layout`](Self::region_layout).
    pub unsafe fn into_raw_parts(self) -> (NonNull<u8>, usize) {
        let this = ManuallyDrop::new(self);

        (this.raw.region, this.raw.region_size)
    }
}

impl<A: BackingAllocator> Drop for BuddyAllocator<A> {
    fn drop(&mut self) {
        // A layout can always be formed for allocated regions; for raw
        // regions it is never used.
        if let Ok(layout) = Self::region_layout(self.raw.region_size) {
            unsafe {
                self.backing_allocator
                    .deallocate(self.raw.region, layout)
            };
        }
    }
}

impl<A: BackingAllocator> fmt::Debug for BuddyAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct FreeChunks<'a>(&'a [AvlTree; NUM_CLASSES]);

        impl fmt::Debug for FreeChunks<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_map()
                    .entries(
                        self.0
                            .iter()
                            .enumerate()
                            .filter(|(_, tree)| !tree.is_empty())
                            .map(|(class, tree)| (class, tree.len())),
                    )
                    .finish()
            }
        }

        f.debug_struct("BuddyAllocator")
            .field("region", &self.raw.region)
            .field("blocks", &self.raw.blocks())
            .field("outstanding", &self.raw.outstanding)
            .field("allocated_chunks", &self.raw.allocated.len())
            .field("free_chunks", &FreeChunks(&self.raw.free))
            .finish()
    }
}

/// The state of a `BuddyAllocator`, without a `Drop` impl or an associated
/// allocator.
///
/// This assists in tacking on the allocator type parameter because this
/// struct can be moved out of, while `BuddyAllocator` itself cannot.
struct RawBuddy {
    /// The aligned range actually divided into blocks.
    base: BasePtr,
    /// The region as supplied, returned by `into_raw_parts()`.
    region: NonNull<u8>,
    region_size: usize,
    blocks: [Block; MAX_BLOCKS],
    num_blocks: usize,
    /// One tree of free chunks per size class.
    free: [AvlTree; NUM_CLASSES],
    allocated: AvlTree,
    outstanding: isize,
}

impl RawBuddy {
    fn with_backing_allocator<A: BackingAllocator>(self, backing_allocator: A) -> BuddyAllocator<A> {
        BuddyAllocator {
            raw: self,
            backing_allocator,
        }
    }

    /// Decomposes the region into blocks and makes each one a free chunk.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `size` bytes.
    unsafe fn try_new(region: NonNull<u8>, size: usize) -> Result<RawBuddy, AllocInitError> {
        const NO_CHUNKS: AvlTree = AvlTree::new();

        // Rejects regions that wrap the address space.
        BasePtr::new(region, size).ok_or(AllocInitError::InvalidConfig)?;

        let skip = region.as_ptr().align_offset(REGION_ALIGN).min(size);
        let aligned = NonZeroUsize::new(region.addr().get() + skip)
            .ok_or(AllocInitError::InvalidConfig)?;
        let base = BasePtr::new(region.with_addr(aligned), size - skip)
            .ok_or(AllocInitError::InvalidConfig)?;

        let mut raw = RawBuddy {
            base,
            region,
            region_size: size,
            blocks: [Block::EMPTY; MAX_BLOCKS],
            num_blocks: 0,
            free: [NO_CHUNKS; NUM_CLASSES],
            allocated: AvlTree::new(),
            outstanding: 0,
        };

        let mut offset = 0;
        let mut remaining = base.extent();

        // A block must at least be able to hold its own header.
        while raw.num_blocks < MAX_BLOCKS && remaining >= class_size(MIN_CHUNK_CLASS) {
            let class = floor_class(remaining).min(NUM_CLASSES - 1);
            let index = raw.num_blocks;

            raw.blocks[index] = Block {
                offset,
                class: class as u8,
            };

            let inserted = unsafe {
                raw.free[class].insert(base, base.addr_at(offset), true, index as u8, class as u8)
            };
            assert!(inserted, "block {index} overlaps another block");

            raw.num_blocks += 1;
            offset += class_size(class);
            remaining -= class_size(class);
        }

        debug!(
            "buddy: {} bytes at {:#x} split into {} blocks, {} bytes unused",
            size,
            region.addr(),
            raw.num_blocks,
            size - offset
        );

        Ok(raw)
    }

    fn blocks(&self) -> &[Block] {
        &self.blocks[..self.num_blocks]
    }

    fn allocate(&mut self, size: usize) -> Result<NonZeroUsize, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidArgument);
        }

        let base = self.base;

        let need = size
            .checked_add(HEADER_SIZE)
            .map(ceiling_class)
            .ok_or(AllocError::OutOfMemory)?;
        debug_assert!(need >= MIN_CHUNK_CLASS);

        // Take the lowest chunk of the smallest nonempty class that fits.
        let donor = (need..NUM_CLASSES).find_map(|class| {
            let chunk = unsafe { self.free[class].smallest(base) }?;
            Some((class, chunk))
        });

        let Some((donor, chunk)) = donor else {
            debug!("buddy: out of memory for {} bytes (class {})", size, need);
            return Err(AllocError::OutOfMemory);
        };

        let block = unsafe { base.header_mut(chunk).block };

        let removed = unsafe { self.free[donor].remove(base, chunk) };
        assert!(removed, "smallest free chunk missing from its tree");

        // Split the chunk repeatedly. The lower half is kept; the address of
        // the chunk does not change.
        for class in (need..donor).rev() {
            let upper = base.addr_at(base.offset_to(chunk) + class_size(class));

            trace!("buddy: split {:#x}, upper half {:#x} (class {})", chunk, upper, class);

            let inserted = unsafe { self.free[class].insert(base, upper, true, block, class as u8) };
            assert!(inserted, "split half already tracked");
        }

        let inserted = unsafe { self.allocated.insert(base, chunk, false, block, need as u8) };
        assert!(inserted, "allocated chunk already tracked");

        self.outstanding += 1;

        Ok(base.addr_at(base.offset_to(chunk) + HEADER_SIZE))
    }

    /// # Safety
    ///
    /// See `BuddyAllocator::deallocate`.
    unsafe fn deallocate(&mut self, ptr: NonZeroUsize) -> Result<(), AllocError> {
        let base = self.base;

        // The closest allocated header below `ptr` must end exactly at `ptr`.
        let Some(chunk) = (unsafe { self.allocated.predecessor(base, ptr) })
            .filter(|chunk| chunk.get() + HEADER_SIZE == ptr.get())
        else {
            warn!("buddy: rejected release of {:#x}", ptr);
            return Err(AllocError::InvalidPointer);
        };

        let header = unsafe { *base.header_mut(chunk) };
        debug_assert!(!header.is_free);

        let removed = unsafe { self.allocated.remove(base, chunk) };
        assert!(removed, "allocated chunk missing from its tree");

        self.outstanding -= 1;

        unsafe { self.coalesce(chunk, header.block, header.power.into()) };

        Ok(())
    }

    /// Merges the free chunk at `chunk` with its buddies for as long as they
    /// are free, then files the result under its final class.
    ///
    /// # Safety
    ///
    /// `chunk` must be a chunk of class `class` in block `block` that is not a
    /// node of any tree.
    unsafe fn coalesce(&mut self, mut chunk: NonZeroUsize, block: u8, mut class: usize) {
        let base = self.base;
        let Block {
            offset: block_ofs,
            class: block_class,
        } = self.blocks[usize::from(block)];

        // Buddies are found relative to the block base; a chunk spanning the
        // whole block has none.
        while class < usize::from(block_class) {
            let chunk_ofs = base.offset_to(chunk) - block_ofs;
            let buddy = base.addr_at(block_ofs + (chunk_ofs ^ class_size(class)));

            if !unsafe { self.free[class].remove(base, buddy) } {
                break;
            }

            trace!("buddy: merged {:#x} with {:#x} (class {})", chunk, buddy, class);

            chunk = chunk.min(buddy);
            class += 1;
        }

        let inserted = unsafe { self.free[class].insert(base, chunk, true, block, class as u8) };
        assert!(inserted, "coalesced chunk already tracked");
    }
}

/// A chunk as recorded by one of the allocator's trees.
#[cfg(test)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ChunkInfo {
    /// Offset from the aligned region base.
    pub offset: usize,
    pub class: usize,
    pub block: usize,
    pub is_free: bool,
}

#[cfg(test)]
impl<A: BackingAllocator> BuddyAllocator<A> {
    /// Returns every tracked chunk, sorted by address.
    pub(crate) fn chunks(&self) -> alloc::vec::Vec<ChunkInfo> {
        let base = self.raw.base;
        let mut chunks = alloc::vec::Vec::new();

        let trees = self
            .raw
            .free
            .iter()
            .map(|tree| (tree, true))
            .chain(core::iter::once((&self.raw.allocated, false)));

        for (tree, in_free_tree) in trees {
            tree.for_each(base, |addr, header| {
                assert_eq!(header.is_free, in_free_tree, "header flag disagrees with tree");
                chunks.push(ChunkInfo {
                    offset: base.offset_to(addr),
                    class: header.power.into(),
                    block: header.block.into(),
                    is_free: header.is_free,
                });
            });
        }

        chunks.sort_unstable_by_key(|c| c.offset);
        chunks
    }

    /// Returns the `(len, height)` of every tree, allocated tree last.
    pub(crate) fn tree_shapes(&self) -> alloc::vec::Vec<(usize, usize)> {
        let base = self.raw.base;

        self.raw
            .free
            .iter()
            .chain(core::iter::once(&self.raw.allocated))
            .map(|tree| (tree.len(), tree.height(base)))
            .collect()
    }

    /// Returns `(offset, class)` of every block.
    pub(crate) fn block_extents(&self) -> alloc::vec::Vec<(usize, usize)> {
        self.raw
            .blocks()
            .iter()
            .map(|b| (b.offset, usize::from(b.class)))
            .collect()
    }

    /// Checks every structural invariant, panicking with a description of
    /// the first one violated.
    pub(crate) fn assert_invariants(&self) {
        let base = self.raw.base;

        for (class, tree) in self.raw.free.iter().enumerate() {
            assert!(tree.is_valid(base), "free tree {class} is malformed");
        }
        assert!(self.raw.allocated.is_valid(base), "allocated tree is malformed");

        let chunks = self.chunks();

        // Free trees hold only chunks of their own class.
        for (class, tree) in self.raw.free.iter().enumerate() {
            tree.for_each(base, |_, header| assert_eq!(usize::from(header.power), class));
        }

        // Tiling: chunks of each block are contiguous, aligned within the
        // block, and span it exactly. Sorting by offset also exposes any
        // address tracked twice as an overlap.
        let mut iter = chunks.iter().peekable();
        for (index, block) in self.raw.blocks().iter().enumerate() {
            let end = block.offset + class_size(block.class.into());
            let mut cursor = block.offset;

            while cursor < end {
                let chunk = iter.next().expect("block not fully tiled");
                assert_eq!(chunk.offset, cursor, "gap or overlap in block {index}");
                assert_eq!(chunk.block, index, "chunk attributed to wrong block");
                assert!(chunk.class >= MIN_CHUNK_CLASS && chunk.class <= block.class.into());
                assert_eq!((chunk.offset - block.offset) % class_size(chunk.class), 0);
                cursor += class_size(chunk.class);
            }

            assert_eq!(cursor, end, "chunk overruns block {index}");
        }
        assert!(iter.next().is_none(), "chunk outside every block");

        // Exhaustive coalescing: no free chunk has a free buddy.
        for chunk in chunks.iter().filter(|c| c.is_free) {
            let block = self.raw.blocks[chunk.block];
            if chunk.class == usize::from(block.class) {
                continue;
            }

            let buddy_ofs = block.offset + ((chunk.offset - block.offset) ^ class_size(chunk.class));
            let buddy = base.addr_at(buddy_ofs);
            assert!(
                !unsafe { self.raw.free[chunk.class].contains(base, buddy) },
                "free buddies at {:#x} and {:#x} were not merged",
                chunk.offset,
                buddy_ofs
            );
        }

        assert_eq!(self.raw.allocated.len(), chunks.iter().filter(|c| !c.is_free).count());
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::prelude::rust_2021::*;

    use super::*;

    /// A word-aligned buffer used as a caller-owned region.
    fn pool(size: usize) -> Vec<u64> {
        std::vec![0; (size + 7) / 8]
    }

    unsafe fn raw_buddy(pool: &mut [u64], size: usize) -> BuddyAllocator<Raw> {
        let region = NonNull::new(pool.as_mut_ptr().cast::<u8>()).unwrap();
        unsafe { BuddyAllocator::new_raw(region, size).unwrap() }
    }

    #[test]
    fn power_of_two_region_is_one_block() {
        let mut mem = pool(1 << 16);
        let buddy = unsafe { raw_buddy(&mut mem, 1 << 16) };

        assert_eq!(buddy.num_blocks(), 1);
        assert_eq!(buddy.capacity(), 1 << 16);
        assert_eq!(buddy.free_bytes(), 1 << 16);
        assert_eq!(buddy.block_extents(), std::vec![(0, 16)]);
        buddy.assert_invariants();
    }

    #[test]
    fn segmentation_is_greedy() {
        // 2 MiB + 256 KiB + 100 bytes.
        let size = (1 << 21) + (1 << 18) + 100;
        let mut mem = pool(size);
        let buddy = unsafe { raw_buddy(&mut mem, size) };

        assert_eq!(
            buddy.block_extents(),
            std::vec![(0, 21), (1 << 21, 18), ((1 << 21) + (1 << 18), 6), ((1 << 21) + (1 << 18) + 64, 5)]
        );
        assert_eq!(buddy.capacity(), size - 4);
        buddy.assert_invariants();
    }

    #[test]
    fn tail_smaller_than_a_header_is_unused() {
        let size = (1 << 10) + HEADER_SIZE;
        let mut mem = pool(size);
        let buddy = unsafe { raw_buddy(&mut mem, size) };

        assert_eq!(buddy.num_blocks(), 1);
        assert_eq!(buddy.capacity(), 1 << 10);
    }

    #[test]
    fn tiny_region_has_no_blocks() {
        let mut mem = pool(16);
        let mut buddy = unsafe { raw_buddy(&mut mem, 16) };

        assert_eq!(buddy.num_blocks(), 0);
        assert_eq!(buddy.allocate(1), Err(AllocError::OutOfMemory));
    }

    #[test]
    fn misaligned_region_is_rounded_up() {
        let mut mem = pool(1 << 12);
        let region = NonNull::new(mem.as_mut_ptr().cast::<u8>()).unwrap();
        let region = unsafe { NonNull::new_unchecked(region.as_ptr().add(1)) };

        let mut buddy = unsafe { BuddyAllocator::new_raw(region, (1 << 12) - 1).unwrap() };
        let block = buddy.allocate(10).unwrap();

        assert_eq!(block.cast::<u8>().as_ptr() as usize % REGION_ALIGN, 0);
        assert_eq!(buddy.region().len(), (1 << 12) - 1);
        buddy.assert_invariants();
    }

    #[test]
    fn wrapping_region_is_rejected() {
        let region = NonNull::<u8>::dangling();
        let res = unsafe { BuddyAllocator::new_raw(region, usize::MAX) };

        assert_eq!(res.err(), Some(AllocInitError::InvalidConfig));
    }

    #[test]
    fn split_then_merge() {
        let mut mem = pool(1 << 12);
        let mut buddy = unsafe { raw_buddy(&mut mem, 1 << 12) };

        let a = buddy.allocate(1).unwrap();
        buddy.assert_invariants();

        // One 32-byte chunk allocated, one free chunk of each class 5..12.
        let shapes = buddy.tree_shapes();
        for class in MIN_CHUNK_CLASS..12 {
            assert_eq!(shapes[class].0, 1, "class {class}");
        }
        assert_eq!(shapes[NUM_CLASSES].0, 1);

        unsafe { buddy.deallocate(a.cast()).unwrap() };
        buddy.assert_invariants();
        assert_eq!(buddy.free_bytes(), 1 << 12);
        assert_eq!(buddy.chunks().len(), 1);
    }

    #[test]
    fn lowest_address_is_preferred() {
        let mut mem = pool(1 << 12);
        let mut buddy = unsafe { raw_buddy(&mut mem, 1 << 12) };

        let blocks: Vec<_> = (0..4).map(|_| buddy.allocate(100).unwrap()).collect();
        for pair in blocks.windows(2) {
            assert!(pair[0].cast::<u8>() < pair[1].cast::<u8>());
        }

        unsafe { buddy.deallocate(blocks[1].cast()).unwrap() };
        let again = buddy.allocate(100).unwrap();
        assert_eq!(again.cast::<u8>(), blocks[1].cast::<u8>());
    }

    #[test]
    fn no_merging_across_blocks() {
        // Two blocks: 4096 and 2048 bytes.
        let size = (1 << 12) + (1 << 11);
        let mut mem = pool(size);
        let mut buddy = unsafe { raw_buddy(&mut mem, size) };

        // The first request fits the small block exactly; the next two split
        // the large one.
        let a = buddy.allocate((1 << 11) - HEADER_SIZE).unwrap();
        let b = buddy.allocate((1 << 11) - HEADER_SIZE).unwrap();
        let c = buddy.allocate((1 << 11) - HEADER_SIZE).unwrap();
        assert_eq!(buddy.allocate(1), Err(AllocError::OutOfMemory));

        unsafe {
            buddy.deallocate(b.cast()).unwrap();
            buddy.deallocate(c.cast()).unwrap();
            buddy.deallocate(a.cast()).unwrap();
        }
        buddy.assert_invariants();

        // The large block merged back; the small block stayed on its own even
        // though it is its numeric neighbor.
        let free: Vec<_> = buddy.chunks().iter().map(|c| (c.offset, c.class)).collect();
        assert_eq!(free, std::vec![(0, 12), (1 << 12, 11)]);
    }

    #[test]
    fn interior_and_foreign_pointers_are_rejected() {
        let mut mem = pool(1 << 12);
        let mut buddy = unsafe { raw_buddy(&mut mem, 1 << 12) };
        let mut other = 0u64;

        let a = buddy.allocate(64).unwrap().cast::<u8>();
        let interior = unsafe { NonNull::new_unchecked(a.as_ptr().add(8)) };
        let header = unsafe { NonNull::new_unchecked(a.as_ptr().sub(HEADER_SIZE)) };

        unsafe {
            assert_eq!(buddy.deallocate(interior), Err(AllocError::InvalidPointer));
            assert_eq!(buddy.deallocate(header), Err(AllocError::InvalidPointer));
            assert_eq!(
                buddy.deallocate(NonNull::from(&mut other).cast()),
                Err(AllocError::InvalidPointer)
            );
        }
        assert_eq!(buddy.outstanding(), 1);

        unsafe {
            assert_eq!(buddy.deallocate(a), Ok(()));
            assert_eq!(buddy.deallocate(a), Err(AllocError::InvalidPointer));
        }
        assert_eq!(buddy.outstanding(), 0);
        buddy.assert_invariants();
    }

    #[test]
    fn outstanding_goes_negative_after_reset() {
        let mut mem = pool(1 << 12);
        let mut buddy = unsafe { raw_buddy(&mut mem, 1 << 12) };

        let a = buddy.allocate(10).unwrap();
        let b = buddy.allocate(10).unwrap();
        assert_eq!(buddy.take_outstanding(), 2);

        unsafe {
            buddy.deallocate(a.cast()).unwrap();
            buddy.deallocate(b.cast()).unwrap();
        }
        assert_eq!(buddy.outstanding(), -2);

        buddy.allocate(10).unwrap();
        assert_eq!(buddy.take_outstanding(), -1);
        assert_eq!(buddy.outstanding(), 0);
        buddy.assert_invariants();
    }

    #[test]
    fn zero_and_oversized_requests() {
        let mut mem = pool(1 << 12);
        let mut buddy = unsafe { raw_buddy(&mut mem, 1 << 12) };

        assert_eq!(buddy.allocate(0), Err(AllocError::InvalidArgument));
        assert_eq!(buddy.allocate(1 << 12), Err(AllocError::OutOfMemory));
        assert_eq!(buddy.allocate(usize::MAX), Err(AllocError::OutOfMemory));
        assert_eq!(buddy.allocate(usize::MAX - HEADER_SIZE), Err(AllocError::OutOfMemory));
        assert_eq!(buddy.outstanding(), 0);
        assert_eq!(buddy.free_bytes(), 1 << 12);
    }

    #[test]
    fn global_backed_allocator() {
        let mut buddy = BuddyAllocator::try_new(3 << 10).unwrap();
        assert_eq!(buddy.num_blocks(), 2);

        let a = buddy.allocate(1000).unwrap();
        unsafe { a.cast::<u8>().as_ptr().write_bytes(0xA5, 1000) };
        unsafe { buddy.deallocate(a.cast()).unwrap() };

        assert_eq!(buddy.take_outstanding(), 0);
        assert_eq!(
            BuddyAllocator::<Global>::try_new(0).err(),
            Some(AllocInitError::InvalidConfig)
        );
    }

    #[test]
    fn into_raw_parts_returns_region() {
        let mut mem = pool(1 << 10);
        let buddy = unsafe { raw_buddy(&mut mem, 1 << 10) };

        let (region, size) = unsafe { buddy.into_raw_parts() };
        assert_eq!(region.as_ptr(), mem.as_mut_ptr().cast::<u8>());
        assert_eq!(size, 1 << 10);
    }
}
