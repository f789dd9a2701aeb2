//! A small library for ~~hating on~~ evaluating the correctness of
//! size-based allocators.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{mem::MaybeUninit, ptr::NonNull, slice};

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
    DeallocInterior,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp {
    /// Allocate a block of the given size.
    Alloc(usize),
    /// Deallocate the outstanding block at the given index, modulo the number
    /// of outstanding blocks.
    Dealloc(usize),
    /// Attempt to deallocate a pointer into the middle of the outstanding
    /// block at the first index, at an offset derived from the second.
    DeallocInterior(usize, usize),
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => {
                // Select a random bit count so small sizes are as likely as
                // large ones.
                let bits = u8::arbitrary(u)? % usize::BITS as u8;
                let size = usize::arbitrary(u)? & ((1 << bits) - 1);
                AllocatorOp::Alloc(size)
            }
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
            AllocatorOpTag::DeallocInterior => {
                AllocatorOp::DeallocInterior(usize::arbitrary(u)?, usize::arbitrary(u)?)
            }
        };

        Ok(op)
    }
}

pub trait Subject {
    type AllocError;

    /// Allocates a block of memory of `size` bytes.
    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError>;

    /// Deallocates the block of memory pointed to by `ptr`.
    ///
    /// Returns an error, leaving the allocator unchanged, if `ptr` does not
    /// denote a block currently allocated by this allocator.
    ///
    /// # Safety
    ///
    /// If `ptr` denotes a block currently allocated by this allocator, that
    /// block must not be accessed after this call.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Self::AllocError>;
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn get_modulo(&self, idx: usize) -> Option<&Block> {
        let len = self.blocks.len();
        (len != 0).then(|| &self.blocks[idx % len])
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // A pointer to the allocated region.
    ptr: NonNull<[u8]>,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

unsafe fn slice_ptr_to_uninit_slice_mut<'a>(ptr: NonNull<[u8]>) -> &'a mut [MaybeUninit<u8>] {
    unsafe { slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) }
}

unsafe fn paint(slice: &mut [MaybeUninit<u8>], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in slice.iter_mut().zip(id_bytes) {
        byte.write(value);
    }
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `ptr.len()` bytes.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - No accesses to the memory at `ptr` may be made except by way of the returned `Block` until
    ///   said `Block` is dropped.
    pub unsafe fn init(ptr: NonNull<[u8]>, id: u64) -> Block {
        let mut b = Block { ptr, id };
        b.paint(id);
        b
    }

    pub fn len(&self) -> usize {
        self.ptr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.len() == 0
    }

    /// Returns the `Block`'s memory as a slice of uninitialized bytes.
    pub fn as_uninit_slice(&self) -> &[MaybeUninit<u8>] {
        // SAFETY: self is immutably borrowed, so only immutable references to
        // the slice can exist
        unsafe { &*slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    pub fn into_raw(self) -> NonNull<[u8]> {
        self.ptr
    }

    /// Returns a pointer `offset` bytes into the block.
    ///
    /// # Panics
    ///
    /// Panics if `offset` exceeds the length of the block.
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset <= self.len());

        // SAFETY: offset is at most one past the end of the block
        unsafe { NonNull::new_unchecked(self.ptr.cast::<u8>().as_ptr().add(offset)) }
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        self.id = id;
        unsafe { paint(self.as_uninit_slice_mut(), id) };
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        let slice: &[u8] = unsafe { self.ptr.as_ref() };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice.iter().zip(id_bytes).all(|(byte, value)| *byte == value)
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    /// The operation that failed, or `None` if a block was found corrupted
    /// after all operations completed.
    pub failed_op: Option<AllocatorOp>,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn into_subject(self) -> S {
        self.subject
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id: u64 = op_id.try_into().unwrap();

            let ok = match op {
                AllocatorOp::Alloc(size) => {
                    if let Ok(ptr) = self.subject.allocate(size) {
                        let block = unsafe { Block::init(ptr, op_id) };
                        blocks.push(block);
                    }

                    true
                }

                AllocatorOp::Dealloc(raw_idx) => match blocks.remove_modulo(raw_idx) {
                    Some(mut block) => {
                        block.verify() && {
                            block.paint(op_id);
                            unsafe { self.subject.deallocate(block.ptr.cast()) }.is_ok()
                        }
                    }
                    None => true,
                },

                AllocatorOp::DeallocInterior(raw_idx, raw_ofs) => match blocks.get_modulo(raw_idx) {
                    Some(block) if !block.is_empty() => {
                        let interior = block.ptr_at(1 + raw_ofs % block.len());
                        unsafe { self.subject.deallocate(interior) }.is_err() && block.verify()
                    }
                    _ => true,
                },
            };

            if !ok {
                return Err(Failed {
                    completed,
                    failed_op: Some(op),
                });
            }

            completed.push(op);
        }

        for block in blocks {
            if !block.verify() {
                return Err(Failed {
                    completed,
                    failed_op: None,
                });
            }

            if unsafe { self.subject.deallocate(block.ptr.cast()) }.is_err() {
                return Err(Failed {
                    completed,
                    failed_op: None,
                });
            }
        }

        Ok(())
    }
}
