#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use alloc_hater::Subject;
use avl_buddy::{AllocError, AllocInitError, BuddyAllocator, Global};

pub struct BuddySubject(BuddyAllocator<Global>);

impl BuddySubject {
    pub fn new(size: usize) -> Result<Self, AllocInitError> {
        let b = BuddyAllocator::try_new(size)?;
        Ok(BuddySubject(b))
    }

    pub fn allocator(&self) -> &BuddyAllocator<Global> {
        &self.0
    }
}

impl Subject for BuddySubject {
    type AllocError = AllocError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError> {
        self.0.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Self::AllocError> {
        unsafe { self.0.deallocate(ptr) }
    }
}

#[cfg(test)]
mod tests {
    use alloc_hater::{AllocatorOp, Evaluator};
    use arbitrary::{Arbitrary, Unstructured};

    use super::*;

    fn evaluate(size: usize, ops: Vec<AllocatorOp>) -> BuddySubject {
        let mut eval = Evaluator::new(BuddySubject::new(size).unwrap());

        if let Err(failed) = eval.evaluate(ops) {
            panic!("evaluation failed: {failed:?}");
        }

        eval.into_subject()
    }

    #[test]
    fn fixed_sequence() {
        use AllocatorOp::*;

        let ops = vec![
            Alloc(1000),
            Alloc(24),
            Alloc(4000),
            DeallocInterior(0, 17),
            Dealloc(1),
            Alloc(1),
            Alloc(100_000),
            DeallocInterior(2, 0),
            Dealloc(0),
            Dealloc(0),
            Alloc(2000),
        ];

        let subject = evaluate(1 << 17, ops);
        assert_eq!(subject.allocator().outstanding(), 0);
        assert_eq!(subject.allocator().free_bytes(), subject.allocator().capacity());
    }

    #[test]
    fn pseudorandom_sequences() {
        // A fixed xorshift stream stands in for fuzzer input.
        let mut state = 0x2545_f491_4f6c_dd1d_u64;
        let mut bytes = vec![0u8; 1 << 16];
        for b in bytes.iter_mut() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            *b = state as u8;
        }

        for (i, chunk) in bytes.chunks(4096).enumerate() {
            let mut u = Unstructured::new(chunk);
            let ops = Vec::<AllocatorOp>::arbitrary(&mut u).unwrap();

            // Region sizes that are not powers of two yield several blocks.
            let size = (1 << 20) - 1 - 4096 * i;
            let subject = evaluate(size, ops);

            assert_eq!(subject.allocator().outstanding(), 0);
            assert_eq!(subject.allocator().free_bytes(), subject.allocator().capacity());
        }
    }
}
