#![no_main]
use alloc_hater::AllocatorOp;
use arbitrary::{Arbitrary, Unstructured};
use avl_buddy::MIN_CHUNK_CLASS;
use avl_buddy_hater::BuddySubject;
use libfuzzer_sys::fuzz_target;

const MAX_REGION_SIZE: usize = 1 << 24;

#[derive(Clone, Debug)]
struct Args {
    size: usize,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let size = usize::arbitrary(un)? % MAX_REGION_SIZE;
        let ops = Vec::arbitrary(un)?;

        Ok(Args { size, ops })
    }
}

fuzz_target!(|args: Args| {
    let Args { size, ops } = args;

    let buddy = match BuddySubject::new(size) {
        Ok(b) => b,
        Err(_) => return,
    };

    let mut eval = alloc_hater::Evaluator::new(buddy);
    eval.evaluate(ops).unwrap();

    // Everything was released, so every block must have coalesced fully.
    let buddy = eval.into_subject();
    let buddy = buddy.allocator();
    assert_eq!(buddy.outstanding(), 0);
    assert_eq!(buddy.free_bytes(), buddy.capacity());

    // Only a tail too small for a header is left out of the blocks.
    assert!(size - buddy.capacity() < 1 << MIN_CHUNK_CLASS);
});
