#![no_main]

use alloc_hater::{AllocatorOp, Evaluator};
use arbitrary::{Arbitrary, Unstructured};
use kbuddy_hater::BuddySubject;
use libfuzzer_sys::fuzz_target;

const LEAF_SIZE: usize = 16;

/// Upper bound on the region length, to keep each run fast.
const MAX_LEN: usize = 1 << 20;

#[derive(Clone, Debug)]
struct Args {
    len: usize,
    misalign: usize,
    external: bool,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        Ok(Args {
            len: usize::arbitrary(un)? % MAX_LEN,
            misalign: usize::arbitrary(un)? % 4096,
            external: bool::arbitrary(un)?,
            ops: Vec::arbitrary(un)?,
        })
    }
}

fuzz_target!(|args: Args| {
    let subject = if args.external {
        BuddySubject::<LEAF_SIZE>::new_external(args.len)
    } else {
        BuddySubject::<LEAF_SIZE>::new(args.len, args.misalign)
    };

    // Regions too small to manage are rejected up front.
    let Ok(subject) = subject else {
        return;
    };

    let mut eval = Evaluator::new(subject);
    if let Err(failure) = eval.evaluate(args.ops) {
        panic!("{failure:?}");
    }
});
