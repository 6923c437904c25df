//! A small library for ~~hating on~~ evaluating the correctness of
//! size-class allocators.
//!
//! An [`Evaluator`] replays a sequence of [`AllocatorOp`]s against a
//! [`Subject`]. Every block it receives is stamped with the id of the
//! operation that produced it, and the stamp is checked again right before
//! the block is freed. A block whose stamp changed while it was live was
//! handed out twice.
#![deny(unsafe_op_in_unsafe_fn)]

use core::ptr::NonNull;

use arbitrary::{Arbitrary, Unstructured};

/// Limit on request size, expressed in bits.
const SIZE_LIMIT_BITS: u32 = 20;

/// Generates a request size, biased toward small sizes.
fn arbitrary_size(u: &mut Unstructured<'_>) -> arbitrary::Result<usize> {
    let bits = u.int_in_range(0..=SIZE_LIMIT_BITS)?;
    let size = usize::arbitrary(u)? & ((1 << bits) - 1);

    Ok(size)
}

#[derive(Clone, Debug, Arbitrary)]
pub enum AllocatorOp {
    /// Allocate a block of at least this many bytes.
    Alloc(#[arbitrary(with = arbitrary_size)] usize),
    /// Free an outstanding block, chosen by this index modulo the number of
    /// outstanding blocks.
    Dealloc(usize),
}

/// An allocator under evaluation.
pub trait Subject {
    type AllocError;

    /// Allocates a block of at least `nbytes` bytes.
    fn allocate(&mut self, nbytes: usize) -> Result<NonNull<[u8]>, Self::AllocError>;

    /// Deallocates the block of memory pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>);

    /// Returns the number of free bytes, if the subject can report it.
    ///
    /// When available, the evaluator checks that freeing every block brings
    /// the count back to its starting value.
    fn free_bytes(&self) -> Option<usize> {
        None
    }
}

/// A live block, stamped with the id of the operation that allocated it.
struct Stamped {
    ptr: NonNull<[u8]>,
    stamp: u64,
}

impl Stamped {
    /// Takes ownership of `ptr` and writes `stamp` over all of it.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes for `ptr.len()` bytes, and
    /// nothing else may access that memory while the `Stamped` exists.
    unsafe fn new(ptr: NonNull<[u8]>, stamp: u64) -> Stamped {
        let bytes = ptr.cast::<u8>().as_ptr();
        let pattern = stamp.to_le_bytes();

        for i in 0..ptr.len() {
            unsafe { bytes.add(i).write(pattern[i % pattern.len()]) };
        }

        Stamped { ptr, stamp }
    }

    /// Returns `true` if every byte still carries the stamp.
    fn is_intact(&self) -> bool {
        let bytes: &[u8] = unsafe { self.ptr.as_ref() };
        let pattern = self.stamp.to_le_bytes();

        bytes
            .chunks(pattern.len())
            .all(|chunk| chunk == &pattern[..chunk.len()])
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub enum Failure {
    /// A block's stamp changed while it was allocated.
    Overwritten {
        completed: Vec<AllocatorOp>,
        stamp: u64,
    },
    /// A block was smaller than the request it satisfied.
    TooSmall { requested: usize, len: usize },
    /// Freeing every block did not restore the free byte count.
    Leaked { before: usize, after: usize },
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn subject(&self) -> &S {
        &self.subject
    }

    /// Checks the stamp of `block`, then returns it to the subject.
    fn release(&mut self, block: Stamped, completed: &[AllocatorOp]) -> Result<(), Failure> {
        if !block.is_intact() {
            return Err(Failure::Overwritten {
                completed: completed.to_vec(),
                stamp: block.stamp,
            });
        }

        unsafe { self.subject.deallocate(block.ptr.cast()) };

        Ok(())
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failure>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let before = self.subject.free_bytes();

        let mut completed = Vec::new();
        let mut live: Vec<Stamped> = Vec::new();

        for (stamp, op) in (0u64..).zip(ops) {
            match op {
                AllocatorOp::Alloc(nbytes) => {
                    let Ok(ptr) = self.subject.allocate(nbytes) else {
                        continue;
                    };

                    if ptr.len() < nbytes {
                        return Err(Failure::TooSmall {
                            requested: nbytes,
                            len: ptr.len(),
                        });
                    }

                    live.push(unsafe { Stamped::new(ptr, stamp) });
                }

                AllocatorOp::Dealloc(idx) => {
                    if live.is_empty() {
                        continue;
                    }

                    let block = live.swap_remove(idx % live.len());
                    self.release(block, &completed)?;
                }
            }

            completed.push(op);
        }

        for block in live {
            self.release(block, &completed)?;
        }

        match (before, self.subject.free_bytes()) {
            (Some(before), Some(after)) if before != after => {
                Err(Failure::Leaked { before, after })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A subject that hands out every request from the global allocator.
    struct Heap;

    impl Subject for Heap {
        type AllocError = ();

        fn allocate(&mut self, nbytes: usize) -> Result<NonNull<[u8]>, ()> {
            let layout = std::alloc::Layout::from_size_align(nbytes.max(1), 8).map_err(|_| ())?;
            let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) }).ok_or(())?;

            Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
        }

        unsafe fn deallocate(&mut self, _: NonNull<u8>) {
            // Leaked; the test is short-lived.
        }
    }

    #[test]
    fn well_behaved_subject_passes() {
        let ops = vec![
            AllocatorOp::Alloc(24),
            AllocatorOp::Alloc(0),
            AllocatorOp::Dealloc(5),
            AllocatorOp::Alloc(300),
            AllocatorOp::Dealloc(0),
        ];

        Evaluator::new(Heap).evaluate(ops).unwrap();
    }

    #[test]
    fn arbitrary_sizes_are_bounded() {
        let data: Vec<u8> = (0..=255).cycle().take(4096).collect();
        let mut u = Unstructured::new(&data);

        while let Ok(size) = arbitrary_size(&mut u) {
            assert!(size < 1 << SIZE_LIMIT_BITS);
            if u.is_empty() {
                break;
            }
        }
    }
}
