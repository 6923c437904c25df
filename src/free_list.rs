use core::num::NonZeroUsize;

use crate::base::{BasePtr, BlockLink};

/// An intrusive, doubly linked list of free blocks.
///
/// Each member block stores its own [`BlockLink`] in its first bytes,
/// so push, pop, and removal of a known member are all O(1) and the list
/// needs no storage of its own beyond the head. Order is not meaningful.
#[derive(Debug)]
pub struct FreeList {
    head: Option<NonZeroUsize>,
    len: usize,
}

impl FreeList {
    pub const fn new() -> FreeList {
        FreeList { head: None, len: 0 }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Pushes a block onto the free list.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `block` must be within the provenance of `base`, aligned for
    ///   `BlockLink`, and valid for writes of `size_of::<BlockLink>()` bytes.
    /// - `block` must be free and not already a member of any free list.
    pub unsafe fn push(&mut self, base: BasePtr, block: NonZeroUsize) {
        assert_eq!(block.get() % core::mem::align_of::<BlockLink>(), 0);

        let next = self.head.replace(block);

        unsafe {
            if let Some(n) = next {
                base.link_mut(n).prev = Some(block);
            }

            base.write_link(block, BlockLink { prev: None, next });
        }

        self.len += 1;
    }

    /// Pops a block from the free list.
    ///
    /// # Safety
    ///
    /// `base` must be the base pointer every member was pushed with.
    pub unsafe fn pop(&mut self, base: BasePtr) -> Option<NonZeroUsize> {
        let head = self.head?;

        unsafe { self.remove(base, head) };

        Some(head)
    }

    /// Removes the specified block from the free list.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `base` must be the base pointer every member was pushed with.
    /// - `block` must be a member of `self`.
    pub unsafe fn remove(&mut self, base: BasePtr, block: NonZeroUsize) {
        debug_assert!(
            unsafe { self.iter(base) }.any(|b| b == block),
            "block {block:#x} is not in the free list"
        );

        let BlockLink { prev, next } = *unsafe { base.link_mut(block) };

        unsafe {
            match prev {
                Some(p) => base.link_mut(p).next = next,
                None => self.head = next,
            }

            if let Some(n) = next {
                base.link_mut(n).prev = prev;
            }
        }

        self.len -= 1;
    }

    /// Returns an iterator over the addresses of the members.
    ///
    /// # Safety
    ///
    /// `base` must be the base pointer every member was pushed with, and the
    /// list must not be modified while the iterator is alive.
    pub unsafe fn iter(&self, base: BasePtr) -> Iter {
        Iter {
            base,
            next: self.head,
        }
    }
}

/// Iterator returned by [`FreeList::iter`].
pub struct Iter {
    base: BasePtr,
    next: Option<NonZeroUsize>,
}

impl Iterator for Iter {
    type Item = NonZeroUsize;

    fn next(&mut self) -> Option<NonZeroUsize> {
        let cur = self.next?;

        // SAFETY: members hold initialized links; guaranteed by the caller of
        // `FreeList::iter`.
        self.next = unsafe { self.base.link_mut(cur).next };

        Some(cur)
    }
}
