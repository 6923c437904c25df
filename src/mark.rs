//! Initial reservation of the parts of the heap that must never be handed out.
//!
//! Two byte ranges are reserved when an allocator is built: the metadata at
//! the front of the heap and the tail past the end of the caller's region.
//! Every block that holds both reserved and usable bytes is marked split, and
//! the usable sibling of the outermost reserved block at each class is pushed
//! onto its free list. Those siblings tile the usable window exactly.

use core::ops::Range;

use crate::{
    base::BasePtr,
    buddy::SizeClass,
    layout::{BlockRef, Geometry},
    AllocInitError,
};

/// Which end of the heap a reserved range is anchored to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    /// The range starts at offset 0; its end borders usable memory.
    Left,
    /// The range ends at the heap size; its start borders usable memory.
    Right,
}

pub struct Marker<'a, const LEAF_SIZE: usize> {
    base: BasePtr,
    geometry: Geometry<LEAF_SIZE>,
    classes: &'a mut [SizeClass],
    usable: Range<usize>,
}

impl<'a, const LEAF_SIZE: usize> Marker<'a, LEAF_SIZE> {
    /// Creates a marker for a heap whose usable bytes are `usable`.
    ///
    /// # Safety
    ///
    /// Every offset in `usable` must address memory within the provenance of
    /// `base` that is valid for writes, and `classes` must hold freshly built
    /// size classes with empty free lists.
    pub unsafe fn new(
        base: BasePtr,
        geometry: Geometry<LEAF_SIZE>,
        classes: &'a mut [SizeClass],
        usable: Range<usize>,
    ) -> Marker<'a, LEAF_SIZE> {
        debug_assert_eq!(classes.len(), geometry.num_classes());
        debug_assert!(usable.start < usable.end && usable.end <= geometry.heap_size());

        Marker {
            base,
            geometry,
            classes,
            usable,
        }
    }

    fn overlaps_usable(&self, block: BlockRef) -> bool {
        let start = self.geometry.offset_of(block);
        let end = start + self.geometry.block_size(block.class);

        start < self.usable.end && self.usable.start < end
    }

    fn within_usable(&self, block: BlockRef) -> bool {
        let start = self.geometry.offset_of(block);
        let end = start + self.geometry.block_size(block.class);

        self.usable.start <= start && end <= self.usable.end
    }

    fn release(&mut self, block: BlockRef) -> usize {
        let offset = self.geometry.offset_of(block);

        // SAFETY: `block` lies within the usable window, guaranteed by the
        // caller of `Marker::new`.
        unsafe {
            self.classes[block.class]
                .free
                .push(self.base, self.base.addr_at(offset))
        };

        self.geometry.block_size(block.class)
    }

    /// Pushes the whole heap as one free block.
    ///
    /// Only valid when nothing is reserved. Returns the number of bytes freed.
    pub fn release_whole_heap(&mut self) -> usize {
        debug_assert_eq!(self.usable, 0..self.geometry.heap_size());

        let top = BlockRef::new(self.geometry.max_class(), 0);

        // The top block has no buddy, so its pair bit stays clear.
        self.release(top)
    }

    /// Reserves `[start, stop)` and frees the usable blocks bordering it.
    ///
    /// Returns the number of bytes pushed onto free lists.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::MisalignedRange`] if either bound is not a
    /// multiple of `LEAF_SIZE`.
    pub fn mark(&mut self, start: usize, stop: usize, side: Side) -> Result<usize, AllocInitError> {
        if start % LEAF_SIZE != 0 || stop % LEAF_SIZE != 0 {
            return Err(AllocInitError::MisalignedRange { start, stop });
        }

        if start >= stop {
            return Ok(0);
        }

        let boundary = match side {
            Side::Left => stop,
            Side::Right => start,
        };

        let mut freed = 0;

        for k in 0..self.geometry.num_classes() {
            let size = self.geometry.block_size(k);

            // A block straddling the boundary holds both reserved and usable
            // bytes, so it must stay split.
            if boundary % size != 0 {
                let straddle = self.geometry.block_of(k, boundary);
                if self.overlaps_usable(straddle) {
                    if let Some(splits) = self.classes[k].splits.as_mut() {
                        splits.set(straddle.index);
                    }
                }
            }

            if k == self.geometry.max_class() {
                break;
            }

            // The outermost reserved block at this class has a usable sibling
            // when it sits on the outer side of its pair.
            let sibling = match side {
                Side::Left => {
                    let first_clear = self.geometry.ceil_block_index(k, boundary);
                    (first_clear % 2 == 1).then(|| BlockRef::new(k, first_clear))
                }
                Side::Right => {
                    let first_reserved = boundary / size;
                    (first_reserved % 2 == 1).then(|| BlockRef::new(k, first_reserved - 1))
                }
            };

            if let Some(block) = sibling.filter(|&b| self.within_usable(b)) {
                self.classes[k].pairs.note_allocation_change(block.pair());
                freed += self.release(block);
            }
        }

        log::debug!(
            "buddy: reserved {start:#x}..{stop:#x} ({side:?}), freed {freed:#x} bytes"
        );

        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::prelude::rust_2021::*;

    use super::*;
    use crate::tests::Region;
    use crate::BuddyAllocator;

    fn free_offsets(buddy: &BuddyAllocator<16>) -> Vec<(usize, usize)> {
        let base = buddy.base_ptr();
        let mut v: Vec<_> = buddy
            .classes()
            .iter()
            .enumerate()
            .flat_map(|(k, c)| unsafe { c.free.iter(base) }.map(move |a| (k, base.offset_to(a))))
            .collect();
        v.sort_unstable_by_key(|&(_, ofs)| ofs);
        v
    }

    #[test]
    fn tail_reservation_frees_descending_blocks() {
        // External metadata, region of 992 bytes in a 1024-byte heap.
        let region = Region::new(992);
        let buddy = region.external::<16>();

        assert_eq!(buddy.heap_size(), 1024);
        assert_eq!(buddy.unavailable_len(), 32);
        assert_eq!(
            free_offsets(&buddy),
            [(5, 0), (4, 512), (3, 768), (2, 896), (1, 960)]
        );
    }

    #[test]
    fn both_reservations_tile_the_window() {
        let region = Region::new(4096);
        let end = unsafe { core::ptr::NonNull::new_unchecked(region.start().as_ptr().add(3000)) };
        let buddy = unsafe { BuddyAllocator::<16>::init(region.start(), end) }.unwrap();

        let usable = buddy.metadata_len()..(buddy.heap_size() - buddy.unavailable_len());

        // Free blocks are disjoint, contiguous, and cover the usable window.
        let mut next = usable.start;
        for (k, ofs) in free_offsets(&buddy) {
            assert_eq!(ofs, next);
            assert_eq!(ofs % buddy.block_size(k), 0);
            next += buddy.block_size(k);
        }
        assert_eq!(next, usable.end);
    }

    #[test]
    fn pair_bits_mark_lone_free_siblings() {
        let region = Region::new(992);
        let buddy = region.external::<16>();
        let geometry = buddy.geometry();

        for (k, ofs) in free_offsets(&buddy) {
            let block = geometry.block_of(k, ofs);
            assert!(buddy.classes()[k].pairs.is_pair_mixed(block.pair()));
        }

        // The reserved 32 bytes sit in split blocks from class 2 up.
        for k in 2..geometry.num_classes() {
            let straddle = geometry.block_of(k, 992);
            let splits = buddy.classes()[k].splits.as_ref().unwrap();
            assert!(splits.is_set(straddle.index), "class {k}");
        }
    }

    #[test]
    fn misaligned_range_is_rejected() {
        let region = Region::new(1024);
        let mut buddy = region.external::<16>();
        let base = buddy.base_ptr();
        let geometry = buddy.geometry();

        let mut marker = unsafe { Marker::new(base, geometry, buddy.classes_mut(), 0..1024) };

        assert_eq!(
            marker.mark(0, 24, Side::Left),
            Err(AllocInitError::MisalignedRange { start: 0, stop: 24 })
        );
        assert_eq!(marker.mark(1024, 1024, Side::Right), Ok(0));
    }
}
