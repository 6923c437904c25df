//! A binary-buddy memory allocator.
//!
//! The managed heap spans `LEAF_SIZE * 2^(N-1)` bytes, the smallest power of
//! two covering the caller's region. Size class `k` holds blocks of
//! `LEAF_SIZE * 2^k` bytes. Allocation takes the smallest free block that is
//! large enough and splits it in halves until it fits, pushing each unused
//! half onto the free list of its class. Deallocation recovers the block's
//! class from the split bitmaps and merges it with its buddy for as long as
//! the buddy is free.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case |
//! |--------------------------|-----------|------------|
//! | Allocate                 | O(1)      | O(N)       |
//! | Deallocate               | O(1)      | O(N)       |
//!
//! #### Fragmentation
//!
//! Blocks are rounded up to a power of two, so a request may waste up to
//! half of its block. Free buddies are always merged eagerly, which bounds
//! external fragmentation to blocks whose buddies are still in use.

use core::{alloc::Layout, cmp, fmt, mem, num::NonZeroUsize, ptr::NonNull, slice};

use crate::{
    base::{BasePtr, BlockLink},
    bitmap::{Bitmap, PairState},
    free_list::FreeList,
    layout::Geometry,
    mark::{Marker, Side},
    AllocError, AllocInitError, DEFAULT_LEAF_SIZE,
};

/// The bookkeeping for one size class.
#[derive(Debug)]
pub(crate) struct SizeClass {
    pub(crate) free: FreeList,
    pub(crate) pairs: PairState,
    /// `None` for class 0, whose blocks are never split.
    pub(crate) splits: Option<Bitmap>,
}

/// A binary-buddy allocator over one fixed region.
///
/// `LEAF_SIZE` is the smallest block size the allocator will hand out. It
/// must be a power of two and at least `2 * mem::size_of::<usize>()` bytes,
/// because every free block stores a free-list link in its first bytes.
///
/// For example, a kernel heap handing out blocks of 16 bytes and up would be:
///
/// ```
/// use kbuddy::BuddyAllocator;
///
/// type KernelBuddy = BuddyAllocator<16>;
/// # fn main() {}
/// ```
pub struct BuddyAllocator<const LEAF_SIZE: usize = DEFAULT_LEAF_SIZE> {
    /// Pointer to the heap, `geometry.heap_size()` bytes of address space.
    base: BasePtr,
    geometry: Geometry<LEAF_SIZE>,
    /// The size class table, `geometry.num_classes()` entries.
    classes: NonNull<SizeClass>,
    /// Bytes reserved at the front of the heap for the table and bitmaps.
    metadata_len: usize,
    /// Offset of the first byte of the unavailable tail.
    usable_end: usize,
}

// SAFETY: The allocator owns its metadata and every free block exclusively;
// the raw pointers it holds are never shared outside of `&mut self` methods.
unsafe impl<const LEAF_SIZE: usize> Send for BuddyAllocator<LEAF_SIZE> {}

/// A region rounded to leaf granularity.
struct Region {
    base: NonNull<u8>,
    len: usize,
}

impl<const LEAF_SIZE: usize> BuddyAllocator<LEAF_SIZE> {
    fn check_leaf_size() -> Result<(), AllocInitError> {
        if !LEAF_SIZE.is_power_of_two()
            || LEAF_SIZE < mem::size_of::<BlockLink>()
            || LEAF_SIZE < mem::align_of::<SizeClass>()
        {
            return Err(AllocInitError::InvalidConfig);
        }

        Ok(())
    }

    /// Rounds `start` up and the length down to multiples of `LEAF_SIZE`.
    fn region(start: NonNull<u8>, end: NonNull<u8>) -> Result<Region, AllocInitError> {
        let aligned = start
            .addr()
            .get()
            .checked_next_multiple_of(LEAF_SIZE)
            .ok_or(AllocInitError::RegionOverflow)?;

        let avail = end
            .addr()
            .get()
            .checked_sub(aligned)
            .ok_or(AllocInitError::RegionTooSmall)?;

        let len = avail - avail % LEAF_SIZE;
        if len == 0 {
            return Err(AllocInitError::RegionTooSmall);
        }

        // `aligned >= start`, so it is non-zero.
        let base = start.with_addr(NonZeroUsize::new(aligned).unwrap());

        Ok(Region { base, len })
    }

    /// Returns the number of bytes of table and bitmaps for `geometry`.
    fn metadata_size(geometry: Geometry<LEAF_SIZE>) -> usize {
        let table = mem::size_of::<SizeClass>() * geometry.num_classes();

        let pair_bitmaps: usize = (0..geometry.num_classes())
            .map(|k| Bitmap::num_bytes(PairState::num_pairs(geometry.num_blocks(k))))
            .sum();

        let split_bitmaps: usize = (1..geometry.num_classes())
            .map(|k| Bitmap::num_bytes(geometry.num_blocks(k)))
            .sum();

        table + pair_bitmaps + split_bitmaps
    }

    /// Returns the layout of the external metadata buffer required by
    /// [`new_raw`](Self::new_raw) for a region of `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `LEAF_SIZE` is invalid or `len` cannot be managed.
    pub fn metadata_layout(len: usize) -> Result<Layout, AllocInitError> {
        Self::check_leaf_size()?;

        let geometry = Geometry::<LEAF_SIZE>::covering(len).ok_or(AllocInitError::RegionTooSmall)?;

        Layout::from_size_align(Self::metadata_size(geometry), mem::align_of::<SizeClass>())
            .map_err(|_| AllocInitError::RegionOverflow)
    }

    /// Initializes an allocator managing `[start, end)`, placing its own
    /// metadata at the front of that range.
    ///
    /// `start` is rounded up to `LEAF_SIZE`. The heap is the smallest power of
    /// two covering the rest of the range; the part of it past `end` (rounded
    /// down to `LEAF_SIZE`) is reserved and never handed out, as is the
    /// metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if `LEAF_SIZE` is invalid, if the range cannot hold the
    /// metadata plus at least one leaf, or if the initial bookkeeping turns out
    /// inconsistent ([`AllocInitError::MisalignedRange`],
    /// [`AllocInitError::AccountingMismatch`]).
    ///
    /// # Safety
    ///
    /// `[start, end)` must be valid for reads and writes and must not be
    /// accessed by anything but the returned allocator (and the holders of
    /// blocks it hands out) for as long as the allocator exists.
    pub unsafe fn init(
        start: NonNull<u8>,
        end: NonNull<u8>,
    ) -> Result<BuddyAllocator<LEAF_SIZE>, AllocInitError> {
        Self::check_leaf_size()?;

        let region = Self::region(start, end)?;
        let geometry =
            Geometry::<LEAF_SIZE>::covering(region.len).ok_or(AllocInitError::RegionOverflow)?;

        let metadata_len = Self::metadata_size(geometry)
            .checked_next_multiple_of(LEAF_SIZE)
            .ok_or(AllocInitError::RegionTooSmall)?;

        if metadata_len >= region.len {
            return Err(AllocInitError::RegionTooSmall);
        }

        log::debug!(
            "buddy: memory size is {} bytes; size class table has {} entries",
            region.len,
            geometry.num_classes()
        );

        unsafe { Self::build(region.base, region, geometry, metadata_len) }
    }

    /// Constructs a new allocator managing `[start, end)`, with its metadata
    /// stored in `metadata`.
    ///
    /// Nothing is reserved at the front of the heap, so the whole region is
    /// available for allocation.
    ///
    /// # Errors
    ///
    /// Returns an error under the same conditions as [`init`](Self::init),
    /// except that metadata size does not count against the region.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `[start, end)` must be valid for reads and writes and must not be
    ///   accessed by anything but the returned allocator (and the holders of
    ///   blocks it hands out) for as long as the allocator exists.
    /// - `metadata` must satisfy the [`Layout`] returned by
    ///   [`Self::metadata_layout(end - start)`], must be valid for reads and
    ///   writes for its entire size, must not overlap `[start, end)`, and must
    ///   not be accessed by anything else for as long as the allocator exists.
    ///
    /// [`Self::metadata_layout(end - start)`]: Self::metadata_layout
    pub unsafe fn new_raw(
        metadata: NonNull<u8>,
        start: NonNull<u8>,
        end: NonNull<u8>,
    ) -> Result<BuddyAllocator<LEAF_SIZE>, AllocInitError> {
        Self::check_leaf_size()?;

        assert_eq!(
            metadata.as_ptr().align_offset(mem::align_of::<SizeClass>()),
            0,
            "metadata pointer is misaligned"
        );

        let region = Self::region(start, end)?;
        let geometry =
            Geometry::<LEAF_SIZE>::covering(region.len).ok_or(AllocInitError::RegionOverflow)?;

        unsafe { Self::build(metadata, region, geometry, 0) }
    }

    /// Lays out the size class table at `metadata`, then reserves
    /// `[0, metadata_len)` and the unavailable tail of the heap.
    ///
    /// # Safety
    ///
    /// `metadata` must be valid for writes of `metadata_size(geometry)` bytes
    /// and suitably aligned for `SizeClass`; if `metadata_len` is nonzero it
    /// must be the base of `region`.
    unsafe fn build(
        metadata: NonNull<u8>,
        region: Region,
        geometry: Geometry<LEAF_SIZE>,
        metadata_len: usize,
    ) -> Result<BuddyAllocator<LEAF_SIZE>, AllocInitError> {
        let base = BasePtr::new(region.base, geometry.heap_size())
            .ok_or(AllocInitError::RegionOverflow)?;

        let table = metadata.cast::<SizeClass>();

        // The bitmaps follow the table: all pair bitmaps, then all split
        // bitmaps.
        let table_len = mem::size_of::<SizeClass>() * geometry.num_classes();
        let pairs_len: usize = (0..geometry.num_classes())
            .map(|k| Bitmap::num_bytes(PairState::num_pairs(geometry.num_blocks(k))))
            .sum();

        let mut pair_curs = table_len;
        let mut split_curs = table_len + pairs_len;

        // SAFETY: both cursors stay within `metadata_size(geometry)` bytes.
        let carve = |curs: &mut usize, num_bits: usize| -> Bitmap {
            let map = unsafe { NonNull::new_unchecked(metadata.as_ptr().add(*curs)) };
            *curs += Bitmap::num_bytes(num_bits);

            unsafe { Bitmap::new(num_bits, map) }
        };

        for k in 0..geometry.num_classes() {
            let num_blocks = geometry.num_blocks(k);
            let pairs = PairState::new(carve(&mut pair_curs, PairState::num_pairs(num_blocks)));
            let splits = (k > 0).then(|| carve(&mut split_curs, num_blocks));

            unsafe {
                table.as_ptr().add(k).write(SizeClass {
                    free: FreeList::new(),
                    pairs,
                    splits,
                })
            };
        }

        debug_assert_eq!(pair_curs, table_len + pairs_len);
        debug_assert_eq!(split_curs, Self::metadata_size(geometry));

        let heap_size = geometry.heap_size();

        let mut buddy = BuddyAllocator {
            base,
            geometry,
            classes: table,
            metadata_len,
            usable_end: region.len,
        };

        let unavailable_len = buddy.unavailable_len();

        log::debug!(
            "buddy: {metadata_len} meta bytes for managing {heap_size} bytes of memory"
        );
        log::debug!("buddy: {unavailable_len:#x} bytes unavailable");

        let mut marker = unsafe {
            Marker::new(
                base,
                geometry,
                buddy.classes_mut(),
                metadata_len..region.len,
            )
        };

        let freed = if metadata_len == 0 && unavailable_len == 0 {
            marker.release_whole_heap()
        } else {
            let left = marker.mark(0, metadata_len, Side::Left)?;
            let right = marker.mark(region.len, heap_size, Side::Right)?;
            left + right
        };

        let expected = heap_size - metadata_len - unavailable_len;
        if freed != expected {
            log::error!("buddy: init freed {freed} bytes, expected {expected}");
            return Err(AllocInitError::AccountingMismatch { freed, expected });
        }

        Ok(buddy)
    }

    pub(crate) fn base_ptr(&self) -> BasePtr {
        self.base
    }

    pub(crate) fn geometry(&self) -> Geometry<LEAF_SIZE> {
        self.geometry
    }

    pub(crate) fn classes(&self) -> &[SizeClass] {
        // SAFETY: `build` initialized `num_classes` entries, which live as
        // long as `self`.
        unsafe { slice::from_raw_parts(self.classes.as_ptr(), self.geometry.num_classes()) }
    }

    pub(crate) fn classes_mut(&mut self) -> &mut [SizeClass] {
        // SAFETY: as in `classes`; `&mut self` guarantees exclusivity.
        unsafe { slice::from_raw_parts_mut(self.classes.as_ptr(), self.geometry.num_classes()) }
    }

    /// Returns a pointer to the first byte of the heap.
    pub fn heap_base(&self) -> NonNull<u8> {
        self.base.ptr()
    }

    /// Returns the size of the heap, a power of two at least as large as the
    /// managed region.
    pub fn heap_size(&self) -> usize {
        self.geometry.heap_size()
    }

    /// Returns the number of size classes.
    pub fn num_classes(&self) -> usize {
        self.geometry.num_classes()
    }

    /// Returns the size of the blocks of class `class`.
    ///
    /// # Panics
    ///
    /// Panics if `class >= self.num_classes()`.
    pub fn block_size(&self, class: usize) -> usize {
        assert!(class < self.num_classes());

        self.geometry.block_size(class)
    }

    /// Returns the number of bytes reserved at the front of the heap for the
    /// allocator's own metadata.
    pub fn metadata_len(&self) -> usize {
        self.metadata_len
    }

    /// Returns the number of bytes reserved at the end of the heap because
    /// they lie past the end of the managed region.
    pub fn unavailable_len(&self) -> usize {
        self.geometry.heap_size() - self.usable_end
    }

    /// Returns the number of free blocks of class `class`.
    ///
    /// # Panics
    ///
    /// Panics if `class >= self.num_classes()`.
    pub fn free_block_count(&self, class: usize) -> usize {
        self.classes()[class].free.len()
    }

    /// Returns the total size of all free blocks.
    pub fn free_bytes(&self) -> usize {
        self.classes()
            .iter()
            .enumerate()
            .map(|(k, c)| c.free.len() * self.geometry.block_size(k))
            .sum()
    }

    /// Attempts to allocate a block of at least `nbytes` bytes.
    ///
    /// On success, returns a [`NonNull<[u8]>`] spanning the whole block, whose
    /// length is `nbytes` rounded up to a power of two no smaller than
    /// `LEAF_SIZE`. A request for zero bytes yields a leaf block. The block
    /// is aligned to its size relative to the heap base.
    ///
    /// The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err` if no free block of the required size exists. The
    /// allocator's state is unchanged in that case.
    ///
    /// [`NonNull<[u8]>`]: NonNull
    pub fn allocate(&mut self, nbytes: usize) -> Result<NonNull<[u8]>, AllocError> {
        let base = self.base;
        let geometry = self.geometry;

        let target = Geometry::<LEAF_SIZE>::first_class_for(nbytes);
        if target >= geometry.num_classes() {
            log::trace!("buddy: allocate({nbytes}): larger than the heap");
            return Err(AllocError);
        }

        let classes = self.classes_mut();

        // Scan increasing block sizes until a free block is found.
        let Some(found) = (target..geometry.num_classes()).find(|&k| !classes[k].free.is_empty())
        else {
            log::trace!("buddy: allocate({nbytes}): out of memory");
            return Err(AllocError);
        };

        // SAFETY: every member of a free list was pushed with `base`.
        let block = unsafe { classes[found].free.pop(base) }.ok_or(AllocError)?;
        let block_ofs = base.offset_to(block);

        let popped = geometry.block_of(found, block_ofs);
        classes[found].pairs.note_allocation_change(popped.pair());

        // Split the block repeatedly to obtain a suitably sized block. The
        // address of the front half does not change.
        for k in (target + 1..=found).rev() {
            let parent = geometry.block_of(k, block_ofs);
            if let Some(splits) = classes[k].splits.as_mut() {
                splits.set(parent.index);
            }

            let front = geometry.block_of(k - 1, block_ofs);
            classes[k - 1].pairs.note_allocation_change(front.pair());

            let back = geometry.offset_of(front.buddy());
            unsafe { classes[k - 1].free.push(base, base.addr_at(back)) };
        }

        log::trace!(
            "buddy: allocate({nbytes}): class {target} block at {block_ofs:#x} (split from class {found})"
        );

        // The returned block inherits the provenance of the base pointer.
        Ok(base.slice_at(block, geometry.block_size(target)))
    }

    /// Returns the size class of the allocated block that starts at `offset`.
    ///
    /// A block of class `k` is the first block containing `offset` whose
    /// parent is split; a block with no split parent is the whole heap.
    fn class_of(&self, offset: usize) -> usize {
        let geometry = self.geometry;
        let classes = self.classes();

        (0..geometry.max_class())
            .find(|&k| {
                let parent = geometry.block_of(k + 1, offset);
                classes[parent.class]
                    .splits
                    .as_ref()
                    .is_some_and(|s| s.is_set(parent.index))
            })
            .unwrap_or(geometry.max_class())
    }

    /// Deallocates the block referenced by `ptr`.
    ///
    /// The block is merged with its buddy for as long as the buddy is free,
    /// and the resulting block is returned to its free list.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` does not point to a leaf boundary inside the usable
    /// part of the heap. This check is not exhaustive: see below.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated via this
    /// allocator. Freeing a block twice is undefined behavior.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let base = self.base;
        let geometry = self.geometry;

        let addr = ptr.addr();
        assert!(
            base.contains_addr(addr),
            "{addr:#x} is outside of the managed heap"
        );

        let mut block_ofs = base.offset_to(addr);
        assert!(
            block_ofs % LEAF_SIZE == 0
                && block_ofs >= self.metadata_len
                && block_ofs < self.usable_end,
            "{addr:#x} was not allocated by this allocator"
        );

        let mut k = self.class_of(block_ofs);
        let size = geometry.block_size(k);
        let classes = self.classes_mut();

        loop {
            let block = geometry.block_of(k, block_ofs);
            let level = &mut classes[k];

            // Free this block at class `k`.
            level.pairs.note_allocation_change(block.pair());

            if k == geometry.max_class() || level.pairs.is_pair_mixed(block.pair()) {
                // The buddy is in use (or there is none); stop merging.
                unsafe { level.free.push(base, base.addr_at(block_ofs)) };
                break;
            }

            // The buddy is free; merge with it.
            let buddy_ofs = geometry.offset_of(block.buddy());
            unsafe { level.free.remove(base, base.addr_at(buddy_ofs)) };

            block_ofs = cmp::min(block_ofs, buddy_ofs);

            // The merged pair is no longer split.
            let parent = block.parent();
            if let Some(splits) = classes[parent.class].splits.as_mut() {
                splits.clear(parent.index);
            }

            k = parent.class;
        }

        log::trace!(
            "buddy: deallocate({addr:#x}): freed {size} bytes as class {k} block at {block_ofs:#x}"
        );
    }
}

impl<const LEAF_SIZE: usize> fmt::Debug for BuddyAllocator<LEAF_SIZE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyAllocator")
            .field("base", &self.base.ptr())
            .field("heap_size", &self.heap_size())
            .field("num_classes", &self.num_classes())
            .field("metadata_len", &self.metadata_len)
            .field("unavailable_len", &self.unavailable_len())
            .field("free_bytes", &self.free_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::prelude::rust_2021::*;

    use super::*;
    use crate::tests::Region;

    type Buddy = BuddyAllocator<16>;

    /// Snapshot of every free list, as sorted heap offsets per class.
    fn free_lists(buddy: &Buddy) -> Vec<Vec<usize>> {
        let base = buddy.base_ptr();
        buddy
            .classes()
            .iter()
            .map(|c| {
                let mut v: Vec<_> = unsafe { c.free.iter(base) }
                    .map(|a| base.offset_to(a))
                    .collect();
                v.sort_unstable();
                v
            })
            .collect()
    }

    fn offset(buddy: &Buddy, block: NonNull<[u8]>) -> usize {
        buddy.base_ptr().offset_to(block.cast::<u8>().addr())
    }

    #[test]
    fn invalid_leaf_sizes_are_rejected() {
        let region = Region::new(4096);

        assert_eq!(
            unsafe { BuddyAllocator::<24>::init(region.start(), region.end()) }.unwrap_err(),
            AllocInitError::InvalidConfig
        );
        assert_eq!(
            unsafe { BuddyAllocator::<8>::init(region.start(), region.end()) }.unwrap_err(),
            AllocInitError::InvalidConfig
        );
    }

    #[test]
    fn tiny_regions_are_rejected() {
        let region = Region::new(4096);

        let end = unsafe { NonNull::new_unchecked(region.start().as_ptr().add(15)) };
        assert_eq!(
            unsafe { Buddy::init(region.start(), end) }.unwrap_err(),
            AllocInitError::RegionTooSmall
        );

        // 64 bytes cannot hold the table of a 64-byte heap.
        let end = unsafe { NonNull::new_unchecked(region.start().as_ptr().add(64)) };
        assert_eq!(
            unsafe { Buddy::init(region.start(), end) }.unwrap_err(),
            AllocInitError::RegionTooSmall
        );
    }

    #[test]
    fn init_reserves_metadata_in_region() {
        let region = Region::new(4096);
        let buddy = unsafe { Buddy::init(region.start(), region.end()) }.unwrap();

        assert_eq!(buddy.heap_size(), 4096);
        assert_eq!(buddy.num_classes(), 9);
        assert!(buddy.metadata_len() > 0);
        assert_eq!(buddy.metadata_len() % 16, 0);
        assert_eq!(buddy.unavailable_len(), 0);
        assert_eq!(buddy.free_bytes(), 4096 - buddy.metadata_len());
    }

    #[test]
    fn init_reserves_unavailable_tail() {
        let region = Region::new(4096);
        let end = unsafe { NonNull::new_unchecked(region.start().as_ptr().add(3000)) };
        let buddy = unsafe { Buddy::init(region.start(), end) }.unwrap();

        assert_eq!(buddy.heap_size(), 4096);
        // The end rounds down to 2992.
        assert_eq!(buddy.unavailable_len(), 4096 - 2992);
        assert_eq!(
            buddy.free_bytes(),
            4096 - buddy.metadata_len() - buddy.unavailable_len()
        );
    }

    #[test]
    fn init_rounds_unaligned_bounds() {
        let region = Region::new(4096);
        let start = unsafe { NonNull::new_unchecked(region.start().as_ptr().add(5)) };
        let end = unsafe { NonNull::new_unchecked(region.start().as_ptr().add(4000)) };
        let buddy = unsafe { Buddy::init(start, end) }.unwrap();

        // Base rounds up to 16, the end down to 4000 - 16 = 3984 bytes.
        assert_eq!(buddy.heap_base().as_ptr() as usize % 16, 0);
        assert_eq!(offset_of_ptr(&region, buddy.heap_base()), 16);
        assert_eq!(buddy.heap_size(), 4096);
        assert_eq!(buddy.unavailable_len(), 4096 - 3984);
    }

    fn offset_of_ptr(region: &Region, ptr: NonNull<u8>) -> usize {
        ptr.as_ptr() as usize - region.start().as_ptr() as usize
    }

    #[test]
    fn metadata_layout_matches_build() {
        let layout = Buddy::metadata_layout(1024).unwrap();
        assert_eq!(layout.align(), mem::align_of::<SizeClass>());

        let geometry = Geometry::<16>::covering(1024).unwrap();
        assert_eq!(layout.size(), Buddy::metadata_size(geometry));
    }

    #[test]
    fn whole_heap_is_one_block_without_reservations() {
        let region = Region::new(1024);
        let buddy = region.external::<16>();

        assert_eq!(buddy.num_classes(), 7);
        assert_eq!(buddy.free_bytes(), 1024);
        assert_eq!(buddy.free_block_count(6), 1);
        assert!((0..6).all(|k| buddy.free_block_count(k) == 0));
    }

    #[test]
    fn allocate_splits_down_to_the_requested_class() {
        let region = Region::new(1024);
        let mut buddy = region.external::<16>();

        let a = buddy.allocate(20).unwrap();
        assert_eq!(a.len(), 32);
        assert_eq!(offset(&buddy, a), 0);

        // One free buddy at each class from 1 up to 5.
        assert_eq!(
            free_lists(&buddy),
            [
                vec![],
                vec![32],
                vec![64],
                vec![128],
                vec![256],
                vec![512],
                vec![],
            ]
        );
    }

    #[test]
    fn whole_heap_allocation_waits_for_coalescing() {
        let region = Region::new(1024);
        let mut buddy = region.external::<16>();

        let a = buddy.allocate(20).unwrap();
        assert_eq!(a.len(), 32);
        assert_eq!(buddy.allocate(1000), Err(AllocError));

        let b = buddy.allocate(500).unwrap();
        assert_eq!(b.len(), 512);
        assert_eq!(buddy.allocate(1000), Err(AllocError));

        unsafe {
            buddy.deallocate(a.cast());
            buddy.deallocate(b.cast());
        }

        let c = buddy.allocate(1000).unwrap();
        assert_eq!(c.len(), 1024);
        assert_eq!(offset(&buddy, c), 0);
        unsafe { buddy.deallocate(c.cast()) };

        assert_eq!(buddy.free_block_count(6), 1);
    }

    #[test]
    fn oversized_request_fails_without_side_effects() {
        let region = Region::new(1024);
        let mut buddy = region.external::<16>();
        let before = free_lists(&buddy);

        assert_eq!(buddy.allocate(1025), Err(AllocError));
        assert_eq!(buddy.allocate(usize::MAX), Err(AllocError));
        assert_eq!(free_lists(&buddy), before);
    }

    #[test]
    fn zero_byte_request_gets_a_leaf() {
        let region = Region::new(1024);
        let mut buddy = region.external::<16>();

        let a = buddy.allocate(0).unwrap();
        assert_eq!(a.len(), 16);
        unsafe { buddy.deallocate(a.cast()) };
    }

    #[test]
    fn buddies_coalesce_only_when_both_free() {
        let region = Region::new(1024);
        let mut buddy = region.external::<16>();

        let a = buddy.allocate(16).unwrap();
        let b = buddy.allocate(16).unwrap();
        assert_eq!(offset(&buddy, a), 0);
        assert_eq!(offset(&buddy, b), 16);

        unsafe { buddy.deallocate(a.cast()) };
        // `b` is still allocated, so `a` stays a leaf.
        assert_eq!(free_lists(&buddy)[0], [0]);
        assert!(!free_lists(&buddy)[1].contains(&0));

        unsafe { buddy.deallocate(b.cast()) };
        assert!(free_lists(&buddy)[0].is_empty());
        assert_eq!(free_lists(&buddy)[6], [0]);
    }

    #[test]
    fn coalesce_in_reverse_order() {
        let region = Region::new(1024);
        let mut buddy = region.external::<16>();
        let before = free_lists(&buddy);

        let blocks: Vec<_> = (0..64).map(|_| buddy.allocate(16).unwrap()).collect();
        assert_eq!(buddy.allocate(16), Err(AllocError));
        assert_eq!(buddy.free_bytes(), 0);

        for b in blocks.into_iter().rev() {
            unsafe { buddy.deallocate(b.cast()) };
        }

        assert_eq!(free_lists(&buddy), before);
    }

    #[test]
    fn coalesce_interleaved_order() {
        let region = Region::new(1024);
        let mut buddy = region.external::<16>();
        let before = free_lists(&buddy);

        let blocks: Vec<_> = (0..16).map(|_| buddy.allocate(64).unwrap()).collect();

        // Evens first, then odds.
        let (evens, odds): (Vec<_>, Vec<_>) = blocks
            .into_iter()
            .enumerate()
            .partition(|(i, _)| i % 2 == 0);

        for (_, b) in evens {
            unsafe { buddy.deallocate(b.cast()) };
        }
        assert_eq!(buddy.free_block_count(2), 8);

        for (_, b) in odds {
            unsafe { buddy.deallocate(b.cast()) };
        }

        assert_eq!(free_lists(&buddy), before);
    }

    #[test]
    fn allocations_avoid_metadata_and_tail() {
        let region = Region::new(4096);
        let end = unsafe { NonNull::new_unchecked(region.start().as_ptr().add(3000)) };
        let mut buddy = unsafe { Buddy::init(region.start(), end) }.unwrap();

        let usable = buddy.metadata_len()..(buddy.heap_size() - buddy.unavailable_len());

        let mut blocks = Vec::new();
        while let Ok(b) = buddy.allocate(16) {
            let ofs = offset(&buddy, b);
            assert!(usable.contains(&ofs) && ofs + b.len() <= usable.end);
            blocks.push(b);
        }

        assert_eq!(blocks.len() * 16, usable.len());

        for b in blocks {
            unsafe { buddy.deallocate(b.cast()) };
        }

        assert_eq!(buddy.free_bytes(), usable.len());
    }

    #[test]
    #[should_panic]
    fn deallocate_outside_heap_panics() {
        let region = Region::new(1024);
        let mut buddy = region.external::<16>();

        let other = Region::new(1024);
        unsafe { buddy.deallocate(other.start()) };
    }

    #[test]
    #[should_panic]
    fn deallocate_metadata_panics() {
        let region = Region::new(1024);
        let mut buddy = unsafe { Buddy::init(region.start(), region.end()) }.unwrap();

        unsafe { buddy.deallocate(region.start()) };
    }
}
