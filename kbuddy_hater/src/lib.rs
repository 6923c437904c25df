#![deny(unsafe_op_in_unsafe_fn)]

use std::{alloc::Layout, ptr::NonNull};

use alloc_hater::Subject;
use kbuddy::{buddy::BuddyAllocator, AllocInitError};

/// A heap allocation backing a subject, freed on drop.
struct Backing {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Backing {
    fn new(size: usize, align: usize) -> Result<Backing, AllocInitError> {
        let layout =
            Layout::from_size_align(size, align).map_err(|_| AllocInitError::RegionOverflow)?;
        if layout.size() == 0 {
            return Err(AllocInitError::RegionTooSmall);
        }

        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) })
            .ok_or(AllocInitError::RegionTooSmall)?;

        Ok(Backing { ptr, layout })
    }

    fn end(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(self.layout.size())) }
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A buddy allocator over a region allocated from the global allocator.
pub struct BuddySubject<const LEAF_SIZE: usize> {
    buddy: BuddyAllocator<LEAF_SIZE>,
    // Both must outlive `buddy`.
    _metadata: Option<Backing>,
    _region: Backing,
}

impl<const LEAF_SIZE: usize> BuddySubject<LEAF_SIZE> {
    /// Creates a subject over `len` bytes, starting `misalign` bytes past a
    /// page boundary, with the metadata stored at the front of the region.
    pub fn new(len: usize, misalign: usize) -> Result<Self, AllocInitError> {
        let size = len
            .checked_add(misalign)
            .ok_or(AllocInitError::RegionOverflow)?;
        let region = Backing::new(size, 4096)?;
        let start = unsafe { NonNull::new_unchecked(region.ptr.as_ptr().add(misalign)) };

        let buddy = unsafe { BuddyAllocator::init(start, region.end())? };

        Ok(BuddySubject {
            buddy,
            _metadata: None,
            _region: region,
        })
    }

    /// Creates a subject over `len` bytes with the metadata stored in a
    /// separate allocation, leaving the whole region usable.
    pub fn new_external(len: usize) -> Result<Self, AllocInitError> {
        let region = Backing::new(len, 4096)?;

        let meta_layout = BuddyAllocator::<LEAF_SIZE>::metadata_layout(len)?;
        let metadata = Backing::new(meta_layout.size(), meta_layout.align())?;

        let buddy = unsafe { BuddyAllocator::new_raw(metadata.ptr, region.ptr, region.end())? };

        Ok(BuddySubject {
            buddy,
            _metadata: Some(metadata),
            _region: region,
        })
    }

    pub fn allocator(&self) -> &BuddyAllocator<LEAF_SIZE> {
        &self.buddy
    }
}

impl<const LEAF_SIZE: usize> Subject for BuddySubject<LEAF_SIZE> {
    type AllocError = kbuddy::AllocError;

    fn allocate(&mut self, nbytes: usize) -> Result<NonNull<[u8]>, Self::AllocError> {
        self.buddy.allocate(nbytes)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        unsafe { self.buddy.deallocate(ptr) };
    }

    fn free_bytes(&self) -> Option<usize> {
        Some(self.buddy.free_bytes())
    }
}
