use core::{
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

use crate::polyfill::Strict;

/// The heap base, through which every block pointer is derived.
///
/// `extent` is the power-of-two heap size. The addresses past the end of the
/// caller's region, up to `base + extent`, belong to the unavailable tail and
/// are never dereferenced.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Wraps `ptr`, which keeps its provenance, as the base of a heap of
    /// `extent` bytes.
    ///
    /// Returns `None` if the heap would wrap around the address space.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> Option<BasePtr> {
        ptr.addr().get().checked_add(extent)?;

        Some(BasePtr { ptr, extent })
    }

    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns `true` if `addr` lies in `[base, base + extent)`.
    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        let base = self.ptr.addr().get();

        (base..base + self.extent).contains(&addr.get())
    }

    /// Returns the heap offset of `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is below the base.
    #[inline]
    pub fn offset_to(self, addr: NonZeroUsize) -> usize {
        addr.get()
            .checked_sub(self.ptr.addr().get())
            .expect("address below heap base")
    }

    /// Returns the address at heap offset `offset`.
    #[inline]
    pub fn addr_at(self, offset: usize) -> NonZeroUsize {
        debug_assert!(offset < self.extent);

        // The sum was bounded by `new`, and the base is non-zero.
        NonZeroUsize::new(self.ptr.addr().get() + offset).unwrap()
    }

    /// Returns a pointer to `addr` carrying the base's provenance.
    #[inline]
    pub fn with_addr(self, addr: NonZeroUsize) -> NonNull<u8> {
        debug_assert!(self.contains_addr(addr));

        self.ptr.with_addr(addr)
    }

    /// Returns a `len`-byte slice pointer at `addr` carrying the base's
    /// provenance.
    #[inline]
    pub fn slice_at(self, addr: NonZeroUsize, len: usize) -> NonNull<[u8]> {
        let data = self.ptr.as_ptr().with_addr(addr.get());

        // SAFETY: `addr` is non-zero.
        unsafe { NonNull::new_unchecked(ptr::slice_from_raw_parts_mut(data, len)) }
    }

    /// Writes `link` into the free block at `addr`.
    ///
    /// # Safety
    ///
    /// The block at `addr` must be free, aligned for `BlockLink`, and valid
    /// for writes of `size_of::<BlockLink>()` bytes under the base's
    /// provenance.
    #[inline]
    pub unsafe fn write_link(self, addr: NonZeroUsize, link: BlockLink) {
        debug_assert!(link.prev.map_or(true, |a| self.contains_addr(a)));
        debug_assert!(link.next.map_or(true, |a| self.contains_addr(a)));

        unsafe { self.with_addr(addr).cast::<BlockLink>().as_ptr().write(link) };
    }

    /// Returns the link stored in the free block at `addr`.
    ///
    /// # Safety
    ///
    /// The block at `addr` must be free and hold a link written by
    /// [`write_link`](Self::write_link), and no other reference to that link
    /// may be live for `'a`.
    #[inline]
    pub unsafe fn link_mut<'a>(self, addr: NonZeroUsize) -> &'a mut BlockLink {
        unsafe { self.with_addr(addr).cast::<BlockLink>().as_mut() }
    }
}

/// The free-list link stored in the first bytes of every free block.
///
/// Neighbors are recorded as bare addresses, not pointers: a block is only
/// ever reached again through [`BasePtr::with_addr`], so no borrow of one
/// block is derived from another.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BlockLink {
    pub prev: Option<NonZeroUsize>,
    pub next: Option<NonZeroUsize>,
}
