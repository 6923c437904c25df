//! A buddy allocator behind a single global spin lock.
//!
//! Every operation takes the lock for its whole duration, so allocations and
//! frees from different harts are serialized. [`SpinBuddyAllocator`] can be
//! declared as a `static` before the heap exists and initialized later, which
//! makes it suitable as a `#[global_allocator]`.

use core::{
    alloc::{GlobalAlloc, Layout},
    cmp,
    ptr::{self, NonNull},
};

use spin::Mutex;

use crate::{AllocError, AllocInitError, BuddyAllocator, DEFAULT_LEAF_SIZE};

/// A [`BuddyAllocator`] guarded by a spin lock.
///
/// ```
/// use kbuddy::SpinBuddyAllocator;
///
/// static HEAP: SpinBuddyAllocator<16> = SpinBuddyAllocator::empty();
///
/// // Until `init` is called, every allocation fails.
/// assert!(HEAP.allocate(8).is_err());
/// ```
#[derive(Debug)]
pub struct SpinBuddyAllocator<const LEAF_SIZE: usize = DEFAULT_LEAF_SIZE> {
    inner: Mutex<Option<BuddyAllocator<LEAF_SIZE>>>,
}

impl<const LEAF_SIZE: usize> SpinBuddyAllocator<LEAF_SIZE> {
    /// Creates an uninitialized allocator.
    pub const fn empty() -> SpinBuddyAllocator<LEAF_SIZE> {
        SpinBuddyAllocator {
            inner: Mutex::new(None),
        }
    }

    /// Initializes the allocator over `[start, end)`.
    ///
    /// See [`BuddyAllocator::init`].
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::AlreadyInitialized`] if called more than once,
    /// or any error returned by [`BuddyAllocator::init`].
    ///
    /// # Safety
    ///
    /// The same requirements as [`BuddyAllocator::init`] apply.
    pub unsafe fn init(&self, start: NonNull<u8>, end: NonNull<u8>) -> Result<(), AllocInitError> {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            return Err(AllocInitError::AlreadyInitialized);
        }

        *inner = Some(unsafe { BuddyAllocator::init(start, end) }?);

        Ok(())
    }

    /// Installs an already constructed allocator.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::AlreadyInitialized`] if the lock already
    /// holds an allocator.
    pub fn install(&self, buddy: BuddyAllocator<LEAF_SIZE>) -> Result<(), AllocInitError> {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            return Err(AllocInitError::AlreadyInitialized);
        }

        *inner = Some(buddy);

        Ok(())
    }

    /// Allocates a block of at least `nbytes` bytes.
    ///
    /// See [`BuddyAllocator::allocate`].
    ///
    /// # Errors
    ///
    /// Returns `Err` if the allocator is uninitialized or out of memory.
    pub fn allocate(&self, nbytes: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.inner
            .lock()
            .as_mut()
            .ok_or(AllocError)?
            .allocate(nbytes)
    }

    /// Deallocates the block referenced by `ptr`.
    ///
    /// # Panics
    ///
    /// Panics if the allocator is uninitialized, or under the conditions
    /// documented on [`BuddyAllocator::deallocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated via this allocator.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let mut inner = self.inner.lock();
        let buddy = inner
            .as_mut()
            .expect("deallocate called on an uninitialized allocator");

        unsafe { buddy.deallocate(ptr) };
    }

    /// Calls `f` with the locked allocator, if it has been initialized.
    pub fn with_locked<R>(&self, f: impl FnOnce(&mut BuddyAllocator<LEAF_SIZE>) -> R) -> Option<R> {
        self.inner.lock().as_mut().map(f)
    }
}

unsafe impl<const LEAF_SIZE: usize> GlobalAlloc for SpinBuddyAllocator<LEAF_SIZE> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Blocks are aligned to their size relative to the heap base, so a
        // block at least `align` bytes long is suitably aligned as long as the
        // base is.
        let nbytes = cmp::max(layout.size(), layout.align());

        let Ok(block) = self.allocate(nbytes) else {
            return ptr::null_mut();
        };

        let ptr = block.cast::<u8>();
        if ptr.as_ptr().align_offset(layout.align()) != 0 {
            unsafe { self.deallocate(ptr) };
            return ptr::null_mut();
        }

        ptr.as_ptr()
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            unsafe { self.deallocate(ptr) };
        }
    }
}
