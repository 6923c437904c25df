//! A binary buddy allocator for a single, fixed region of kernel memory.
//!
//! The allocator hands out power-of-two-sized blocks carved from one
//! contiguous region and coalesces them back together when they are freed.
//! All bookkeeping (one pair-parity bitmap and one split bitmap per size
//! class, plus an intrusive free list) lives either at the front of the
//! managed region or in a caller-provided metadata buffer; the allocator never
//! allocates for itself after construction.
//!
//! The core type is [`BuddyAllocator`], which is mutated through `&mut self`.
//! [`SpinBuddyAllocator`] wraps it in a single global spin lock and implements
//! [`GlobalAlloc`](core::alloc::GlobalAlloc).
//!
//! ```
//! use std::alloc::{alloc, dealloc, Layout};
//! use std::ptr::NonNull;
//!
//! use kbuddy::BuddyAllocator;
//!
//! let layout = Layout::from_size_align(64 * 1024, 4096).unwrap();
//! let start = NonNull::new(unsafe { alloc(layout) }).unwrap();
//! let end = NonNull::new(unsafe { start.as_ptr().add(layout.size()) }).unwrap();
//!
//! let mut buddy = unsafe { BuddyAllocator::<16>::init(start, end) }.unwrap();
//!
//! let block = buddy.allocate(100).unwrap();
//! assert_eq!(block.len(), 128);
//!
//! unsafe {
//!     buddy.deallocate(block.cast());
//!     dealloc(start.as_ptr(), layout);
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/kbuddy/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![no_std]
// This is necessary to allow `sptr` and `polyfill` to shadow methods provided
// by newer toolchains.
#![allow(unstable_name_collisions)]

#[cfg(test)]
extern crate alloc;

mod base;
mod bitmap;
pub mod buddy;
mod dump;
mod free_list;
pub mod layout;
mod mark;
mod polyfill;
pub mod sync;


pub use crate::{buddy::BuddyAllocator, dump::Dump, layout::BlockRef, sync::SpinBuddyAllocator};

/// A 16-byte leaf, the smallest that holds a free-list link on 64-bit targets.
pub const DEFAULT_LEAF_SIZE: usize = 16;

/// Indicates an allocation failure due to resource exhaustion.
///
/// No free block at or above the requested size class exists. The allocator
/// never retries internally.
#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
#[error("out of memory")]
pub struct AllocError;

/// The error type for allocator constructors.
///
/// `MisalignedRange` and `AccountingMismatch` indicate that the allocator's
/// own bookkeeping is inconsistent. An embedding kernel should treat them as
/// fatal.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AllocInitError {
    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when `LEAF_SIZE` is not a power of two or is
    /// too small to hold a free-list link.
    #[error("invalid allocator configuration")]
    InvalidConfig,

    /// The region cannot hold a single leaf block once alignment and metadata
    /// are accounted for.
    #[error("region too small to manage")]
    RegionTooSmall,

    /// The rounded-up heap would extend past the end of the address space.
    #[error("heap extent overflows the address space")]
    RegionOverflow,

    /// The locked allocator has already been initialized.
    #[error("allocator already initialized")]
    AlreadyInitialized,

    /// A reservation passed to range marking was not leaf-aligned.
    #[error("reserved range {start:#x}..{stop:#x} is not leaf-aligned")]
    MisalignedRange {
        /// Offset of the start of the range.
        start: usize,
        /// Offset of the end of the range.
        stop: usize,
    },

    /// The bytes placed on free lists during initialization do not add up to
    /// the heap size minus the reserved ranges.
    #[error("initialization freed {freed} bytes, expected {expected}")]
    AccountingMismatch {
        /// Bytes actually pushed onto free lists.
        freed: usize,
        /// Bytes that should have been pushed.
        expected: usize,
    },
}
