//! A binary-buddy allocator over a single caller-supplied region.
//!
//! The region is decomposed into at most [`MAX_BLOCKS`] power-of-two blocks.
//! Each block is an independent buddy system: chunks are split in halves on
//! allocation and coalesced with their buddies on release. Free chunks of
//! each size class, and all allocated chunks, are kept in address-ordered AVL
//! trees whose nodes are the chunk headers themselves, so both operations run
//! in O(log n) without any memory outside the region.
//!
//! ## Crate features
//!
//! - `sptr` (default): use the [`sptr`] polyfill for strict-provenance
//!   pointer methods. Without it, the methods provided by `core` are used.
//! - `alloc`: enables [`Global`] and [`BuddyAllocator::try_new`].
//! - `log`: emit diagnostics through the [`log`] facade.
//!
//! [`sptr`]: https://docs.rs/sptr
//! [`log`]: https://docs.rs/log

#![doc(html_root_url = "https://docs.rs/avl_buddy/0.1.0")]
#![no_std]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` and `polyfill` to shadow methods provided
// by `core` on newer toolchains.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

// Stub macros when `log` is disabled; diagnostics compile to nothing.
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

mod base;
pub mod buddy;
mod class;
pub mod heap;
mod polyfill;
mod tree;


use core::{alloc::Layout, fmt, ptr::NonNull};

pub use crate::{
    buddy::BuddyAllocator,
    class::{ceiling_class, floor_class, HEADER_SIZE, MAX_BLOCKS, MIN_CHUNK_CLASS, NUM_CLASSES},
    heap::Heap,
};

/// The error type for allocator constructors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate the
    /// managed region, but the underlying allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when the region would extend past the end of
    /// the address space.
    InvalidConfig,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::AllocFailed(layout) => write!(
                f,
                "failed to allocate region of {} bytes (align {})",
                layout.size(),
                layout.align()
            ),
            AllocInitError::InvalidConfig => f.write_str("invalid allocator configuration"),
        }
    }
}

/// Indicates why an allocation or a release was refused.
///
/// The allocator's state is unchanged whenever one of these is returned.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AllocError {
    /// The request was malformed, e.g. a zero-sized allocation.
    InvalidArgument,
    /// No free chunk of a sufficient size class exists.
    OutOfMemory,
    /// The pointer does not denote a block currently allocated by this
    /// allocator.
    InvalidPointer,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AllocError::InvalidArgument => "invalid allocation request",
            AllocError::OutOfMemory => "out of memory",
            AllocError::InvalidPointer => "pointer was not allocated by this allocator",
        })
    }
}

/// Types which provide memory which backs an allocator.
///
/// This trait is sealed, and is implemented by the following types:
/// - The `Raw` marker type indicates that an allocator is not backed by another
///   allocator. This is the case when constructing the allocator from raw
///   pointers. Memory used by this allocator can be reclaimed using
///   `.into_raw_parts()`.
/// - The `Global` marker type indicates that an allocator is backed by the
///   global allocator. The allocator will free its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory currently allocated via this
    ///   allocator, and
    /// * `layout` must fit that block of memory.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that an allocator is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

/// The global memory allocator.
#[cfg(any(feature = "alloc", test))]
#[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
