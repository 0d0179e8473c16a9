//! Producer side storage strategy.
//!
//! Finalization is part of the vtable and anyone holding a handle can run it.
//! Releasing storage is not: only the party that knows which allocator handed
//! out the memory can give it back. These traits are how that knowledge is
//! carried around on the Rust side.

use std::alloc::{alloc, dealloc};
use std::ptr::NonNull;

use crate::error::Error;
use crate::layout::MemoryLayout;

/// Releases blocks of memory previously allocated by a compatible allocator.
///
/// A foreign producer's deallocation entry point is usually wrapped in a type
/// implementing only this trait, since Rust never allocates on its behalf.
pub trait Deallocator {
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator, and `layout` must be the layout it was allocated with.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: MemoryLayout);
}

/// Allocates blocks of memory given their layout.
pub trait Allocator: Deallocator {
    /// Returns an error instead of aborting when the memory cannot be provided.
    fn allocate(&self, layout: MemoryLayout) -> Result<NonNull<u8>, Error>;
}

/// The Rust global allocator.
#[derive(Copy, Clone, Debug, Default)]
pub struct GlobalAllocator;

impl Allocator for GlobalAllocator {
    fn allocate(&self, layout: MemoryLayout) -> Result<NonNull<u8>, Error> {
        let rust_layout = layout.to_layout()?;
        if layout.is_zero_sized() {
            // SAFETY: alignments are never zero
            return Ok(unsafe { NonNull::new_unchecked(layout.align as *mut u8) });
        }

        let memory = unsafe { alloc(rust_layout) };
        NonNull::new(memory).ok_or_else(|| Error::alloc_failed(layout.size, layout.align))
    }
}

impl Deallocator for GlobalAllocator {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: MemoryLayout) {
        if layout.is_zero_sized() {
            return;
        }
        // The layout was accepted when this block was allocated.
        let rust_layout = std::alloc::Layout::from_size_align_unchecked(layout.size, layout.align);
        dealloc(ptr.as_ptr(), rust_layout)
    }
}

impl<A: Deallocator + ?Sized> Deallocator for &A {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: MemoryLayout) {
        (**self).deallocate(ptr, layout)
    }
}

impl<A: Allocator + ?Sized> Allocator for &A {
    fn allocate(&self, layout: MemoryLayout) -> Result<NonNull<u8>, Error> {
        (**self).allocate(layout)
    }
}
