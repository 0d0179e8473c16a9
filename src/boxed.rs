use std::mem::ManuallyDrop;
use std::ptr;

use crate::alloc::{Allocator, Deallocator, GlobalAllocator};
use crate::error::Error;
use crate::handle::{DynPtr, DynRef, DynRefMut};
use crate::layout::MemoryLayout;
use crate::vtables::{DynTrait, SubTable, VTable};

/// An FFI safe owning handle: a [`DynPtr`] plus the allocator that owns its storage.
///
/// Dropping a `DynBox` finalizes the value through the `drop` slot of its
/// vtable and then releases the storage with its allocator, each exactly once.
/// This is the only place in the crate where both steps happen together.
///
/// The allocator does not need to be able to allocate. A value produced on the
/// other side of the boundary can be adopted with [`DynBox::from_raw_in`] and a
/// [`Deallocator`] that forwards to the producer's deallocation entry point.
#[repr(C)]
pub struct DynBox<V: VTable, A: Deallocator = GlobalAllocator> {
    ptr: DynPtr<V>,
    alloc: A,
}

impl<V: VTable> DynBox<V, GlobalAllocator> {
    /// Moves `data` into the global allocator.
    ///
    /// # Panics
    ///
    /// Panics on allocation failure.
    pub fn new<T: DynTrait<V>>(data: T) -> Self {
        Self::new_in(data, GlobalAllocator)
    }

    /// Adopts a handle whose storage came from the Rust global allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must be a valid, owned, not yet finalized handle whose data was
    /// allocated by the global allocator with the layout in its vtable.
    pub unsafe fn from_raw(ptr: DynPtr<V>) -> Self {
        Self::from_raw_in(ptr, GlobalAllocator)
    }
}

impl<V: VTable, A: Deallocator> DynBox<V, A> {
    /// Moves `data` into memory from `alloc`.
    ///
    /// # Panics
    ///
    /// Panics on allocation failure.
    pub fn new_in<T: DynTrait<V>>(data: T, alloc: A) -> Self
    where
        A: Allocator,
    {
        match Self::try_new_in(data, alloc) {
            Ok(dynbox) => dynbox,
            Err(err) => panic!("Cannot allocate dyn value: {err}"),
        }
    }

    /// Moves `data` into memory from `alloc`, returning an error if the
    /// allocation fails. On failure `data` is dropped.
    pub fn try_new_in<T: DynTrait<V>>(data: T, alloc: A) -> Result<Self, Error>
    where
        A: Allocator,
    {
        Self::try_new_with_in(alloc, move || data)
    }

    /// Allocates from `alloc` and only then builds the value with `f`.
    ///
    /// Values whose destructor has side effects use this, so that a failed
    /// allocation never constructs (and never drops) one.
    pub fn try_new_with_in<T, F>(alloc: A, f: F) -> Result<Self, Error>
    where
        T: DynTrait<V>,
        F: FnOnce() -> T,
        A: Allocator,
    {
        let layout = MemoryLayout::new::<T>();
        let memory = alloc.allocate(layout)?.cast::<T>();
        log::trace!("allocated {} bytes for dyn value at {:p}", layout.size, memory);

        unsafe {
            memory.as_ptr().write(f());
            Ok(Self::from_raw_in(DynPtr::new(memory.as_ptr()), alloc))
        }
    }

    /// Adopts a handle whose storage was allocated by `alloc`.
    ///
    /// After this call the handle is owned by the `DynBox` and will be
    /// finalized and released when it is dropped.
    ///
    /// # Safety
    ///
    /// `ptr` must be a valid, owned, not yet finalized handle whose data was
    /// allocated by `alloc` with the layout recorded in its vtable. Nobody else
    /// may finalize or release it afterwards.
    pub unsafe fn from_raw_in(ptr: DynPtr<V>, alloc: A) -> Self {
        Self { ptr, alloc }
    }

    /// Gives up ownership, returning the raw handle and its allocator.
    ///
    /// The caller becomes responsible for finalizing and releasing the value.
    pub fn into_raw_with_allocator(b: Self) -> (DynPtr<V>, A) {
        let b = ManuallyDrop::new(b);
        // SAFETY: `b` is never dropped, so the allocator is moved out exactly once
        let alloc = unsafe { ptr::read(&b.alloc) };
        (b.ptr, alloc)
    }

    /// Gives up ownership, returning the raw handle. The allocator is dropped.
    pub fn into_raw(b: Self) -> DynPtr<V> {
        Self::into_raw_with_allocator(b).0
    }

    /// Converts to an owning handle at the parent level `P`.
    ///
    /// Teardown still finalizes the whole value, since the `drop` slot in the
    /// parent table was built for the same concrete type.
    pub fn upcast<P: VTable>(b: Self) -> DynBox<P, A>
    where
        V: SubTable<P>,
    {
        let (ptr, alloc) = Self::into_raw_with_allocator(b);
        DynBox {
            ptr: ptr.upcast(),
            alloc,
        }
    }

    /// Immutably borrows the wrapped value.
    pub fn borrow(b: &Self) -> DynRef<'_, V> {
        // SAFETY: the box keeps the value alive and shared for the borrow
        unsafe { DynRef::from_raw(b.ptr) }
    }

    /// Mutably borrows the wrapped value.
    pub fn borrow_mut(b: &mut Self) -> DynRefMut<'_, V> {
        // SAFETY: the box keeps the value alive and exclusive for the borrow
        unsafe { DynRefMut::from_raw(b.ptr) }
    }

    /// The allocator the value's storage goes back to.
    pub fn allocator(b: &Self) -> &A {
        &b.alloc
    }
}

impl<V: VTable, A: Deallocator> Drop for DynBox<V, A> {
    fn drop(&mut self) {
        unsafe {
            self.ptr.finalize();
            self.ptr.release_in(&self.alloc);
        }
    }
}

// Not derived: it would require `V: Debug`.
impl<V: VTable, A: Deallocator + std::fmt::Debug> std::fmt::Debug for DynBox<V, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynBox")
            .field("ptr", &self.ptr)
            .field("alloc", &self.alloc)
            .finish()
    }
}
