//! The `ReadInt` / `ReadWriteInt` capability levels and the `Counter` value
//! used to exercise them across the boundary.
//!
//! `ReadWriteInt` extends `ReadInt`, so its vtable embeds a complete
//! [`ReadIntVTable`] right after the header:
//!
//! ```text
//! ReadWriteIntVTable
//! +--------+--------+--------------------------------------+--------+
//! | drop   | layout | parent: ReadIntVTable                | set    |
//! |        |        | +--------+--------+--------+         |        |
//! |        |        | | drop   | layout | get    |         |        |
//! +--------+--------+--------------------------------------+--------+
//! ```

use std::ffi::c_void;
use std::mem::{offset_of, size_of};
use std::ptr::NonNull;

use crate::alloc::{Allocator, Deallocator, GlobalAllocator};
use crate::boxed::DynBox;
use crate::diagnostics::Diagnostics;
use crate::error::Error;
use crate::handle::{DynPtr, DynRef, DynRefMut};
use crate::layout::MemoryLayout;
use crate::vtables::{drop_in_place, DropFn, DynTrait, SubTable, VTable};

/// Values that hold a readable integer.
pub trait ReadInt {
    fn get(&self) -> i32;
}

/// Values that hold a readable and writable integer.
pub trait ReadWriteInt: ReadInt {
    fn set(&mut self, value: i32);
}

pub type GetFn = unsafe extern "C" fn(data: *const c_void) -> i32;
pub type SetFn = unsafe extern "C" fn(data: *mut c_void, value: i32);

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct ReadIntVTable {
    pub drop: Option<DropFn>,
    pub layout: MemoryLayout,
    pub get: Option<GetFn>,
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct ReadWriteIntVTable {
    pub drop: Option<DropFn>,
    pub layout: MemoryLayout,
    pub parent: ReadIntVTable,
    pub set: Option<SetFn>,
}

const WORD: usize = size_of::<usize>();

const _: () = assert!(offset_of!(ReadIntVTable, drop) == 0);
const _: () = assert!(offset_of!(ReadIntVTable, layout) == WORD);
const _: () = assert!(offset_of!(ReadIntVTable, get) == 3 * WORD);
const _: () = assert!(size_of::<ReadIntVTable>() == 4 * WORD);

const _: () = assert!(offset_of!(ReadWriteIntVTable, drop) == 0);
const _: () = assert!(offset_of!(ReadWriteIntVTable, layout) == WORD);
const _: () = assert!(offset_of!(ReadWriteIntVTable, parent) == 3 * WORD);
const _: () = assert!(offset_of!(ReadWriteIntVTable, set) == 7 * WORD);
const _: () = assert!(size_of::<ReadWriteIntVTable>() == 8 * WORD);

unsafe impl VTable for ReadIntVTable {}
unsafe impl VTable for ReadWriteIntVTable {}

unsafe impl SubTable<ReadIntVTable> for ReadWriteIntVTable {
    const OFFSET: usize = offset_of!(ReadWriteIntVTable, parent);
}

unsafe extern "C" fn get_shim<T: ReadInt>(data: *const c_void) -> i32 {
    (*data.cast::<T>()).get()
}

unsafe extern "C" fn set_shim<T: ReadWriteInt>(data: *mut c_void, value: i32) {
    (*data.cast::<T>()).set(value)
}

unsafe impl<T: ReadInt> DynTrait<ReadIntVTable> for T {
    const VTABLE: ReadIntVTable = ReadIntVTable {
        drop: Some(drop_in_place::<T>),
        layout: MemoryLayout::new::<T>(),
        get: Some(get_shim::<T>),
    };
    const STATIC_VTABLE: &'static ReadIntVTable = &Self::VTABLE;
}

unsafe impl<T: ReadWriteInt> DynTrait<ReadWriteIntVTable> for T {
    const VTABLE: ReadWriteIntVTable = ReadWriteIntVTable {
        drop: Some(drop_in_place::<T>),
        layout: MemoryLayout::new::<T>(),
        parent: <T as DynTrait<ReadIntVTable>>::VTABLE,
        set: Some(set_shim::<T>),
    };
    const STATIC_VTABLE: &'static ReadWriteIntVTable = &Self::VTABLE;
}

/// Reads the integer through the `ReadInt` level of any handle that has one.
pub fn get<V: SubTable<ReadIntVTable>>(this: DynRef<'_, V>) -> i32 {
    let get = this
        .table::<ReadIntVTable>()
        .get
        .expect("vtable function 'get' not set");
    unsafe { get(this.data()) }
}

/// Writes the integer through the `ReadWriteInt` level.
pub fn set<V: SubTable<ReadWriteIntVTable>>(mut this: DynRefMut<'_, V>, value: i32) {
    let set = this
        .table::<ReadWriteIntVTable>()
        .set
        .expect("vtable function 'set' not set");
    unsafe { set(this.data_mut(), value) }
}

/// Adds one to the integer and returns the new value.
///
/// Reads with the `get` slot of the embedded parent region and writes with the
/// level's own `set` slot, so a single call dispatches at both levels. Wraps
/// around on overflow.
pub fn increment<V: SubTable<ReadWriteIntVTable>>(mut this: DynRefMut<'_, V>) -> i32 {
    let table = this.table::<ReadWriteIntVTable>();
    let get = table.parent.get.expect("vtable function 'get' not set");
    let set = table.set.expect("vtable function 'set' not set");

    unsafe {
        let value = get(this.data()).wrapping_add(1);
        set(this.data_mut(), value);
        value
    }
}

impl<V: SubTable<ReadIntVTable>> ReadInt for DynRef<'_, V> {
    fn get(&self) -> i32 {
        get(*self)
    }
}

impl<V: SubTable<ReadIntVTable>> ReadInt for DynRefMut<'_, V> {
    fn get(&self) -> i32 {
        get(self.as_dyn_ref())
    }
}

impl<V> ReadWriteInt for DynRefMut<'_, V>
where
    V: SubTable<ReadIntVTable> + SubTable<ReadWriteIntVTable>,
{
    fn set(&mut self, value: i32) {
        set(self.reborrow(), value)
    }
}

impl<V: SubTable<ReadIntVTable>, A: Deallocator> ReadInt for DynBox<V, A> {
    fn get(&self) -> i32 {
        get(DynBox::borrow(self))
    }
}

impl<V, A> ReadWriteInt for DynBox<V, A>
where
    V: SubTable<ReadIntVTable> + SubTable<ReadWriteIntVTable>,
    A: Deallocator,
{
    fn set(&mut self, value: i32) {
        set(DynBox::borrow_mut(self), value)
    }
}

/// The integer holding value handed out by the producer entry points.
///
/// Finalizing a counter records a drop on the [`Diagnostics`] it was created
/// with, if any.
#[derive(Debug)]
pub struct Counter {
    value: i32,
    diagnostics: *const Diagnostics,
}

impl Counter {
    /// A counter that reports to nobody.
    pub fn new(value: i32) -> Self {
        Self {
            value,
            diagnostics: std::ptr::null(),
        }
    }

    /// # Safety
    ///
    /// `diagnostics` must be null or outlive the counter.
    pub unsafe fn with_diagnostics(value: i32, diagnostics: *const Diagnostics) -> Self {
        Self { value, diagnostics }
    }
}

impl ReadInt for Counter {
    fn get(&self) -> i32 {
        self.value
    }
}

impl ReadWriteInt for Counter {
    fn set(&mut self, value: i32) {
        self.value = value;
    }
}

impl Drop for Counter {
    fn drop(&mut self) {
        if let Some(diagnostics) = unsafe { self.diagnostics.as_ref() } {
            diagnostics.record_drop();
        }
    }
}

/// The producer's allocator for counters: global memory, with every release
/// recorded on a [`Diagnostics`].
#[derive(Copy, Clone, Debug)]
pub struct CounterAllocator {
    diagnostics: *const Diagnostics,
}

impl CounterAllocator {
    /// # Safety
    ///
    /// `diagnostics` must be null or outlive every use of the allocator.
    pub unsafe fn new(diagnostics: *const Diagnostics) -> Self {
        Self { diagnostics }
    }
}

impl Allocator for CounterAllocator {
    fn allocate(&self, layout: MemoryLayout) -> Result<NonNull<u8>, Error> {
        GlobalAllocator.allocate(layout)
    }
}

impl Deallocator for CounterAllocator {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: MemoryLayout) {
        if let Some(diagnostics) = self.diagnostics.as_ref() {
            diagnostics.record_dealloc();
        }
        GlobalAllocator.deallocate(ptr, layout)
    }
}

/// Allocates a counter starting at 0 and returns a handle at the extended level.
///
/// Ownership passes to the caller, who must finalize the value and then give
/// the storage back with [`release_counter`].
///
/// # Safety
///
/// `diagnostics` must be null or outlive the counter.
pub unsafe fn produce_counter(
    diagnostics: *const Diagnostics,
) -> Result<DynPtr<ReadWriteIntVTable>, Error> {
    produce_counter_in(diagnostics, CounterAllocator::new(diagnostics))
}

/// Same as [`produce_counter`] with storage from `alloc`.
///
/// The counter is only built once the allocation succeeded, so a failure
/// leaves `diagnostics` untouched.
///
/// # Safety
///
/// `diagnostics` must be null or outlive the counter.
pub unsafe fn produce_counter_in<A: Allocator>(
    diagnostics: *const Diagnostics,
    alloc: A,
) -> Result<DynPtr<ReadWriteIntVTable>, Error> {
    let counter = DynBox::<ReadWriteIntVTable, _>::try_new_with_in(alloc, || {
        Counter::with_diagnostics(0, diagnostics)
    })?;
    Ok(DynBox::into_raw(counter))
}

/// Gives the storage of a finalized counter back to the producer.
///
/// # Safety
///
/// `data` must come from [`produce_counter`], must have been finalized and
/// must not be released twice.
pub unsafe fn release_counter(diagnostics: *const Diagnostics, data: NonNull<c_void>) {
    log::trace!("releasing counter at {:p}", data);
    CounterAllocator::new(diagnostics).deallocate(data.cast(), MemoryLayout::new::<Counter>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_call_counts;
    use crate::test_utils::CountingAllocator;
    use crate::vtables::VTableHeader;

    #[test]
    fn vtable_offsets_match_c_layout() {
        assert_eq!(offset_of!(ReadIntVTable, get), 3 * WORD);
        assert_eq!(offset_of!(ReadWriteIntVTable, parent), 3 * WORD);
        assert_eq!(offset_of!(ReadWriteIntVTable, set), 7 * WORD);
        assert_eq!(
            <ReadWriteIntVTable as SubTable<ReadIntVTable>>::OFFSET,
            3 * WORD
        );
    }

    #[test]
    fn embedded_parent_equals_standalone_table() {
        let standalone = <Counter as DynTrait<ReadIntVTable>>::STATIC_VTABLE;
        let extended = <Counter as DynTrait<ReadWriteIntVTable>>::STATIC_VTABLE;
        let embedded: &ReadIntVTable = extended.subtable();

        assert_eq!(embedded.layout, standalone.layout);
        assert_eq!(embedded.drop.is_some(), standalone.drop.is_some());

        let counter = Counter::new(31);
        let data = &counter as *const Counter as *const c_void;
        unsafe {
            assert_eq!(embedded.get.unwrap()(data), standalone.get.unwrap()(data));
        }

        let header: &VTableHeader = extended.header();
        assert_eq!(header.layout, MemoryLayout::new::<Counter>());
        assert_eq!(embedded.header().layout, header.layout);
    }

    #[test]
    fn upcast_get_matches_extended_get() {
        let mut counter = Counter::new(17);
        let handle = DynRefMut::<ReadWriteIntVTable>::new(&mut counter);

        let through_extended = get(handle.as_dyn_ref());
        let through_base = get(handle.as_dyn_ref().upcast::<ReadIntVTable>());
        assert_eq!(through_extended, 17);
        assert_eq!(through_base, 17);
    }

    #[test]
    fn increment_n_times_yields_n() {
        let mut counter = Counter::new(0);
        let mut handle = DynRefMut::<ReadWriteIntVTable>::new(&mut counter);
        for expected in 1..=25 {
            assert_eq!(increment(handle.reborrow()), expected);
        }
        assert_eq!(handle.upcast::<ReadIntVTable>().get(), 25);
        assert_eq!(counter.get(), 25);
    }

    #[test]
    fn increment_wraps_around() {
        let mut counter = Counter::new(i32::MAX);
        assert_eq!(
            increment(DynRefMut::<ReadWriteIntVTable>::new(&mut counter)),
            i32::MIN
        );
    }

    #[test]
    fn set_then_get_through_traits() {
        let mut counter = Counter::new(0);
        let mut handle = DynRefMut::<ReadWriteIntVTable>::new(&mut counter);
        handle.set(-4);
        assert_eq!(handle.get(), -4);
        assert_eq!(DynRef::<ReadIntVTable>::new(&counter).get(), -4);
    }

    #[test]
    fn boxed_counter_dispatches_and_tears_down_once() {
        let diagnostics = Diagnostics::new();
        let alloc = CountingAllocator::default();
        {
            let mut counter = DynBox::<ReadWriteIntVTable, _>::new_in(
                unsafe { Counter::with_diagnostics(0, &diagnostics) },
                &alloc,
            );
            counter.set(counter.get() + 1);
            increment(DynBox::borrow_mut(&mut counter));
            assert_eq!(counter.get(), 2);

            let base = DynBox::upcast::<ReadIntVTable>(counter);
            assert_eq!(base.get(), 2);
            assert_call_counts!(diagnostics, 0, 0);
        }
        assert_call_counts!(diagnostics, 1, 0);
        assert_eq!(alloc.deallocations(), 1);
    }

    #[test]
    #[should_panic(expected = "vtable function 'get' not set")]
    fn missing_slot_panics() {
        static BROKEN: ReadIntVTable = ReadIntVTable {
            drop: None,
            layout: MemoryLayout::new::<Counter>(),
            get: None,
        };
        let counter = Counter::new(0);
        let handle = unsafe {
            DynRef::from_raw(DynPtr {
                data: &counter as *const Counter as *mut c_void,
                vtable: &BROKEN as *const ReadIntVTable,
            })
        };
        get(handle);
    }

    #[test]
    fn lifecycle_is_counted_exactly_once() {
        let diagnostics = Diagnostics::new();
        unsafe {
            let handle = produce_counter(&diagnostics).unwrap();
            assert!(!handle.is_null());
            assert_call_counts!(diagnostics, 0, 0);

            increment(DynRefMut::from_raw(handle));
            increment(DynRefMut::from_raw(handle));
            assert_eq!(get(DynRef::from_raw(handle.upcast::<ReadIntVTable>())), 2);

            handle.upcast::<ReadIntVTable>().finalize();
            assert_call_counts!(diagnostics, 1, 0);

            release_counter(&diagnostics, NonNull::new(handle.data).unwrap());
            assert_call_counts!(diagnostics, 1, 1);
        }
    }

    #[test]
    fn failed_allocation_leaves_counts_untouched() {
        let diagnostics = Diagnostics::new();
        let alloc = CountingAllocator::failing();

        let err = unsafe { produce_counter_in(&diagnostics, &alloc) }.unwrap_err();
        assert!(matches!(err, Error::AllocFailed { .. }));
        assert_call_counts!(diagnostics, 0, 0);
        assert_eq!(alloc.deallocations(), 0);
    }

    #[test]
    fn counter_in_caller_storage() {
        let diagnostics = Diagnostics::new();
        let alloc = CountingAllocator::default();
        unsafe {
            let handle = produce_counter_in(&diagnostics, &alloc).unwrap();
            assert_eq!(alloc.allocations(), 1);
            increment(DynRefMut::from_raw(handle));

            let value = DynBox::from_raw_in(handle, &alloc);
            assert_eq!(value.get(), 1);
            drop(value);
        }
        assert_call_counts!(diagnostics, 1, 0);
        assert_eq!(alloc.deallocations(), 1);
    }
}
