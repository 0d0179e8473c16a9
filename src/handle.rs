use std::ffi::c_void;
use std::marker::PhantomData;
use std::mem::{offset_of, size_of};
use std::ptr;

use crate::alloc::Deallocator;
use crate::layout::MemoryLayout;
use crate::vtables::{subtable_ptr, DynTrait, SubTable, VTable, VTableHeader};

/// FFI safe wide pointer: a value plus the vtable to reach it through.
///
/// This is the entire value passed across the boundary for a dynamic trait
/// object: two pointers, `data` then `vtable`. The `vtable` field is typed at
/// the capability level `V` the handle was produced or upcast at.
///
/// A `DynPtr` is a view. It owns nothing and carries no lifetime. Whoever
/// allocated `data` must eventually finalize it (through the `drop` slot of
/// any level) and then release the storage with the matching allocator,
/// each exactly once. See [`DynBox`][crate::DynBox] for an owning variant that
/// does both.
///
/// Nothing about a `DynPtr` is checked at runtime. Pairing `data` with a
/// vtable built for a different concrete type, using it after finalization or
/// after its storage was released are all undefined behavior. In practice that
/// means a crash or silent memory corruption in the host.
#[repr(C)]
pub struct DynPtr<V: VTable> {
    pub data: *mut c_void,
    pub vtable: *const V,
}

const _: () = assert!(size_of::<DynPtr<VTableHeader>>() == 2 * size_of::<usize>());
const _: () = assert!(offset_of!(DynPtr<VTableHeader>, data) == 0);
const _: () = assert!(offset_of!(DynPtr<VTableHeader>, vtable) == size_of::<usize>());

impl<V: VTable> Copy for DynPtr<V> {}
impl<V: VTable> Clone for DynPtr<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V: VTable> std::fmt::Debug for DynPtr<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynPtr")
            .field("data", &self.data)
            .field("vtable", &self.vtable)
            .finish()
    }
}

impl<V: VTable> DynPtr<V> {
    /// Pairs `data` with the static vtable of `T` at level `V`.
    ///
    /// Safe by itself, since nothing is dereferenced. The result is only
    /// usable while `data` points to a live `T`.
    pub fn new<T: DynTrait<V>>(data: *mut T) -> Self {
        Self {
            data: data.cast(),
            vtable: T::STATIC_VTABLE,
        }
    }

    /// A handle with both pointers null, returned by exports that failed.
    pub fn null() -> Self {
        Self {
            data: ptr::null_mut(),
            vtable: ptr::null(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.data.is_null() || self.vtable.is_null()
    }

    /// Views this handle at the parent level `P`.
    ///
    /// The data pointer is kept, the vtable pointer is moved to the embedded
    /// `P` table. Pure pointer arithmetic; this never fails and never reads
    /// through either pointer.
    #[inline(always)]
    pub fn upcast<P: VTable>(self) -> DynPtr<P>
    where
        V: SubTable<P>,
    {
        DynPtr {
            data: self.data,
            vtable: subtable_ptr::<V, P>(self.vtable),
        }
    }

    /// Forgets every capability but the header.
    ///
    /// The result can still be finalized and released, which is all a party
    /// that does not know the value's capability set may do with it.
    #[inline(always)]
    pub fn erase(self) -> DynPtr<VTableHeader> {
        DynPtr {
            data: self.data,
            vtable: self.vtable.cast(),
        }
    }

    /// The layout recorded in the vtable header.
    ///
    /// # Safety
    ///
    /// `vtable` must point to a live vtable of level `V` or any level derived
    /// from `V`.
    pub unsafe fn layout(&self) -> MemoryLayout {
        (*self.vtable).header().layout
    }

    /// Runs the `drop` slot found in the vtable header, leaving the storage allocated.
    ///
    /// Works at every capability level, since every level starts with the header.
    ///
    /// # Safety
    ///
    /// The handle must be valid and not yet finalized. After this call the
    /// value must not be dispatched on or finalized again; only its storage may
    /// still be released.
    pub unsafe fn finalize(self) {
        log::trace!("finalizing dyn value at {:p}", self.data);
        (*self.vtable).header().finalize(self.data)
    }

    /// Releases the storage behind `data` using `alloc`, without finalizing it.
    ///
    /// Zero sized layouts own no storage and are skipped.
    ///
    /// # Safety
    ///
    /// `data` must have been allocated by `alloc` with the layout recorded in
    /// the vtable, and must not be released twice. The value should have been
    /// finalized first, otherwise its resources leak.
    pub unsafe fn release_in<A: Deallocator>(self, alloc: &A) {
        let layout = self.layout();
        if layout.is_zero_sized() {
            return;
        }
        log::trace!(
            "releasing {} bytes of dyn value at {:p}",
            layout.size,
            self.data
        );
        alloc.deallocate(ptr::NonNull::new_unchecked(self.data.cast::<u8>()), layout)
    }
}

/// Alternate form of `&Dyn` used to keep the vtable reference available.
///
/// Same representation as [`DynPtr`], so it can be passed to `extern "C"`
/// functions that take a `DynPtr` by value.
#[repr(transparent)]
pub struct DynRef<'a, V: VTable> {
    ptr: DynPtr<V>,
    _lt: PhantomData<&'a ()>,
}

/// Alternate form of `&mut Dyn` used to keep the vtable reference available.
#[repr(transparent)]
pub struct DynRefMut<'a, V: VTable> {
    ptr: DynPtr<V>,
    _lt: PhantomData<&'a mut ()>,
}

impl<V: VTable> Copy for DynRef<'_, V> {}
impl<V: VTable> Clone for DynRef<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, V: VTable> DynRef<'a, V> {
    /// Borrows a live value through its static vtable.
    pub fn new<T: DynTrait<V>>(value: &'a T) -> Self {
        Self {
            ptr: DynPtr::new(value as *const T as *mut T),
            _lt: PhantomData,
        }
    }

    /// # Safety
    ///
    /// `ptr` must be a valid handle for the whole of `'a`, and the value must
    /// not be mutated during that time.
    pub unsafe fn from_raw(ptr: DynPtr<V>) -> Self {
        Self {
            ptr,
            _lt: PhantomData,
        }
    }

    pub fn as_raw(&self) -> DynPtr<V> {
        self.ptr
    }

    pub fn data(&self) -> *const c_void {
        self.ptr.data
    }

    /// The vtable this handle was created at.
    pub fn vtable(&self) -> &'a V {
        unsafe { &*self.ptr.vtable }
    }

    /// Resolves the table of level `P`, which is `V` itself or one of its ancestors.
    ///
    /// This is the dispatch step: read a slot from the returned table and
    /// call it with [`DynRef::data`].
    pub fn table<P: VTable>(&self) -> &'a P
    where
        V: SubTable<P>,
    {
        unsafe { &*subtable_ptr::<V, P>(self.ptr.vtable) }
    }

    /// Views this reference at the parent level `P`. See [`DynPtr::upcast`].
    #[inline(always)]
    pub fn upcast<P: VTable>(self) -> DynRef<'a, P>
    where
        V: SubTable<P>,
    {
        DynRef {
            ptr: self.ptr.upcast(),
            _lt: PhantomData,
        }
    }
}

impl<'a, V: VTable> DynRefMut<'a, V> {
    /// Mutably borrows a live value through its static vtable.
    pub fn new<T: DynTrait<V>>(value: &'a mut T) -> Self {
        Self {
            ptr: DynPtr::new(value as *mut T),
            _lt: PhantomData,
        }
    }

    /// # Safety
    ///
    /// `ptr` must be a valid handle for the whole of `'a`, and nothing else may
    /// access the value during that time.
    pub unsafe fn from_raw(ptr: DynPtr<V>) -> Self {
        Self {
            ptr,
            _lt: PhantomData,
        }
    }

    pub fn as_raw(&self) -> DynPtr<V> {
        self.ptr
    }

    pub fn data(&self) -> *const c_void {
        self.ptr.data
    }

    pub fn data_mut(&mut self) -> *mut c_void {
        self.ptr.data
    }

    pub fn vtable(&self) -> &'a V {
        unsafe { &*self.ptr.vtable }
    }

    /// Resolves the table of level `P`. See [`DynRef::table`].
    pub fn table<P: VTable>(&self) -> &'a P
    where
        V: SubTable<P>,
    {
        unsafe { &*subtable_ptr::<V, P>(self.ptr.vtable) }
    }

    /// Reborrows as a shared reference.
    pub fn as_dyn_ref(&self) -> DynRef<'_, V> {
        DynRef {
            ptr: self.ptr,
            _lt: PhantomData,
        }
    }

    /// Reborrows for a shorter lifetime, so the handle can be passed on by value.
    pub fn reborrow(&mut self) -> DynRefMut<'_, V> {
        DynRefMut {
            ptr: self.ptr,
            _lt: PhantomData,
        }
    }

    /// Views this reference at the parent level `P`. See [`DynPtr::upcast`].
    #[inline(always)]
    pub fn upcast<P: VTable>(self) -> DynRefMut<'a, P>
    where
        V: SubTable<P>,
    {
        DynRefMut {
            ptr: self.ptr.upcast(),
            _lt: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vtables::DropFn;

    #[repr(C)]
    struct BaseVTable {
        drop: Option<DropFn>,
        layout: MemoryLayout,
        get: Option<unsafe extern "C" fn(*const c_void) -> u64>,
    }

    #[repr(C)]
    struct DerivedVTable {
        drop: Option<DropFn>,
        layout: MemoryLayout,
        base: BaseVTable,
        bump: Option<unsafe extern "C" fn(*mut c_void)>,
    }

    unsafe impl VTable for BaseVTable {}
    unsafe impl VTable for DerivedVTable {}
    unsafe impl SubTable<BaseVTable> for DerivedVTable {
        const OFFSET: usize = offset_of!(DerivedVTable, base);
    }

    unsafe extern "C" fn get(data: *const c_void) -> u64 {
        *data.cast::<u64>()
    }

    unsafe extern "C" fn bump(data: *mut c_void) {
        *data.cast::<u64>() += 1;
    }

    const BASE: BaseVTable = BaseVTable {
        drop: Some(crate::vtables::drop_in_place::<u64>),
        layout: MemoryLayout::new::<u64>(),
        get: Some(get),
    };

    unsafe impl DynTrait<BaseVTable> for u64 {
        const VTABLE: BaseVTable = BASE;
        const STATIC_VTABLE: &'static BaseVTable = &BASE;
    }

    unsafe impl DynTrait<DerivedVTable> for u64 {
        const VTABLE: DerivedVTable = DerivedVTable {
            drop: Some(crate::vtables::drop_in_place::<u64>),
            layout: MemoryLayout::new::<u64>(),
            base: BASE,
            bump: Some(bump),
        };
        const STATIC_VTABLE: &'static DerivedVTable = &Self::VTABLE;
    }

    #[test]
    fn upcast_keeps_data_and_offsets_vtable() {
        let mut value = 5_u64;
        let derived = DynPtr::<DerivedVTable>::new(&mut value as *mut u64);
        let base: DynPtr<BaseVTable> = derived.upcast();

        assert_eq!(base.data, derived.data);
        assert_eq!(
            base.vtable as usize - derived.vtable as usize,
            offset_of!(DerivedVTable, base)
        );
    }

    #[test]
    fn upcast_never_dereferences() {
        let dangling = DynPtr::<DerivedVTable> {
            data: ptr::null_mut(),
            vtable: 0x1000 as *const DerivedVTable,
        };
        let base = dangling.upcast::<BaseVTable>();
        assert_eq!(
            base.vtable as usize,
            0x1000 + offset_of!(DerivedVTable, base)
        );
        assert!(base.data.is_null());
    }

    #[test]
    fn table_dispatches_at_both_levels() {
        let mut value = 41_u64;
        let mut handle = DynRefMut::<DerivedVTable>::new(&mut value);

        let bump = handle.vtable().bump.unwrap();
        unsafe { bump(handle.data_mut()) };

        let through_parent = handle.table::<BaseVTable>().get.unwrap();
        assert_eq!(unsafe { through_parent(handle.data()) }, 42);

        let base = handle.as_dyn_ref().upcast::<BaseVTable>();
        let direct = base.vtable().get.unwrap();
        assert_eq!(unsafe { direct(base.data()) }, 42);
    }

    #[test]
    fn header_is_shared_by_all_levels() {
        let value = 0_u64;
        let derived = DynRef::<DerivedVTable>::new(&value);
        let base = derived.upcast::<BaseVTable>();

        assert_eq!(derived.vtable().header().layout, MemoryLayout::new::<u64>());
        assert_eq!(base.vtable().header().layout, MemoryLayout::new::<u64>());
        assert_eq!(unsafe { derived.as_raw().layout() }, unsafe {
            base.as_raw().layout()
        });
    }

    #[test]
    fn erase_keeps_header() {
        let mut value = 9_u64;
        let erased = DynPtr::<DerivedVTable>::new(&mut value as *mut u64).erase();
        assert_eq!(erased.data, &mut value as *mut u64 as *mut c_void);
        assert_eq!(unsafe { erased.layout() }, MemoryLayout::new::<u64>());
    }

    #[test]
    fn null_works() {
        let handle = DynPtr::<BaseVTable>::null();
        assert!(handle.is_null());
        assert!(handle.data.is_null());
        assert!(handle.vtable.is_null());

        let value = 1_u64;
        assert!(!DynRef::<BaseVTable>::new(&value).as_raw().is_null());
    }

    #[test]
    fn refs_have_pointer_pair_layout() {
        assert_eq!(size_of::<DynRef<BaseVTable>>(), 2 * size_of::<usize>());
        assert_eq!(size_of::<DynRefMut<BaseVTable>>(), 2 * size_of::<usize>());
    }
}
