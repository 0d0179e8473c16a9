//! The vtable contract shared by every capability level.
//!
//! A vtable is a `#[repr(C)]` struct of free functions plus layout metadata,
//! built once per concrete type and never changed afterwards. The fields of
//! every vtable appear in this fixed order:
//!
//! 1. `drop`: finalizes the value in place, without releasing its storage.
//! 2. `layout`: the [`MemoryLayout`] of the concrete type.
//! 3. If the level extends a parent level: the complete parent vtable,
//!    embedded by value. It recursively follows the same shape.
//! 4. The level's own operations.
//!
//! Reordering any of these fields silently breaks every consumer on the other
//! side of the boundary.
//!
//! ## Nullability
//!
//! Operation slots are declared as `Option<extern "C" fn ...>`, which is the
//! correct way to represent a nullable C function pointer. A foreign producer
//! can always leave a slot as `NULL`. Missing vtable fields indicate a
//! lifecycle bug in the producer and are treated with a panic.
//!
//! ## Upcasting
//!
//! Since the parent table is embedded rather than pointed to, a pointer to the
//! parent level is a fixed offset away from the pointer to the child level.
//! [`SubTable`] records that offset, so going from a child handle to a parent
//! handle is pure pointer arithmetic: no runtime tag, no lookup, no copy.
//! And because the header is the first thing in every level, `drop` and
//! `layout` can be read through a pointer to any level, see [`VTableHeader`].

use std::ffi::c_void;
use std::mem::{offset_of, size_of};

use crate::layout::MemoryLayout;

/// The signature of the `drop` slot.
///
/// Runs type specific cleanup on the value behind `data`. The storage itself
/// stays allocated and is released separately by its owner.
pub type DropFn = unsafe extern "C" fn(data: *mut c_void);

/// The prefix that every vtable starts with.
///
/// Any vtable pointer, at any capability level, can be reinterpreted as a
/// pointer to this struct.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct VTableHeader {
    pub drop: Option<DropFn>,
    pub layout: MemoryLayout,
}

const _: () = assert!(offset_of!(VTableHeader, drop) == 0);
const _: () = assert!(offset_of!(VTableHeader, layout) == size_of::<usize>());
const _: () = assert!(size_of::<Option<DropFn>>() == size_of::<usize>());

// The header alone is the smallest valid vtable: a value that can only be destroyed.
unsafe impl VTable for VTableHeader {}

impl VTableHeader {
    /// Calls the `drop` slot.
    ///
    /// # Safety
    ///
    /// `data` must point to a live value of the concrete type this header was
    /// built for. After this call the value is finalized: calling `drop` again,
    /// or dispatching any other slot on it, is undefined behavior.
    pub unsafe fn finalize(&self, data: *mut c_void) {
        let drop = self.drop.expect("vtable function 'drop' not set");
        drop(data)
    }
}

/// Marker for structs that are vtables.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` and start with a `drop: Option<DropFn>`
/// field followed by a `layout: MemoryLayout` field, so that a pointer to the
/// implementor is also a valid pointer to a [`VTableHeader`].
pub unsafe trait VTable: Sized + 'static {
    /// The `drop` and `layout` prefix of this table.
    fn header(&self) -> &VTableHeader {
        // SAFETY: guaranteed by the trait contract
        unsafe { &*(self as *const Self as *const VTableHeader) }
    }
}

/// VTables that embed the vtable `P`, directly or through a chain of parents.
///
/// Every vtable is a subtable of itself with offset 0.
///
/// # Safety
///
/// `OFFSET` must be the byte offset of a complete, valid `P` inside `Self`,
/// built for the same concrete type as `Self`.
pub unsafe trait SubTable<P: VTable>: VTable {
    /// Distance in bytes from the start of `Self` to the embedded `P`.
    const OFFSET: usize;

    /// Gets a reference to the embedded vtable of type `P`.
    fn subtable(&self) -> &P {
        // SAFETY: guaranteed by the trait contract
        unsafe { &*subtable_ptr::<Self, P>(self) }
    }
}

unsafe impl<V: VTable> SubTable<V> for V {
    const OFFSET: usize = 0;
}

/// Moves a vtable pointer from level `V` to its embedded level `P`.
///
/// The pointer is never dereferenced, so this is fine to call on any pointer;
/// the result is only meaningful if `vtable` really points at a `V`.
#[inline(always)]
pub fn subtable_ptr<V: SubTable<P>, P: VTable>(vtable: *const V) -> *const P {
    vtable.cast::<u8>().wrapping_add(V::OFFSET).cast::<P>()
}

/// Types with a statically known vtable for the capability level `V`.
///
/// The table is built once per concrete type, at compile time, by whoever
/// defines the capability level.
///
/// # Safety
///
/// `VTABLE` must be built for `Self`: every slot must expect a pointer to a
/// `Self`, and the layout must be `MemoryLayout::new::<Self>()`.
pub unsafe trait DynTrait<V: VTable> {
    /// The vtable by value.
    const VTABLE: V;
    /// The same vtable in static memory. Handles point here.
    const STATIC_VTABLE: &'static V;
}

/// A `drop` slot for any Rust type: runs its destructor in place.
///
/// # Safety
///
/// `data` must point to a live, properly aligned `T` that is not used again.
pub unsafe extern "C" fn drop_in_place<T>(data: *mut c_void) {
    std::ptr::drop_in_place(data.cast::<T>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[repr(C)]
    struct LeafVTable {
        drop: Option<DropFn>,
        layout: MemoryLayout,
        op: Option<unsafe extern "C" fn(*const c_void) -> u8>,
    }

    unsafe impl VTable for LeafVTable {}

    thread_local! {
        static DROPPED: Cell<u32> = const { Cell::new(0) };
    }

    struct Tracked(#[allow(dead_code)] u16);

    impl Drop for Tracked {
        fn drop(&mut self) {
            DROPPED.with(|d| d.set(d.get() + 1));
        }
    }

    unsafe extern "C" fn op(_: *const c_void) -> u8 {
        7
    }

    #[test]
    fn header_reads_prefix() {
        let table = LeafVTable {
            drop: Some(drop_in_place::<Tracked>),
            layout: MemoryLayout::new::<Tracked>(),
            op: Some(op),
        };
        let header = table.header();
        assert_eq!(header.layout, MemoryLayout::new::<Tracked>());
        assert_eq!(
            header.drop.map(|f| f as usize),
            Some(drop_in_place::<Tracked> as DropFn as usize)
        );
        assert_eq!(unsafe { (table.op.unwrap())(std::ptr::null()) }, 7);
    }

    #[test]
    fn finalize_runs_destructor_once() {
        let table = LeafVTable {
            drop: Some(drop_in_place::<Tracked>),
            layout: MemoryLayout::new::<Tracked>(),
            op: None,
        };
        let mut value = std::mem::ManuallyDrop::new(Tracked(3));
        let before = DROPPED.with(|d| d.get());
        unsafe {
            table
                .header()
                .finalize(&mut *value as *mut Tracked as *mut c_void)
        };
        assert_eq!(DROPPED.with(|d| d.get()), before + 1);
    }

    #[test]
    #[should_panic(expected = "vtable function 'drop' not set")]
    fn finalize_panics_on_missing_slot() {
        let table = LeafVTable {
            drop: None,
            layout: MemoryLayout::new::<u8>(),
            op: None,
        };
        let mut value = 0u8;
        unsafe {
            table
                .header()
                .finalize(&mut value as *mut u8 as *mut c_void)
        };
    }

    #[test]
    fn subtable_of_self_is_identity() {
        let table = LeafVTable {
            drop: None,
            layout: MemoryLayout::new::<u8>(),
            op: None,
        };
        assert_eq!(<LeafVTable as SubTable<LeafVTable>>::OFFSET, 0);
        assert!(std::ptr::eq(table.subtable(), &table));
        assert_eq!(subtable_ptr::<LeafVTable, LeafVTable>(&table), &table as *const _);
    }
}
