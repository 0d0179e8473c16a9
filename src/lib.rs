#![allow(clippy::not_unsafe_ptr_arg_deref, clippy::missing_safety_doc)]

//! FFI safe trait objects with single inheritance.
//!
//! A trait object crosses the boundary as a [`DynPtr`]: a data pointer and a
//! pointer to a `#[repr(C)]` vtable. A vtable for a trait that extends another
//! embeds the parent's complete vtable after its `drop` and `layout` header,
//! so upcasting moves the vtable pointer by a compile-time offset and nothing
//! else. See [`vtables`] for the layout rules.

pub mod alloc;
mod boxed;
mod calls;
pub mod counter;
mod diagnostics;
mod error;
mod handle;
mod layout;
mod memory;
mod test_utils;
pub mod vtables;

pub use boxed::DynBox;
pub use diagnostics::{CallCounts, Diagnostics};
pub use error::{Error, ErrorCode};
pub use handle::{DynPtr, DynRef, DynRefMut};
pub use layout::MemoryLayout;
pub use vtables::{DynTrait, SubTable, VTable, VTableHeader};

// The fixture is driven through `extern "C"` interfaces, not those public
// exports. They are here such that we can access them in the docs (`cargo doc`)
// and from the integration tests.
pub use calls::{
    counter_call_counts, counter_call_counts_json, dealloc_counter_value, get_counter,
    increment_counter, new_counter_value, new_diagnostics, release_diagnostics,
    reset_diagnostics,
};
pub use memory::{destroy_unmanaged_vector, UnmanagedVector};
