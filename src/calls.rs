//! The conformance fixture's `extern "C"` surface.
//!
//! A host links against these to obtain counters, dispatch on them and give
//! them back, reading the lifecycle counters of a [`Diagnostics`] at the end.

use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;

use crate::counter::{self, ReadIntVTable, ReadWriteIntVTable};
use crate::diagnostics::{CallCounts, Diagnostics};
use crate::error::{handle_c_error_or, to_c_result, Error};
use crate::handle::{DynPtr, DynRef, DynRefMut};
use crate::memory::UnmanagedVector;

const DIAGNOSTICS_ARG: &str = "diagnostics";

fn to_diagnostics<'a>(ptr: *const Diagnostics) -> Option<&'a Diagnostics> {
    unsafe { ptr.as_ref() }
}

/// Creates an empty diagnostics context. Free it with [`release_diagnostics`].
#[no_mangle]
pub extern "C" fn new_diagnostics() -> *mut Diagnostics {
    Box::into_raw(Box::new(Diagnostics::new()))
}

/// Frees a context from [`new_diagnostics`].
///
/// Every counter produced against it must be gone by then.
#[no_mangle]
pub extern "C" fn release_diagnostics(diagnostics: *mut Diagnostics) {
    if !diagnostics.is_null() {
        // SAFETY: the pointer comes from `new_diagnostics` and is released once
        let _ = unsafe { Box::from_raw(diagnostics) };
    }
}

#[no_mangle]
pub extern "C" fn reset_diagnostics(
    diagnostics: *const Diagnostics,
    error_msg: Option<&mut UnmanagedVector>,
) -> i32 {
    let r = match to_diagnostics(diagnostics) {
        Some(d) => {
            d.reset();
            Ok(())
        }
        None => Err(Error::unset_arg(DIAGNOSTICS_ARG)),
    };
    to_c_result(r, error_msg, None)
}

/// Produces a counter set to 0 and returns it at the `ReadWriteInt` level.
///
/// On failure both pointers of the returned handle are null and `error_msg`
/// holds the reason. The caller owns the value: finalize it through the `drop`
/// slot of its vtable, then pass `data` to [`dealloc_counter_value`].
#[no_mangle]
pub extern "C" fn new_counter_value(
    diagnostics: *const Diagnostics,
    error_msg: Option<&mut UnmanagedVector>,
) -> DynPtr<ReadWriteIntVTable> {
    let r = match to_diagnostics(diagnostics) {
        Some(d) => catch_unwind(AssertUnwindSafe(move || do_new_counter_value(d)))
            .unwrap_or_else(|err| {
                log::error!("Panic in do_new_counter_value: {err:?}");
                Err(Error::panic())
            }),
        None => Err(Error::unset_arg(DIAGNOSTICS_ARG)),
    };
    handle_c_error_or(r, error_msg, DynPtr::null())
}

fn do_new_counter_value(diagnostics: &Diagnostics) -> Result<DynPtr<ReadWriteIntVTable>, Error> {
    // SAFETY: hosts keep the context alive until every counter is released
    let handle = unsafe { counter::produce_counter(diagnostics) }?;
    log::trace!("produced counter at {:p}", handle.data);
    Ok(handle)
}

/// Releases the storage of a counter from [`new_counter_value`].
///
/// Only storage is released here, the value must already be finalized. A null
/// `data` is ignored. A null `diagnostics` releases without counting.
#[no_mangle]
pub extern "C" fn dealloc_counter_value(diagnostics: *const Diagnostics, data: *mut c_void) {
    let Some(data) = NonNull::new(data) else {
        return;
    };
    // SAFETY: `data` was produced by `new_counter_value` and is released once
    unsafe { counter::release_counter(diagnostics, data) };
}

/// Adds one to the counter, reading through the embedded `ReadInt` table and
/// writing through the `ReadWriteInt` table.
#[no_mangle]
pub extern "C" fn increment_counter(value: DynRefMut<'_, ReadWriteIntVTable>) {
    if value.as_raw().is_null() {
        log::error!("increment_counter called with a null handle");
        return;
    }
    let r = catch_unwind(AssertUnwindSafe(move || counter::increment(value)));
    if let Err(err) = r {
        log::error!("Panic in increment_counter: {err:?}");
    }
}

/// Reads the counter using only the `ReadInt` level.
///
/// Returns 0 for a null handle or a panic, after logging it.
#[no_mangle]
pub extern "C" fn get_counter(value: DynRef<'_, ReadIntVTable>) -> i32 {
    if value.as_raw().is_null() {
        log::error!("get_counter called with a null handle");
        return 0;
    }
    catch_unwind(AssertUnwindSafe(move || counter::get(value))).unwrap_or_else(|err| {
        log::error!("Panic in get_counter: {err:?}");
        0
    })
}

/// The number of finalized and of released counters. Zeroes for a null context.
#[no_mangle]
pub extern "C" fn counter_call_counts(diagnostics: *const Diagnostics) -> CallCounts {
    to_diagnostics(diagnostics)
        .map(Diagnostics::counts)
        .unwrap_or_default()
}

/// Same as [`counter_call_counts`], JSON encoded.
///
/// The returned vector must be destroyed with
/// [`destroy_unmanaged_vector`][crate::destroy_unmanaged_vector].
#[no_mangle]
pub extern "C" fn counter_call_counts_json(
    diagnostics: *const Diagnostics,
    error_msg: Option<&mut UnmanagedVector>,
) -> UnmanagedVector {
    let r = match to_diagnostics(diagnostics) {
        Some(d) => catch_unwind(AssertUnwindSafe(move || do_counter_call_counts_json(d)))
            .unwrap_or_else(|err| {
                log::error!("Panic in do_counter_call_counts_json: {err:?}");
                Err(Error::panic())
            }),
        None => Err(Error::unset_arg(DIAGNOSTICS_ARG)),
    };
    let json = handle_c_error_or(r, error_msg, Vec::new());
    UnmanagedVector::new(Some(json))
}

fn do_counter_call_counts_json(diagnostics: &Diagnostics) -> Result<Vec<u8>, Error> {
    Ok(serde_json::to_vec(&diagnostics.counts())?)
}
