use std::cell::Cell;

use serde::Serialize;

/// Counts lifecycle calls on values produced against it.
///
/// A `Diagnostics` is created by the test or host, passed to the producer when
/// a value is allocated, and read back at the end. Each value remembers the
/// context it was produced with, so two tests never share counters.
///
/// A finalize count above the number of produced values points at a double
/// drop, a release count above it at a double free. Neither is prevented, only
/// made visible.
///
/// Single threaded only, like the handles it observes. Opaque to C hosts,
/// which only ever hold a pointer to it.
#[derive(Debug, Default)]
pub struct Diagnostics {
    drop_calls: Cell<u32>,
    dealloc_calls: Cell<u32>,
}

/// A copy of the counters at one point in time.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CallCounts {
    /// How often a value's `drop` slot ran.
    pub drop_calls: u32,
    /// How often a value's storage was released.
    pub dealloc_calls: u32,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_drop(&self) {
        self.drop_calls.set(self.drop_calls.get() + 1);
    }

    pub fn record_dealloc(&self) {
        self.dealloc_calls.set(self.dealloc_calls.get() + 1);
    }

    pub fn counts(&self) -> CallCounts {
        CallCounts {
            drop_calls: self.drop_calls.get(),
            dealloc_calls: self.dealloc_calls.get(),
        }
    }

    pub fn reset(&self) {
        self.drop_calls.set(0);
        self.dealloc_calls.set(0);
    }
}
