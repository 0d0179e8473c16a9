#![cfg(test)]

use std::cell::Cell;
use std::ptr::NonNull;

use crate::alloc::{Allocator, Deallocator, GlobalAllocator};
use crate::error::Error;
use crate::layout::MemoryLayout;

/// Asserts the drop and dealloc counters of a [`Diagnostics`][crate::Diagnostics].
///
/// Like [`assert_eq!`], this macro has a second form, where a custom
/// panic message can be provided.
#[macro_export]
macro_rules! assert_call_counts {
    ($diagnostics:expr, $drops:expr, $deallocs:expr $(,)?) => {{
        $crate::test_utils::assert_call_counts_impl(&$diagnostics, $drops, $deallocs, None);
    }};
    ($diagnostics:expr, $drops:expr, $deallocs:expr, $($args:tt)+) => {{
        $crate::test_utils::assert_call_counts_impl(
            &$diagnostics,
            $drops,
            $deallocs,
            Some(format!($($args)*)),
        );
    }};
}

#[track_caller]
pub fn assert_call_counts_impl(
    diagnostics: &crate::Diagnostics,
    drops: u32,
    deallocs: u32,
    panic_msg: Option<String>,
) {
    let counts = diagnostics.counts();
    if counts.drop_calls != drops || counts.dealloc_calls != deallocs {
        match panic_msg {
            Some(panic_msg) => panic!(
                "expected {drops} drops and {deallocs} deallocs, got {} and {}: {panic_msg}",
                counts.drop_calls, counts.dealloc_calls
            ),
            None => panic!(
                "expected {drops} drops and {deallocs} deallocs, got {} and {}",
                counts.drop_calls, counts.dealloc_calls
            ),
        }
    }
}

/// Global memory with bookkeeping, for checking that owners release what they allocate.
#[derive(Debug, Default)]
pub struct CountingAllocator {
    allocations: Cell<u32>,
    deallocations: Cell<u32>,
    fail: bool,
}

impl CountingAllocator {
    /// An allocator on which every allocation fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn allocations(&self) -> u32 {
        self.allocations.get()
    }

    pub fn deallocations(&self) -> u32 {
        self.deallocations.get()
    }
}

impl Allocator for CountingAllocator {
    fn allocate(&self, layout: MemoryLayout) -> Result<NonNull<u8>, Error> {
        if self.fail {
            return Err(Error::alloc_failed(layout.size, layout.align));
        }
        self.allocations.set(self.allocations.get() + 1);
        GlobalAllocator.allocate(layout)
    }
}

impl Deallocator for CountingAllocator {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: MemoryLayout) {
        self.deallocations.set(self.deallocations.get() + 1);
        GlobalAllocator.deallocate(ptr, layout)
    }
}

mod tests {
    use crate::Diagnostics;

    #[test]
    fn assert_call_counts_works() {
        let diagnostics = Diagnostics::new();
        diagnostics.record_drop();
        assert_call_counts!(diagnostics, 1, 0);
        assert_call_counts!(diagnostics, 1, 0, "after {} drop", 1);
    }

    #[test]
    #[should_panic(expected = "expected 0 drops and 0 deallocs, got 1 and 0")]
    fn assert_call_counts_fails() {
        let diagnostics = Diagnostics::new();
        diagnostics.record_drop();
        assert_call_counts!(diagnostics, 0, 0);
    }
}
