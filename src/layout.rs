use std::alloc::Layout;
use std::mem::{align_of, offset_of, size_of};

use crate::error::Error;

/// Size and alignment of the concrete value behind a handle.
///
/// Stand-in for [`std::alloc::Layout`] with a stable C representation: two
/// machine words, `size` then `align`. Every vtable carries one of these right
/// after its `drop` slot, so whoever finalizes a value can also tell the
/// allocator how much storage to give back.
///
/// The values must match the real allocation exactly. A mismatch is not
/// detected anywhere and is undefined behavior once the storage is released.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryLayout {
    pub size: usize,
    pub align: usize,
}

const _: () = assert!(size_of::<MemoryLayout>() == 2 * size_of::<usize>());
const _: () = assert!(align_of::<MemoryLayout>() == align_of::<usize>());
const _: () = assert!(offset_of!(MemoryLayout, size) == 0);
const _: () = assert!(offset_of!(MemoryLayout, align) == size_of::<usize>());

impl MemoryLayout {
    /// The layout of `T`, usable in constant vtable initializers.
    pub const fn new<T>() -> Self {
        Self {
            size: size_of::<T>(),
            align: align_of::<T>(),
        }
    }

    /// Zero sized values never own storage, so there is nothing to deallocate.
    pub const fn is_zero_sized(&self) -> bool {
        self.size == 0
    }

    /// Converts into a Rust layout, rejecting pairs the global allocator cannot accept.
    ///
    /// Layouts coming from the other side of the boundary are just two integers,
    /// so this is the conversion to use whenever they were not produced by
    /// [`MemoryLayout::new`].
    pub fn to_layout(self) -> Result<Layout, Error> {
        Ok(Layout::from_size_align(self.size, self.align)?)
    }
}

impl From<Layout> for MemoryLayout {
    fn from(value: Layout) -> Self {
        Self {
            size: value.size(),
            align: value.align(),
        }
    }
}
