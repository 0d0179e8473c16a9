use std::mem::ManuallyDrop;
use std::ptr;

/// Bytes this library hands to a host: error messages and JSON diagnostics.
///
/// The buffer is allocated by Rust and must come back to Rust to be freed,
/// through [`destroy_unmanaged_vector`]. A host that wants to keep the bytes
/// copies them first. `is_none` distinguishes "no message" from an empty one;
/// when it is set the other fields carry no meaning.
///
/// Hosts pass a zeroed-out vector with `is_none = true` as the `error_msg`
/// argument of the exports. An export that fails replaces it with a message.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UnmanagedVector {
    is_none: bool,
    ptr: *mut u8,
    len: usize,
    cap: usize,
}

impl UnmanagedVector {
    const NONE: Self = Self {
        is_none: true,
        ptr: ptr::null_mut(),
        len: 0,
        cap: 0,
    };

    /// Takes ownership of `source` without copying it.
    pub fn new(source: Option<Vec<u8>>) -> Self {
        source.map_or(Self::NONE, Self::from_vec)
    }

    fn from_vec(bytes: Vec<u8>) -> Self {
        if bytes.capacity() == 0 {
            // no allocation behind it, so hosts see NULL instead of a dangling pointer
            return Self {
                is_none: false,
                ..Self::NONE
            };
        }
        let mut bytes = ManuallyDrop::new(bytes);
        Self {
            is_none: false,
            ptr: bytes.as_mut_ptr(),
            len: bytes.len(),
            cap: bytes.capacity(),
        }
    }

    pub fn is_none(&self) -> bool {
        self.is_none
    }

    pub fn is_some(&self) -> bool {
        !self.is_none
    }

    /// Gives the bytes back to Rust's memory management.
    ///
    /// Copies share the same buffer, so only one of them may be consumed.
    pub fn consume(self) -> Option<Vec<u8>> {
        match (self.is_none, self.cap) {
            (true, _) => None,
            (false, 0) => Some(Vec::new()),
            // SAFETY: ptr, len and cap were taken from a live Vec in `from_vec`
            (false, cap) => Some(unsafe { Vec::from_raw_parts(self.ptr, self.len, cap) }),
        }
    }
}

impl Default for UnmanagedVector {
    fn default() -> Self {
        Self::NONE
    }
}

/// Frees a vector returned by any export of this library.
#[no_mangle]
pub extern "C" fn destroy_unmanaged_vector(v: UnmanagedVector) {
    let _ = v.consume();
}
