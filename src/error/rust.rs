use std::alloc::LayoutError;

use thiserror::Error;

use crate::memory::UnmanagedVector;

#[derive(Error, Debug)]
pub enum RustError {
    #[error("Memory allocation failed: {size} bytes aligned to {align}")]
    AllocFailed { size: usize, align: usize },
    #[error("Invalid memory layout: {}", msg)]
    InvalidLayout { msg: String },
    #[error("Caught panic")]
    Panic {},
    #[error("Cannot serialize diagnostics: {}", msg)]
    Serialization { msg: String },
    #[error("Null/Nil argument: {}", name)]
    UnsetArg { name: String },
}

impl RustError {
    pub fn alloc_failed(size: usize, align: usize) -> Self {
        RustError::AllocFailed { size, align }
    }

    pub fn invalid_layout<S: ToString>(msg: S) -> Self {
        RustError::InvalidLayout {
            msg: msg.to_string(),
        }
    }

    pub fn panic() -> Self {
        RustError::Panic {}
    }

    pub fn serialization<S: ToString>(msg: S) -> Self {
        RustError::Serialization {
            msg: msg.to_string(),
        }
    }

    pub fn unset_arg<T: Into<String>>(name: T) -> Self {
        RustError::UnsetArg { name: name.into() }
    }
}

impl From<LayoutError> for RustError {
    fn from(source: LayoutError) -> Self {
        RustError::invalid_layout(source)
    }
}

impl From<serde_json::Error> for RustError {
    fn from(source: serde_json::Error) -> Self {
        RustError::serialization(source)
    }
}

/// An error code used to communicate the errors of FFI calls.
/// Similar to shell codes and errno, 0 means no error.
/// cbindgen:prefix-with-name
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    Other = 1,
    OutOfMemory = 2,
}

impl ErrorCode {
    pub fn to_int(self) -> i32 {
        self as i32
    }
}

pub fn set_error(err: RustError, error_msg: Option<&mut UnmanagedVector>) -> ErrorCode {
    if let Some(error_msg) = error_msg {
        if error_msg.is_some() {
            panic!(
                "There is an old error message in the given pointer that has not been \
                cleaned up. Error message pointers should not be reused for multiple calls."
            )
        }

        let msg: Vec<u8> = err.to_string().into();
        *error_msg = UnmanagedVector::new(Some(msg));
    } else {
        // The caller provided a nil pointer for the error message.
        // That's not nice but we can live with it.
    }

    match err {
        RustError::AllocFailed { .. } => ErrorCode::OutOfMemory,
        _ => ErrorCode::Other,
    }
}

pub fn set_out<T>(value: T, out_ptr: Option<&mut T>) {
    if let Some(out_ref) = out_ptr {
        *out_ref = value;
    }
}

/// If `result` is Ok, this writes the Ok value to `out` and returns 0.
/// Otherwise it writes the error message to `error_msg` and returns the error code.
pub fn to_c_result<T>(
    result: Result<T, RustError>,
    error_msg_ptr: Option<&mut UnmanagedVector>,
    out_ptr: Option<&mut T>,
) -> i32 {
    let code = match result {
        Ok(value) => {
            set_out(value, out_ptr);
            ErrorCode::Success
        }
        Err(error) => set_error(error, error_msg_ptr),
    };
    code.to_int()
}

/// If `result` is Ok, this returns the Ok value.
/// Otherwise it writes the error message to `error_msg` and returns `fallback`.
///
/// Used by exports that hand their result back as the return value and signal
/// failure through a sentinel, e.g. a handle with null pointers.
pub fn handle_c_error_or<T>(
    result: Result<T, RustError>,
    error_msg: Option<&mut UnmanagedVector>,
    fallback: T,
) -> T {
    match result {
        Ok(value) => value,
        Err(error) => {
            set_error(error, error_msg);
            fallback
        }
    }
}
