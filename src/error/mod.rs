mod rust;

pub use rust::{handle_c_error_or, to_c_result, ErrorCode, RustError as Error};
