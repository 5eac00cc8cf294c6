// src/engine/common.rs
//
// Common utilities shared across engine modules.
// Provides the codec panic policy and the engine Result alias.

use crate::error::CompressError;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

pub type EngineResult<T> = std::result::Result<T, CompressError>;

/// Run a codec call, converting a panic into `CompressError::InternalPanic`.
///
/// Native codecs (mozjpeg, libwebp) report some failures by unwinding. One bad
/// upload must not take down the batch or the host process, so every codec
/// entry point goes through here with a short stage label.
pub fn run_with_panic_policy<T, F>(stage: &'static str, f: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(stage, %message, "codec panicked");
            Err(CompressError::internal_panic(format!("{stage}: {message}")))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
