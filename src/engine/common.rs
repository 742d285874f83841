// src/engine/common.rs
//
// Common utilities shared across engine modules.

use crate::error::{BatchError, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Run a codec stage, converting any panic into a typed error.
///
/// Native codec bindings (mozjpeg, libwebp) can abort on inputs the header
/// checks did not catch. A panic here must stay local to the one image being
/// processed, so the worker catches it and settles the item with an error.
pub(crate) fn run_with_panic_policy<T>(
    stage: &'static str,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload);
            tracing::warn!(stage, %message, "codec stage panicked");
            Err(BatchError::worker_panicked(stage, message))
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
