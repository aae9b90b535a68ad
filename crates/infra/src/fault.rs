//! Fault boundaries.
//!
//! Panics are caught where a handler, task or loop iteration is invoked and turned into
//! error values, so they never unwind into an unrelated call stack.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;

/// Best-effort description of a panic payload.
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Await `fut`, converting a panic into `Err(message)`.
pub async fn isolate<F>(fut: F) -> Result<F::Output, String>
where
    F: Future,
{
    AssertUnwindSafe(fut).catch_unwind().await.map_err(panic_message)
}
