//! Task supervision.
//!
//! Every long-lived task the crate spawns goes through [`supervise`], so a
//! panic inside one connection, channel, or session is caught at the task
//! boundary and logged instead of unwinding into the runtime.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::error;

/// Spawns `fut` and converts a panic into a logged error.
///
/// The returned handle resolves to `Some(output)` when the task finished
/// normally and `None` when it panicked.
pub fn supervise<F>(name: &'static str, fut: F) -> JoinHandle<Option<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(async move {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(output) => Some(output),
            Err(payload) => {
                error!(task = name, panic = %panic_message(payload.as_ref()), "Task panicked");
                None
            }
        }
    })
}

/// Runs blocking `f` on the blocking pool with the same panic containment.
pub fn supervise_blocking<F, T>(name: &'static str, f: F) -> JoinHandle<Option<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(output) => Some(output),
        Err(payload) => {
            error!(task = name, panic = %panic_message(payload.as_ref()), "Blocking task panicked");
            None
        }
    })
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
