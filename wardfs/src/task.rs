use std::future::Future;

use tokio::task::JoinHandle;
use tracing::debug;

/// Spawns a task with a name recorded in the trace stream.
pub fn spawn_named<F>(name: &str, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    debug!(task = name, "spawning task");
    tokio::spawn(future)
}

/// Spawns a blocking task with a name recorded in the trace stream.
/// Session workers live here: they block on real filesystem I/O.
pub fn spawn_blocking_named<F, R>(name: &str, f: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    debug!(task = name, "spawning blocking task");
    tokio::task::spawn_blocking(f)
}
