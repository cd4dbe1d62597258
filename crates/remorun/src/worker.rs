//! # Workers
//!
//! An isolated execution context: a dedicated OS thread with its own
//! single-threaded tokio runtime, reachable only through a `Port`.
//!
//! Nothing but packets crosses the boundary, so a runner hosted in a worker
//! behaves exactly as one in another process would.

use std::future::Future;
use std::io;
use std::thread;

use crate::transport::Port;

pub struct WorkerHandle {
    name: String,
    thread: thread::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Blocks until the worker's future has completed.
    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }
}

/// Starts a worker running `body` with its end of a fresh port pair, and
/// returns the other end.
///
/// Tasks the body spawns live as long as the body does. A resolver host
/// should therefore await `closed()` before returning.
pub fn spawn_worker<F, Fut>(name: impl Into<String>, body: F) -> io::Result<(Port, WorkerHandle)>
where
    F: FnOnce(Port) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + 'static,
{
    let name = name.into();
    let (parent, child) = Port::pair();
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

    let label = name.clone();
    let thread = thread::Builder::new().name(name.clone()).spawn(move || {
        tracing::debug!(worker = %label, "worker started");
        runtime.block_on(body(child));
        tracing::debug!(worker = %label, "worker finished");
    })?;

    Ok((parent, WorkerHandle { name, thread }))
}
