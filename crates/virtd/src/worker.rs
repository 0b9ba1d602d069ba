//! Worker threads driving the shared reactor.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::info;

const WORKERS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::workers");
const THREAD_NAME: &str = "virtd-worker";

/// A fixed set of OS threads sharing one reactor.
///
/// The pool owns no queue of its own; every worker polls the same runtime,
/// and the thread that calls [`WorkerPool::block_on`] drives its future
/// alongside them. Stopping the runtime is the only way to stop the workers.
#[derive(Debug)]
pub struct WorkerPool {
    runtime: Runtime,
    workers: usize,
}

impl WorkerPool {
    /// Starts `workers` threads. At least one is always started.
    ///
    /// # Errors
    ///
    /// Propagates runtime construction failures.
    pub fn start(workers: usize) -> io::Result<Self> {
        let workers = workers.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name(THREAD_NAME)
            .enable_all()
            .build()?;
        info!(target: WORKERS_TARGET, workers, "worker pool started");
        Ok(Self { runtime, workers })
    }

    /// Number of worker threads.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Handle for spawning onto the shared reactor.
    #[must_use]
    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }

    /// Drives `future` to completion on the calling thread.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Stops the reactor and waits up to `timeout` for the workers to exit.
    /// Tasks still pending are dropped.
    pub fn join(self, timeout: Duration) {
        self.runtime.shutdown_timeout(timeout);
        info!(target: WORKERS_TARGET, "worker pool joined");
    }
}
