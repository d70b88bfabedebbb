//! Shared background worker pool.
//!
//! # Design Decisions
//! - A dedicated multi-threaded runtime, separate from the I/O runtime
//! - Dropping the pool shuts its runtime down without blocking the caller

use std::future::Future;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::execution::ExecError;

/// Runtime for handlers that opted onto the background pool.
#[derive(Debug)]
pub struct WorkerPool {
    runtime: Option<Runtime>,
    handle: Handle,
    threads: usize,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self, ExecError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("switchyard-worker")
            .enable_all()
            .build()
            .map_err(ExecError::Spawn)?;

        tracing::info!(threads = threads, "Background worker pool started");

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            threads,
        })
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
