//! Handler execution subsystem.
//!
//! # Data Flow
//! ```text
//! Matched endpoint + flags
//!     → ExecutionMode (inline | background pool | serializing context)
//!     → Executor::run(mode, callback future)
//!     → output, or ExecError (panic, cancelled, unavailable)
//! ```
//!
//! # Design Decisions
//! - Panics are captured in every mode and surface as `ExecError::Panicked`
//! - Dropping the future returned by `run` cancels the callback in every mode
//! - The serializing context is opt-in; without it "inline" means the connection task

pub mod pool;
pub mod serial;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::task::JoinHandle;

use crate::config::WorkerConfig;
pub use pool::WorkerPool;
pub use serial::{SerialContext, SerialHandle};

/// Where a callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Inline,
    BackgroundPool,
    Serialized,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Inline => f.write_str("inline"),
            ExecutionMode::BackgroundPool => f.write_str("background"),
            ExecutionMode::Serialized => f.write_str("serialized"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Handler panicked: {0}")]
    Panicked(String),
    #[error("Handler was cancelled")]
    Cancelled,
    #[error("Execution context unavailable")]
    Unavailable,
    #[error("Failed to start execution context: {0}")]
    Spawn(#[source] std::io::Error),
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Aborts the task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs handler callbacks in the mode their registration asks for.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    pool: Option<Arc<WorkerPool>>,
    serial: Option<Arc<SerialContext>>,
}

impl Executor {
    /// Executor that runs everything inline.
    pub fn inline() -> Self {
        Self::default()
    }

    pub fn from_config(config: &WorkerConfig) -> Result<Self, ExecError> {
        let pool = WorkerPool::new(config.background_threads)?;
        let serial = if config.serializing_context {
            Some(Arc::new(SerialContext::start()?))
        } else {
            None
        };
        Ok(Self {
            pool: Some(Arc::new(pool)),
            serial,
        })
    }

    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(Arc::new(pool));
        self
    }

    pub fn with_serial_context(mut self, serial: SerialContext) -> Self {
        self.serial = Some(Arc::new(serial));
        self
    }

    /// Pick the mode for an endpoint.
    pub fn mode_for(&self, run_on_background_pool: bool) -> ExecutionMode {
        if run_on_background_pool && self.pool.is_some() {
            ExecutionMode::BackgroundPool
        } else if self.serial.is_some() {
            ExecutionMode::Serialized
        } else {
            ExecutionMode::Inline
        }
    }

    /// Run `future` in `mode`.
    pub async fn run<F>(&self, mode: ExecutionMode, future: F) -> Result<F::Output, ExecError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match (mode, &self.pool, &self.serial) {
            (ExecutionMode::BackgroundPool, Some(pool), _) => {
                let mut task = AbortOnDrop(pool.spawn(future));
                match (&mut task.0).await {
                    Ok(output) => Ok(output),
                    Err(e) if e.is_panic() => Err(ExecError::Panicked(panic_message(e.into_panic().as_ref()))),
                    Err(_) => Err(ExecError::Cancelled),
                }
            }
            (ExecutionMode::Serialized, _, Some(serial)) => serial.spawn(future).await,
            (ExecutionMode::Inline, _, _) => AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .map_err(|payload| ExecError::Panicked(panic_message(payload.as_ref()))),
            _ => Err(ExecError::Unavailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_inline_captures_panic() {
        let executor = Executor::inline();
        let err = executor
            .run(ExecutionMode::Inline, async { panic!("boom") })
            .await
            .map(|_: ()| ())
            .unwrap_err();
        assert!(matches!(err, ExecError::Panicked(ref m) if m == "boom"));
    }

    #[tokio::test]
    async fn test_background_runs_on_pool_thread() {
        let executor = Executor::inline().with_pool(WorkerPool::new(1).unwrap());
        let mode = executor.mode_for(true);
        assert_eq!(mode, ExecutionMode::BackgroundPool);

        let name = executor
            .run(mode, async { std::thread::current().name().map(str::to_string) })
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some("switchyard-worker"));
    }

    #[tokio::test]
    async fn test_serialized_runs_on_one_thread() {
        let executor = Executor::inline().with_serial_context(SerialContext::start().unwrap());
        let mode = executor.mode_for(false);
        assert_eq!(mode, ExecutionMode::Serialized);

        let first = executor
            .run(mode, async { std::thread::current().id() })
            .await
            .unwrap();
        let second = executor
            .run(mode, async { std::thread::current().id() })
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_ne!(first, std::thread::current().id());
    }

    #[tokio::test]
    async fn test_serialized_captures_panic() {
        let executor = Executor::inline().with_serial_context(SerialContext::start().unwrap());
        let result = executor
            .run(ExecutionMode::Serialized, async { panic!("serial boom") })
            .await
            .map(|_: ()| ());
        assert!(matches!(result, Err(ExecError::Panicked(_))));
    }

    #[tokio::test]
    async fn test_dropping_run_cancels_background_job() {
        let executor = Executor::inline().with_pool(WorkerPool::new(1).unwrap());
        let finished = Arc::new(AtomicBool::new(false));

        let flag = finished.clone();
        let run = executor.run(ExecutionMode::BackgroundPool, async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            flag.store(true, Ordering::SeqCst);
        });
        let _ = tokio::time::timeout(Duration::from_millis(20), run).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_mode_selection_without_contexts() {
        let executor = Executor::inline();
        assert_eq!(executor.mode_for(true), ExecutionMode::Inline);
        assert_eq!(executor.mode_for(false), ExecutionMode::Inline);
    }
}
