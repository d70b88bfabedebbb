//! Single-threaded serializing execution context.
//!
//! # Responsibilities
//! - Run submitted jobs one logical thread at a time
//! - Return each job's output (or panic) to the submitter
//! - Cancel a job when its submitter stops waiting
//!
//! # Design Decisions
//! - One OS thread running a current-thread runtime and a `LocalSet`
//! - Jobs interleave only at their await points, never in parallel
//! - The thread exits when the context is dropped

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::{AbortHandle, Abortable, BoxFuture};
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};

use crate::execution::{panic_message, ExecError};

type Job = BoxFuture<'static, ()>;

/// Handle to the serializing thread.
#[derive(Debug)]
pub struct SerialContext {
    jobs: mpsc::UnboundedSender<Job>,
}

impl SerialContext {
    pub fn start() -> Result<Self, ExecError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        std::thread::Builder::new()
            .name("switchyard-serial".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to start serializing context");
                        return;
                    }
                };
                let local = tokio::task::LocalSet::new();
                local.block_on(&runtime, async move {
                    while let Some(job) = rx.recv().await {
                        tokio::task::spawn_local(job);
                    }
                });
                tracing::debug!("Serializing context stopped");
            })
            .map_err(ExecError::Spawn)?;

        tracing::info!("Serializing context started");
        Ok(Self { jobs: tx })
    }

    /// Submit a job. Dropping the returned handle cancels the job.
    pub fn spawn<F>(&self, future: F) -> SerialHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let (abort, registration) = AbortHandle::new_pair();

        let job = Abortable::new(
            async move {
                let outcome = AssertUnwindSafe(future)
                    .catch_unwind()
                    .await
                    .map_err(|payload| ExecError::Panicked(panic_message(payload.as_ref())));
                let _ = result_tx.send(outcome);
            },
            registration,
        );

        let submitted = self.jobs.send(async move {
            let _ = job.await;
        }
        .boxed());

        SerialHandle {
            result: result_rx,
            abort,
            rejected: submitted.is_err(),
        }
    }
}

/// Pending result of a job on the serializing context.
#[derive(Debug)]
pub struct SerialHandle<T> {
    result: oneshot::Receiver<Result<T, ExecError>>,
    abort: AbortHandle,
    rejected: bool,
}

impl<T> Future for SerialHandle<T> {
    type Output = Result<T, ExecError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.rejected {
            return Poll::Ready(Err(ExecError::Unavailable));
        }
        match Pin::new(&mut self.result).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ExecError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for SerialHandle<T> {
    fn drop(&mut self) {
        self.abort.abort();
    }
}
