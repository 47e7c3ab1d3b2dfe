//! Pluggable task submission for concurrent transport work.
//!
//! The transport, the segmented downloader and the update orchestrator never
//! call `tokio::spawn` directly. They submit futures through an
//! [`AsyncExecutor`] and get back a [`TaskHandle`] they can await, which lets
//! the host decide how much parallelism the engine may use.
//!
//! # Concurrency Model
//!
//! - Each submitted future runs in its own Tokio task
//! - A semaphore permit is acquired before the future starts running
//! - Permits are released automatically when the future completes (RAII)
//! - Submission itself never blocks the caller

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, oneshot};
use tracing::{debug, instrument, warn};

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 100;

/// Default concurrency if not specified.
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Error type for executor operations.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// No Tokio runtime is active on the calling thread.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    /// The task was dropped or panicked before producing a value.
    #[error("task dropped before completion")]
    TaskDropped,
}

/// Task-submission abstraction used for all concurrent transport work.
pub trait AsyncExecutor: Send + Sync + fmt::Debug {
    /// Schedules a future to run to completion in the background.
    fn spawn_boxed(&self, task: BoxFuture<'static, ()>);
}

/// Awaitable result of a submitted task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    receiver: oneshot::Receiver<T>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, ExecutorError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| ExecutorError::TaskDropped))
    }
}

/// Submits a future and returns a handle resolving to its output.
pub fn submit<T, F>(executor: &dyn AsyncExecutor, future: F) -> TaskHandle<T>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    let (sender, receiver) = oneshot::channel();
    executor.spawn_boxed(Box::pin(async move {
        // The receiver may be gone if the caller stopped waiting.
        let _ = sender.send(future.await);
    }));
    TaskHandle { receiver }
}

/// Executor backed by a Tokio runtime with a bounded number of running tasks.
#[derive(Clone)]
pub struct TokioExecutor {
    handle: Handle,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    submitted: Arc<AtomicUsize>,
}

impl fmt::Debug for TokioExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioExecutor")
            .field("concurrency", &self.concurrency)
            .field("available_permits", &self.semaphore.available_permits())
            .field("submitted", &self.submitted.load(Ordering::Relaxed))
            .finish()
    }
}

impl TokioExecutor {
    /// Creates an executor on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::InvalidConcurrency`] if the value is outside
    /// `1..=100`, or [`ExecutorError::NoRuntime`] when called outside a runtime.
    #[instrument(level = "debug")]
    pub fn current(concurrency: usize) -> Result<Self, ExecutorError> {
        Self::with_handle(Handle::try_current()?, concurrency)
    }

    /// Creates an executor on an explicit runtime handle.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::InvalidConcurrency`] if the value is outside `1..=100`.
    pub fn with_handle(handle: Handle, concurrency: usize) -> Result<Self, ExecutorError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(ExecutorError::InvalidConcurrency { value: concurrency });
        }
        debug!(concurrency, "creating tokio executor");
        Ok(Self {
            handle,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            submitted: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Returns the configured concurrency limit.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Returns how many tasks were submitted over the executor's lifetime.
    #[must_use]
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }
}

impl AsyncExecutor for TokioExecutor {
    fn spawn_boxed(&self, task: BoxFuture<'static, ()>) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        let semaphore = Arc::clone(&self.semaphore);
        self.handle.spawn(async move {
            // Permit is dropped when this block exits (RAII)
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!("executor semaphore closed, running task unbounded");
                    None
                }
            };
            task.await;
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_executor_new_valid_concurrency() {
        assert_eq!(TokioExecutor::current(1).unwrap().concurrency(), 1);
        assert_eq!(TokioExecutor::current(100).unwrap().concurrency(), 100);
    }

    #[tokio::test]
    async fn test_executor_new_invalid_concurrency_zero() {
        let result = TokioExecutor::current(0);
        assert!(matches!(
            result,
            Err(ExecutorError::InvalidConcurrency { value: 0 })
        ));
    }

    #[tokio::test]
    async fn test_executor_new_invalid_concurrency_too_high() {
        let result = TokioExecutor::current(101);
        assert!(matches!(
            result,
            Err(ExecutorError::InvalidConcurrency { value: 101 })
        ));
    }

    #[test]
    fn test_executor_outside_runtime_reports_no_runtime() {
        assert!(matches!(
            TokioExecutor::current(4),
            Err(ExecutorError::NoRuntime(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_returns_task_output() {
        let executor = TokioExecutor::current(4).unwrap();
        let handle = submit(&executor, async { 21 * 2 });
        assert_eq!(handle.await.unwrap(), 42);
        assert_eq!(executor.submitted(), 1);
    }

    #[tokio::test]
    async fn test_panicking_task_reports_dropped() {
        let executor = TokioExecutor::current(1).unwrap();
        let handle: TaskHandle<u32> = submit(&executor, async { panic!("boom") });
        assert!(matches!(handle.await, Err(ExecutorError::TaskDropped)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_limit_is_respected() {
        let executor = TokioExecutor::current(2).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                submit(&executor, async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak exceeded limit");
    }

    #[test]
    fn test_executor_error_display() {
        let msg = ExecutorError::InvalidConcurrency { value: 0 }.to_string();
        assert!(msg.contains("invalid concurrency"));
        assert!(msg.contains("100"));
    }
}
