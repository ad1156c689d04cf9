//! Executor - the seam between admission control and worker execution.
//!
//! The pool assumes nothing about how work runs (threads, subprocesses,
//! remote workers); it only requires that every job handed to `run` resolves
//! its completion exactly once. `SpawnBlockingExecutor` is the bundled
//! implementation, running jobs on the Tokio blocking-thread pool.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::TaskError;

/// A unit of work. Runs once on a worker and produces the task's outcome.
pub type Job<T> = Box<dyn FnOnce() -> Result<T, TaskError> + Send + 'static>;

/// Completion future for a submitted job. Resolves exactly once.
pub type Completion<T> = oneshot::Receiver<Result<T, TaskError>>;

/// Runs admitted jobs on some underlying worker mechanism.
#[async_trait]
pub trait Executor<T: Send + 'static>: Send + Sync {
    /// Hand a job to a worker.
    ///
    /// Every call must eventually resolve the returned completion with
    /// exactly one outcome. Dropping the sender instead is a contract breach
    /// the pool surfaces as [`TaskError::Lost`], releasing the slot anyway.
    fn run(&self, job: Job<T>) -> Completion<T>;

    /// Tear down the underlying workers. With `drain` the pool has already
    /// waited for in-flight work; without it, running jobs are left to
    /// finish on their own. Must tolerate repeated calls.
    async fn shutdown(&self, drain: bool);
}

/// Default executor backed by `tokio::task::spawn_blocking`.
///
/// A panicking job is reported as [`TaskError::Panicked`] rather than
/// tearing anything down. The blocking pool belongs to the runtime, so
/// `shutdown` only marks the executor closed.
pub struct SpawnBlockingExecutor {
    closed: AtomicBool,
}

impl SpawnBlockingExecutor {
    pub fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
        }
    }
}

impl Default for SpawnBlockingExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> Executor<T> for SpawnBlockingExecutor {
    fn run(&self, job: Job<T>) -> Completion<T> {
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!("job submitted to a closed executor");
        }
        let (tx, rx) = oneshot::channel();
        let worker = tokio::task::spawn_blocking(job);
        tokio::spawn(async move {
            let outcome = match worker.await {
                Ok(outcome) => outcome,
                Err(err) if err.is_panic() => {
                    Err(TaskError::Panicked(panic_message(err.into_panic())))
                }
                Err(_) => Err(TaskError::Lost),
            };
            let _ = tx.send(outcome);
        });
        rx
    }

    async fn shutdown(&self, drain: bool) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!(drain, "executor closed");
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<unknown>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn executor() -> Arc<dyn Executor<i32>> {
        Arc::new(SpawnBlockingExecutor::new())
    }

    #[tokio::test]
    async fn runs_job_to_completion() {
        let exec = executor();
        let completion = exec.run(Box::new(|| Ok(7)));
        assert_eq!(completion.await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn surfaces_job_error() {
        let exec = executor();
        let completion = exec.run(Box::new(|| Err(TaskError::failed("nope"))));
        assert_eq!(completion.await.unwrap(), Err(TaskError::failed("nope")));
    }

    #[tokio::test]
    async fn converts_panic_to_task_error() {
        let exec = executor();
        let completion = exec.run(Box::new(|| panic!("boom")));
        match completion.await.unwrap() {
            Err(TaskError::Panicked(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected Panicked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let exec = executor();
        exec.shutdown(true).await;
        exec.shutdown(false).await;
        // Jobs already handed over still complete.
        let completion = exec.run(Box::new(|| Ok(1)));
        assert_eq!(completion.await.unwrap(), Ok(1));
    }
}
