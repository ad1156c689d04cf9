//! Error types for pool-level and task-level failures.
//!
//! Pool-level errors go back to the caller of the originating API. Task-level
//! errors are routed through the callback/queue path like any other outcome
//! and never affect slot accounting beyond the normal release.

/// Errors returned by the pool's public surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Admission was attempted after `stop`.
    #[error("pool is stopped")]
    Stopped,

    /// A generic-slot resize would oversubscribe the generic pool.
    #[error("resize needs {needed} generic slots but only {available} are uncommitted")]
    InsufficientGeneric { needed: usize, available: usize },

    /// Result iteration was requested while a pool data callback is set.
    #[error("results are routed to the pool data callback, not the queue")]
    CallbackModeActive,
}

/// The failure of a single task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The job returned an error.
    #[error("task failed: {0}")]
    Failed(String),

    /// The job panicked on its worker.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The executor dropped the completion without resolving it. The slot is
    /// still released; the executor broke its contract.
    #[error("executor dropped the completion")]
    Lost,
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings() {
        assert_eq!(PoolError::Stopped.to_string(), "pool is stopped");
        assert_eq!(
            PoolError::InsufficientGeneric {
                needed: 9,
                available: 2
            }
            .to_string(),
            "resize needs 9 generic slots but only 2 are uncommitted"
        );
        assert_eq!(
            TaskError::failed("oops").to_string(),
            "task failed: oops"
        );
    }
}
