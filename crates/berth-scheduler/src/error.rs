//! Scheduler error types.

use thiserror::Error;

/// Errors surfaced in `CommandFailed` answers.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The affected apps are locked; carries the ids of the conflicting
    /// deployments (empty when a non-deployment command holds the lock).
    #[error("apps locked by conflicting deployments: {0:?}")]
    AppLocked(Vec<String>),

    #[error("timed out waiting for conflicting deployments to cancel")]
    CancellationTimeout,

    #[error("deployment {0} is not running")]
    DeploymentNotRunning(String),

    #[error("store error: {0}")]
    Store(#[from] berth_state::StoreError),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("scheduler is shut down")]
    Unavailable,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
