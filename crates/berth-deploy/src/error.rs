//! Deployment error types.

use thiserror::Error;

/// Result type alias for deployment operations.
pub type DeploymentResult<T> = Result<T, DeploymentError>;

/// Why a deployment did not finish.
///
/// `Canceled` is distinguished from other failures: canceled plans are
/// deleted from the store, failed plans are kept for diagnostics.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeploymentError {
    #[error("deployment was canceled")]
    Canceled,

    #[error("deployment step failed: {0}")]
    StepFailed(String),

    #[error("deployment {0} is not running")]
    NotRunning(String),
}
