//! Validation error types for the domain model.

use thiserror::Error;

/// Result type alias for validation.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Errors raised when a run spec or group violates a business rule.
///
/// Validation failures are surfaced to the caller and never trigger a
/// deployment.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid app id {0:?}: {1}")]
    InvalidAppId(String, String),

    #[error("app {0}: exactly one of ip-per-instance or port definitions must be set")]
    PortDefinition(String),

    #[error("app {0}: residency must be set if and only if persistent volumes are declared")]
    Residency(String),

    #[error("app {0}: single-instance apps may not have more than one instance")]
    SingleInstance(String),

    #[error("app {0}: gpu apps may not declare residency")]
    Gpu(String),

    #[error("app {0}: resident apps may not change resources or volumes on update")]
    ResidentUpdate(String),

    #[error("group {0}: child {1} is not a descendant of its parent")]
    ChildOutsideParent(String, String),

    #[error("group {0}: app {1} defined more than once")]
    DuplicateApp(String, String),

    #[error("group {0}: dependency graph contains a cycle through {1}")]
    DependencyCycle(String, String),
}
