//! berth-health — health check lifecycle for the Berth scheduling core.
//!
//! Health checks are registered per `(app, spec version)`. The broker (or
//! an embedding prober) reports task health through [`HealthCheckManager::update`];
//! the manager tracks per-task results, kills tasks that exceed their
//! failure threshold, and is reconciled against the live instance set after
//! any change to the application tree.

pub mod manager;

pub use manager::{HealthCheckManager, HealthResult};
