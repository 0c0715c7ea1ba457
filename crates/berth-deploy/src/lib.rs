//! berth-deploy — deployment execution for the Berth scheduling core.
//!
//! The `DeploymentManager` owns every running deployment plan. Each plan
//! runs in its own worker task that walks the plan's steps in order,
//! issuing per-app actions through the [`DeploymentActions`] seam and
//! waiting for readiness before advancing. Workers react to cancellation
//! at every await point.
//!
//! Across deployments no ordering is promised; within one deployment the
//! steps run strictly in declared order.

pub mod error;
pub mod manager;
mod worker;

use async_trait::async_trait;

use berth_core::RunSpec;

pub use error::{DeploymentError, DeploymentResult};
pub use manager::{
    DeploymentEvent, DeploymentManager, DeploymentManagerHandle, RunningDeployment,
};

/// The calls a deployment worker issues per app action. Implemented by the
/// scheduler's action layer; mutations must be idempotent, because a plan
/// is re-run as a whole after a leader failover.
#[async_trait]
pub trait DeploymentActions: Send + Sync {
    /// Make a new app known (health checks, queue state) and request its
    /// first instances.
    async fn start_app(&self, spec: &RunSpec, scale_to: u32) -> anyhow::Result<()>;

    /// Adjust the instance count of an unchanged config.
    async fn scale_app(&self, spec: &RunSpec, scale_to: u32) -> anyhow::Result<()>;

    /// Replace every instance with the new config.
    async fn restart_app(&self, spec: &RunSpec) -> anyhow::Result<()>;

    /// Tear the app down entirely.
    async fn stop_app(&self, spec: &RunSpec) -> anyhow::Result<()>;

    /// Resolve once `target` instances are running (and healthy, if the
    /// spec defines health checks). May pend indefinitely; the worker
    /// cancels it on deployment cancellation.
    async fn wait_for_ready(&self, spec: &RunSpec, target: u32) -> anyhow::Result<()>;
}
