//! The seam towards the launch queue.
//!
//! The launch queue is the external placement component: it receives
//! resource offers, matches them against pending instance launches, and
//! rate-limits launches per run spec. The core only enqueues, purges, and
//! inspects it.

use async_trait::async_trait;

use berth_core::{AppId, RunSpec, Timestamp};

/// Point-in-time queue state for one run spec. Lives only while the queue
/// has work for the spec.
#[derive(Debug, Clone)]
pub struct QueuedInstanceInfo {
    pub run_spec: RunSpec,
    pub instances_left_to_launch: u32,
    pub in_progress: bool,
    /// Tracked instances plus pending launches.
    pub final_instance_count: u32,
    /// Of `final_instance_count`, how many are currently unreachable.
    pub unreachable_instances: u32,
    pub backoff_until: Option<Timestamp>,
}

/// The launch-queue operations the core issues.
#[async_trait]
pub trait LaunchQueue: Send + Sync {
    /// Request `count` additional launches for a run spec.
    async fn add(&self, spec: &RunSpec, count: u32) -> anyhow::Result<()>;

    /// Queue state for a run spec, if it has pending work.
    async fn get(&self, app_id: &AppId) -> Option<QueuedInstanceInfo>;

    /// Drop all pending launches for a run spec.
    async fn purge(&self, app_id: &AppId) -> anyhow::Result<()>;

    /// Reset the launch rate-limiter delay for a run spec.
    async fn reset_delay(&self, spec: &RunSpec);
}
