//! The narrow seam towards the resource broker.
//!
//! The wire protocol lives outside the core; this module only defines the
//! status vocabulary the broker reports and the driver calls the core
//! issues. Status updates may be reissued by the broker; everything built
//! on top must stay idempotent across duplicates.

use async_trait::async_trait;

use berth_core::Timestamp;

use crate::condition::Condition;
use crate::instance::TaskId;

/// Task states as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerTaskState {
    Staging,
    Starting,
    Running,
    Killing,
    Killed,
    Finished,
    Failed,
    Error,
    Gone,
    Dropped,
    Unreachable,
    Unknown,
}

impl From<BrokerTaskState> for Condition {
    fn from(state: BrokerTaskState) -> Condition {
        match state {
            BrokerTaskState::Staging => Condition::Staging,
            BrokerTaskState::Starting => Condition::Starting,
            BrokerTaskState::Running => Condition::Running,
            BrokerTaskState::Killing => Condition::Killing,
            BrokerTaskState::Killed => Condition::Killed,
            BrokerTaskState::Finished => Condition::Finished,
            BrokerTaskState::Failed => Condition::Failed,
            BrokerTaskState::Error => Condition::Error,
            BrokerTaskState::Gone => Condition::Gone,
            BrokerTaskState::Dropped => Condition::Dropped,
            BrokerTaskState::Unreachable => Condition::Unreachable,
            BrokerTaskState::Unknown => Condition::Unknown,
        }
    }
}

/// A task status update as received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerTaskStatus {
    pub task_id: TaskId,
    pub state: BrokerTaskState,
    pub message: Option<String>,
    pub agent_id: Option<String>,
    /// Health as reported by broker-executed checks, when present.
    pub healthy: Option<bool>,
    pub timestamp: Timestamp,
}

impl BrokerTaskStatus {
    pub fn new(task_id: TaskId, state: BrokerTaskState, timestamp: Timestamp) -> Self {
        BrokerTaskStatus {
            task_id,
            state,
            message: None,
            agent_id: None,
            healthy: None,
            timestamp,
        }
    }
}

/// Driver primitives the core consumes. Failures are opaque and treated as
/// broker-transient: recovered by the next reconciliation or by abdication.
#[async_trait]
pub trait BrokerDriver: Send + Sync {
    /// Ask the broker for authoritative state of the given tasks. An empty
    /// list is the implicit reconcile: the broker reports on everything it
    /// knows about.
    async fn reconcile_tasks(&self, statuses: Vec<BrokerTaskStatus>) -> anyhow::Result<()>;

    /// Ask the broker to kill a single task.
    async fn kill_task(&self, task_id: TaskId) -> anyhow::Result<()>;

    /// Acknowledge a routed status update.
    async fn acknowledge(&self, status: &BrokerTaskStatus) -> anyhow::Result<()>;

    /// Stop the driver, optionally keeping the framework registered for
    /// failover.
    async fn stop(&self, failover: bool) -> anyhow::Result<()>;
}
