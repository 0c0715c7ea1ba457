//! Recording test doubles for the collaborator seams.
//!
//! Used by this crate's unit and integration tests. Kept in the library so
//! integration tests under `tests/` can share them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use berth_core::{AppId, RunSpec, Timestamp};
use berth_instance::{
    BrokerDriver, BrokerTaskStatus, Instance, InstanceId, InstanceTracker,
    InstanceUpdateOperation, KillReason, KillService, TaskId,
};

use crate::launch_queue::{LaunchQueue, QueuedInstanceInfo};

/// Launch queue that records calls. With `auto_launch`, every `add` tracks
/// that many running instances, standing in for the external offer matcher.
#[derive(Default)]
pub struct MockLaunchQueue {
    adds: Mutex<Vec<(AppId, u32)>>,
    purges: Mutex<Vec<AppId>>,
    resets: Mutex<Vec<AppId>>,
    info: Mutex<HashMap<AppId, QueuedInstanceInfo>>,
    auto_launch: Option<Arc<InstanceTracker>>,
    /// When set, `add` blocks forever (for cancellation tests).
    pub block_adds: bool,
}

impl MockLaunchQueue {
    pub fn auto_launching(tracker: Arc<InstanceTracker>) -> Self {
        MockLaunchQueue {
            auto_launch: Some(tracker),
            ..MockLaunchQueue::default()
        }
    }

    pub fn blocking() -> Self {
        MockLaunchQueue {
            block_adds: true,
            ..MockLaunchQueue::default()
        }
    }

    pub fn set_info(&self, app_id: &AppId, info: QueuedInstanceInfo) {
        self.info.lock().unwrap().insert(app_id.clone(), info);
    }

    pub fn adds(&self) -> Vec<(AppId, u32)> {
        self.adds.lock().unwrap().clone()
    }

    pub fn purges(&self) -> Vec<AppId> {
        self.purges.lock().unwrap().clone()
    }

    pub fn resets(&self) -> Vec<AppId> {
        self.resets.lock().unwrap().clone()
    }
}

#[async_trait]
impl LaunchQueue for MockLaunchQueue {
    async fn add(&self, spec: &RunSpec, count: u32) -> anyhow::Result<()> {
        self.adds.lock().unwrap().push((spec.id.clone(), count));
        if self.block_adds {
            std::future::pending::<()>().await;
        }
        if let Some(tracker) = &self.auto_launch {
            for _ in 0..count {
                let mut instance = Instance::ephemeral(spec.clone(), 1, Timestamp::now());
                for task in instance.tasks.values_mut() {
                    task.condition = berth_instance::Condition::Running;
                }
                instance.state.condition = berth_instance::Condition::Running;
                if !spec.health_checks.is_empty() {
                    instance.state.healthy = Some(true);
                }
                tracker.process(InstanceUpdateOperation::LaunchEphemeral(instance));
            }
        }
        Ok(())
    }

    async fn get(&self, app_id: &AppId) -> Option<QueuedInstanceInfo> {
        self.info.lock().unwrap().get(app_id).cloned()
    }

    async fn purge(&self, app_id: &AppId) -> anyhow::Result<()> {
        self.purges.lock().unwrap().push(app_id.clone());
        Ok(())
    }

    async fn reset_delay(&self, spec: &RunSpec) {
        self.resets.lock().unwrap().push(spec.id.clone());
    }
}

/// Kill service that records kills. With `confirm_on`, killed instances are
/// expunged from the tracker, standing in for broker-confirmed terminal
/// status updates.
#[derive(Default)]
pub struct MockKillService {
    kills: Mutex<Vec<(InstanceId, KillReason)>>,
    confirm_on: Option<Arc<InstanceTracker>>,
}

impl MockKillService {
    pub fn confirming(tracker: Arc<InstanceTracker>) -> Self {
        MockKillService {
            confirm_on: Some(tracker),
            ..MockKillService::default()
        }
    }

    pub fn kills(&self) -> Vec<(InstanceId, KillReason)> {
        self.kills.lock().unwrap().clone()
    }
}

#[async_trait]
impl KillService for MockKillService {
    async fn kill_instances(
        &self,
        instances: Vec<Instance>,
        reason: KillReason,
    ) -> anyhow::Result<()> {
        for instance in instances {
            self.kills
                .lock()
                .unwrap()
                .push((instance.instance_id.clone(), reason));
            if let Some(tracker) = &self.confirm_on {
                tracker.process(InstanceUpdateOperation::ForceExpunge(
                    instance.instance_id,
                ));
            }
        }
        Ok(())
    }
}

/// Broker driver that records every call.
#[derive(Default)]
pub struct MockDriver {
    reconciles: Mutex<Vec<Vec<BrokerTaskStatus>>>,
    killed_tasks: Mutex<Vec<TaskId>>,
    acked: Mutex<Vec<TaskId>>,
    stops: Mutex<Vec<bool>>,
}

impl MockDriver {
    pub fn reconciles(&self) -> Vec<Vec<BrokerTaskStatus>> {
        self.reconciles.lock().unwrap().clone()
    }

    pub fn killed_tasks(&self) -> Vec<TaskId> {
        self.killed_tasks.lock().unwrap().clone()
    }

    pub fn acked(&self) -> Vec<TaskId> {
        self.acked.lock().unwrap().clone()
    }

    pub fn stops(&self) -> Vec<bool> {
        self.stops.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerDriver for MockDriver {
    async fn reconcile_tasks(&self, statuses: Vec<BrokerTaskStatus>) -> anyhow::Result<()> {
        self.reconciles.lock().unwrap().push(statuses);
        Ok(())
    }

    async fn kill_task(&self, task_id: TaskId) -> anyhow::Result<()> {
        self.killed_tasks.lock().unwrap().push(task_id);
        Ok(())
    }

    async fn acknowledge(&self, status: &BrokerTaskStatus) -> anyhow::Result<()> {
        self.acked.lock().unwrap().push(status.task_id.clone());
        Ok(())
    }

    async fn stop(&self, failover: bool) -> anyhow::Result<()> {
        self.stops.lock().unwrap().push(failover);
        Ok(())
    }
}
