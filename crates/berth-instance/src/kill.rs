//! Instance killing.
//!
//! All kills flow through the `KillService` seam so policy (scaling,
//! deletion, orphan cleanup, health failures) stays attached to the request.
//! Kills carry no wall-clock timeout; the service retries independently and
//! the tracker expunges rows only on broker-confirmed terminal status.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::broker::BrokerDriver;
use crate::instance::Instance;

/// Why an instance is being killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    ScalingApp,
    DeletingApp,
    RestartingApp,
    Orphaned,
    KillingTasksViaApi,
    FailedHealthChecks,
}

/// The seam every kill goes through.
#[async_trait]
pub trait KillService: Send + Sync {
    async fn kill_instances(
        &self,
        instances: Vec<Instance>,
        reason: KillReason,
    ) -> anyhow::Result<()>;

    async fn kill_instance(&self, instance: Instance, reason: KillReason) -> anyhow::Result<()> {
        self.kill_instances(vec![instance], reason).await
    }
}

/// Kill service backed by the broker driver: issues one kill per launched
/// task of each instance.
pub struct DriverKillService {
    driver: Arc<dyn BrokerDriver>,
}

impl DriverKillService {
    pub fn new(driver: Arc<dyn BrokerDriver>) -> Self {
        DriverKillService { driver }
    }
}

#[async_trait]
impl KillService for DriverKillService {
    async fn kill_instances(
        &self,
        instances: Vec<Instance>,
        reason: KillReason,
    ) -> anyhow::Result<()> {
        for instance in instances {
            info!(
                instance_id = %instance.instance_id,
                ?reason,
                "killing instance"
            );
            for task in instance.tasks.values().filter(|t| t.launched) {
                self.driver.kill_task(task.task_id.clone()).await?;
            }
        }
        Ok(())
    }
}
