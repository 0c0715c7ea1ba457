//! Broker-side task reconciliation.
//!
//! Asks the broker for authoritative state of every known task, asks it to
//! report anything we don't know (the implicit reconcile), and kills
//! orphans: instances whose run spec no longer exists in the repository.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use berth_core::AppId;
use berth_instance::{BrokerDriver, BrokerTaskStatus, Instance, InstanceTracker, KillReason, KillService};
use berth_state::GroupRepository;

pub async fn reconcile_tasks(
    driver: &dyn BrokerDriver,
    repository: &GroupRepository,
    tracker: &InstanceTracker,
    kill: &dyn KillService,
) -> anyhow::Result<()> {
    let known_app_ids = repository.ids()?;
    let instances = tracker.all_sync();

    let mut known_statuses: Vec<BrokerTaskStatus> = Vec::new();
    let mut orphans: HashMap<AppId, Vec<Instance>> = HashMap::new();

    for instance in instances {
        if known_app_ids.contains(instance.app_id()) {
            known_statuses.extend(
                instance
                    .tasks
                    .values()
                    .filter_map(|task| task.broker_status.clone()),
            );
        } else {
            orphans
                .entry(instance.app_id().clone())
                .or_default()
                .push(instance);
        }
    }

    for (app_id, instances) in orphans {
        warn!(
            %app_id,
            count = instances.len(),
            "killing orphaned instances of removed app"
        );
        kill.kill_instances(instances, KillReason::Orphaned).await?;
    }

    if !known_statuses.is_empty() {
        info!(count = known_statuses.len(), "reconciling known tasks");
        driver.reconcile_tasks(known_statuses).await?;
    } else {
        debug!("no known task statuses to reconcile");
    }
    // Implicit reconcile: the broker reports on tasks we don't know about.
    driver.reconcile_tasks(Vec::new()).await?;
    Ok(())
}
