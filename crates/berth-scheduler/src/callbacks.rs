//! Broker callback surface.
//!
//! The wire layer delivers registration events and task status updates
//! here. Every status update is routed into the instance tracker and then
//! acknowledged, including updates the state machine refused (the refusal
//! is logged; the broker must not resend forever).

use std::sync::Arc;

use tracing::warn;

use berth_core::{CoreEvent, EventBus, Timestamp};
use berth_instance::{
    BrokerDriver, BrokerTaskStatus, InstanceTracker, InstanceUpdateEffect,
    InstanceUpdateOperation,
};

pub struct BrokerCallbacks {
    tracker: Arc<InstanceTracker>,
    driver: Arc<dyn BrokerDriver>,
    events: EventBus,
}

impl BrokerCallbacks {
    pub fn new(
        tracker: Arc<InstanceTracker>,
        driver: Arc<dyn BrokerDriver>,
        events: EventBus,
    ) -> Self {
        BrokerCallbacks {
            tracker,
            driver,
            events,
        }
    }

    pub fn registered(&self) {
        self.events.publish(CoreEvent::SchedulerRegistered);
    }

    pub fn reregistered(&self) {
        self.events.publish(CoreEvent::SchedulerReregistered);
    }

    pub fn disconnected(&self) {
        self.events.publish(CoreEvent::SchedulerDisconnected);
    }

    /// Route a status update into the tracker, then acknowledge it.
    pub async fn status_update(&self, status: BrokerTaskStatus) {
        let effect = self.tracker.process(InstanceUpdateOperation::BrokerUpdate {
            status: status.clone(),
            now: Timestamp::now(),
        });
        if let InstanceUpdateEffect::Failure { error, .. } = &effect {
            warn!(task_id = %status.task_id, %error, "status update refused, acking anyway");
        }
        if let Err(e) = self.driver.acknowledge(&status).await {
            warn!(task_id = %status.task_id, error = %e, "failed to acknowledge status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{AppId, RunSpec};
    use berth_instance::{BrokerTaskState, Condition, Instance, TaskId};

    use crate::testing::MockDriver;

    #[tokio::test]
    async fn status_updates_are_routed_and_acked() {
        let events = EventBus::default();
        let tracker = Arc::new(InstanceTracker::new(events.clone()));
        let driver = Arc::new(MockDriver::default());
        let callbacks = BrokerCallbacks::new(tracker.clone(), driver.clone(), events);

        let spec = RunSpec::new(AppId::parse("/web").unwrap(), 1);
        let instance = Instance::ephemeral(spec, 1, Timestamp::at_millis(0));
        tracker.process(InstanceUpdateOperation::LaunchEphemeral(instance.clone()));
        let task_id = instance.tasks.keys().next().unwrap().clone();

        callbacks
            .status_update(BrokerTaskStatus::new(
                task_id.clone(),
                BrokerTaskState::Running,
                Timestamp::at_millis(10),
            ))
            .await;

        assert_eq!(
            tracker.get(&instance.instance_id).unwrap().state.condition,
            Condition::Running
        );
        assert_eq!(driver.acked(), vec![task_id]);
    }

    #[tokio::test]
    async fn refused_updates_are_still_acked() {
        let events = EventBus::default();
        let tracker = Arc::new(InstanceTracker::new(events.clone()));
        let driver = Arc::new(MockDriver::default());
        let callbacks = BrokerCallbacks::new(tracker, driver.clone(), events);

        // Status for an instance nobody tracks.
        let spec = RunSpec::new(AppId::parse("/ghost").unwrap(), 1);
        let untracked = Instance::ephemeral(spec, 1, Timestamp::at_millis(0));
        let task_id: TaskId = untracked.tasks.keys().next().unwrap().clone();

        callbacks
            .status_update(BrokerTaskStatus::new(
                task_id.clone(),
                BrokerTaskState::Running,
                Timestamp::at_millis(10),
            ))
            .await;

        assert_eq!(driver.acked(), vec![task_id]);
    }
}
