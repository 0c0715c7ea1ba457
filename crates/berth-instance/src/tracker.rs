//! The instance tracker.
//!
//! Authoritative in-memory map of every tracked instance. All operations are
//! synchronous map mutations; the lock is never held across an await, so the
//! scale algorithm can take point-in-time snapshots cheaply. Snapshots may be
//! stale by the time a decision lands; callers are idempotent under that.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use tracing::{debug, warn};

use berth_core::{AppId, CoreEvent, EventBus};

use crate::instance::{Instance, InstanceId};
use crate::update::{apply, InstanceUpdateEffect, InstanceUpdateOperation};

/// Exclusive owner of the in-memory instance map.
pub struct InstanceTracker {
    instances: RwLock<HashMap<InstanceId, Instance>>,
    events: EventBus,
}

impl InstanceTracker {
    pub fn new(events: EventBus) -> Self {
        InstanceTracker {
            instances: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Apply an update operation and return its effect. `Update` and
    /// `Expunge` effects publish an `InstanceChanged` event; failures are
    /// logged and leave state untouched.
    pub fn process(&self, op: InstanceUpdateOperation) -> InstanceUpdateEffect {
        let mut instances = self.instances.write().unwrap();
        let current = instances.get(op.instance_id());
        let effect = apply(current, op);

        match &effect {
            InstanceUpdateEffect::Update { instance, .. } => {
                instances.insert(instance.instance_id.clone(), instance.clone());
                drop(instances);
                self.publish_changed(instance);
            }
            InstanceUpdateEffect::Expunge(instance) => {
                instances.remove(&instance.instance_id);
                drop(instances);
                debug!(instance_id = %instance.instance_id, "instance expunged");
                self.publish_changed(instance);
            }
            InstanceUpdateEffect::Noop(_) => {}
            InstanceUpdateEffect::Failure { instance_id, error } => {
                warn!(%instance_id, %error, "instance update refused");
            }
        }
        effect
    }

    fn publish_changed(&self, instance: &Instance) {
        self.events.publish(CoreEvent::InstanceChanged {
            app_id: instance.app_id().clone(),
            instance_id: instance.instance_id.to_string(),
            condition: instance.state.condition.to_string(),
            run_spec_version: instance.run_spec_version(),
        });
    }

    // ── Snapshot reads ─────────────────────────────────────────────

    pub fn get(&self, instance_id: &InstanceId) -> Option<Instance> {
        self.instances.read().unwrap().get(instance_id).cloned()
    }

    /// All instances of one run spec, point-in-time.
    pub fn spec_instances_sync(&self, app_id: &AppId) -> Vec<Instance> {
        self.instances
            .read()
            .unwrap()
            .values()
            .filter(|instance| instance.app_id() == app_id)
            .cloned()
            .collect()
    }

    pub fn count_spec_instances_sync(&self, app_id: &AppId) -> usize {
        self.instances
            .read()
            .unwrap()
            .values()
            .filter(|instance| instance.app_id() == app_id)
            .count()
    }

    /// All run spec ids with at least one tracked instance.
    pub fn spec_ids_sync(&self) -> BTreeSet<AppId> {
        self.instances
            .read()
            .unwrap()
            .values()
            .map(|instance| instance.app_id().clone())
            .collect()
    }

    pub fn all_sync(&self) -> Vec<Instance> {
        self.instances.read().unwrap().values().cloned().collect()
    }

    // Async faces of the snapshot reads, for wider queries.

    pub async fn spec_instances(&self, app_id: &AppId) -> Vec<Instance> {
        self.spec_instances_sync(app_id)
    }

    pub async fn all(&self) -> Vec<Instance> {
        self.all_sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{RunSpec, Timestamp};

    use crate::broker::{BrokerTaskState, BrokerTaskStatus};
    use crate::condition::Condition;

    fn spec(id: &str) -> RunSpec {
        RunSpec::new(AppId::parse(id).unwrap(), 1)
    }

    fn track(tracker: &InstanceTracker, app: &str) -> Instance {
        let instance = Instance::ephemeral(spec(app), 1, Timestamp::at_millis(0));
        tracker.process(InstanceUpdateOperation::LaunchEphemeral(instance.clone()));
        instance
    }

    #[test]
    fn tracks_and_counts_instances() {
        let tracker = InstanceTracker::new(EventBus::default());
        track(&tracker, "/web");
        track(&tracker, "/web");
        track(&tracker, "/db");

        assert_eq!(
            tracker.count_spec_instances_sync(&AppId::parse("/web").unwrap()),
            2
        );
        assert_eq!(tracker.spec_ids_sync().len(), 2);
        assert_eq!(tracker.all_sync().len(), 3);
    }

    #[test]
    fn terminal_update_removes_instance() {
        let tracker = InstanceTracker::new(EventBus::default());
        let instance = track(&tracker, "/web");
        let task_id = instance.tasks.keys().next().unwrap().clone();

        tracker.process(InstanceUpdateOperation::BrokerUpdate {
            status: BrokerTaskStatus::new(
                task_id,
                BrokerTaskState::Finished,
                Timestamp::at_millis(50),
            ),
            now: Timestamp::at_millis(50),
        });

        assert_eq!(
            tracker.count_spec_instances_sync(&AppId::parse("/web").unwrap()),
            0
        );
    }

    #[test]
    fn refused_update_leaves_state_untouched() {
        let tracker = InstanceTracker::new(EventBus::default());
        let instance = track(&tracker, "/web");

        let effect = tracker.process(InstanceUpdateOperation::LaunchEphemeral(instance.clone()));
        assert!(matches!(effect, InstanceUpdateEffect::Failure { .. }));
        assert_eq!(
            tracker.count_spec_instances_sync(&AppId::parse("/web").unwrap()),
            1
        );
    }

    #[tokio::test]
    async fn updates_publish_instance_changed() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let tracker = InstanceTracker::new(events);

        let instance = track(&tracker, "/web");
        match rx.recv().await.unwrap() {
            CoreEvent::InstanceChanged {
                app_id,
                instance_id,
                condition,
                ..
            } => {
                assert_eq!(app_id, AppId::parse("/web").unwrap());
                assert_eq!(instance_id, instance.instance_id.to_string());
                assert_eq!(condition, Condition::Created.to_string());
            }
            other => panic!("expected InstanceChanged, got {other:?}"),
        }
    }
}
