//! Scheduler actions.
//!
//! The operations the scheduler actor (and deployment workers) invoke:
//! scale-up/scale-down target computation, victim selection, app teardown,
//! restart, and readiness waits. The target computations are pure functions
//! over tracker/queue snapshots; snapshots may be stale by the time an
//! effect lands, so every effect is idempotent.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use berth_core::{CoreEvent, EventBus, KillSelection, RunSpec};
use berth_deploy::DeploymentActions;
use berth_health::HealthCheckManager;
use berth_instance::{Condition, Instance, InstanceTracker, KillReason, KillService};

use crate::config::SchedulerConfig;
use crate::launch_queue::{LaunchQueue, QueuedInstanceInfo};

/// How many launches to request so a run spec reaches `target` instances.
///
/// With a queue entry, instances the queue already accounts for are
/// subtracted, except unreachable ones: lost instances are replaced
/// promptly rather than waited for.
pub fn launches_needed(
    target: u32,
    launched: u32,
    queue: Option<&QueuedInstanceInfo>,
) -> u32 {
    let queued_or_running = match queue {
        Some(info) => {
            launched.max(info.final_instance_count.saturating_sub(info.unreachable_instances))
        }
        None => launched,
    };
    target.saturating_sub(queued_or_running)
}

/// Pick `count` scale-down victims.
///
/// Only staging, starting, and running instances are candidates, killed in
/// that order. Within one bucket `YoungestFirst` kills the most recently
/// changed instance first; `OldestFirst` inverts the tiebreak.
pub fn select_victims(
    mut instances: Vec<Instance>,
    count: usize,
    selection: KillSelection,
) -> Vec<Instance> {
    instances.retain(|instance| instance.state.condition.scale_down_rank().is_some());
    instances.sort_by(|a, b| {
        let rank = a
            .state
            .condition
            .scale_down_rank()
            .cmp(&b.state.condition.scale_down_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match selection {
            KillSelection::YoungestFirst => b.state.since.cmp(&a.state.since),
            KillSelection::OldestFirst => a.state.since.cmp(&b.state.since),
        }
    });
    instances.truncate(count);
    instances
}

/// The effectful action layer over tracker, queue, kill service and health
/// manager.
pub struct SchedulerActions {
    tracker: Arc<InstanceTracker>,
    queue: Arc<dyn LaunchQueue>,
    kill: Arc<dyn KillService>,
    health: Arc<HealthCheckManager>,
    events: EventBus,
    config: SchedulerConfig,
}

impl SchedulerActions {
    pub fn new(
        tracker: Arc<InstanceTracker>,
        queue: Arc<dyn LaunchQueue>,
        kill: Arc<dyn KillService>,
        health: Arc<HealthCheckManager>,
        events: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        SchedulerActions {
            tracker,
            queue,
            kill,
            health,
            events,
            config,
        }
    }

    /// Scale a run spec towards its own target count.
    pub async fn scale(&self, spec: &RunSpec) -> anyhow::Result<()> {
        self.scale_to(spec, spec.instances).await
    }

    /// Scale a run spec towards an explicit target.
    pub async fn scale_to(&self, spec: &RunSpec, target: u32) -> anyhow::Result<()> {
        let instances = self.tracker.spec_instances_sync(&spec.id);
        let launched = instances
            .iter()
            .filter(|instance| instance.state.condition.is_launched())
            .count() as u32;

        if target > launched {
            let queue_info = self.queue.get(&spec.id).await;
            let to_queue = launches_needed(target, launched, queue_info.as_ref());
            if to_queue > 0 {
                info!(app_id = %spec.id, count = to_queue, "queueing launches");
                self.queue.add(spec, to_queue).await?;
            } else {
                debug!(app_id = %spec.id, "scale-up already covered by queue");
            }
        } else if target < launched {
            self.queue.purge(&spec.id).await?;
            let excess = (launched - target) as usize;
            let victims = select_victims(instances, excess, spec.kill_selection);
            info!(app_id = %spec.id, count = victims.len(), "killing excess instances");
            self.kill
                .kill_instances(victims, KillReason::ScalingApp)
                .await?;
        } else {
            debug!(app_id = %spec.id, target, "already at target");
        }
        Ok(())
    }

    /// Tear an app down: checks gone, instances killed, queue purged, rate
    /// limiter reset. Instance rows leave the tracker only on
    /// broker-confirmed terminal status.
    pub async fn stop(&self, spec: &RunSpec) -> anyhow::Result<()> {
        self.health.remove_all_for(&spec.id);

        let launched: Vec<Instance> = self
            .tracker
            .spec_instances_sync(&spec.id)
            .into_iter()
            .filter(|instance| instance.is_launched())
            .collect();
        if !launched.is_empty() {
            self.kill
                .kill_instances(launched, KillReason::DeletingApp)
                .await?;
        }

        self.queue.purge(&spec.id).await?;
        self.queue.reset_delay(spec).await;
        self.events.publish(CoreEvent::AppTerminated {
            app_id: spec.id.clone(),
        });
        info!(app_id = %spec.id, "app stopped");
        Ok(())
    }

    /// Replace every instance with the new config. Old instances up to the
    /// spec's health floor keep running until the replacements are ready.
    pub async fn restart(&self, spec: &RunSpec) -> anyhow::Result<()> {
        self.queue.purge(&spec.id).await?;

        let old: Vec<Instance> = self
            .tracker
            .spec_instances_sync(&spec.id)
            .into_iter()
            .filter(|instance| {
                instance.state.condition.is_launched()
                    && instance.run_spec_version() != spec.version()
            })
            .collect();

        let floor = ((spec.instances as f64) * spec.upgrade_strategy.min_health_capacity)
            .ceil() as usize;
        let immediate = old.len().saturating_sub(floor.min(old.len()));
        if immediate > 0 {
            let victims = select_victims(old.clone(), immediate, spec.kill_selection);
            self.kill
                .kill_instances(victims, KillReason::RestartingApp)
                .await?;
        }

        self.queue.add(spec, spec.instances).await?;
        self.await_running(spec, spec.instances, true).await?;

        // The survivors of the old version go once replacements are ready.
        let leftovers: Vec<Instance> = self
            .tracker
            .spec_instances_sync(&spec.id)
            .into_iter()
            .filter(|instance| {
                instance.state.condition.is_launched()
                    && instance.run_spec_version() != spec.version()
            })
            .collect();
        if !leftovers.is_empty() {
            self.kill
                .kill_instances(leftovers, KillReason::RestartingApp)
                .await?;
        }
        Ok(())
    }

    /// Poll the tracker until `target` instances are running (and healthy,
    /// when the spec defines health checks). Pends until satisfied; callers
    /// race it against cancellation.
    async fn await_running(
        &self,
        spec: &RunSpec,
        target: u32,
        version_matched: bool,
    ) -> anyhow::Result<()> {
        loop {
            let ready = self
                .tracker
                .spec_instances_sync(&spec.id)
                .iter()
                .filter(|instance| {
                    instance.state.condition == Condition::Running
                        && (!version_matched
                            || instance.run_spec_version() == spec.version())
                        && (spec.health_checks.is_empty()
                            || instance.state.healthy == Some(true))
                })
                .count();
            if ready >= target as usize {
                return Ok(());
            }
            tokio::time::sleep(self.config.readiness_poll()).await;
        }
    }
}

#[async_trait]
impl DeploymentActions for SchedulerActions {
    async fn start_app(&self, spec: &RunSpec, scale_to: u32) -> anyhow::Result<()> {
        self.health.add_all_for(spec);
        self.scale_to(spec, scale_to).await
    }

    async fn scale_app(&self, spec: &RunSpec, scale_to: u32) -> anyhow::Result<()> {
        self.scale_to(spec, scale_to).await
    }

    async fn restart_app(&self, spec: &RunSpec) -> anyhow::Result<()> {
        self.health.add_all_for(spec);
        self.restart(spec).await
    }

    async fn stop_app(&self, spec: &RunSpec) -> anyhow::Result<()> {
        self.stop(spec).await
    }

    async fn wait_for_ready(&self, spec: &RunSpec, target: u32) -> anyhow::Result<()> {
        self.await_running(spec, target, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{AppId, Timestamp};
    use berth_instance::{InstanceState, InstanceUpdateOperation};

    use crate::testing::{MockKillService, MockLaunchQueue};

    fn spec(id: &str, instances: u32) -> RunSpec {
        RunSpec::new(AppId::parse(id).unwrap(), instances)
    }

    fn instance_in(spec: &RunSpec, condition: Condition, since: i64) -> Instance {
        let mut instance = Instance::ephemeral(spec.clone(), 1, Timestamp::at_millis(since));
        for task in instance.tasks.values_mut() {
            task.condition = condition;
        }
        instance.state = InstanceState {
            condition,
            since: Timestamp::at_millis(since),
            healthy: None,
        };
        instance
    }

    struct Fixture {
        tracker: Arc<InstanceTracker>,
        queue: Arc<MockLaunchQueue>,
        kill: Arc<MockKillService>,
        actions: SchedulerActions,
    }

    fn fixture() -> Fixture {
        let events = EventBus::default();
        let tracker = Arc::new(InstanceTracker::new(events.clone()));
        let queue = Arc::new(MockLaunchQueue::default());
        let kill = Arc::new(MockKillService::default());
        let health = Arc::new(HealthCheckManager::new(
            tracker.clone(),
            kill.clone(),
            events.clone(),
        ));
        let actions = SchedulerActions::new(
            tracker.clone(),
            queue.clone(),
            kill.clone(),
            health,
            events,
            SchedulerConfig {
                readiness_poll_millis: 5,
                ..SchedulerConfig::default()
            },
        );
        Fixture {
            tracker,
            queue,
            kill,
            actions,
        }
    }

    fn track(fixture: &Fixture, instance: Instance) {
        fixture
            .tracker
            .process(InstanceUpdateOperation::LaunchEphemeral(instance));
    }

    #[test]
    fn launches_needed_without_queue_entry() {
        assert_eq!(launches_needed(5, 3, None), 2);
        assert_eq!(launches_needed(3, 5, None), 0);
    }

    #[test]
    fn launches_needed_excludes_unreachable() {
        let spec = spec("/web", 15);
        let info = QueuedInstanceInfo {
            run_spec: spec,
            instances_left_to_launch: 0,
            in_progress: true,
            final_instance_count: 15,
            unreachable_instances: 5,
            backoff_until: None,
        };
        // 10 reachable accounted for, so 5 replacements are requested.
        assert_eq!(launches_needed(15, 10, Some(&info)), 5);
        // The queue never reduces the count below what is launched.
        assert_eq!(launches_needed(15, 12, Some(&info)), 3);
    }

    #[tokio::test]
    async fn scale_up_replaces_unreachable_instances() {
        let fixture = fixture();
        let spec = spec("/web", 15);
        for i in 0..10 {
            track(&fixture, instance_in(&spec, Condition::Running, i));
        }
        fixture.queue.set_info(
            &spec.id,
            QueuedInstanceInfo {
                run_spec: spec.clone(),
                instances_left_to_launch: 0,
                in_progress: true,
                final_instance_count: 15,
                unreachable_instances: 5,
                backoff_until: None,
            },
        );

        fixture.actions.scale(&spec).await.unwrap();

        assert_eq!(fixture.queue.adds(), vec![(spec.id.clone(), 5)]);
        assert!(fixture.kill.kills().is_empty());
    }

    #[tokio::test]
    async fn scale_down_kills_youngest_staged_first() {
        let fixture = fixture();
        let spec = spec("/web", 3);
        track(&fixture, instance_in(&spec, Condition::Running, 1));
        track(&fixture, instance_in(&spec, Condition::Running, 2));
        track(&fixture, instance_in(&spec, Condition::Running, 3));
        let staged = instance_in(&spec, Condition::Staging, 1);
        let young = instance_in(&spec, Condition::Running, 4);
        track(&fixture, staged.clone());
        track(&fixture, young.clone());

        fixture.actions.scale(&spec).await.unwrap();

        assert_eq!(fixture.queue.purges(), vec![spec.id.clone()]);
        let kills = fixture.kill.kills();
        assert_eq!(kills.len(), 2);
        assert_eq!(kills[0], (staged.instance_id.clone(), KillReason::ScalingApp));
        assert_eq!(kills[1], (young.instance_id.clone(), KillReason::ScalingApp));
    }

    #[tokio::test]
    async fn scale_at_target_is_a_noop() {
        let fixture = fixture();
        let spec = spec("/web", 2);
        track(&fixture, instance_in(&spec, Condition::Running, 1));
        track(&fixture, instance_in(&spec, Condition::Staging, 2));

        fixture.actions.scale(&spec).await.unwrap();

        assert!(fixture.queue.adds().is_empty());
        assert!(fixture.queue.purges().is_empty());
        assert!(fixture.kill.kills().is_empty());
    }

    #[test]
    fn victims_ignore_non_candidates() {
        let spec = spec("/web", 1);
        let unreachable = instance_in(&spec, Condition::Unreachable, 9);
        let running = instance_in(&spec, Condition::Running, 1);
        let victims = select_victims(
            vec![unreachable, running.clone()],
            2,
            KillSelection::YoungestFirst,
        );
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].instance_id, running.instance_id);
    }

    #[test]
    fn oldest_first_inverts_the_tiebreak() {
        let spec = spec("/web", 1);
        let old = instance_in(&spec, Condition::Running, 1);
        let new = instance_in(&spec, Condition::Running, 9);
        let victims =
            select_victims(vec![old.clone(), new], 1, KillSelection::OldestFirst);
        assert_eq!(victims[0].instance_id, old.instance_id);
    }

    #[tokio::test]
    async fn restart_replaces_old_instances_keeping_the_health_floor() {
        let events = EventBus::default();
        let tracker = Arc::new(InstanceTracker::new(events.clone()));
        let queue = Arc::new(MockLaunchQueue::auto_launching(tracker.clone()));
        let kill = Arc::new(MockKillService::confirming(tracker.clone()));
        let health = Arc::new(HealthCheckManager::new(
            tracker.clone(),
            kill.clone(),
            events.clone(),
        ));
        let actions = SchedulerActions::new(
            tracker.clone(),
            queue.clone(),
            kill.clone(),
            health,
            events,
            SchedulerConfig {
                readiness_poll_millis: 5,
                ..SchedulerConfig::default()
            },
        );

        use berth_core::{UpgradeStrategy, VersionInfo};
        let mut old_spec = spec("/web", 2);
        old_spec.version_info = VersionInfo::for_new_config(Timestamp::at_millis(1000));
        let mut new_spec = old_spec.clone();
        new_spec.cmd = Some("serve --v2".to_string());
        new_spec.version_info = VersionInfo::for_new_config(Timestamp::at_millis(2000));
        new_spec.upgrade_strategy = UpgradeStrategy {
            min_health_capacity: 0.5,
            max_over_capacity: 1.0,
        };

        for since in [1, 2] {
            let mut instance = Instance::ephemeral(old_spec.clone(), 1, Timestamp::at_millis(since));
            for task in instance.tasks.values_mut() {
                task.condition = Condition::Running;
            }
            instance.state.condition = Condition::Running;
            tracker.process(InstanceUpdateOperation::LaunchEphemeral(instance));
        }

        actions.restart(&new_spec).await.unwrap();

        // Every old instance is gone, replaced by the new version.
        let kills = kill.kills();
        assert_eq!(kills.len(), 2);
        assert!(kills.iter().all(|(_, r)| *r == KillReason::RestartingApp));
        let survivors = tracker.spec_instances_sync(&new_spec.id);
        assert_eq!(survivors.len(), 2);
        assert!(survivors
            .iter()
            .all(|i| i.run_spec_version() == new_spec.version()));
        assert_eq!(queue.purges(), vec![new_spec.id.clone()]);
        assert_eq!(queue.adds(), vec![(new_spec.id.clone(), 2)]);
    }

    #[tokio::test]
    async fn stop_on_empty_app_resets_rate_limiter_without_kills() {
        let fixture = fixture();
        let spec = spec("/myapp", 0);

        fixture.actions.stop(&spec).await.unwrap();

        assert_eq!(fixture.queue.purges(), vec![spec.id.clone()]);
        assert_eq!(fixture.queue.resets(), vec![spec.id.clone()]);
        assert!(fixture.kill.kills().is_empty());
    }

    #[tokio::test]
    async fn stop_kills_launched_instances() {
        let fixture = fixture();
        let spec = spec("/web", 2);
        track(&fixture, instance_in(&spec, Condition::Running, 1));
        track(&fixture, instance_in(&spec, Condition::Running, 2));

        fixture.actions.stop(&spec).await.unwrap();

        assert_eq!(fixture.kill.kills().len(), 2);
        assert!(fixture
            .kill
            .kills()
            .iter()
            .all(|(_, reason)| *reason == KillReason::DeletingApp));
    }
}
