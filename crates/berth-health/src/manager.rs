//! The health check manager.
//!
//! Per `(app, version)` set of registered checks plus retained per-task
//! results. Results survive re-registration, so a check that was just
//! re-added after a reconcile immediately exposes the task's prior
//! `last_success` / `last_failure`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use berth_core::{AppId, CoreEvent, EventBus, HealthCheckDef, RunSpec, Timestamp};
use berth_instance::{
    BrokerTaskStatus, Condition, Instance, InstanceTracker, KillReason, KillService, TaskId,
};

/// The last known health of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthResult {
    pub alive: bool,
    pub consecutive_failures: u32,
    pub last_success: Option<Timestamp>,
    pub last_failure: Option<Timestamp>,
}

/// Checks and results of one app.
#[derive(Default)]
struct AppChecks {
    by_version: BTreeMap<Timestamp, Vec<HealthCheckDef>>,
    /// Retained across version re-registration.
    results: HashMap<TaskId, HealthResult>,
}

impl AppChecks {
    fn is_empty(&self) -> bool {
        self.by_version.is_empty() && self.results.is_empty()
    }
}

/// Owns every registered health check and the per-task results.
pub struct HealthCheckManager {
    tracker: Arc<InstanceTracker>,
    kill: Arc<dyn KillService>,
    events: EventBus,
    inner: RwLock<HashMap<AppId, AppChecks>>,
}

impl HealthCheckManager {
    pub fn new(
        tracker: Arc<InstanceTracker>,
        kill: Arc<dyn KillService>,
        events: EventBus,
    ) -> Self {
        HealthCheckManager {
            tracker,
            kill,
            events,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Checks are never dispatched to instances in these conditions.
    pub fn should_dispatch(instance: &Instance) -> bool {
        !matches!(
            instance.state.condition,
            Condition::Staging | Condition::Unreachable | Condition::Gone | Condition::Dropped
        )
    }

    // ── Registration ───────────────────────────────────────────────

    /// Register one check for an app version.
    pub fn add(&self, app_id: &AppId, version: Timestamp, def: HealthCheckDef) {
        let mut inner = self.inner.write().unwrap();
        let checks = inner.entry(app_id.clone()).or_default();
        let list = checks.by_version.entry(version).or_default();
        if list.contains(&def) {
            return;
        }
        list.push(def);
        drop(inner);
        debug!(%app_id, %version, "health check added");
        self.events.publish(CoreEvent::HealthCheckAdded {
            app_id: app_id.clone(),
            version,
        });
    }

    /// Register every check a run spec defines, under the spec's version.
    pub fn add_all_for(&self, spec: &RunSpec) {
        for def in &spec.health_checks {
            self.add(&spec.id, spec.version(), def.clone());
        }
    }

    /// Drop every check and retained result of an app.
    pub fn remove_all_for(&self, app_id: &AppId) {
        let removed = self.inner.write().unwrap().remove(app_id);
        if let Some(checks) = removed {
            for version in checks.by_version.keys() {
                self.events.publish(CoreEvent::HealthCheckRemoved {
                    app_id: app_id.clone(),
                    version: *version,
                });
            }
            info!(%app_id, "health checks removed");
        }
    }

    /// Drop everything (standby).
    pub fn remove_all(&self) {
        let app_ids: Vec<AppId> = self.inner.read().unwrap().keys().cloned().collect();
        for app_id in app_ids {
            self.remove_all_for(&app_id);
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn list(&self, app_id: &AppId) -> Vec<(Timestamp, HealthCheckDef)> {
        let inner = self.inner.read().unwrap();
        inner
            .get(app_id)
            .map(|checks| {
                checks
                    .by_version
                    .iter()
                    .flat_map(|(version, defs)| {
                        defs.iter().map(move |def| (*version, def.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn status(&self, app_id: &AppId, task_id: &TaskId) -> Option<HealthResult> {
        self.inner
            .read()
            .unwrap()
            .get(app_id)
            .and_then(|checks| checks.results.get(task_id).cloned())
    }

    pub fn statuses(&self, app_id: &AppId) -> HashMap<TaskId, HealthResult> {
        self.inner
            .read()
            .unwrap()
            .get(app_id)
            .map(|checks| checks.results.clone())
            .unwrap_or_default()
    }

    // ── Updates ────────────────────────────────────────────────────

    /// Record a health report for a task. Exceeding a check's failure
    /// threshold kills the task's instance, except for unreachable tasks.
    pub async fn update(&self, status: &BrokerTaskStatus, version: &Timestamp) {
        let healthy = match status.healthy {
            Some(healthy) => healthy,
            None => return,
        };
        let instance = match self.tracker.get(&status.task_id.instance_id) {
            Some(instance) => instance,
            None => {
                debug!(task_id = %status.task_id, "health report for untracked instance");
                return;
            }
        };
        if !Self::should_dispatch(&instance) {
            debug!(
                task_id = %status.task_id,
                condition = %instance.state.condition,
                "suppressing health handling"
            );
            return;
        }

        let app_id = instance.app_id().clone();
        let should_kill = {
            let mut inner = self.inner.write().unwrap();
            let checks = match inner.get_mut(&app_id) {
                Some(checks) if checks.by_version.contains_key(version) => checks,
                _ => {
                    debug!(%app_id, %version, "health report for unregistered version");
                    return;
                }
            };
            let result = checks
                .results
                .entry(status.task_id.clone())
                .or_insert(HealthResult {
                    alive: healthy,
                    consecutive_failures: 0,
                    last_success: None,
                    last_failure: None,
                });
            if healthy {
                result.alive = true;
                result.consecutive_failures = 0;
                result.last_success = Some(status.timestamp);
                false
            } else {
                result.alive = false;
                result.consecutive_failures += 1;
                result.last_failure = Some(status.timestamp);
                let failures = result.consecutive_failures;
                checks.by_version[version]
                    .iter()
                    .any(|def| def.max_consecutive_failures > 0
                        && failures >= def.max_consecutive_failures)
            }
        };

        if should_kill {
            warn!(
                task_id = %status.task_id,
                "health check failure threshold reached, killing"
            );
            if let Err(e) = self
                .kill
                .kill_instance(instance, KillReason::FailedHealthChecks)
                .await
            {
                warn!(task_id = %status.task_id, error = %e, "health kill failed");
            }
        }
    }

    /// Reconcile registered checks with the live instance set of an app:
    /// versions with live instances get their spec's checks registered,
    /// versions without live instances are dropped. Retained results are
    /// not touched.
    pub fn reconcile_with(&self, app_id: &AppId) {
        let instances = self.tracker.spec_instances_sync(app_id);

        let mut live_versions: BTreeMap<Timestamp, Vec<HealthCheckDef>> = BTreeMap::new();
        for instance in &instances {
            live_versions
                .entry(instance.run_spec_version())
                .or_insert_with(|| instance.run_spec.health_checks.clone());
        }

        let (to_add, to_remove) = {
            let inner = self.inner.read().unwrap();
            let registered: BTreeSet<Timestamp> = inner
                .get(app_id)
                .map(|checks| checks.by_version.keys().copied().collect())
                .unwrap_or_default();

            let to_add: Vec<(Timestamp, Vec<HealthCheckDef>)> = live_versions
                .iter()
                .filter(|(version, defs)| !registered.contains(*version) && !defs.is_empty())
                .map(|(version, defs)| (*version, defs.clone()))
                .collect();
            let to_remove: Vec<Timestamp> = registered
                .iter()
                .copied()
                .filter(|version| !live_versions.contains_key(version))
                .collect();
            (to_add, to_remove)
        };

        for (version, defs) in to_add {
            for def in defs {
                self.add(app_id, version, def);
            }
        }
        for version in to_remove {
            let mut inner = self.inner.write().unwrap();
            let mut remove_entry = false;
            if let Some(checks) = inner.get_mut(app_id) {
                checks.by_version.remove(&version);
                remove_entry = checks.is_empty() && instances.is_empty();
            }
            if remove_entry {
                inner.remove(app_id);
            }
            drop(inner);
            self.events.publish(CoreEvent::HealthCheckRemoved {
                app_id: app_id.clone(),
                version,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use berth_core::VersionInfo;
    use berth_instance::{
        BrokerTaskState, Instance, InstanceId, InstanceUpdateOperation,
    };

    struct RecordingKillService {
        kills: Mutex<Vec<(InstanceId, KillReason)>>,
    }

    #[async_trait]
    impl KillService for RecordingKillService {
        async fn kill_instances(
            &self,
            instances: Vec<Instance>,
            reason: KillReason,
        ) -> anyhow::Result<()> {
            let mut kills = self.kills.lock().unwrap();
            for instance in instances {
                kills.push((instance.instance_id, reason));
            }
            Ok(())
        }
    }

    struct Fixture {
        tracker: Arc<InstanceTracker>,
        kill: Arc<RecordingKillService>,
        manager: HealthCheckManager,
    }

    fn fixture() -> Fixture {
        let events = EventBus::default();
        let tracker = Arc::new(InstanceTracker::new(events.clone()));
        let kill = Arc::new(RecordingKillService {
            kills: Mutex::new(Vec::new()),
        });
        let manager = HealthCheckManager::new(tracker.clone(), kill.clone(), events);
        Fixture {
            tracker,
            kill,
            manager,
        }
    }

    fn checked_spec(id: &str, millis: i64) -> RunSpec {
        let mut spec = RunSpec::new(AppId::parse(id).unwrap(), 1);
        spec.health_checks.push(HealthCheckDef {
            max_consecutive_failures: 2,
            ..HealthCheckDef::default()
        });
        spec.version_info = VersionInfo::for_new_config(Timestamp::at_millis(millis));
        spec
    }

    fn launch(fixture: &Fixture, spec: &RunSpec, condition: Condition) -> Instance {
        let mut instance = Instance::ephemeral(spec.clone(), 1, Timestamp::at_millis(0));
        for task in instance.tasks.values_mut() {
            task.condition = condition;
        }
        instance.state.condition = condition;
        fixture
            .tracker
            .process(InstanceUpdateOperation::LaunchEphemeral(instance.clone()));
        instance
    }

    fn unhealthy(instance: &Instance, millis: i64) -> BrokerTaskStatus {
        let task_id = instance.tasks.keys().next().unwrap().clone();
        let mut status =
            BrokerTaskStatus::new(task_id, BrokerTaskState::Running, Timestamp::at_millis(millis));
        status.healthy = Some(false);
        status
    }

    #[test]
    fn reconcile_registers_live_versions() {
        let fixture = fixture();
        let spec = checked_spec("/web", 1000);
        launch(&fixture, &spec, Condition::Running);

        fixture.manager.reconcile_with(&spec.id);
        assert_eq!(fixture.manager.list(&spec.id).len(), 1);

        // Idempotent.
        fixture.manager.reconcile_with(&spec.id);
        assert_eq!(fixture.manager.list(&spec.id).len(), 1);
    }

    #[test]
    fn reconcile_drops_dead_versions() {
        let fixture = fixture();
        let spec = checked_spec("/web", 1000);
        fixture.manager.add_all_for(&spec);
        assert_eq!(fixture.manager.list(&spec.id).len(), 1);

        // No live instances left.
        fixture.manager.reconcile_with(&spec.id);
        assert!(fixture.manager.list(&spec.id).is_empty());
    }

    #[tokio::test]
    async fn results_survive_reregistration() {
        let fixture = fixture();
        let spec = checked_spec("/web", 1000);
        let instance = launch(&fixture, &spec, Condition::Running);
        fixture.manager.add_all_for(&spec);

        fixture
            .manager
            .update(&unhealthy(&instance, 500), &spec.version())
            .await;
        let task_id = instance.tasks.keys().next().unwrap().clone();
        let before = fixture.manager.status(&spec.id, &task_id).unwrap();
        assert_eq!(before.consecutive_failures, 1);
        assert_eq!(before.last_failure, Some(Timestamp::at_millis(500)));

        // Re-register the version; the retained result is still exposed.
        fixture.manager.reconcile_with(&spec.id);
        let after = fixture.manager.status(&spec.id, &task_id).unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn threshold_crossing_kills_instance() {
        let fixture = fixture();
        let spec = checked_spec("/web", 1000);
        let instance = launch(&fixture, &spec, Condition::Running);
        fixture.manager.add_all_for(&spec);

        fixture
            .manager
            .update(&unhealthy(&instance, 1), &spec.version())
            .await;
        assert!(fixture.kill.kills.lock().unwrap().is_empty());

        fixture
            .manager
            .update(&unhealthy(&instance, 2), &spec.version())
            .await;
        let kills = fixture.kill.kills.lock().unwrap();
        assert_eq!(kills.len(), 1);
        assert_eq!(kills[0].1, KillReason::FailedHealthChecks);
    }

    #[tokio::test]
    async fn recovery_resets_the_failure_streak() {
        let fixture = fixture();
        let spec = checked_spec("/web", 1000);
        let instance = launch(&fixture, &spec, Condition::Running);
        fixture.manager.add_all_for(&spec);

        fixture
            .manager
            .update(&unhealthy(&instance, 1), &spec.version())
            .await;
        let mut healthy = unhealthy(&instance, 2);
        healthy.healthy = Some(true);
        fixture.manager.update(&healthy, &spec.version()).await;
        fixture
            .manager
            .update(&unhealthy(&instance, 3), &spec.version())
            .await;

        assert!(fixture.kill.kills.lock().unwrap().is_empty());
        let task_id = instance.tasks.keys().next().unwrap().clone();
        let result = fixture.manager.status(&spec.id, &task_id).unwrap();
        assert_eq!(result.consecutive_failures, 1);
        assert_eq!(result.last_success, Some(Timestamp::at_millis(2)));
    }

    #[tokio::test]
    async fn no_dispatch_to_staging_or_unreachable() {
        let fixture = fixture();
        let spec = checked_spec("/web", 1000);
        fixture.manager.add_all_for(&spec);

        for condition in [
            Condition::Staging,
            Condition::Unreachable,
            Condition::Gone,
            Condition::Dropped,
        ] {
            let instance = launch(&fixture, &spec, condition);
            assert!(!HealthCheckManager::should_dispatch(&instance));

            // Even a failing report must not count or kill.
            fixture
                .manager
                .update(&unhealthy(&instance, 1), &spec.version())
                .await;
            fixture
                .manager
                .update(&unhealthy(&instance, 2), &spec.version())
                .await;
        }
        assert!(fixture.kill.kills.lock().unwrap().is_empty());
    }

    #[test]
    fn remove_all_clears_every_app() {
        let fixture = fixture();
        fixture.manager.add_all_for(&checked_spec("/a", 1000));
        fixture.manager.add_all_for(&checked_spec("/b", 1000));

        fixture.manager.remove_all();
        assert!(fixture.manager.list(&AppId::parse("/a").unwrap()).is_empty());
        assert!(fixture.manager.list(&AppId::parse("/b").unwrap()).is_empty());
    }
}
