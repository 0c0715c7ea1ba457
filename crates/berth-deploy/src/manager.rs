//! The deployment manager.
//!
//! One actor task owning `plan id → running worker`. The manager registers
//! plans, spawns workers, resolves conflicts between overlapping plans, and
//! enforces cancellation. Outcomes are reported on the event bus and on the
//! notify channel handed in at spawn time (the scheduler actor listens
//! there to release its locks).

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use berth_core::{AppId, CoreEvent, DeploymentPlan, EventBus};

use crate::error::DeploymentError;
use crate::worker;
use crate::DeploymentActions;

/// Outcome of a deployment, delivered on the notify channel.
#[derive(Debug)]
pub enum DeploymentEvent {
    Finished(DeploymentPlan),
    Failed(DeploymentPlan, DeploymentError),
}

/// A running plan with its step progress.
#[derive(Debug, Clone)]
pub struct RunningDeployment {
    pub plan: DeploymentPlan,
    pub current_step: usize,
    pub total_steps: usize,
}

enum Command {
    Perform(DeploymentPlan),
    Cancel {
        plan_id: String,
        reply: oneshot::Sender<bool>,
    },
    CancelConflicting(BTreeSet<AppId>),
    StopAll {
        reply: oneshot::Sender<()>,
    },
    Running {
        reply: oneshot::Sender<Vec<RunningDeployment>>,
    },
    WorkerDone {
        plan_id: String,
        result: Result<(), DeploymentError>,
    },
}

struct Entry {
    plan: DeploymentPlan,
    cancel_tx: watch::Sender<bool>,
    progress: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

/// Spawns and owns the manager actor task.
pub struct DeploymentManager {
    actions: Arc<dyn DeploymentActions>,
    events: EventBus,
    notify: mpsc::Sender<DeploymentEvent>,
    running: HashMap<String, Entry>,
    self_tx: mpsc::Sender<Command>,
}

impl DeploymentManager {
    /// Spawn the manager; the returned handle is the only way to talk to it.
    /// Outcomes are sent to `notify`.
    pub fn spawn(
        actions: Arc<dyn DeploymentActions>,
        events: EventBus,
        notify: mpsc::Sender<DeploymentEvent>,
    ) -> DeploymentManagerHandle {
        let (tx, mut rx) = mpsc::channel(64);
        let mut manager = DeploymentManager {
            actions,
            events,
            notify,
            running: HashMap::new(),
            self_tx: tx.clone(),
        };
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                manager.handle(command).await;
            }
            debug!("deployment manager stopped");
        });
        DeploymentManagerHandle { tx }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Perform(plan) => self.perform(plan),
            Command::Cancel { plan_id, reply } => {
                let known = self.cancel(&plan_id);
                let _ = reply.send(known);
            }
            Command::CancelConflicting(affected) => {
                let conflicting: Vec<String> = self
                    .running
                    .values()
                    .filter(|entry| {
                        !entry
                            .plan
                            .affected_run_spec_ids()
                            .is_disjoint(&affected)
                    })
                    .map(|entry| entry.plan.id.clone())
                    .collect();
                for plan_id in conflicting {
                    info!(%plan_id, "canceling conflicting deployment");
                    self.cancel(&plan_id);
                }
            }
            Command::StopAll { reply } => {
                for (plan_id, entry) in self.running.drain() {
                    debug!(%plan_id, "stopping deployment");
                    let _ = entry.cancel_tx.send(true);
                    entry.handle.abort();
                }
                let _ = reply.send(());
            }
            Command::Running { reply } => {
                let running = self
                    .running
                    .values()
                    .map(|entry| RunningDeployment {
                        plan: entry.plan.clone(),
                        current_step: entry.progress.load(Ordering::Relaxed),
                        total_steps: entry.plan.steps.len(),
                    })
                    .collect();
                let _ = reply.send(running);
            }
            Command::WorkerDone { plan_id, result } => self.worker_done(plan_id, result).await,
        }
    }

    fn perform(&mut self, plan: DeploymentPlan) {
        if self.running.contains_key(&plan.id) {
            warn!(plan_id = %plan.id, "deployment already running, ignoring");
            return;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let progress = Arc::new(AtomicUsize::new(0));
        let actions = Arc::clone(&self.actions);
        let self_tx = self.self_tx.clone();
        let worker_plan = plan.clone();
        let worker_progress = Arc::clone(&progress);

        let handle = tokio::spawn(async move {
            let plan_id = worker_plan.id.clone();
            let result = worker::run(worker_plan, actions, cancel_rx, worker_progress).await;
            let _ = self_tx.send(Command::WorkerDone { plan_id, result }).await;
        });

        info!(plan_id = %plan.id, "deployment registered");
        self.running.insert(
            plan.id.clone(),
            Entry {
                plan,
                cancel_tx,
                progress,
                handle,
            },
        );
    }

    fn cancel(&mut self, plan_id: &str) -> bool {
        match self.running.get(plan_id) {
            Some(entry) => {
                let _ = entry.cancel_tx.send(true);
                true
            }
            None => false,
        }
    }

    async fn worker_done(&mut self, plan_id: String, result: Result<(), DeploymentError>) {
        let entry = match self.running.remove(&plan_id) {
            Some(entry) => entry,
            None => {
                // Stopped via StopAll; nothing left to report.
                debug!(%plan_id, "late worker result for unregistered deployment");
                return;
            }
        };

        match result {
            Ok(()) => {
                info!(%plan_id, "deployment succeeded");
                self.events
                    .publish(CoreEvent::DeploymentSuccess { plan_id });
                let _ = self
                    .notify
                    .send(DeploymentEvent::Finished(entry.plan))
                    .await;
            }
            Err(error) => {
                warn!(%plan_id, %error, "deployment failed");
                self.events.publish(CoreEvent::DeploymentFailed {
                    plan_id,
                    reason: error.to_string(),
                });
                let _ = self
                    .notify
                    .send(DeploymentEvent::Failed(entry.plan, error))
                    .await;
            }
        }
    }
}

/// Cheap-to-clone handle on the manager actor.
#[derive(Clone)]
pub struct DeploymentManagerHandle {
    tx: mpsc::Sender<Command>,
}

impl DeploymentManagerHandle {
    /// Register and start executing a plan. The outcome arrives on the
    /// notify channel.
    pub async fn perform(&self, plan: DeploymentPlan) {
        let _ = self.tx.send(Command::Perform(plan)).await;
    }

    /// Request cancellation. Returns false for unknown plans; the
    /// `DeploymentEvent::Failed(_, Canceled)` outcome follows once the
    /// worker has terminated.
    pub async fn cancel(&self, plan_id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::Cancel {
                plan_id: plan_id.to_string(),
                reply,
            })
            .await;
        rx.await.unwrap_or(false)
    }

    /// Cancel every running plan whose affected apps overlap `affected`.
    pub async fn cancel_conflicting(&self, affected: BTreeSet<AppId>) {
        let _ = self.tx.send(Command::CancelConflicting(affected)).await;
    }

    /// Cancel everything and clear the table (standby). Workers are
    /// aborted; no outcomes are reported.
    pub async fn stop_all(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::StopAll { reply }).await;
        let _ = rx.await;
    }

    /// Running plans with per-step progress.
    pub async fn running(&self) -> Vec<RunningDeployment> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Running { reply }).await;
        rx.await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use berth_core::{Group, RunSpec, Timestamp};

    /// Actions that record calls; `block_ready` makes readiness pend forever.
    struct TestActions {
        calls: Mutex<Vec<String>>,
        block_ready: bool,
    }

    #[async_trait]
    impl DeploymentActions for TestActions {
        async fn start_app(&self, spec: &RunSpec, scale_to: u32) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("start {} {scale_to}", spec.id));
            Ok(())
        }

        async fn scale_app(&self, spec: &RunSpec, scale_to: u32) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("scale {} {scale_to}", spec.id));
            Ok(())
        }

        async fn restart_app(&self, spec: &RunSpec) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("restart {}", spec.id));
            Ok(())
        }

        async fn stop_app(&self, spec: &RunSpec) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("stop {}", spec.id));
            Ok(())
        }

        async fn wait_for_ready(&self, _spec: &RunSpec, _target: u32) -> anyhow::Result<()> {
            if self.block_ready {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    fn plan_for(apps: &[(&str, u32)]) -> DeploymentPlan {
        let mut target = Group::empty_root(Timestamp::at_millis(1));
        for (id, instances) in apps {
            target.put_app(RunSpec::new(
                berth_core::AppId::parse(id).unwrap(),
                *instances,
            ));
        }
        DeploymentPlan::compute(
            Group::empty_root(Timestamp::at_millis(0)),
            target,
            Timestamp::at_millis(1),
        )
    }

    struct Fixture {
        handle: DeploymentManagerHandle,
        notify_rx: mpsc::Receiver<DeploymentEvent>,
        actions: Arc<TestActions>,
    }

    fn fixture(block_ready: bool) -> Fixture {
        let actions = Arc::new(TestActions {
            calls: Mutex::new(Vec::new()),
            block_ready,
        });
        let (notify_tx, notify_rx) = mpsc::channel(16);
        let handle = DeploymentManager::spawn(actions.clone(), EventBus::default(), notify_tx);
        Fixture {
            handle,
            notify_rx,
            actions,
        }
    }

    #[tokio::test]
    async fn plan_runs_to_completion() {
        let mut fixture = fixture(false);
        let plan = plan_for(&[("/web", 3)]);
        let plan_id = plan.id.clone();

        fixture.handle.perform(plan).await;

        match fixture.notify_rx.recv().await.unwrap() {
            DeploymentEvent::Finished(done) => assert_eq!(done.id, plan_id),
            other => panic!("expected Finished, got {other:?}"),
        }
        assert_eq!(
            *fixture.actions.calls.lock().unwrap(),
            vec!["start /web 3".to_string()]
        );
        assert!(fixture.handle.running().await.is_empty());
    }

    #[tokio::test]
    async fn cancel_yields_canceled_failure() {
        let mut fixture = fixture(true);
        let plan = plan_for(&[("/web", 3)]);
        let plan_id = plan.id.clone();

        fixture.handle.perform(plan).await;

        // Worker is pending in the readiness wait now.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fixture.handle.running().await.len(), 1);

        assert!(fixture.handle.cancel(&plan_id).await);
        match fixture.notify_rx.recv().await.unwrap() {
            DeploymentEvent::Failed(done, DeploymentError::Canceled) => {
                assert_eq!(done.id, plan_id)
            }
            other => panic!("expected Canceled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_of_unknown_plan_is_reported() {
        let fixture = fixture(false);
        assert!(!fixture.handle.cancel("no-such-plan").await);
    }

    #[tokio::test]
    async fn conflicting_plans_are_canceled() {
        let mut fixture = fixture(true);
        let web = plan_for(&[("/web", 3)]);
        let web_id = web.id.clone();
        let db = plan_for(&[("/db", 1)]);

        fixture.handle.perform(web).await;
        fixture.handle.perform(db).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let affected: BTreeSet<AppId> =
            [AppId::parse("/web").unwrap()].into_iter().collect();
        fixture.handle.cancel_conflicting(affected).await;

        match fixture.notify_rx.recv().await.unwrap() {
            DeploymentEvent::Failed(done, DeploymentError::Canceled) => {
                assert_eq!(done.id, web_id)
            }
            other => panic!("expected Canceled /web, got {other:?}"),
        }
        // The disjoint plan keeps running.
        assert_eq!(fixture.handle.running().await.len(), 1);
    }

    #[tokio::test]
    async fn stop_all_clears_the_table() {
        let fixture = fixture(true);
        fixture.handle.perform(plan_for(&[("/a", 1)])).await;
        fixture.handle.perform(plan_for(&[("/b", 1)])).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        fixture.handle.stop_all().await;
        assert!(fixture.handle.running().await.is_empty());
    }

    #[tokio::test]
    async fn running_reports_step_progress() {
        let mut fixture = fixture(true);
        let plan = plan_for(&[("/web", 2)]);
        fixture.handle.perform(plan).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let running = fixture.handle.running().await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].total_steps, 1);
        assert_eq!(running[0].current_step, 0);
        fixture.handle.cancel(&running[0].plan.id).await;
        assert!(matches!(
            fixture.notify_rx.recv().await,
            Some(DeploymentEvent::Failed(_, DeploymentError::Canceled))
        ));
    }
}
