//! The scheduler actor.
//!
//! The single, process-wide, leader-only coordinator. One task consumes the
//! command channel; commands are handled strictly in arrival order, so the
//! lock table and mode state need no further synchronization. Long-running
//! work (scaling, killing, reconciliation, deployments) runs in spawned
//! tasks that report back via self-messages; locks are released in those
//! self-messages, strictly before the caller's answer is sent.
//!
//! Modes: suspended (standby, commands are stashed) → started (leader) →
//! awaiting-cancellation (a forced deploy waits for conflicting
//! deployments to cancel).

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use berth_core::{AppId, CoreEvent, DeploymentPlan, EventBus};
use berth_deploy::{
    DeploymentError, DeploymentEvent, DeploymentManager, DeploymentManagerHandle,
    RunningDeployment,
};
use berth_health::HealthCheckManager;
use berth_instance::{BrokerDriver, InstanceId, InstanceTracker, KillReason, KillService};
use berth_state::{GroupRepository, PersistentStore};

use crate::actions::SchedulerActions;
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::launch_queue::LaunchQueue;
use crate::reconcile;

/// Leader-election signal, provided by the (external) election machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderEvent {
    ElectedAsLeader,
    Standby,
}

/// Answers to scheduler commands.
#[derive(Debug)]
pub enum SchedulerReply {
    TasksReconciled,
    AppScaled(AppId),
    TasksKilled {
        app_id: AppId,
        instance_ids: Vec<String>,
    },
    DeploymentStarted {
        plan_id: String,
    },
    DeploymentFailed {
        plan_id: String,
    },
    RunningDeployments(Vec<RunningDeployment>),
    CommandFailed(SchedulerError),
}

type Reply = oneshot::Sender<SchedulerReply>;

/// Commands processed by the actor, FIFO. The `reply`-less forms are used
/// for self-issued work (periodic scaling, deployment recovery).
pub enum SchedulerCommand {
    Leader(LeaderEvent),
    ReconcileTasks { reply: Option<Reply> },
    ReconcileHealthChecks,
    ScaleApps,
    ScaleApp { app_id: AppId, reply: Option<Reply> },
    Deploy {
        plan: DeploymentPlan,
        force: bool,
        reply: Option<Reply>,
    },
    CancelDeployment { plan_id: String, reply: Reply },
    KillInstances {
        app_id: AppId,
        instance_ids: Vec<InstanceId>,
        reply: Option<Reply>,
    },
    RetrieveRunningDeployments { reply: Reply },

    // Self-messages. Lock releases happen here, before any answer goes out.
    AppScaled { app_id: AppId },
    InstancesKilled { app_id: AppId },
    ReconcileFinished { result: Result<(), String> },
    DeploymentFinished { plan: DeploymentPlan },
    DeploymentFailedSignal {
        plan: DeploymentPlan,
        error: DeploymentError,
    },
    CancellationTimedOut { token: u64 },
}

impl SchedulerCommand {
    /// Completion signals that are meaningless outside the mode that
    /// produced them; dropped instead of stashed while suspended.
    fn is_completion_signal(&self) -> bool {
        matches!(
            self,
            SchedulerCommand::AppScaled { .. }
                | SchedulerCommand::InstancesKilled { .. }
                | SchedulerCommand::ReconcileFinished { .. }
                | SchedulerCommand::DeploymentFinished { .. }
                | SchedulerCommand::DeploymentFailedSignal { .. }
                | SchedulerCommand::CancellationTimedOut { .. }
        )
    }
}

enum Mode {
    Suspended,
    Started,
    AwaitingCancellation {
        plan: DeploymentPlan,
        reply: Option<Reply>,
        timer: JoinHandle<()>,
        token: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModeKind {
    Suspended,
    Started,
    Awaiting,
}

impl Mode {
    fn kind(&self) -> ModeKind {
        match self {
            Mode::Suspended => ModeKind::Suspended,
            Mode::Started => ModeKind::Started,
            Mode::AwaitingCancellation { .. } => ModeKind::Awaiting,
        }
    }
}

pub struct SchedulerActor {
    actions: Arc<SchedulerActions>,
    repo: Arc<GroupRepository>,
    store: PersistentStore,
    tracker: Arc<InstanceTracker>,
    driver: Arc<dyn BrokerDriver>,
    kill: Arc<dyn KillService>,
    health: Arc<HealthCheckManager>,
    deployments: DeploymentManagerHandle,
    events: EventBus,
    config: SchedulerConfig,
    self_tx: mpsc::Sender<SchedulerCommand>,

    mode: Mode,
    locks: HashSet<AppId>,
    stash: VecDeque<SchedulerCommand>,
    reconciling: bool,
    reconcile_waiters: Vec<Reply>,
    cancel_waiters: HashMap<String, Vec<Reply>>,
    token_counter: u64,
}

impl SchedulerActor {
    /// Wire up the actor and its deployment manager; returns the command
    /// handle. The actor starts suspended and waits for `ElectedAsLeader`.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: SchedulerConfig,
        store: PersistentStore,
        repo: Arc<GroupRepository>,
        tracker: Arc<InstanceTracker>,
        driver: Arc<dyn BrokerDriver>,
        queue: Arc<dyn LaunchQueue>,
        kill: Arc<dyn KillService>,
        health: Arc<HealthCheckManager>,
        events: EventBus,
    ) -> SchedulerHandle {
        let actions = Arc::new(SchedulerActions::new(
            Arc::clone(&tracker),
            queue,
            Arc::clone(&kill),
            Arc::clone(&health),
            events.clone(),
            config.clone(),
        ));

        let (notify_tx, mut notify_rx) = mpsc::channel::<DeploymentEvent>(64);
        let deployments = DeploymentManager::spawn(
            Arc::clone(&actions) as Arc<dyn berth_deploy::DeploymentActions>,
            events.clone(),
            notify_tx,
        );

        let (tx, rx) = mpsc::channel(256);

        // Forward deployment outcomes into the command stream.
        let forward_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = notify_rx.recv().await {
                let command = match event {
                    DeploymentEvent::Finished(plan) => {
                        SchedulerCommand::DeploymentFinished { plan }
                    }
                    DeploymentEvent::Failed(plan, error) => {
                        SchedulerCommand::DeploymentFailedSignal { plan, error }
                    }
                };
                if forward_tx.send(command).await.is_err() {
                    break;
                }
            }
        });

        let actor = SchedulerActor {
            actions,
            repo,
            store,
            tracker,
            driver,
            kill,
            health,
            deployments,
            events,
            config,
            self_tx: tx.clone(),
            mode: Mode::Suspended,
            locks: HashSet::new(),
            stash: VecDeque::new(),
            reconciling: false,
            reconcile_waiters: Vec::new(),
            cancel_waiters: HashMap::new(),
            token_counter: 0,
        };
        tokio::spawn(actor.run(rx));
        SchedulerHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SchedulerCommand>) {
        while let Some(command) = rx.recv().await {
            self.handle(command).await;
        }
        debug!("scheduler actor stopped");
    }

    async fn handle(&mut self, command: SchedulerCommand) {
        match self.mode.kind() {
            ModeKind::Suspended => match command {
                SchedulerCommand::Leader(event) => self.leader_event(event).await,
                other if other.is_completion_signal() => {
                    debug!("dropping completion signal while suspended");
                }
                other => self.stash.push_back(other),
            },
            ModeKind::Awaiting => match command {
                SchedulerCommand::Leader(event) => self.leader_event(event).await,
                SchedulerCommand::DeploymentFinished { plan } => {
                    self.deployment_finished(plan).await;
                    self.resume_pending().await;
                }
                SchedulerCommand::DeploymentFailedSignal { plan, error } => {
                    self.deployment_failed(plan, error).await;
                    self.resume_pending().await;
                }
                SchedulerCommand::CancellationTimedOut { token } => {
                    self.cancellation_timed_out(token).await;
                }
                SchedulerCommand::AppScaled { app_id } => {
                    self.locks.remove(&app_id);
                }
                SchedulerCommand::InstancesKilled { app_id } => {
                    self.locks.remove(&app_id);
                }
                SchedulerCommand::ReconcileFinished { result } => {
                    self.reconcile_finished(result);
                }
                other => self.stash.push_back(other),
            },
            ModeKind::Started => self.handle_started(command).await,
        }
    }

    async fn handle_started(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Leader(event) => self.leader_event(event).await,
            SchedulerCommand::ReconcileTasks { reply } => self.reconcile_tasks(reply),
            SchedulerCommand::ReconcileHealthChecks => self.reconcile_health_checks(),
            SchedulerCommand::ScaleApps => self.scale_apps(),
            SchedulerCommand::ScaleApp { app_id, reply } => self.scale_app(app_id, reply),
            SchedulerCommand::Deploy { plan, force, reply } => {
                self.deploy(plan, force, reply).await
            }
            SchedulerCommand::CancelDeployment { plan_id, reply } => {
                self.cancel_deployment(plan_id, reply).await
            }
            SchedulerCommand::KillInstances {
                app_id,
                instance_ids,
                reply,
            } => self.kill_instances(app_id, instance_ids, reply),
            SchedulerCommand::RetrieveRunningDeployments { reply } => {
                let running = self.deployments.running().await;
                let _ = reply.send(SchedulerReply::RunningDeployments(running));
            }
            SchedulerCommand::AppScaled { app_id } => {
                self.locks.remove(&app_id);
            }
            SchedulerCommand::InstancesKilled { app_id } => {
                self.locks.remove(&app_id);
            }
            SchedulerCommand::ReconcileFinished { result } => self.reconcile_finished(result),
            SchedulerCommand::DeploymentFinished { plan } => {
                self.deployment_finished(plan).await
            }
            SchedulerCommand::DeploymentFailedSignal { plan, error } => {
                self.deployment_failed(plan, error).await
            }
            SchedulerCommand::CancellationTimedOut { .. } => {
                // Stale timer from an earlier forced deploy.
            }
        }
    }

    // ── Leadership ─────────────────────────────────────────────────

    async fn leader_event(&mut self, event: LeaderEvent) {
        match (event, self.mode.kind()) {
            (LeaderEvent::ElectedAsLeader, ModeKind::Suspended) => {
                info!("elected as leader, recovering deployments");
                self.mode = Mode::Started;
                match self.store.plans() {
                    Ok(plans) => {
                        for plan in plans {
                            // Recovered plans run without an interested sender.
                            Box::pin(self.handle(SchedulerCommand::Deploy {
                                plan,
                                force: false,
                                reply: None,
                            }))
                            .await;
                        }
                    }
                    Err(e) => error!(error = %e, "failed to load persisted deployments"),
                }
                self.unstash().await;
                let _ = self
                    .self_tx
                    .try_send(SchedulerCommand::ReconcileHealthChecks);
            }
            (LeaderEvent::Standby, ModeKind::Suspended) => {}
            (LeaderEvent::ElectedAsLeader, _) => {
                debug!("already leader, ignoring election event");
            }
            (LeaderEvent::Standby, _) => {
                info!("standing by, suspending scheduler");
                let previous = std::mem::replace(&mut self.mode, Mode::Suspended);
                if let Mode::AwaitingCancellation { reply, timer, .. } = previous {
                    timer.abort();
                    if let Some(reply) = reply {
                        let _ = reply
                            .send(SchedulerReply::CommandFailed(SchedulerError::Unavailable));
                    }
                }
                self.health.remove_all();
                self.deployments.stop_all().await;
                self.locks.clear();
                self.reconciling = false;
                self.reconcile_waiters.clear();
                self.cancel_waiters.clear();
            }
        }
    }

    // ── Reconciliation ─────────────────────────────────────────────

    /// At most one reconciliation is in flight; every concurrent caller
    /// shares its result.
    fn reconcile_tasks(&mut self, reply: Option<Reply>) {
        if let Some(reply) = reply {
            self.reconcile_waiters.push(reply);
        }
        if self.reconciling {
            debug!("reconciliation already in flight, joining");
            return;
        }
        self.reconciling = true;

        let driver = Arc::clone(&self.driver);
        let repo = Arc::clone(&self.repo);
        let tracker = Arc::clone(&self.tracker);
        let kill = Arc::clone(&self.kill);
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = reconcile::reconcile_tasks(
                driver.as_ref(),
                &repo,
                &tracker,
                kill.as_ref(),
            )
            .await
            .map_err(|e| e.to_string());
            let _ = self_tx
                .send(SchedulerCommand::ReconcileFinished { result })
                .await;
        });
    }

    fn reconcile_finished(&mut self, result: Result<(), String>) {
        // Cleared before any answer goes out, so the next caller starts a
        // fresh run.
        self.reconciling = false;
        let waiters = std::mem::take(&mut self.reconcile_waiters);
        match result {
            Ok(()) => {
                for waiter in waiters {
                    let _ = waiter.send(SchedulerReply::TasksReconciled);
                }
            }
            Err(message) => {
                warn!(error = %message, "reconciliation failed, stopping driver");
                self.events.publish(CoreEvent::SchedulerDisconnected);
                let driver = Arc::clone(&self.driver);
                tokio::spawn(async move {
                    let _ = driver.stop(true).await;
                });
                for waiter in waiters {
                    let _ = waiter.send(SchedulerReply::CommandFailed(
                        SchedulerError::Broker(message.clone()),
                    ));
                }
            }
        }
    }

    fn reconcile_health_checks(&mut self) {
        match self.repo.ids() {
            Ok(ids) => {
                for app_id in ids {
                    self.health.reconcile_with(&app_id);
                }
            }
            Err(e) => warn!(error = %e, "failed to list apps for health reconcile"),
        }
    }

    // ── Scaling and killing ────────────────────────────────────────

    fn scale_apps(&mut self) {
        let ids = match self.repo.ids() {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "failed to list apps for scale pass");
                return;
            }
        };
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            for app_id in ids {
                let _ = self_tx
                    .send(SchedulerCommand::ScaleApp {
                        app_id,
                        reply: None,
                    })
                    .await;
            }
        });
    }

    fn scale_app(&mut self, app_id: AppId, reply: Option<Reply>) {
        if !self.try_lock(&single(&app_id)) {
            if let Some(reply) = reply {
                let _ = reply.send(SchedulerReply::CommandFailed(SchedulerError::AppLocked(
                    Vec::new(),
                )));
            }
            return;
        }

        let actions = Arc::clone(&self.actions);
        let repo = Arc::clone(&self.repo);
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = match repo.get(&app_id) {
                Ok(Some(spec)) => actions
                    .scale(&spec)
                    .await
                    .map_err(|e| SchedulerError::Broker(e.to_string())),
                Ok(None) => {
                    debug!(%app_id, "app gone, nothing to scale");
                    Ok(())
                }
                Err(e) => Err(SchedulerError::Store(e)),
            };
            let _ = self_tx
                .send(SchedulerCommand::AppScaled {
                    app_id: app_id.clone(),
                })
                .await;
            if let Some(reply) = reply {
                let _ = reply.send(match result {
                    Ok(()) => SchedulerReply::AppScaled(app_id),
                    Err(e) => SchedulerReply::CommandFailed(e),
                });
            }
        });
    }

    fn kill_instances(
        &mut self,
        app_id: AppId,
        instance_ids: Vec<InstanceId>,
        reply: Option<Reply>,
    ) {
        if !self.try_lock(&single(&app_id)) {
            if let Some(reply) = reply {
                let _ = reply.send(SchedulerReply::CommandFailed(SchedulerError::AppLocked(
                    Vec::new(),
                )));
            }
            return;
        }

        let actions = Arc::clone(&self.actions);
        let repo = Arc::clone(&self.repo);
        let tracker = Arc::clone(&self.tracker);
        let kill = Arc::clone(&self.kill);
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let instances: Vec<_> = instance_ids
                .iter()
                .filter_map(|id| tracker.get(id))
                .collect();
            let killed: Vec<String> =
                instances.iter().map(|i| i.instance_id.to_string()).collect();

            let mut result = kill
                .kill_instances(instances, KillReason::KillingTasksViaApi)
                .await
                .map_err(|e| SchedulerError::Broker(e.to_string()));
            if result.is_ok() {
                // Killing frees capacity; scale back towards the target.
                result = match repo.get(&app_id) {
                    Ok(Some(spec)) => actions
                        .scale(&spec)
                        .await
                        .map_err(|e| SchedulerError::Broker(e.to_string())),
                    Ok(None) => Ok(()),
                    Err(e) => Err(SchedulerError::Store(e)),
                };
            }

            let _ = self_tx
                .send(SchedulerCommand::InstancesKilled {
                    app_id: app_id.clone(),
                })
                .await;
            if let Some(reply) = reply {
                let _ = reply.send(match result {
                    Ok(()) => SchedulerReply::TasksKilled {
                        app_id,
                        instance_ids: killed,
                    },
                    Err(e) => SchedulerReply::CommandFailed(e),
                });
            }
        });
    }

    // ── Deployments ────────────────────────────────────────────────

    async fn deploy(&mut self, plan: DeploymentPlan, force: bool, reply: Option<Reply>) {
        let affected = plan.affected_run_spec_ids();
        if self.try_lock(&affected) {
            self.start_deployment(plan, reply).await;
        } else if !force {
            let conflicts = self.conflicting_plan_ids(&affected).await;
            debug!(plan_id = %plan.id, ?conflicts, "deploy refused, apps locked");
            if let Some(reply) = reply {
                let _ = reply.send(SchedulerReply::CommandFailed(SchedulerError::AppLocked(
                    conflicts,
                )));
            }
        } else {
            info!(plan_id = %plan.id, "forcing deploy, canceling conflicting deployments");
            self.deployments.cancel_conflicting(affected).await;
            self.token_counter += 1;
            let token = self.token_counter;
            let timeout = self.config.cancellation_timeout();
            let self_tx = self.self_tx.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = self_tx
                    .send(SchedulerCommand::CancellationTimedOut { token })
                    .await;
            });
            self.mode = Mode::AwaitingCancellation {
                plan,
                reply,
                timer,
                token,
            };
        }
    }

    /// Caller holds the locks for the plan's affected apps. The plan is
    /// persisted before the deployment manager sees it, so a leader
    /// failover never loses it.
    async fn start_deployment(&mut self, plan: DeploymentPlan, reply: Option<Reply>) {
        if let Err(e) = self.store.store_plan(&plan) {
            self.release(&plan.affected_run_spec_ids());
            if let Some(reply) = reply {
                let _ = reply.send(SchedulerReply::CommandFailed(SchedulerError::Store(e)));
            }
            return;
        }
        info!(plan_id = %plan.id, "deployment starting");
        self.events.publish(CoreEvent::DeploymentStarted {
            plan_id: plan.id.clone(),
        });
        let plan_id = plan.id.clone();
        self.deployments.perform(plan).await;
        if let Some(reply) = reply {
            let _ = reply.send(SchedulerReply::DeploymentStarted { plan_id });
        }
    }

    async fn cancel_deployment(&mut self, plan_id: String, reply: Reply) {
        if self.deployments.cancel(&plan_id).await {
            // Answered when the failure signal comes back.
            self.cancel_waiters.entry(plan_id).or_default().push(reply);
        } else {
            let _ = reply.send(SchedulerReply::CommandFailed(
                SchedulerError::DeploymentNotRunning(plan_id),
            ));
        }
    }

    async fn deployment_finished(&mut self, plan: DeploymentPlan) {
        self.release(&plan.affected_run_spec_ids());
        if let Err(e) = self.store.delete_plan(&plan.id) {
            warn!(plan_id = %plan.id, error = %e, "failed to delete finished plan");
        }
        for waiter in self.cancel_waiters.remove(&plan.id).unwrap_or_default() {
            let _ = waiter.send(SchedulerReply::CommandFailed(
                SchedulerError::DeploymentNotRunning(plan.id.clone()),
            ));
        }
    }

    async fn deployment_failed(&mut self, plan: DeploymentPlan, error: DeploymentError) {
        self.release(&plan.affected_run_spec_ids());
        // Canceled plans are deleted; other failures keep the plan for
        // diagnostics.
        if error == DeploymentError::Canceled {
            if let Err(e) = self.store.delete_plan(&plan.id) {
                warn!(plan_id = %plan.id, error = %e, "failed to delete canceled plan");
            }
        }
        for waiter in self.cancel_waiters.remove(&plan.id).unwrap_or_default() {
            let _ = waiter.send(SchedulerReply::DeploymentFailed {
                plan_id: plan.id.clone(),
            });
        }
    }

    /// In awaiting-cancellation: once the pending plan's apps are free,
    /// run it and return to started.
    async fn resume_pending(&mut self) {
        let free = match &self.mode {
            Mode::AwaitingCancellation { plan, .. } => {
                self.lockable(&plan.affected_run_spec_ids())
            }
            _ => return,
        };
        if !free {
            return;
        }
        if let Mode::AwaitingCancellation {
            plan, reply, timer, ..
        } = std::mem::replace(&mut self.mode, Mode::Started)
        {
            timer.abort();
            info!(plan_id = %plan.id, "conflicts cleared, starting forced deploy");
            let affected = plan.affected_run_spec_ids();
            self.try_lock(&affected);
            self.start_deployment(plan, reply).await;
            self.unstash().await;
        }
    }

    async fn cancellation_timed_out(&mut self, token: u64) {
        let matches = matches!(
            &self.mode,
            Mode::AwaitingCancellation { token: active, .. } if *active == token
        );
        if !matches {
            return;
        }
        if let Mode::AwaitingCancellation { plan, reply, .. } =
            std::mem::replace(&mut self.mode, Mode::Started)
        {
            warn!(plan_id = %plan.id, "conflicting deployments did not cancel in time");
            if let Some(reply) = reply {
                let _ = reply.send(SchedulerReply::CommandFailed(
                    SchedulerError::CancellationTimeout,
                ));
            }
        }
        self.unstash().await;
    }

    async fn conflicting_plan_ids(&self, affected: &BTreeSet<AppId>) -> Vec<String> {
        self.deployments
            .running()
            .await
            .into_iter()
            .filter(|running| {
                !running.plan.affected_run_spec_ids().is_disjoint(affected)
            })
            .map(|running| running.plan.id)
            .collect()
    }

    // ── Lock table and stash ───────────────────────────────────────

    fn lockable(&self, ids: &BTreeSet<AppId>) -> bool {
        ids.iter().all(|id| !self.locks.contains(id))
    }

    /// Acquire all of `ids` atomically, or none.
    fn try_lock(&mut self, ids: &BTreeSet<AppId>) -> bool {
        if !self.lockable(ids) {
            return false;
        }
        self.locks.extend(ids.iter().cloned());
        true
    }

    fn release(&mut self, ids: &BTreeSet<AppId>) {
        for id in ids {
            self.locks.remove(id);
        }
    }

    async fn unstash(&mut self) {
        let stashed: Vec<SchedulerCommand> = self.stash.drain(..).collect();
        for command in stashed {
            Box::pin(self.handle(command)).await;
        }
    }
}

fn single(app_id: &AppId) -> BTreeSet<AppId> {
    BTreeSet::from([app_id.clone()])
}

/// Cheap-to-clone handle on the scheduler actor.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub async fn leader_event(&self, event: LeaderEvent) {
        let _ = self.tx.send(SchedulerCommand::Leader(event)).await;
    }

    pub async fn reconcile_tasks(&self) -> SchedulerReply {
        self.request(|reply| SchedulerCommand::ReconcileTasks { reply: Some(reply) })
            .await
    }

    pub async fn reconcile_health_checks(&self) {
        let _ = self.tx.send(SchedulerCommand::ReconcileHealthChecks).await;
    }

    pub async fn scale_apps(&self) {
        let _ = self.tx.send(SchedulerCommand::ScaleApps).await;
    }

    pub async fn scale_app(&self, app_id: AppId) -> SchedulerReply {
        self.request(|reply| SchedulerCommand::ScaleApp {
            app_id,
            reply: Some(reply),
        })
        .await
    }

    pub async fn deploy(&self, plan: DeploymentPlan, force: bool) -> SchedulerReply {
        self.request(|reply| SchedulerCommand::Deploy {
            plan,
            force,
            reply: Some(reply),
        })
        .await
    }

    pub async fn cancel_deployment(&self, plan_id: &str) -> SchedulerReply {
        self.request(|reply| SchedulerCommand::CancelDeployment {
            plan_id: plan_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn kill_instances(
        &self,
        app_id: AppId,
        instance_ids: Vec<InstanceId>,
    ) -> SchedulerReply {
        self.request(|reply| SchedulerCommand::KillInstances {
            app_id,
            instance_ids,
            reply: Some(reply),
        })
        .await
    }

    pub async fn running_deployments(&self) -> SchedulerReply {
        self.request(|reply| SchedulerCommand::RetrieveRunningDeployments { reply })
            .await
    }

    async fn request<F>(&self, command: F) -> SchedulerReply
    where
        F: FnOnce(Reply) -> SchedulerCommand,
    {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(command(reply)).await.is_err() {
            return SchedulerReply::CommandFailed(SchedulerError::Unavailable);
        }
        rx.await
            .unwrap_or(SchedulerReply::CommandFailed(SchedulerError::Unavailable))
    }
}

/// Periodic self-commands: reconciliation and the scale pass. Runs until
/// the returned handle is aborted or the actor goes away.
pub fn spawn_timers(handle: SchedulerHandle, config: &SchedulerConfig) -> JoinHandle<()> {
    let reconcile_every = config.reconcile_interval();
    let scale_every = config.scale_interval();
    tokio::spawn(async move {
        let mut reconcile = tokio::time::interval(reconcile_every);
        let mut scale = tokio::time::interval(scale_every);
        // The first tick of an interval fires immediately; skip it.
        reconcile.tick().await;
        scale.tick().await;
        loop {
            tokio::select! {
                _ = reconcile.tick() => {
                    let _ = handle.reconcile_tasks().await;
                }
                _ = scale.tick() => {
                    handle.scale_apps().await;
                }
            }
        }
    })
}
