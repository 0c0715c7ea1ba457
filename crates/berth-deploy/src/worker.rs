//! The per-deployment worker.
//!
//! Walks the plan's steps in declared order. Every action and readiness
//! wait races against the cancel signal; a canceled worker stops at the
//! next await point and reports `DeploymentError::Canceled`.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use berth_core::{DeploymentAction, DeploymentPlan};

use crate::error::{DeploymentError, DeploymentResult};
use crate::DeploymentActions;

pub(crate) async fn run(
    plan: DeploymentPlan,
    actions: Arc<dyn DeploymentActions>,
    mut cancel: watch::Receiver<bool>,
    progress: Arc<AtomicUsize>,
) -> DeploymentResult<()> {
    info!(plan_id = %plan.id, steps = plan.steps.len(), "deployment starting");

    for (index, step) in plan.steps.iter().enumerate() {
        progress.store(index, Ordering::Relaxed);
        debug!(plan_id = %plan.id, step = index, "running step");

        for action in &step.actions {
            run_action(action, actions.as_ref(), &mut cancel).await?;
        }
    }

    progress.store(plan.steps.len(), Ordering::Relaxed);
    info!(plan_id = %plan.id, "deployment finished");
    Ok(())
}

async fn run_action(
    action: &DeploymentAction,
    actions: &dyn DeploymentActions,
    cancel: &mut watch::Receiver<bool>,
) -> DeploymentResult<()> {
    match action {
        DeploymentAction::Start { run_spec, scale_to } => {
            cancellable(cancel, actions.start_app(run_spec, *scale_to)).await?;
            cancellable(cancel, actions.wait_for_ready(run_spec, *scale_to)).await
        }
        DeploymentAction::Scale { run_spec, scale_to } => {
            cancellable(cancel, actions.scale_app(run_spec, *scale_to)).await?;
            cancellable(cancel, actions.wait_for_ready(run_spec, *scale_to)).await
        }
        DeploymentAction::Restart { run_spec } => {
            cancellable(cancel, actions.restart_app(run_spec)).await?;
            cancellable(cancel, actions.wait_for_ready(run_spec, run_spec.instances)).await
        }
        DeploymentAction::Stop { run_spec } => {
            cancellable(cancel, actions.stop_app(run_spec)).await
        }
    }
}

/// Race a step future against the cancel signal. A dropped sender counts
/// as cancellation: the manager is gone and nobody waits for this worker.
async fn cancellable<F>(
    cancel: &mut watch::Receiver<bool>,
    fut: F,
) -> DeploymentResult<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    if *cancel.borrow() {
        return Err(DeploymentError::Canceled);
    }
    tokio::select! {
        _ = cancel.changed() => Err(DeploymentError::Canceled),
        result = fut => result.map_err(|e| DeploymentError::StepFailed(e.to_string())),
    }
}
