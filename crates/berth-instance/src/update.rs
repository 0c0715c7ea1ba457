//! The instance state machine.
//!
//! Every mutation of tracked state is expressed as an
//! `InstanceUpdateOperation` and answered with an `InstanceUpdateEffect`.
//! Effects carry the old and new state so downstream consumers (event
//! emission, acknowledgement) need no second lookup. A refused transition
//! is a `Failure` effect, never a panic: the broker may reissue updates in
//! any order and the core must absorb them.

use thiserror::Error;

use berth_core::Timestamp;

use crate::broker::BrokerTaskStatus;
use crate::condition::Condition;
use crate::instance::{Instance, InstanceId, InstanceState, Task, TaskId};

/// Errors raised when the state machine refuses a transition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InstanceUpdateError {
    #[error("instance {0} does not exist")]
    UnknownInstance(String),

    #[error("instance {0} already exists")]
    AlreadyExists(String),

    #[error("task {0} not found on its instance")]
    UnknownTask(String),

    #[error("task {0} does not belong to the addressed instance")]
    ForeignTask(String),

    #[error("instance {0} is not reserved")]
    NotReserved(String),

    #[error("operation {0} is not supported")]
    Unsupported(&'static str),
}

/// A requested mutation of tracked instance state.
#[derive(Debug, Clone)]
pub enum InstanceUpdateOperation {
    /// Track a freshly provisioned ephemeral instance.
    LaunchEphemeral(Instance),
    /// Apply a task status update from the broker.
    BrokerUpdate {
        status: BrokerTaskStatus,
        now: Timestamp,
    },
    /// Launch tasks onto an existing reservation.
    LaunchOnReservation {
        instance_id: InstanceId,
        containers: u32,
        now: Timestamp,
    },
    /// The reservation was not used in time.
    ReservationTimeout(InstanceId),
    /// Drop the instance regardless of its state.
    ForceExpunge(InstanceId),
    /// Track a new reservation.
    Reserve(Instance),
    /// Restore a snapshot (not supported by this tracker).
    Revert(Instance),
}

impl InstanceUpdateOperation {
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            InstanceUpdateOperation::LaunchEphemeral(instance)
            | InstanceUpdateOperation::Reserve(instance)
            | InstanceUpdateOperation::Revert(instance) => &instance.instance_id,
            InstanceUpdateOperation::BrokerUpdate { status, .. } => {
                &status.task_id.instance_id
            }
            InstanceUpdateOperation::LaunchOnReservation { instance_id, .. }
            | InstanceUpdateOperation::ReservationTimeout(instance_id)
            | InstanceUpdateOperation::ForceExpunge(instance_id) => instance_id,
        }
    }
}

/// The outcome of applying an operation.
#[derive(Debug, Clone)]
pub enum InstanceUpdateEffect {
    /// State changed; `previous` is `None` for newly tracked instances.
    Update {
        instance: Instance,
        previous: Option<Box<Instance>>,
    },
    /// The instance reached a terminal state and must be removed.
    Expunge(Instance),
    /// Nothing changed.
    Noop(InstanceId),
    /// The transition was refused; no state change.
    Failure {
        instance_id: InstanceId,
        error: InstanceUpdateError,
    },
}

/// Apply `op` against the currently tracked value of its instance.
pub fn apply(current: Option<&Instance>, op: InstanceUpdateOperation) -> InstanceUpdateEffect {
    let instance_id = op.instance_id().clone();
    match op {
        InstanceUpdateOperation::LaunchEphemeral(instance) => match current {
            Some(_) => failure(instance_id.clone(), InstanceUpdateError::AlreadyExists(instance_id.to_string())),
            None => InstanceUpdateEffect::Update {
                instance,
                previous: None,
            },
        },

        InstanceUpdateOperation::BrokerUpdate { status, now } => match current {
            None => failure(
                instance_id.clone(),
                InstanceUpdateError::UnknownInstance(instance_id.to_string()),
            ),
            Some(instance) => broker_update(instance, &status, now),
        },

        InstanceUpdateOperation::LaunchOnReservation {
            instance_id,
            containers,
            now,
        } => match current {
            None => failure(
                instance_id.clone(),
                InstanceUpdateError::UnknownInstance(instance_id.to_string()),
            ),
            Some(instance) if instance.state.condition != Condition::Reserved => failure(
                instance_id.clone(),
                InstanceUpdateError::NotReserved(instance_id.to_string()),
            ),
            Some(instance) => {
                let mut updated = instance.clone();
                updated.tasks = (0..containers.max(1))
                    .map(|index| {
                        let task_id = TaskId::new(instance_id.clone(), index);
                        (task_id.clone(), Task::provisioned(task_id, now))
                    })
                    .collect();
                updated.state = InstanceState::compute(&updated.tasks, now, None);
                InstanceUpdateEffect::Update {
                    instance: updated,
                    previous: Some(Box::new(instance.clone())),
                }
            }
        },

        InstanceUpdateOperation::ReservationTimeout(instance_id) => match current {
            None => failure(
                instance_id.clone(),
                InstanceUpdateError::UnknownInstance(instance_id.to_string()),
            ),
            Some(instance) if instance.state.condition != Condition::Reserved => failure(
                instance_id.clone(),
                InstanceUpdateError::NotReserved(instance_id.to_string()),
            ),
            Some(instance) => InstanceUpdateEffect::Expunge(instance.clone()),
        },

        InstanceUpdateOperation::ForceExpunge(instance_id) => match current {
            None => failure(
                instance_id.clone(),
                InstanceUpdateError::UnknownInstance(instance_id.to_string()),
            ),
            Some(instance) => InstanceUpdateEffect::Expunge(instance.clone()),
        },

        InstanceUpdateOperation::Reserve(instance) => match current {
            Some(_) => failure(
                instance_id.clone(),
                InstanceUpdateError::AlreadyExists(instance_id.to_string()),
            ),
            None => InstanceUpdateEffect::Update {
                instance,
                previous: None,
            },
        },

        InstanceUpdateOperation::Revert(_) => {
            failure(instance_id, InstanceUpdateError::Unsupported("revert"))
        }
    }
}

fn failure(instance_id: InstanceId, error: InstanceUpdateError) -> InstanceUpdateEffect {
    InstanceUpdateEffect::Failure { instance_id, error }
}

/// Task-level effect of a broker status update.
enum TaskEffect {
    Update(Task),
    Expunge(Task),
    Noop,
}

fn update_task(task: &Task, status: &BrokerTaskStatus, now: Timestamp) -> TaskEffect {
    let condition = Condition::from(status.state);
    let healthy = status.healthy.or(task.healthy);
    if condition == task.condition && healthy == task.healthy {
        return TaskEffect::Noop;
    }
    let mut updated = task.clone();
    updated.condition = condition;
    updated.since = now;
    updated.healthy = healthy;
    updated.broker_status = Some(status.clone());
    if condition.is_terminal() {
        TaskEffect::Expunge(updated)
    } else {
        TaskEffect::Update(updated)
    }
}

fn broker_update(
    instance: &Instance,
    status: &BrokerTaskStatus,
    now: Timestamp,
) -> InstanceUpdateEffect {
    if !instance.owns(&status.task_id) {
        return failure(
            instance.instance_id.clone(),
            InstanceUpdateError::ForeignTask(status.task_id.to_string()),
        );
    }
    let task = match instance.tasks.get(&status.task_id) {
        Some(task) => task,
        None => {
            return failure(
                instance.instance_id.clone(),
                InstanceUpdateError::UnknownTask(status.task_id.to_string()),
            )
        }
    };

    match update_task(task, status, now) {
        TaskEffect::Noop => InstanceUpdateEffect::Noop(instance.instance_id.clone()),
        TaskEffect::Update(updated_task) => {
            let mut updated = instance.clone();
            updated
                .tasks
                .insert(updated_task.task_id.clone(), updated_task);
            updated.state = InstanceState::compute(&updated.tasks, now, Some(&instance.state));
            InstanceUpdateEffect::Update {
                instance: updated,
                previous: Some(Box::new(instance.clone())),
            }
        }
        TaskEffect::Expunge(updated_task) => {
            // One task going terminal takes the whole instance with it.
            let mut updated = instance.clone();
            updated
                .tasks
                .insert(updated_task.task_id.clone(), updated_task);
            updated.state = InstanceState::compute(&updated.tasks, now, Some(&instance.state));
            InstanceUpdateEffect::Expunge(updated)
        }
    }
}
