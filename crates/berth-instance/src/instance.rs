//! Instances and tasks.

use std::collections::BTreeMap;
use std::fmt;

use uuid::Uuid;

use berth_core::{AppId, RunSpec, Timestamp};

use crate::broker::BrokerTaskStatus;
use crate::condition::{aggregate, Condition};

/// Identifies an instance: the owning run spec plus a unique suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId {
    pub run_spec_id: AppId,
    pub uuid: Uuid,
}

impl InstanceId {
    pub fn new(run_spec_id: AppId) -> Self {
        InstanceId {
            run_spec_id,
            uuid: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.run_spec_id, self.uuid)
    }
}

/// Identifies one task within an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    pub instance_id: InstanceId,
    pub container_index: u32,
}

impl TaskId {
    pub fn new(instance_id: InstanceId, container_index: u32) -> Self {
        TaskId {
            instance_id,
            container_index,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.instance_id, self.container_index)
    }
}

/// Where an instance was placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    pub host: String,
    pub agent_id: Option<String>,
}

/// A single broker-tracked process on a specific agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub task_id: TaskId,
    pub condition: Condition,
    pub since: Timestamp,
    pub host_ports: Vec<u16>,
    /// Set once the task has been handed to the broker.
    pub launched: bool,
    pub healthy: Option<bool>,
    /// Last raw status received from the broker, kept for reconciliation.
    pub broker_status: Option<BrokerTaskStatus>,
}

impl Task {
    pub fn provisioned(task_id: TaskId, now: Timestamp) -> Self {
        Task {
            task_id,
            condition: Condition::Created,
            since: now,
            host_ports: Vec::new(),
            launched: true,
            healthy: None,
            broker_status: None,
        }
    }
}

/// Aggregate state of an instance, recomputed on every task update.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceState {
    pub condition: Condition,
    pub since: Timestamp,
    pub healthy: Option<bool>,
}

impl InstanceState {
    /// Compute the aggregate from the task set. If condition and health both
    /// match `previous`, the previous state (and its `since`) is kept.
    pub fn compute(
        tasks: &BTreeMap<TaskId, Task>,
        now: Timestamp,
        previous: Option<&InstanceState>,
    ) -> InstanceState {
        let conditions: Vec<Condition> = tasks.values().map(|t| t.condition).collect();
        let condition = aggregate(&conditions);

        let healthy = if tasks.values().any(|t| t.healthy == Some(false)) {
            Some(false)
        } else if !tasks.is_empty() && tasks.values().all(|t| t.healthy == Some(true)) {
            Some(true)
        } else {
            None
        };

        match previous {
            Some(prev) if prev.condition == condition && prev.healthy == healthy => {
                prev.clone()
            }
            _ => InstanceState {
                condition,
                since: now,
                healthy,
            },
        }
    }
}

/// A scheduled unit of one or more tasks sharing lifecycle and placement.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub instance_id: InstanceId,
    pub agent_info: Option<AgentInfo>,
    pub state: InstanceState,
    pub tasks: BTreeMap<TaskId, Task>,
    /// The spec version this instance was launched against.
    pub run_spec: RunSpec,
}

impl Instance {
    /// A freshly provisioned ephemeral instance with one task per container.
    pub fn ephemeral(run_spec: RunSpec, containers: u32, now: Timestamp) -> Instance {
        let instance_id = InstanceId::new(run_spec.id.clone());
        let tasks: BTreeMap<TaskId, Task> = (0..containers.max(1))
            .map(|index| {
                let task_id = TaskId::new(instance_id.clone(), index);
                (task_id.clone(), Task::provisioned(task_id, now))
            })
            .collect();
        let state = InstanceState::compute(&tasks, now, None);
        Instance {
            instance_id,
            agent_info: None,
            state,
            tasks,
            run_spec,
        }
    }

    /// A reserved instance holding an agent but no launched tasks yet.
    pub fn reserved(run_spec: RunSpec, agent_info: AgentInfo, now: Timestamp) -> Instance {
        let instance_id = InstanceId::new(run_spec.id.clone());
        Instance {
            instance_id,
            agent_info: Some(agent_info),
            state: InstanceState {
                condition: Condition::Reserved,
                since: now,
                healthy: None,
            },
            tasks: BTreeMap::new(),
            run_spec,
        }
    }

    pub fn app_id(&self) -> &AppId {
        &self.instance_id.run_spec_id
    }

    pub fn run_spec_version(&self) -> Timestamp {
        self.run_spec.version()
    }

    /// An instance is launched once every task has been handed out.
    pub fn is_launched(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.values().all(|t| t.launched)
    }

    /// Every task must belong to this instance.
    pub fn owns(&self, task_id: &TaskId) -> bool {
        task_id.instance_id == self.instance_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> RunSpec {
        RunSpec::new(AppId::parse(id).unwrap(), 1)
    }

    #[test]
    fn ephemeral_instance_starts_created() {
        let instance = Instance::ephemeral(spec("/web"), 2, Timestamp::at_millis(5));
        assert_eq!(instance.tasks.len(), 2);
        assert_eq!(instance.state.condition, Condition::Created);
        assert_eq!(instance.state.since, Timestamp::at_millis(5));
        assert!(instance.is_launched());
        for task_id in instance.tasks.keys() {
            assert!(instance.owns(task_id));
        }
    }

    #[test]
    fn reserved_instance_has_no_tasks() {
        let instance = Instance::reserved(
            spec("/db"),
            AgentInfo {
                host: "agent-1".to_string(),
                agent_id: Some("a1".to_string()),
            },
            Timestamp::at_millis(1),
        );
        assert_eq!(instance.state.condition, Condition::Reserved);
        assert!(!instance.is_launched());
    }

    #[test]
    fn unchanged_aggregate_preserves_since() {
        let mut instance = Instance::ephemeral(spec("/web"), 2, Timestamp::at_millis(1));
        for task in instance.tasks.values_mut() {
            task.condition = Condition::Running;
        }
        let first = InstanceState::compute(
            &instance.tasks,
            Timestamp::at_millis(10),
            Some(&instance.state),
        );
        assert_eq!(first.condition, Condition::Running);
        assert_eq!(first.since, Timestamp::at_millis(10));

        let second =
            InstanceState::compute(&instance.tasks, Timestamp::at_millis(20), Some(&first));
        assert_eq!(second.since, Timestamp::at_millis(10));
    }

    #[test]
    fn health_aggregates_pessimistically() {
        let mut instance = Instance::ephemeral(spec("/web"), 2, Timestamp::at_millis(1));
        let ids: Vec<TaskId> = instance.tasks.keys().cloned().collect();

        instance.tasks.get_mut(&ids[0]).unwrap().healthy = Some(true);
        let state = InstanceState::compute(&instance.tasks, Timestamp::at_millis(2), None);
        assert_eq!(state.healthy, None);

        instance.tasks.get_mut(&ids[1]).unwrap().healthy = Some(true);
        let state = InstanceState::compute(&instance.tasks, Timestamp::at_millis(3), None);
        assert_eq!(state.healthy, Some(true));

        instance.tasks.get_mut(&ids[0]).unwrap().healthy = Some(false);
        let state = InstanceState::compute(&instance.tasks, Timestamp::at_millis(4), None);
        assert_eq!(state.healthy, Some(false));
    }
}
