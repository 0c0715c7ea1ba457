//! berth-instance — instance and task state for the Berth scheduling core.
//!
//! An *instance* is a scheduled unit of one or more *tasks* sharing
//! lifecycle and placement. The broker reports task-level status updates;
//! this crate turns them into instance-level effects:
//!
//! - `Condition`: the shared status vocabulary and aggregation rules
//! - `Instance` / `Task`: the tracked state per scheduled unit
//! - `InstanceUpdateOperation` → `InstanceUpdateEffect`: the state machine
//! - `InstanceTracker`: the authoritative in-memory instance map
//! - `BrokerDriver` / `KillService`: the seams towards the broker

pub mod broker;
pub mod condition;
pub mod instance;
pub mod kill;
pub mod tracker;
pub mod update;

pub use broker::{BrokerDriver, BrokerTaskState, BrokerTaskStatus};
pub use condition::Condition;
pub use instance::{AgentInfo, Instance, InstanceId, InstanceState, Task, TaskId};
pub use kill::{DriverKillService, KillReason, KillService};
pub use tracker::InstanceTracker;
pub use update::{InstanceUpdateEffect, InstanceUpdateError, InstanceUpdateOperation};
