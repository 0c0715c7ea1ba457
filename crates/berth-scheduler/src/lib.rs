//! berth-scheduler — the command core of Berth.
//!
//! The scheduler actor serializes cluster-wide commands (deploy, scale,
//! kill, reconcile) while leader, owns the per-app lock table, and wires
//! together the tracker, launch queue, kill service, health manager and
//! deployment manager.
//!
//! # Architecture
//!
//! ```text
//! SchedulerHandle ──► SchedulerActor (one task, FIFO commands)
//!   ├── lock table (per-app mutual exclusion)
//!   ├── SchedulerActions ──► LaunchQueue / KillService / tracker
//!   ├── DeploymentManager ──► workers (one per running plan)
//!   ├── HealthCheckManager
//!   └── GroupRepository / PersistentStore (plans, apps, root group)
//! ```

pub mod actions;
pub mod actor;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod launch_queue;
pub mod reconcile;
pub mod testing;

pub use actions::{launches_needed, select_victims, SchedulerActions};
pub use actor::{
    spawn_timers, LeaderEvent, SchedulerActor, SchedulerCommand, SchedulerHandle,
    SchedulerReply,
};
pub use callbacks::BrokerCallbacks;
pub use config::SchedulerConfig;
pub use error::{SchedulerError, SchedulerResult};
pub use launch_queue::{LaunchQueue, QueuedInstanceInfo};
