//! berth-core — domain model for the Berth scheduling core.
//!
//! Berth schedules long-running applications on top of a two-level
//! resource-offer cluster manager (the "resource broker"). This crate holds
//! the declarative model everything else operates on:
//!
//! - `AppId`: hierarchical, absolute application paths
//! - `Timestamp` / `VersionInfo`: version stamps for config and scale changes
//! - `RunSpec`: the declarative description of a long-running app
//! - `Group`: the versioned application tree
//! - `DeploymentPlan`: ordered steps transforming one group into another
//! - `EventBus`: the in-process event stream the core publishes on

pub mod error;
pub mod events;
pub mod group;
pub mod ids;
pub mod plan;
pub mod run_spec;
pub mod version;

pub use error::{ValidationError, ValidationResult};
pub use events::{CoreEvent, EventBus};
pub use group::Group;
pub use ids::AppId;
pub use plan::{DeploymentAction, DeploymentPlan, DeploymentStep};
pub use run_spec::{
    HealthCheckDef, HealthCheckProtocol, KillSelection, PersistentVolume, PortDefinition,
    Residency, Resources, RunSpec, UpgradeStrategy,
};
pub use version::{Timestamp, VersionInfo};
