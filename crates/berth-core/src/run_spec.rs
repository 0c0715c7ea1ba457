//! Run specs.
//!
//! A `RunSpec` is the declarative description of a long-running process
//! group: resources, command, ports, health checks, upgrade strategy,
//! dependencies and desired instance count. Specs are versioned; every
//! config or scale change produces a new version stamp.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ValidationError, ValidationResult};
use crate::ids::AppId;
use crate::version::{Timestamp, VersionInfo};

/// Resource demand per instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: f64,
    /// Memory in MiB.
    pub mem: f64,
    /// Scratch disk in MiB.
    pub disk: f64,
    pub gpus: u32,
}

impl Default for Resources {
    fn default() -> Self {
        Resources {
            cpus: 1.0,
            mem: 128.0,
            disk: 0.0,
            gpus: 0,
        }
    }
}

/// A port requested for every instance of an app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDefinition {
    pub port: u16,
    pub name: Option<String>,
    pub protocol: String,
}

impl PortDefinition {
    pub fn tcp(port: u16) -> Self {
        PortDefinition {
            port,
            name: None,
            protocol: "tcp".to_string(),
        }
    }
}

/// How a health check probes a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthCheckProtocol {
    Http { path: String, port_index: usize },
    Tcp { port_index: usize },
    Command { value: String },
}

/// A health check definition attached to a run spec version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckDef {
    pub protocol: HealthCheckProtocol,
    /// Seconds after launch during which failures are ignored.
    pub grace_period_secs: u64,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Consecutive failures before the task is killed. Zero disables killing.
    pub max_consecutive_failures: u32,
}

impl Default for HealthCheckDef {
    fn default() -> Self {
        HealthCheckDef {
            protocol: HealthCheckProtocol::Http {
                path: "/healthz".to_string(),
                port_index: 0,
            },
            grace_period_secs: 300,
            interval_secs: 60,
            timeout_secs: 20,
            max_consecutive_failures: 3,
        }
    }
}

/// Capacity bounds honored while replacing instances during an upgrade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeStrategy {
    /// Fraction of `instances` that must stay healthy during a restart.
    pub min_health_capacity: f64,
    /// Fraction of `instances` that may exist on top of the target count.
    pub max_over_capacity: f64,
}

impl Default for UpgradeStrategy {
    fn default() -> Self {
        UpgradeStrategy {
            min_health_capacity: 1.0,
            max_over_capacity: 1.0,
        }
    }
}

/// A persistent volume pinned to an instance slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentVolume {
    pub container_path: String,
    pub size_mb: u64,
}

/// Keeps an instance slot pinned to an agent via reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Residency {
    /// Seconds to wait for the original agent before relaunching elsewhere.
    pub relaunch_escalation_timeout_secs: u64,
}

/// Which instances die first when scaling down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSelection {
    #[default]
    YoungestFirst,
    OldestFirst,
}

/// The declarative description of a long-running app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub id: AppId,
    pub cmd: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub resources: Resources,
    pub instances: u32,
    #[serde(default)]
    pub port_definitions: Vec<PortDefinition>,
    /// Every instance gets its own ip; mutually exclusive with ports.
    #[serde(default)]
    pub ip_per_instance: bool,
    #[serde(default)]
    pub health_checks: Vec<HealthCheckDef>,
    #[serde(default)]
    pub upgrade_strategy: UpgradeStrategy,
    #[serde(default)]
    pub dependencies: Vec<AppId>,
    #[serde(default)]
    pub residency: Option<Residency>,
    #[serde(default)]
    pub persistent_volumes: Vec<PersistentVolume>,
    /// Secret names referenced by the app; values never enter the core.
    #[serde(default)]
    pub secrets: Vec<String>,
    /// At most one instance may ever run (e.g. framework singletons).
    #[serde(default)]
    pub single_instance: bool,
    /// Launch rate-limiter tunables consumed by the launch queue.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_launch_delay_secs")]
    pub max_launch_delay_secs: u64,
    #[serde(default)]
    pub kill_selection: KillSelection,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub version_info: VersionInfo,
}

fn default_backoff_secs() -> u64 {
    1
}

fn default_backoff_factor() -> f64 {
    1.15
}

fn default_max_launch_delay_secs() -> u64 {
    300
}

impl RunSpec {
    /// A minimal spec with sensible defaults, one port, `instances` copies.
    pub fn new(id: AppId, instances: u32) -> Self {
        RunSpec {
            id,
            cmd: None,
            args: Vec::new(),
            resources: Resources::default(),
            instances,
            port_definitions: vec![PortDefinition::tcp(0)],
            ip_per_instance: false,
            health_checks: Vec::new(),
            upgrade_strategy: UpgradeStrategy::default(),
            dependencies: Vec::new(),
            residency: None,
            persistent_volumes: Vec::new(),
            secrets: Vec::new(),
            single_instance: false,
            backoff_secs: default_backoff_secs(),
            backoff_factor: default_backoff_factor(),
            max_launch_delay_secs: default_max_launch_delay_secs(),
            kill_selection: KillSelection::default(),
            env: HashMap::new(),
            version_info: VersionInfo::NoVersion,
        }
    }

    /// The version stamp of this spec, or the epoch for unversioned specs.
    pub fn version(&self) -> Timestamp {
        self.version_info.version().unwrap_or(Timestamp::at_millis(0))
    }

    pub fn is_resident(&self) -> bool {
        self.residency.is_some()
    }

    /// Check the spec's internal business rules.
    pub fn validate(&self) -> ValidationResult<()> {
        if self.ip_per_instance == !self.port_definitions.is_empty() {
            return Err(ValidationError::PortDefinition(self.id.to_string()));
        }
        if self.residency.is_some() != !self.persistent_volumes.is_empty() {
            return Err(ValidationError::Residency(self.id.to_string()));
        }
        if self.single_instance && self.instances > 1 {
            return Err(ValidationError::SingleInstance(self.id.to_string()));
        }
        if self.resources.gpus > 0 && self.residency.is_some() {
            return Err(ValidationError::Gpu(self.id.to_string()));
        }
        Ok(())
    }

    /// Check an update against the current spec. Resident apps may not
    /// change resources or volume sizes.
    pub fn validate_update(&self, update: &RunSpec) -> ValidationResult<()> {
        update.validate()?;
        if self.is_resident()
            && (self.resources != update.resources
                || self.persistent_volumes != update.persistent_volumes)
        {
            return Err(ValidationError::ResidentUpdate(self.id.to_string()));
        }
        Ok(())
    }

    /// True when `to` differs from `self` only in the instance count.
    pub fn is_only_scale_change(&self, to: &RunSpec) -> bool {
        self.instances != to.instances && !self.is_upgrade(to)
    }

    /// True when `to` changes anything besides the instance count.
    pub fn is_upgrade(&self, to: &RunSpec) -> bool {
        self.config_fingerprint() != to.config_fingerprint()
    }

    /// The spec with instance count and version stamps normalized away,
    /// used to compare configurations.
    fn config_fingerprint(&self) -> RunSpec {
        let mut spec = self.clone();
        spec.instances = 0;
        spec.version_info = VersionInfo::NoVersion;
        spec
    }

    /// Stamp this spec against its predecessor: scale-only changes keep the
    /// config stamp, config changes move all stamps.
    pub fn stamped_against(mut self, previous: Option<&RunSpec>, now: Timestamp) -> RunSpec {
        self.version_info = match previous {
            Some(prev) if !prev.is_upgrade(&self) => {
                prev.version_info.with_scaling_change(now)
            }
            _ => VersionInfo::for_new_config(now),
        };
        self
    }
}
