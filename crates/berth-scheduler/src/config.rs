//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables of the scheduling core. The embedding daemon owns config-file
/// loading; this struct only carries the values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds a forced deploy waits for conflicting deployments to cancel.
    pub cancellation_timeout_secs: u64,
    /// Seconds between periodic broker reconciliations.
    pub reconcile_interval_secs: u64,
    /// Seconds between periodic scale passes over all apps.
    pub scale_interval_secs: u64,
    /// Milliseconds between readiness polls during deployment steps.
    pub readiness_poll_millis: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            cancellation_timeout_secs: 60,
            reconcile_interval_secs: 600,
            scale_interval_secs: 300,
            readiness_poll_millis: 500,
        }
    }
}

impl SchedulerConfig {
    pub fn cancellation_timeout(&self) -> Duration {
        Duration::from_secs(self.cancellation_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn scale_interval(&self) -> Duration {
        Duration::from_secs(self.scale_interval_secs)
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_millis)
    }
}
