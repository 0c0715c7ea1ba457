//! The in-process event bus.
//!
//! Components publish lifecycle events here; subscribers (API layer, health
//! manager, tests) receive them via a broadcast channel. Publishing never
//! blocks; events for lagging subscribers are dropped by the channel.

use tokio::sync::broadcast;
use tracing::trace;

use crate::ids::AppId;
use crate::version::Timestamp;

/// Everything the scheduling core announces to the rest of the process.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    SchedulerRegistered,
    SchedulerReregistered,
    SchedulerDisconnected,
    DeploymentStarted { plan_id: String },
    DeploymentSuccess { plan_id: String },
    DeploymentFailed { plan_id: String, reason: String },
    AppTerminated { app_id: AppId },
    InstanceChanged {
        app_id: AppId,
        instance_id: String,
        condition: String,
        run_spec_version: Timestamp,
    },
    HealthCheckAdded { app_id: AppId, version: Timestamp },
    HealthCheckRemoved { app_id: AppId, version: Timestamp },
}

/// Cheap-to-clone handle on the broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Fine to call with no subscribers.
    pub fn publish(&self, event: CoreEvent) {
        trace!(?event, "publishing");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(CoreEvent::AppTerminated {
            app_id: AppId::parse("/web").unwrap(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            CoreEvent::AppTerminated {
                app_id: AppId::parse("/web").unwrap()
            }
        );
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(CoreEvent::SchedulerRegistered);
    }
}
