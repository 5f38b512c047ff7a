//! Core event bus
//!
//! A broadcast channel carrying typed lifecycle events out of the pool,
//! queue, and health monitor. Subscribers that fall behind lose the oldest
//! events (broadcast semantics); emitters never block on slow consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{CommandId, DeviceId, HealthStatus, TransactionId};

/// Default ring capacity for subscribers
const EVENT_CAPACITY: usize = 1024;

/// Everything the core announces to the outside world
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    /// A device became reachable (first session up, or breaker re-closed)
    DeviceOnline { device_id: DeviceId },
    /// The circuit breaker tripped open for a device
    DeviceOffline { device_id: DeviceId, reason: String },
    /// A device's health classification changed
    HealthChanged {
        device_id: DeviceId,
        previous: HealthStatus,
        current: HealthStatus,
        score: f64,
    },
    /// A health alert fired (respects the per-device cooldown)
    HealthAlert {
        device_id: DeviceId,
        status: HealthStatus,
        message: String,
    },
    /// A metric deviated past the anomaly baseline
    AnomalyDetected {
        device_id: DeviceId,
        metric: String,
        value: f64,
        mean: f64,
    },
    /// A queued command exhausted its retries and went to the dead letter
    /// buffer
    CommandDeadLettered {
        command_id: CommandId,
        /// None when the command never resolved to a target device
        device_id: Option<DeviceId>,
        error: String,
    },
    /// A transaction was rolled back, either explicitly or on deadline
    TransactionRolledBack {
        transaction_id: TransactionId,
        reason: String,
    },
}

impl CoreEvent {
    /// Stable label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            CoreEvent::DeviceOnline { .. } => "device_online",
            CoreEvent::DeviceOffline { .. } => "device_offline",
            CoreEvent::HealthChanged { .. } => "health_changed",
            CoreEvent::HealthAlert { .. } => "health_alert",
            CoreEvent::AnomalyDetected { .. } => "anomaly_detected",
            CoreEvent::CommandDeadLettered { .. } => "command_dead_lettered",
            CoreEvent::TransactionRolledBack { .. } => "transaction_rolled_back",
        }
    }
}

/// A timestamped event as delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: CoreEvent,
}

/// Shared broadcast bus. Cloning is cheap; all clones feed the same
/// subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Lack of subscribers is not an error.
    pub fn publish(&self, event: CoreEvent) {
        trace!(kind = event.kind(), "Publishing core event");
        let _ = self.sender.send(EventEnvelope {
            timestamp: Utc::now(),
            event,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(CoreEvent::DeviceOnline {
            device_id: DeviceId(7),
        });

        for rx in [&mut rx1, &mut rx2] {
            let envelope = rx.recv().await.unwrap();
            assert_eq!(envelope.event.kind(), "device_online");
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(CoreEvent::DeviceOffline {
            device_id: DeviceId(1),
            reason: "breaker open".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let envelope = EventEnvelope {
            timestamp: Utc::now(),
            event: CoreEvent::HealthChanged {
                device_id: DeviceId(3),
                previous: HealthStatus::Healthy,
                current: HealthStatus::Degraded,
                score: 0.42,
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["event"], "health_changed");
        assert_eq!(json["current"], "degraded");
    }
}
