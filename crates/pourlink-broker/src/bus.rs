//! Broadcast bus carrying push envelopes from the processor to every
//! connected viewer session.
//!
//! Uses [`tokio::sync::broadcast`] so each session receives every envelope
//! without any slow session blocking the others; a session that falls behind
//! observes a `Lagged` error and handles it itself.

use chrono::{DateTime, Utc};
use pourlink_types::{SystemSnapshot, Update};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Default envelope buffer per subscriber before old entries are dropped.
const DEFAULT_CAPACITY: usize = 256;

/// The push-message shape delivered to viewer sessions:
/// `{type, topic, data, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub topic: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Envelope for a live state update.
    pub fn update(update: &Update) -> Self {
        Self {
            kind: "update".to_string(),
            topic: update.topic_label(),
            data: serde_json::to_value(update).unwrap_or(Value::Null),
            timestamp: Utc::now(),
        }
    }

    /// Envelope sent exactly once when a session joins, carrying the full
    /// current snapshot.
    pub fn connection_ack(snapshot: &SystemSnapshot) -> Self {
        Self {
            kind: "connection-ack".to_string(),
            topic: "bridge/snapshot".to_string(),
            data: serde_json::to_value(snapshot).unwrap_or(Value::Null),
            timestamp: Utc::now(),
        }
    }

    /// Periodic keepalive envelope.
    pub fn heartbeat() -> Self {
        Self {
            kind: "heartbeat".to_string(),
            topic: "bridge/heartbeat".to_string(),
            data: Value::Null,
            timestamp: Utc::now(),
        }
    }
}

/// Shared fan-out channel. Clone it cheaply; all clones share the same
/// underlying broadcast channel.
#[derive(Clone, Debug)]
pub struct UpdateBus {
    sender: broadcast::Sender<Envelope>,
}

impl UpdateBus {
    /// Create a bus whose subscribers each buffer up to `capacity` envelopes.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an envelope to every subscriber.
    ///
    /// Returns the number of sessions the envelope was handed to. Zero
    /// subscribers is a normal condition (no viewers connected), not an
    /// error.
    pub fn publish(&self, envelope: Envelope) -> usize {
        self.sender.send(envelope).unwrap_or(0)
    }

    /// Subscribe to all future envelopes.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }
}

impl Default for UpdateBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pourlink_types::{ConcentrationTarget, TargetStatus};

    fn target_update() -> Update {
        Update::Concentration(ConcentrationTarget {
            value: 55.0,
            source: "mqtt".to_string(),
            status: TargetStatus::MinorChange,
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn every_subscriber_receives_every_envelope() {
        let bus = UpdateBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let delivered = bus.publish(Envelope::update(&target_update()));
        assert_eq!(delivered, 2);

        assert_eq!(rx1.recv().await.unwrap().topic, "concentration/target");
        assert_eq!(rx2.recv().await.unwrap().topic, "concentration/target");
    }

    #[test]
    fn publish_with_no_subscribers_is_not_an_error() {
        let bus = UpdateBus::default();
        assert_eq!(bus.publish(Envelope::heartbeat()), 0);
    }

    #[test]
    fn envelope_serializes_type_field() {
        let envelope = Envelope::connection_ack(&SystemSnapshot::default());
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""type":"connection-ack""#));
        assert!(json.contains(r#""topic":"bridge/snapshot""#));
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lag() {
        let bus = UpdateBus::new(4);
        let mut rx = bus.subscribe();

        for _ in 0..64 {
            bus.publish(Envelope::heartbeat());
        }

        let result = rx.recv().await;
        assert!(matches!(
            result,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
