//! Internal event bus.
//!
//! Fans server events (operation lifecycle changes, mostly) out to
//! long-poll listeners.  Sending never blocks; with no listener the
//! event is dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// One published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Broadcast fan-out with a bounded per-listener buffer.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(128);
        Self { tx }
    }

    /// Publish `payload` under `topic`.
    pub fn send(&self, topic: &str, payload: serde_json::Value) {
        let _ = self.tx.send(Event {
            topic: topic.to_string(),
            timestamp: Utc::now(),
            metadata: payload,
        });
    }

    /// Subscribe a new listener.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.send("operation", serde_json::json!({"id": "abc"}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic, "operation");
        assert_eq!(event.metadata["id"], "abc");
    }

    #[test]
    fn test_send_without_listeners_is_fine() {
        let bus = EventBus::new();
        bus.send("operation", serde_json::json!({}));
    }
}
