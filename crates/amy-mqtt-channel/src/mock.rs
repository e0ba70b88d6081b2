//! Mock MQTT channel for testing without a real broker.
//!
//! Records all published messages and subscription filters for
//! assertion in tests.

use async_trait::async_trait;
use rumqttc::QoS;
use std::sync::Mutex;

use crate::channel::Channel;
use crate::error::MqttResult;

/// A recorded publish call.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// Mock implementation of the `Channel` trait.
///
/// Stores all publishes and subscriptions in memory for test verification.
/// Thread-safe via `Mutex` (fine for test contexts).
pub struct MockChannel {
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Get all published messages.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap().clone()
    }

    /// Get all subscription filters.
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Check whether a subscription was made to the given filter.
    pub fn is_subscribed_to(&self, filter: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .any(|(f, _)| f == filter)
    }

    /// Clear all recorded state.
    pub fn reset(&self) {
        self.published.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()> {
        self.published.lock().unwrap().push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> MqttResult<()> {
        self.subscriptions
            .lock()
            .unwrap()
            .push((filter.to_string(), qos));
        Ok(())
    }
}
