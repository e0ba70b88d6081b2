//! MQTT channel — async client for the hospital telemetry broker.
//!
//! Wraps `rumqttc::AsyncClient` with the subscription sets of the three
//! device-family listeners. Sessions are persistent (clean session =
//! false) so that QoS-1 redelivery survives restarts.

use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};

use crate::config::MqttConfig;
use crate::error::{MqttError, MqttResult};
use amy_protocol::topics;

// ── Channel trait ─────────────────────────────────────────────

/// Abstraction for MQTT message publishing and subscribing.
///
/// Enables mocking in tests without a real MQTT broker.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Publish a raw payload to a topic.
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()>;

    /// Subscribe to a topic filter.
    async fn subscribe(&self, filter: &str, qos: QoS) -> MqttResult<()>;
}

pub(crate) fn qos_level(raw: u8) -> MqttResult<QoS> {
    match raw {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(MqttError::InvalidQos(other)),
    }
}

// ── MqttChannel ───────────────────────────────────────────────

/// MQTT channel connected to the telemetry broker.
///
/// Owns the `AsyncClient`. The `EventLoop` is returned separately from
/// `new()` — the caller (listener worker) must drive it via
/// `eventloop.poll()` and owns reconnect policy.
#[derive(Clone)]
pub struct MqttChannel {
    client: AsyncClient,
    qos: QoS,
}

impl MqttChannel {
    /// Create a new channel. `client_id` must be unique per listener so
    /// the broker keeps one persistent session per device family.
    pub fn new(config: &MqttConfig, client_id: &str) -> MqttResult<(Self, EventLoop)> {
        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(std::time::Duration::from_secs(config.keepalive_s.into()));
        // Persistent session: QoS-1 messages queued while disconnected
        // are redelivered on reconnect.
        options.set_clean_session(false);
        // Messages are acked only after the write protocol completes, so
        // a failed write is redelivered by the broker.
        options.set_manual_acks(true);
        if !config.username.is_empty() {
            options.set_credentials(&config.username, &config.password);
        }

        let qos = qos_level(config.qos)?;
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let mut network_options = rumqttc::NetworkOptions::new();
        network_options.set_connection_timeout(config.connect_timeout_s);
        eventloop.network_options = network_options;

        Ok((Self { client, qos }, eventloop))
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Acknowledge a processed publish (manual-ack mode).
    pub async fn ack(&self, publish: &rumqttc::Publish) -> MqttResult<()> {
        self.client
            .ack(publish)
            .await
            .map_err(|e| MqttError::Other(e.to_string()))
    }

    /// Close the broker connection cleanly (shutdown path).
    pub async fn disconnect(&self) -> MqttResult<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| MqttError::Connection(e.to_string()))
    }

    // ── Subscription helpers ──────────────────────────────────

    /// Subscribe to the AVA4 gateway status + medical report topics
    /// (including the legacy `dusun_pub` alias).
    pub async fn subscribe_ava4(&self) -> MqttResult<()> {
        for filter in topics::ava4_subscriptions() {
            self.subscribe(filter, self.qos).await?;
        }
        Ok(())
    }

    /// Subscribe to all Kati watch subtopics.
    pub async fn subscribe_kati(&self) -> MqttResult<()> {
        for filter in topics::kati_subscriptions() {
            self.subscribe(filter, self.qos).await?;
        }
        Ok(())
    }

    /// Subscribe to the Qube-Vital kiosk topic.
    pub async fn subscribe_qube(&self) -> MqttResult<()> {
        for filter in topics::qube_subscriptions() {
            self.subscribe(filter, self.qos).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for MqttChannel {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()> {
        self.client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| MqttError::Publish(e.to_string()))
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> MqttResult<()> {
        self.client
            .subscribe(filter, qos)
            .await
            .map_err(|e| MqttError::Subscribe(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_levels() {
        assert_eq!(qos_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_level(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_level(2).unwrap(), QoS::ExactlyOnce);
        assert!(matches!(qos_level(7), Err(MqttError::InvalidQos(7))));
    }
}
