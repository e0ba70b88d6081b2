//! Listener runtime — one subscriber worker per device family.
//!
//! Each worker owns its broker connection, re-subscribes after every
//! reconnect (backoff 1 s doubling to 30 s, infinite retries), and
//! dispatches messages into a semaphore-bounded handler pool. Per-patient
//! write ordering is enforced downstream in the writer, so handlers run
//! concurrently across messages.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{Event, EventLoop, Packet};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use amy_mqtt_channel::{MqttChannel, MqttConfig, MqttResult};

use crate::pipeline::Pipeline;

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Worker lifecycle: `Disconnected → Connecting → Subscribed → Running`,
/// back to `Disconnected` on any broker error; shutdown is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Subscribed,
    Running,
}

/// The three device-family subscriber workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Ava4,
    Kati,
    Qube,
}

impl ListenerKind {
    pub fn name(&self) -> &'static str {
        match self {
            ListenerKind::Ava4 => "ava4",
            ListenerKind::Kati => "kati",
            ListenerKind::Qube => "qube",
        }
    }

    /// Stable client id per worker — the broker keeps one persistent
    /// session per device family.
    fn client_id(&self) -> &'static str {
        match self {
            ListenerKind::Ava4 => "amy-ingest-ava4",
            ListenerKind::Kati => "amy-ingest-kati",
            ListenerKind::Qube => "amy-ingest-qube",
        }
    }

    fn subscription_count(&self) -> usize {
        match self {
            ListenerKind::Ava4 => 3,
            ListenerKind::Kati | ListenerKind::Qube => 1,
        }
    }

    async fn subscribe(&self, channel: &MqttChannel) -> MqttResult<()> {
        match self {
            ListenerKind::Ava4 => channel.subscribe_ava4().await,
            ListenerKind::Kati => channel.subscribe_kati().await,
            ListenerKind::Qube => channel.subscribe_qube().await,
        }
    }
}

pub struct Listener {
    kind: ListenerKind,
    channel: MqttChannel,
    eventloop: EventLoop,
    pipeline: Arc<Pipeline>,
    pool: Arc<Semaphore>,
}

impl Listener {
    pub fn new(
        kind: ListenerKind,
        config: &MqttConfig,
        pipeline: Arc<Pipeline>,
        pool: Arc<Semaphore>,
    ) -> MqttResult<Self> {
        let (channel, eventloop) = MqttChannel::new(config, kind.client_id())?;
        Ok(Self {
            kind,
            channel,
            eventloop,
            pipeline,
            pool,
        })
    }

    /// Drive the event loop until shutdown, then drain in-flight
    /// handlers within `drain` and close the connection.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>, drain: Duration) {
        let mut state = ListenerState::Disconnected;
        let mut backoff = RECONNECT_MIN;
        let mut pending_subs = 0usize;
        let mut handlers: JoinSet<()> = JoinSet::new();

        self.transition(&mut state, ListenerState::Connecting);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        backoff = RECONNECT_MIN;
                        self.transition(&mut state, ListenerState::Connecting);
                        // Persistent sessions still re-subscribe: the
                        // broker may have expired the session.
                        pending_subs = self.kind.subscription_count();
                        if let Err(e) = self.kind.subscribe(&self.channel).await {
                            tracing::error!(
                                listener = self.kind.name(),
                                error = %e,
                                "subscribe failed after connect"
                            );
                        }
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        pending_subs = pending_subs.saturating_sub(1);
                        if pending_subs == 0 && state == ListenerState::Connecting {
                            self.transition(&mut state, ListenerState::Subscribed);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if state != ListenerState::Running {
                            self.transition(&mut state, ListenerState::Running);
                        }
                        // Reap finished handlers without blocking.
                        while handlers.try_join_next().is_some() {}

                        let Ok(permit) = self.pool.clone().acquire_owned().await else {
                            break;
                        };
                        let pipeline = self.pipeline.clone();
                        let channel = self.channel.clone();
                        handlers.spawn(async move {
                            let _permit = permit;
                            let complete =
                                pipeline.handle_message(&publish.topic, &publish.payload).await;
                            // Failed writes stay unacked; the broker
                            // redelivers them on the next session.
                            if complete {
                                if let Err(e) = channel.ack(&publish).await {
                                    tracing::debug!(error = %e, "ack failed");
                                }
                            } else {
                                tracing::warn!(
                                    topic = %publish.topic,
                                    "message left unacked for redelivery"
                                );
                            }
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.transition(&mut state, ListenerState::Disconnected);
                        tracing::error!(
                            listener = self.kind.name(),
                            error = %e,
                            backoff_s = backoff.as_secs(),
                            "broker connection lost, reconnecting"
                        );
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            () = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(RECONNECT_MAX);
                        self.transition(&mut state, ListenerState::Connecting);
                    }
                }
            }
        }

        tracing::info!(listener = self.kind.name(), "shutting down");
        if let Err(e) = self.channel.disconnect().await {
            tracing::debug!(listener = self.kind.name(), error = %e, "disconnect failed");
        }

        // Drain in-flight handlers with a bounded deadline; writes past
        // the history append must complete.
        let drained = tokio::time::timeout(drain, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                listener = self.kind.name(),
                remaining = handlers.len(),
                "drain deadline exceeded, aborting handlers"
            );
            handlers.abort_all();
        }
        tracing::info!(listener = self.kind.name(), "stopped");
    }

    fn transition(&self, state: &mut ListenerState, next: ListenerState) {
        if *state != next {
            tracing::info!(
                listener = self.kind.name(),
                from = ?*state,
                to = ?next,
                "listener state"
            );
            *state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_kinds_have_distinct_sessions() {
        let ids = [
            ListenerKind::Ava4.client_id(),
            ListenerKind::Kati.client_id(),
            ListenerKind::Qube.client_id(),
        ];
        assert_eq!(
            ids.iter().collect::<std::collections::HashSet<_>>().len(),
            3
        );
    }

    #[test]
    fn subscription_counts_match_topic_sets() {
        assert_eq!(
            ListenerKind::Ava4.subscription_count(),
            amy_protocol::topics::ava4_subscriptions().len()
        );
        assert_eq!(
            ListenerKind::Kati.subscription_count(),
            amy_protocol::topics::kati_subscriptions().len()
        );
        assert_eq!(
            ListenerKind::Qube.subscription_count(),
            amy_protocol::topics::qube_subscriptions().len()
        );
    }

    #[tokio::test]
    async fn mock_subscriptions_cover_family_topics() {
        use amy_mqtt_channel::{Channel, MockChannel};
        use rumqttc::QoS;

        let mock = MockChannel::new();
        for filter in amy_protocol::topics::ava4_subscriptions() {
            mock.subscribe(filter, QoS::AtLeastOnce).await.unwrap();
        }
        assert!(mock.is_subscribed_to("ESP32_BLE_GW_TX"));
        assert!(mock.is_subscribed_to("dusun_sub"));
        assert!(mock.is_subscribed_to("dusun_pub"));
    }
}
