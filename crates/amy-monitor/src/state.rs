//! Shared collector state: ring buffer + live broadcast.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use amy_protocol::FlowEvent;

use crate::ring::RingBuffer;

/// Per-subscriber lag buffer: a WebSocket client more than this many
/// events behind loses its oldest undelivered events.
pub const SUBSCRIBER_BUFFER: usize = 100;

/// Shared application state, cheap to clone into Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<EventHub>,
}

impl AppState {
    pub fn new(ring_buffer_size: usize, replay_count: usize) -> Self {
        Self {
            hub: Arc::new(EventHub::new(ring_buffer_size, replay_count)),
        }
    }
}

/// Fan-out hub: every published event lands in the ring buffer and on
/// the broadcast channel for live WebSocket subscribers.
pub struct EventHub {
    ring: Mutex<RingBuffer>,
    tx: broadcast::Sender<FlowEvent>,
    replay_count: usize,
}

impl EventHub {
    pub fn new(ring_buffer_size: usize, replay_count: usize) -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            ring: Mutex::new(RingBuffer::new(ring_buffer_size)),
            tx,
            replay_count,
        }
    }

    /// Record an event and push it to live subscribers.
    pub fn publish(&self, event: FlowEvent) {
        self.ring.lock().unwrap().push(event.clone());
        // No subscribers is fine; the ring still keeps the event.
        let _ = self.tx.send(event);
    }

    /// Most recent events, newest last.
    pub fn recent(&self, limit: usize) -> Vec<FlowEvent> {
        self.ring.lock().unwrap().recent(limit)
    }

    pub fn stored(&self) -> usize {
        self.ring.lock().unwrap().len()
    }

    /// Replay batch + live receiver for a new WebSocket subscriber.
    ///
    /// The receiver is subscribed before the replay snapshot is taken,
    /// so a subscriber may see an event twice at the boundary but never
    /// misses one.
    pub fn subscribe(&self) -> (Vec<FlowEvent>, broadcast::Receiver<FlowEvent>) {
        let rx = self.tx.subscribe();
        let replay = self.recent(self.replay_count);
        (replay, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amy_protocol::{DeviceFamily, FlowStep};
    use uuid::Uuid;

    fn event() -> FlowEvent {
        FlowEvent::ok(
            Uuid::now_v7(),
            FlowStep::HistoryWritten,
            DeviceFamily::QubeVital,
            "CM4_BLE_GW_TX",
            "e4:5f:01:aa:bb:cc",
        )
    }

    #[tokio::test]
    async fn publish_reaches_ring_and_subscribers() {
        let hub = EventHub::new(500, 50);
        let (replay, mut rx) = hub.subscribe();
        assert!(replay.is_empty());

        let e = event();
        hub.publish(e.clone());

        assert_eq!(hub.stored(), 1);
        let live = rx.recv().await.unwrap();
        assert_eq!(live.flow_id, e.flow_id);
    }

    #[tokio::test]
    async fn subscribe_replays_last_n() {
        let hub = EventHub::new(500, 3);
        for _ in 0..10 {
            hub.publish(event());
        }
        let (replay, _rx) = hub.subscribe();
        assert_eq!(replay.len(), 3);
    }
}
