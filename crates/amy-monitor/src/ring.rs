//! Fixed-capacity FIFO ring buffer for recent flow events.
//!
//! The only sanctioned loss point of the event path: when full, the
//! oldest event is evicted.

use std::collections::VecDeque;

use amy_protocol::FlowEvent;

pub struct RingBuffer {
    events: VecDeque<FlowEvent>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, event: FlowEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Newest-last snapshot of up to `limit` most recent events.
    pub fn recent(&self, limit: usize) -> Vec<FlowEvent> {
        let skip = self.events.len().saturating_sub(limit);
        self.events.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amy_protocol::{DeviceFamily, FlowStep};
    use uuid::Uuid;

    fn event(device_id: &str) -> FlowEvent {
        FlowEvent::ok(
            Uuid::now_v7(),
            FlowStep::Received,
            DeviceFamily::KatiWatch,
            "iMEDE_watch/hb",
            device_id,
        )
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut ring = RingBuffer::new(3);
        for i in 0..5 {
            ring.push(event(&format!("dev-{i}")));
        }
        assert_eq!(ring.len(), 3);

        let recent = ring.recent(10);
        let ids: Vec<&str> = recent.iter().map(|e| e.device_id.as_str()).collect();
        assert_eq!(ids, vec!["dev-2", "dev-3", "dev-4"]);
    }

    #[test]
    fn recent_respects_limit() {
        let mut ring = RingBuffer::new(10);
        for i in 0..6 {
            ring.push(event(&format!("dev-{i}")));
        }
        let recent = ring.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].device_id, "dev-5");
    }

    #[test]
    fn empty_ring() {
        let ring = RingBuffer::new(5);
        assert!(ring.is_empty());
        assert!(ring.recent(10).is_empty());
    }
}
