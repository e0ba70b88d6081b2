//! Shared test harness for E2E integration tests.
//!
//! Wires the real pipeline (codec → resolver → writer → events) over
//! the in-memory store and event sink, exercising actual code paths
//! across crate boundaries without a broker or a database.

use std::sync::Arc;

use uuid::Uuid;

use amy_ingest::dataflow::MemoryEventSink;
use amy_ingest::pipeline::Pipeline;
use amy_ingest::resolver::PatientResolver;
use amy_ingest::store::MemoryStore;
use amy_ingest::writer::{CanonicalWriter, WriterSettings};
use amy_protocol::{FlowEvent, FlowStep};

/// End-to-end harness around one pipeline instance.
pub struct TestHarness {
    /// Shared in-memory document store.
    pub store: Arc<MemoryStore>,
    /// Recorded flow events.
    pub events: Arc<MemoryEventSink>,
    /// The pipeline under test.
    pub pipeline: Arc<Pipeline>,
}

impl TestHarness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(MemoryEventSink::new());
        let pipeline = Arc::new(Pipeline::new(
            PatientResolver::new(store.clone(), 60),
            CanonicalWriter::new(store.clone(), WriterSettings::default()),
            events.clone(),
        ));
        Self {
            store,
            events,
            pipeline,
        }
    }

    /// Run one MQTT message through the pipeline.
    pub async fn process(&self, topic: &str, payload: &str) {
        self.pipeline.handle_message(topic, payload.as_bytes()).await;
    }

    /// Distinct flow ids in first-seen order.
    pub fn flow_ids(&self) -> Vec<Uuid> {
        let mut seen = Vec::new();
        for event in self.events.events() {
            if !seen.contains(&event.flow_id) {
                seen.push(event.flow_id);
            }
        }
        seen
    }

    /// Step sequence of one flow.
    pub fn steps(&self, flow_id: Uuid) -> Vec<FlowStep> {
        self.events
            .flow(flow_id)
            .iter()
            .map(|e| e.step)
            .collect()
    }

    /// All events of one step across flows.
    pub fn events_at(&self, step: FlowStep) -> Vec<FlowEvent> {
        self.events
            .events()
            .into_iter()
            .filter(|e| e.step == step)
            .collect()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
