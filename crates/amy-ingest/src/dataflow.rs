//! Data-flow event emitter.
//!
//! Handlers `emit()` into a bounded channel; one drainer task POSTs the
//! events to the collector (`amy-monitor`) in order. The single drainer
//! preserves per-flow ordering. The channel never silently drops: a
//! producer blocked longer than 500 ms gives up and bumps the
//! backpressure counter instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use amy_protocol::FlowEvent;

/// How long `emit` may block on a full channel before counting a drop.
const EMIT_BLOCK_BUDGET: Duration = Duration::from_millis(500);

/// Collector POST retry backoff (two retries after the first attempt).
const POST_BACKOFF_MS: [u64; 2] = [100, 400];

/// Seam for flow-event emission; the pipeline never knows whether
/// events go over HTTP or into a test buffer.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: FlowEvent);
}

// ── HTTP emitter ──────────────────────────────────────────────

/// Producer half: enqueues events for the drainer.
pub struct HttpEventSink {
    tx: mpsc::Sender<FlowEvent>,
    dropped: Arc<AtomicU64>,
}

/// Consumer half: drains the channel to the collector endpoint.
/// Runs until every sender is dropped, then flushes what is queued.
pub struct DataflowDrainer {
    rx: mpsc::Receiver<FlowEvent>,
    client: reqwest::Client,
    collector_url: String,
    dropped: Arc<AtomicU64>,
}

impl HttpEventSink {
    pub fn new(collector_url: &str, channel_capacity: usize) -> (Self, DataflowDrainer) {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        (
            Self {
                tx,
                dropped: dropped.clone(),
            },
            DataflowDrainer {
                rx,
                client: reqwest::Client::new(),
                collector_url: collector_url.to_string(),
                dropped,
            },
        )
    }

    /// Events dropped so far (backpressure + collector failures).
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn emit(&self, event: FlowEvent) {
        if let Err(e) = self.tx.send_timeout(event, EMIT_BLOCK_BUDGET).await {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(cause = "backpressure", error = %e, "dropped flow event");
        }
    }
}

impl DataflowDrainer {
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            self.post(&event).await;
        }
        tracing::debug!("data-flow drainer stopped");
    }

    async fn post(&self, event: &FlowEvent) {
        let mut attempt = 0usize;
        loop {
            let result = self
                .client
                .post(&self.collector_url)
                .json(event)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return,
                Ok(response) => {
                    tracing::debug!(
                        status = %response.status(),
                        attempt = attempt,
                        "collector rejected flow event"
                    );
                }
                Err(e) => {
                    tracing::debug!(error = %e, attempt = attempt, "collector unreachable");
                }
            }

            let Some(delay) = POST_BACKOFF_MS.get(attempt) else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    flow_id = %event.flow_id,
                    cause = "collector_down",
                    "dropped flow event"
                );
                return;
            };
            tokio::time::sleep(Duration::from_millis(*delay)).await;
            attempt += 1;
        }
    }
}

// ── Test sink ─────────────────────────────────────────────────

/// Records every emitted event for assertions.
#[derive(Default)]
pub struct MemoryEventSink {
    events: std::sync::Mutex<Vec<FlowEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FlowEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events for one flow, in emission order.
    pub fn flow(&self, flow_id: uuid::Uuid) -> Vec<FlowEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.flow_id == flow_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn emit(&self, event: FlowEvent) {
        self.events.lock().unwrap().push(event);
    }
}
