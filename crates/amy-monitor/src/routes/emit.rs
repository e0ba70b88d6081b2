//! Flow-event ingestion endpoint (the HTTP hop from `amy-ingest`).

use axum::Json;
use axum::extract::State;

use amy_protocol::FlowEvent;

use crate::state::AppState;

/// POST /data-flow/emit — record one flow event and fan it out.
pub async fn ingest_event(
    State(state): State<AppState>,
    Json(event): Json<FlowEvent>,
) -> Json<serde_json::Value> {
    tracing::debug!(
        flow_id = %event.flow_id,
        step = ?event.step,
        "flow event ingested"
    );
    state.hub.publish(event);
    Json(serde_json::json!({ "accepted": true }))
}
