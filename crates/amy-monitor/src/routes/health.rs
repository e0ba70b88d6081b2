//! Liveness endpoint.

use axum::Json;
use axum::extract::State;

use crate::state::AppState;

/// GET /health — liveness plus ring occupancy.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "events_stored": state.hub.stored(),
    }))
}
