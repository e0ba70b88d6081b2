//! Ring buffer query endpoint.

use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;

use amy_protocol::FlowEvent;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Maximum events to return (newest last).
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// GET /data-flow/events — snapshot of the most recent events.
pub async fn recent_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<FlowEvent>>> {
    if query.limit == 0 {
        return Err(ApiError::BadRequest("limit must be positive".into()));
    }
    Ok(Json(state.hub.recent(query.limit)))
}
