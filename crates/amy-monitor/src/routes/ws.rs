//! WebSocket endpoint for real-time flow-event streaming.
//!
//! New subscribers get a replay of the most recent events, then the
//! live stream, one JSON frame per event. Slow subscribers lag on the
//! broadcast channel and lose their oldest undelivered events.

use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use tokio::sync::broadcast;

use amy_protocol::FlowEvent;

use crate::state::AppState;

/// A send slower than this means the subscriber is gone or wedged.
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// GET /ws — upgrade to WebSocket for real-time flow events.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        let (replay, rx) = state.hub.subscribe();
        handle_socket(socket, replay, rx)
    })
}

async fn handle_socket(
    mut socket: WebSocket,
    replay: Vec<FlowEvent>,
    mut rx: broadcast::Receiver<FlowEvent>,
) {
    tracing::info!(replay = replay.len(), "WebSocket client connected");

    for event in &replay {
        if send_event(&mut socket, event).await.is_err() {
            tracing::info!("WebSocket client left during replay");
            return;
        }
    }

    loop {
        tokio::select! {
            // Forward live events to the client.
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break; // Client disconnected or wedged
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("WebSocket client lagged, skipped {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break; // Hub gone
                    }
                }
            }
            // Handle incoming messages from the client (ping/pong, close).
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {} // Ignore text/binary from client
                    Some(Err(_)) => break,
                }
            }
        }
    }

    tracing::info!("WebSocket client disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &FlowEvent) -> Result<(), ()> {
    let json = match serde_json::to_string(event) {
        Ok(j) => j,
        Err(e) => {
            tracing::error!("failed to serialize flow event: {e}");
            return Ok(());
        }
    };
    match tokio::time::timeout(SEND_TIMEOUT, socket.send(Message::Text(json.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(()),
        Err(_) => {
            tracing::warn!("WebSocket send timed out");
            Err(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amy_protocol::{DeviceFamily, FlowStep};
    use uuid::Uuid;

    #[test]
    fn flow_event_serializes_to_one_frame() {
        let event = FlowEvent::ok(
            Uuid::now_v7(),
            FlowStep::EmittedEmergency,
            DeviceFamily::KatiWatch,
            "iMEDE_watch/sos",
            "865067123456789",
        )
        .with_reason("CRITICAL");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("emitted_emergency"));
        assert!(json.contains("CRITICAL"));
        assert!(!json.contains('\n'));
    }
}
