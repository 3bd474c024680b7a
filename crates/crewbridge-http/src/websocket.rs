//! WebSocket handler for live session events.
//!
//! Clients connect to `/ws/sessions/{session_id}` (optionally
//! `?agent=<name>`) and receive the session's replay followed by live
//! events, one JSON text frame per [`BridgeEvent`].

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::{IntoResponse, Response},
};
use crewbridge_core::{BridgeEvent, Observer, SessionId};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;

use super::routes::core_failure;
use super::SharedState;

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Only forward events about this agent.
    #[serde(default)]
    agent: Option<String>,
}

/// Handler for GET /ws/sessions/{session_id}
///
/// The observer is attached before the upgrade so an unknown session or
/// agent is answered with a plain 404.
pub async fn ws_handler(
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
    State(state): State<Arc<SharedState>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let session_id = SessionId(session_id);
    let observer = match state
        .controller
        .attach(&session_id, query.agent.as_deref())
    {
        Ok(observer) => observer,
        Err(e) => return core_failure(e).into_response(),
    };

    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state, observer)),
        Err(rejection) => {
            state.controller.detach(observer.handle());
            rejection.into_response()
        }
    }
}

/// Forward observer events until either side goes away, then detach.
async fn handle_socket(socket: WebSocket, state: Arc<SharedState>, mut observer: Observer) {
    let handle = observer.handle().clone();
    log::debug!(
        "WebSocket observer {} attached to session {}",
        handle.id,
        handle.session_id
    );
    let (mut sender, mut receiver) = socket.split();

    // Client frames carry nothing; only a close matters.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = observer.recv().await {
            let Some(json) = frame(&event) else {
                continue;
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break; // Client disconnected
            }
        }
        // Session closed or observer dropped for falling behind
        let _ = sender.close().await;
    });

    tokio::select! {
        _ = &mut recv_task => send_task.abort(),
        _ = &mut send_task => recv_task.abort(),
    }

    state.controller.detach(&handle);
    log::debug!("WebSocket observer {} closed", handle.id);
}

fn frame(event: &BridgeEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            log::warn!("Failed to serialize bridge event: {}", e);
            None
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
