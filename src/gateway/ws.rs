//! WebSocket streaming endpoint.
//!
//! `GET /stream/ws?workflow_id=&types=&last_event_id=` carries the same
//! replay-then-live semantics as the SSE endpoint; each message is one
//! JSON event. Liveness uses ping control frames every 20 s and a 60 s
//! read deadline refreshed by any client frame.

use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::SinkExt;
use serde_json::json;

use super::{
    attach_stream, AttachedStream, ConnectionGauge, ResumeCursor, StreamParams, TypeFilter,
    UnsubscribeGuard, WorkflowValidation,
};
use crate::error::ApiError;
use crate::events::{types, WorkflowEvent};
use crate::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(20);
const READ_DEADLINE: Duration = Duration::from_secs(60);
const FIRST_EVENT_TIMEOUT: Duration = Duration::from_secs(30);

/// WebSocket routes.
pub fn router() -> Router<AppState> {
    Router::new().route("/stream/ws", get(stream_events_ws))
}

/// Upgrade and stream workflow events as JSON frames.
pub async fn stream_events_ws(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let workflow_id = params
        .workflow_id
        .clone()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::validation("workflow_id query parameter is required"))?;
    let filter = TypeFilter::parse(params.types.as_deref());
    let cursor = ResumeCursor::from_request(&headers, params.last_event_id.as_deref());

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, workflow_id, filter, cursor)))
}

async fn handle_socket(
    mut socket: WebSocket,
    state: AppState,
    workflow_id: String,
    filter: TypeFilter,
    cursor: ResumeCursor,
) {
    let _gauge = ConnectionGauge::new("ws");

    let AttachedStream {
        replayed,
        mut subscription,
    } = match attach_stream(&state, &workflow_id, &cursor).await {
        Ok(attached) => attached,
        Err(e) => {
            tracing::error!(workflow_id = %workflow_id, error = %e, "WS attach failed");
            let _ = socket
                .send(error_message(&workflow_id, "Event stream unavailable"))
                .await;
            let _ = socket.close().await;
            return;
        }
    };
    let _teardown = UnsubscribeGuard::new(&state, &subscription);

    let mut delivered = !replayed.is_empty();
    for event in replayed {
        if filter.allows(&event.event_type) && send_event(&mut socket, &event).await.is_err() {
            return;
        }
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_activity = Instant::now();

    let first_event_timeout = tokio::time::sleep(FIRST_EVENT_TIMEOUT);
    tokio::pin!(first_event_timeout);

    loop {
        tokio::select! {
            received = subscription.receiver.recv() => match received {
                Some(event) => {
                    delivered = true;
                    if filter.allows(&event.event_type)
                        && send_event(&mut socket, &event).await.is_err()
                    {
                        break;
                    }
                }
                // Reader fiber closed the channel: manager shutdown.
                None => break,
            },

            message = socket.recv() => match message {
                Some(Ok(Message::Close(_))) | None => break,
                // Pongs and any other client frame refresh the deadline.
                Some(Ok(_)) => last_activity = Instant::now(),
                Some(Err(e)) => {
                    tracing::debug!(workflow_id = %workflow_id, error = %e, "WS read error");
                    break;
                }
            },

            _ = ping.tick() => {
                if last_activity.elapsed() > READ_DEADLINE {
                    tracing::debug!(workflow_id = %workflow_id, "WS read deadline exceeded");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            },

            () = &mut first_event_timeout, if !delivered => {
                match super::validate_quiet_stream(&state, &workflow_id, &cursor).await {
                    WorkflowValidation::Exists => {
                        first_event_timeout
                            .as_mut()
                            .reset(tokio::time::Instant::now() + FIRST_EVENT_TIMEOUT);
                    }
                    WorkflowValidation::CompletedOnStream(backlog) => {
                        for event in backlog {
                            if filter.allows(&event.event_type)
                                && send_event(&mut socket, &event).await.is_err()
                            {
                                break;
                            }
                        }
                        break;
                    }
                    WorkflowValidation::Missing(message) => {
                        let _ = socket.send(error_message(&workflow_id, &message)).await;
                        break;
                    }
                }
            }
        }
    }

    let _ = socket.close().await;
}

async fn send_event(socket: &mut WebSocket, event: &WorkflowEvent) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(event).unwrap_or_default();
    socket.send(Message::Text(payload.into())).await
}

fn error_message(workflow_id: &str, message: &str) -> Message {
    Message::Text(
        json!({
            "workflow_id": workflow_id,
            "type": types::ERROR_OCCURRED,
            "message": message,
        })
        .to_string()
        .into(),
    )
}
