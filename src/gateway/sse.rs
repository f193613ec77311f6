//! SSE streaming endpoint.
//!
//! `GET /stream/sse?workflow_id=&types=&last_event_id=` bridges an HTTP
//! client to the streaming manager: replay the backlog from the resume
//! cursor, then deliver live events, with heartbeat comments and a
//! first-event timer that validates the workflow against the durable
//! engine when the stream stays quiet.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{
        sse::{Event, KeepAlive, Sse},
        AppendHeaders, IntoResponse,
    },
    routing::get,
    Router,
};
use serde_json::json;

use super::{
    attach_stream, AttachedStream, ConnectionGauge, ResumeCursor, StreamParams, TypeFilter,
    UnsubscribeGuard, WorkflowValidation,
};
use crate::error::ApiError;
use crate::events::{types, WorkflowEvent};
use crate::AppState;

/// Heartbeat cadence on quiet connections.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// How long a stream may stay quiet before the workflow is validated.
const FIRST_EVENT_TIMEOUT: Duration = Duration::from_secs(30);

/// SSE routes.
pub fn router() -> Router<AppState> {
    Router::new().route("/stream/sse", get(stream_events))
}

/// Stream workflow events via SSE.
pub async fn stream_events(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let workflow_id = params
        .workflow_id
        .clone()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::validation("workflow_id query parameter is required"))?;
    let filter = TypeFilter::parse(params.types.as_deref());
    let cursor = ResumeCursor::from_request(&headers, params.last_event_id.as_deref());

    tracing::debug!(
        workflow_id = %workflow_id,
        cursor = ?cursor,
        "SSE client attaching"
    );

    let stream = async_stream::stream! {
        let _gauge = ConnectionGauge::new("sse");

        // Establish the stream before touching the backend so the client
        // sees headers and the opening comment immediately.
        yield Ok::<_, Infallible>(Event::default().comment("ok"));

        let AttachedStream { replayed, mut subscription } =
            match attach_stream(&state, &workflow_id, &cursor).await {
                Ok(attached) => attached,
                Err(e) => {
                    tracing::error!(
                        workflow_id = %workflow_id,
                        error = %e,
                        "SSE attach failed"
                    );
                    yield Ok(error_frame(&workflow_id, "Event stream unavailable"));
                    return;
                }
            };
        let _teardown = UnsubscribeGuard::new(&state, &subscription);

        // A replayed event proves the workflow exists even when the type
        // filter swallows it.
        let mut delivered = !replayed.is_empty();
        for event in replayed {
            if filter.allows(&event.event_type) {
                yield Ok(event_frame(&event));
            }
        }

        let first_event_timeout = tokio::time::sleep(FIRST_EVENT_TIMEOUT);
        tokio::pin!(first_event_timeout);

        loop {
            tokio::select! {
                received = subscription.receiver.recv() => match received {
                    Some(event) => {
                        delivered = true;
                        if filter.allows(&event.event_type) {
                            yield Ok(event_frame(&event));
                        }
                    }
                    // Reader fiber closed the channel: manager shutdown.
                    None => break,
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
                                if filter.allows(&event.event_type) {
                                    yield Ok(event_frame(&event));
                                }
                            }
                            break;
                        }
                        WorkflowValidation::Missing(message) => {
                            yield Ok(error_frame(&workflow_id, &message));
                            break;
                        }
                    }
                }
            }
        }
    };

    Ok((
        AppendHeaders([
            ("Cache-Control", "no-cache"),
            ("X-Accel-Buffering", "no"),
        ]),
        Sse::new(stream).keep_alive(
            KeepAlive::new()
                .interval(HEARTBEAT_INTERVAL)
                .text("heartbeat"),
        ),
    ))
}

/// Render one event as an SSE frame, using the stream id as the frame id
/// when available and the sequence number otherwise.
fn event_frame(event: &WorkflowEvent) -> Event {
    let id = event
        .stream_id
        .clone()
        .unwrap_or_else(|| event.seq.to_string());
    Event::default()
        .id(id)
        .event(event.event_type.clone())
        .data(serde_json::to_string(event).unwrap_or_default())
}

/// Terminal error frame.
fn error_frame(workflow_id: &str, message: &str) -> Event {
    Event::default().event(types::ERROR_OCCURRED).data(
        json!({
            "workflow_id": workflow_id,
            "type": types::ERROR_OCCURRED,
            "message": message,
        })
        .to_string(),
    )
}
