//! HTTP gateway - streaming, ingest, approvals, timeline, schedules, auth.
//!
//! One router per concern, merged in [`create_router`]. The SSE and
//! WebSocket handlers share the resume-cursor grammar and the
//! replay-then-subscribe attach sequence defined here.

pub mod approvals;
pub mod auth;
pub mod ingest;
pub mod routes;
pub mod schedules;
pub mod sse;
pub mod timeline;
pub mod ws;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::Router;
use serde::Deserialize;

use crate::error::ApiError;
use crate::events::WorkflowEvent;
use crate::streaming::backend::{StreamError, CURSOR_TAIL};
use crate::streaming::Subscription;
use crate::AppState;

/// Delivery-channel depth per streaming connection.
pub(crate) const SUBSCRIBER_BUFFER: usize = 256;

/// Create the gateway router with all routes.
pub fn create_router() -> Router<AppState> {
    Router::new()
        .merge(routes::router())
        .merge(sse::router())
        .merge(ws::router())
        .merge(ingest::router())
        .merge(approvals::router())
        .merge(timeline::router())
        .merge(schedules::router())
        .merge(auth::router())
}

/// Query parameters shared by the SSE and WebSocket endpoints.
#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub workflow_id: Option<String>,
    /// Comma-separated event-type filter.
    pub types: Option<String>,
    pub last_event_id: Option<String>,
}

/// Event-type filter parsed from the `types` query parameter.
#[derive(Debug, Clone, Default)]
pub struct TypeFilter {
    allowed: Option<Vec<String>>,
}

impl TypeFilter {
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        let allowed = raw.and_then(|raw| {
            let types: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(ToString::to_string)
                .collect();
            (!types.is_empty()).then_some(types)
        });
        Self { allowed }
    }

    #[must_use]
    pub fn allows(&self, event_type: &str) -> bool {
        self.allowed
            .as_ref()
            .is_none_or(|types| types.iter().any(|t| t == event_type))
    }
}

/// Resume cursor grammar: `Last-Event-ID` header wins over the
/// `last_event_id` query parameter; a value containing `-` is a stream id,
/// a plain integer is a sequence number, `$` means tail-only and absence
/// means start from the beginning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeCursor {
    Beginning,
    Tail,
    StreamId(String),
    Seq(u64),
}

impl ResumeCursor {
    #[must_use]
    pub fn from_request(headers: &HeaderMap, query_cursor: Option<&str>) -> Self {
        let raw = headers
            .get("last-event-id")
            .and_then(|value| value.to_str().ok())
            .or(query_cursor);
        Self::parse(raw)
    }

    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => Self::Beginning,
            Some("$") => Self::Tail,
            Some(value) if value.contains('-') => Self::StreamId(value.to_string()),
            Some(value) => match value.parse() {
                Ok(seq) => Self::Seq(seq),
                Err(_) => Self::Beginning,
            },
        }
    }
}

/// Replayed backlog plus a live subscription that starts strictly after it.
pub struct AttachedStream {
    pub replayed: Vec<WorkflowEvent>,
    pub subscription: Subscription,
}

/// Replay from the cursor and open the live subscription.
///
/// The subscription cursor is the highest replayed stream id, so no event
/// is both replayed and live-delivered, and none falls in between.
pub async fn attach_stream(
    state: &AppState,
    workflow_id: &str,
    cursor: &ResumeCursor,
) -> Result<AttachedStream, StreamError> {
    let streaming = &state.streaming;

    let (replayed, live_cursor) = match cursor {
        ResumeCursor::Beginning => (Vec::new(), None),
        ResumeCursor::Tail => (Vec::new(), Some(CURSOR_TAIL.to_string())),
        ResumeCursor::StreamId(id) => {
            let replayed = streaming.replay_from_stream_id(workflow_id, id).await?;
            let last = replayed
                .last()
                .and_then(|event| event.stream_id.clone())
                .unwrap_or_else(|| id.clone());
            (replayed, Some(last))
        }
        ResumeCursor::Seq(seq) => {
            let replayed = streaming.replay_since(workflow_id, *seq).await?;
            let last = match replayed.last().and_then(|event| event.stream_id.clone()) {
                Some(id) => Some(id),
                // Nothing newer than the cursor: everything currently on
                // the stream is already seen, so live delivery starts
                // after the present tail.
                None => streaming.get_last_stream_id(workflow_id).await?,
            };
            (replayed, last)
        }
    };

    let subscription = match live_cursor {
        Some(cursor) => streaming.subscribe_from(workflow_id, SUBSCRIBER_BUFFER, &cursor),
        None => streaming.subscribe(workflow_id, SUBSCRIBER_BUFFER),
    };

    Ok(AttachedStream {
        replayed,
        subscription,
    })
}

/// Enforce the optional static bearer token on ingest-style endpoints.
pub(crate) fn require_ingest_token(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(), ApiError> {
    let Some(expected) = &state.config.gateway.ingest_token else {
        return Ok(());
    };
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match presented {
        Some(token) if token == expected => Ok(()),
        _ => Err(ApiError::unauthorized()),
    }
}

/// Ensures connection teardown always releases the subscription, whatever
/// path the handler exits through.
pub(crate) struct UnsubscribeGuard {
    streaming: std::sync::Arc<crate::streaming::EventStreamManager>,
    workflow_id: String,
    subscription_id: u64,
}

impl UnsubscribeGuard {
    pub fn new(state: &AppState, subscription: &Subscription) -> Self {
        Self {
            streaming: std::sync::Arc::clone(&state.streaming),
            workflow_id: subscription.workflow_id().to_string(),
            subscription_id: subscription.id(),
        }
    }
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        self.streaming
            .unsubscribe_by_id(&self.workflow_id, self.subscription_id);
    }
}

/// Outcome of validating a quiet stream against the durable engine.
pub(crate) enum WorkflowValidation {
    /// The workflow exists and may still emit; keep waiting.
    Exists,
    /// The workflow already completed; the backlog (from the caller's
    /// cursor) is all there will ever be.
    CompletedOnStream(Vec<WorkflowEvent>),
    /// The workflow is unknown or validation failed terminally.
    Missing(String),
}

/// Bound on the engine describe call issued from streaming handlers.
const DESCRIBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// First-event validation, shared by SSE and WebSocket handlers.
///
/// Consults the stream tail first: a completion record means the workflow
/// finished before the subscriber attached (visibility race), which is
/// resolved by replaying from the caller's cursor and closing. Otherwise
/// the durable engine is asked whether the workflow exists at all.
pub(crate) async fn validate_quiet_stream(
    state: &AppState,
    workflow_id: &str,
    cursor: &ResumeCursor,
) -> WorkflowValidation {
    if state.streaming.has_emitted_completion(workflow_id).await {
        let backlog = match cursor {
            ResumeCursor::StreamId(id) => state
                .streaming
                .replay_from_stream_id(workflow_id, id)
                .await
                .unwrap_or_default(),
            ResumeCursor::Seq(seq) => state
                .streaming
                .replay_since(workflow_id, *seq)
                .await
                .unwrap_or_default(),
            ResumeCursor::Beginning => state
                .streaming
                .replay_since(workflow_id, 0)
                .await
                .unwrap_or_default(),
            ResumeCursor::Tail => Vec::new(),
        };
        return WorkflowValidation::CompletedOnStream(backlog);
    }

    let engine = std::sync::Arc::clone(&state.engine);
    let workflow = workflow_id.to_string();
    let describe = state
        .engine_breaker
        .execute(|| async move { engine.describe_workflow(&workflow, None).await });

    match tokio::time::timeout(DESCRIBE_TIMEOUT, describe).await {
        Ok(Ok(_)) => WorkflowValidation::Exists,
        Ok(Err(crate::breaker::BreakerError::Inner(e))) if e.is_not_found() => {
            WorkflowValidation::Missing("Workflow not found".to_string())
        }
        Ok(Err(e)) => WorkflowValidation::Missing(format!("Workflow validation failed: {e}")),
        Err(_) => WorkflowValidation::Missing("Workflow validation timed out".to_string()),
    }
}

/// Gauge guard for open streaming connections.
pub(crate) struct ConnectionGauge {
    transport: &'static str,
}

impl ConnectionGauge {
    pub fn new(transport: &'static str) -> Self {
        crate::metrics::add_stream_connections(transport, 1.0);
        Self { transport }
    }
}

impl Drop for ConnectionGauge {
    fn drop(&mut self) {
        crate::metrics::add_stream_connections(self.transport, -1.0);
    }
}
