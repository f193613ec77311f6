//! External event ingest.
//!
//! `POST /events` accepts one event object or an array, capped at 10 MB,
//! optionally guarded by a static bearer token. Ingested events go through
//! the normal publish path: sequence assignment, role injection, fan-out
//! and archival.

use axum::{
    extract::{DefaultBodyLimit, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use super::require_ingest_token;
use crate::error::ApiError;
use crate::events::WorkflowEvent;
use crate::AppState;

/// Maximum accepted request body.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Ingest routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/events", post(ingest_events))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}

/// One externally produced event.
#[derive(Debug, Deserialize)]
pub struct IngestEvent {
    pub workflow_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub agent_id: Option<String>,
    pub message: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    /// RFC 3339 with nanoseconds; defaults to the ingest time.
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

/// Request body: a single event or an array of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum IngestBody {
    One(IngestEvent),
    Many(Vec<IngestEvent>),
}

/// Accept externally produced events into the stream.
pub async fn ingest_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IngestBody>,
) -> Result<impl IntoResponse, ApiError> {
    require_ingest_token(&state, &headers)?;

    let incoming = match body {
        IngestBody::One(event) => vec![event],
        IngestBody::Many(events) => events,
    };

    let count = incoming.len();
    for ingest in incoming {
        if ingest.workflow_id.is_empty() {
            return Err(ApiError::validation("workflow_id is required"));
        }
        if ingest.event_type.is_empty() {
            return Err(ApiError::validation("type is required")
                .with_workflow(ingest.workflow_id));
        }

        let mut event = WorkflowEvent::new(ingest.workflow_id, ingest.event_type)
            .with_payload(ingest.payload);
        event.agent_id = ingest.agent_id;
        event.message = ingest.message;
        if let Some(timestamp) = ingest.timestamp {
            event.timestamp = timestamp;
        }
        state.streaming.publish(event).await;
    }

    tracing::debug!(count, "Ingested external events");
    Ok(Json(json!({ "status": "ok" })))
}
