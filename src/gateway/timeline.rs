//! Timeline endpoint.
//!
//! `GET /timeline?workflow_id=&run_id=&mode=summary|full&include_payloads=
//! &persist=` renders durable history as readable rows. With
//! `persist=true` the job is accepted and the rows are mirrored into the
//! event log asynchronously, best effort.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::error::ApiError;
use crate::timeline::{TimelineBuilder, TimelineMode};
use crate::AppState;

/// Timeline routes.
pub fn router() -> Router<AppState> {
    Router::new().route("/timeline", get(get_timeline))
}

#[derive(Debug, Deserialize)]
pub struct TimelineParams {
    pub workflow_id: Option<String>,
    pub run_id: Option<String>,
    pub mode: Option<String>,
    #[serde(default)]
    pub include_payloads: bool,
    #[serde(default)]
    pub persist: bool,
}

/// Build (and optionally archive) a workflow timeline.
pub async fn get_timeline(
    State(state): State<AppState>,
    Query(params): Query<TimelineParams>,
) -> Result<impl IntoResponse, ApiError> {
    let workflow_id = params
        .workflow_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::validation("workflow_id query parameter is required"))?;
    let mode = TimelineMode::parse(params.mode.as_deref().unwrap_or_default());

    let rows = state
        .timeline
        .build(
            &workflow_id,
            params.run_id.as_deref(),
            mode,
            params.include_payloads,
        )
        .await
        .map_err(|e| ApiError::from(e).with_workflow(workflow_id.clone()))?;

    if params.persist {
        match &state.event_log {
            Some(store) => {
                let store = Arc::clone(store);
                let events = TimelineBuilder::to_events(&workflow_id, &rows);
                let count = rows.len();
                let workflow = workflow_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = store.insert_batch(&events).await {
                        tracing::error!(
                            workflow_id = %workflow,
                            count,
                            error = %e,
                            "Timeline persistence failed"
                        );
                    }
                });
                return Ok((
                    StatusCode::ACCEPTED,
                    Json(json!({ "status": "accepted", "rows": count })),
                )
                    .into_response());
            }
            None => {
                return Err(ApiError::validation(
                    "timeline persistence requires a relational store",
                )
                .with_workflow(workflow_id));
            }
        }
    }

    Ok(Json(rows).into_response())
}
