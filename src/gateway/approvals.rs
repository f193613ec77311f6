//! Human-approval decisions.
//!
//! `POST /approvals/decision` forwards an approval verdict to the waiting
//! workflow as a signal named `human-approval-<approval_id>`, bounded by a
//! 10 s deadline and the gRPC breaker.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State, http::HeaderMap, response::IntoResponse, routing::post, Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use super::require_ingest_token;
use crate::error::ApiError;
use crate::AppState;

const SIGNAL_DEADLINE: Duration = Duration::from_secs(10);

/// Approval routes.
pub fn router() -> Router<AppState> {
    Router::new().route("/approvals/decision", post(submit_decision))
}

/// Approval decision body.
#[derive(Debug, Deserialize)]
pub struct ApprovalDecision {
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub approval_id: String,
    pub approved: bool,
    pub feedback: Option<String>,
    pub modified_action: Option<serde_json::Value>,
    pub approved_by: Option<String>,
}

/// Send an approval decision to the durable workflow.
pub async fn submit_decision(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(decision): Json<ApprovalDecision>,
) -> Result<impl IntoResponse, ApiError> {
    require_ingest_token(&state, &headers)?;

    if decision.workflow_id.is_empty() || decision.approval_id.is_empty() {
        return Err(ApiError::validation(
            "workflow_id and approval_id are required",
        ));
    }

    let signal = format!("human-approval-{}", decision.approval_id);
    let payload = json!({
        "approval_id": decision.approval_id,
        "approved": decision.approved,
        "feedback": decision.feedback,
        "modified_action": decision.modified_action,
        "approved_by": decision.approved_by,
    });

    let engine = Arc::clone(&state.engine);
    let workflow_id = decision.workflow_id.clone();
    let run_id = decision.run_id.clone();
    let signal_name = signal.clone();
    let send = state.engine_breaker.execute(|| async move {
        engine
            .signal_workflow(&workflow_id, run_id.as_deref(), &signal_name, payload)
            .await
    });

    match tokio::time::timeout(SIGNAL_DEADLINE, send).await {
        Ok(Ok(())) => {
            tracing::info!(
                workflow_id = %decision.workflow_id,
                signal = %signal,
                approved = decision.approved,
                "Approval decision delivered"
            );
            Ok(Json(json!({ "status": "ok" })))
        }
        Ok(Err(e)) => Err(ApiError::from(e).with_workflow(decision.workflow_id)),
        Err(_) => Err(ApiError::unavailable("approval signal timed out")
            .with_workflow(decision.workflow_id)),
    }
}
