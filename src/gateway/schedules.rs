//! Schedule management API endpoints.
//!
//! CRUD over the scheduled-task manager. Responses render timestamps as
//! RFC 3339 and the schedule status in its catalog form.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::scheduler::{CreateScheduleInput, Schedule, ScheduleStatus, UpdateScheduleInput};
use crate::AppState;

/// Schedule routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/schedules", post(create_schedule).get(list_schedules))
        .route(
            "/api/v1/schedules/{id}",
            get(get_schedule)
                .patch(update_schedule)
                .delete(delete_schedule),
        )
        .route("/api/v1/schedules/{id}/pause", post(pause_schedule))
        .route("/api/v1/schedules/{id}/resume", post(resume_schedule))
}

/// Request to create a new schedule.
#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub cron_expression: String,
    pub timezone: Option<String>,
    pub task_query: String,
    pub task_context: Option<serde_json::Value>,
    pub max_budget_per_run_usd: Option<f64>,
    pub timeout_seconds: Option<u64>,
}

/// Request to update a schedule.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateScheduleRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub cron_expression: Option<String>,
    pub timezone: Option<String>,
    pub task_query: Option<String>,
    pub task_context: Option<serde_json::Value>,
    pub max_budget_per_run_usd: Option<f64>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub user_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ReasonBody {
    pub reason: Option<String>,
}

/// Schedule response.
#[derive(Debug, Serialize)]
pub struct ScheduleResponse {
    pub id: String,
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub cron_expression: String,
    pub timezone: String,
    pub task_query: String,
    pub task_context: serde_json::Value,
    pub max_budget_per_run_usd: f64,
    pub timeout_seconds: u64,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
    pub last_run_at: Option<String>,
    pub next_run_at: Option<String>,
    pub total_runs: i64,
    pub successful_runs: i64,
    pub failed_runs: i64,
}

impl From<Schedule> for ScheduleResponse {
    fn from(schedule: Schedule) -> Self {
        Self {
            id: schedule.id,
            user_id: schedule.user_id,
            tenant_id: schedule.tenant_id,
            name: schedule.name,
            description: schedule.description,
            cron_expression: schedule.cron_expression,
            timezone: schedule.timezone,
            task_query: schedule.task_query,
            task_context: schedule.task_context,
            max_budget_per_run_usd: schedule.max_budget_per_run_usd,
            timeout_seconds: schedule.timeout_seconds,
            status: schedule.status.as_str().to_string(),
            created_at: schedule.created_at.to_rfc3339(),
            updated_at: schedule.updated_at.to_rfc3339(),
            last_run_at: schedule.last_run_at.map(|dt| dt.to_rfc3339()),
            next_run_at: schedule.next_run_at.map(|dt| dt.to_rfc3339()),
            total_runs: schedule.total_runs,
            successful_runs: schedule.successful_runs,
            failed_runs: schedule.failed_runs,
        }
    }
}

/// Create a new schedule.
///
/// # Endpoint
///
/// `POST /api/v1/schedules`
pub async fn create_schedule(
    State(state): State<AppState>,
    Json(req): Json<CreateScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.user_id.is_empty() {
        return Err(ApiError::validation("user_id is required"));
    }
    if req.task_query.is_empty() {
        return Err(ApiError::validation("task_query is required"));
    }

    let schedule = state
        .schedules
        .create(CreateScheduleInput {
            user_id: req.user_id,
            tenant_id: req.tenant_id,
            name: req.name,
            description: req.description,
            cron_expression: req.cron_expression,
            timezone: req.timezone,
            task_query: req.task_query,
            task_context: req.task_context,
            max_budget_per_run_usd: req.max_budget_per_run_usd,
            timeout_seconds: req.timeout_seconds,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(ScheduleResponse::from(schedule))))
}

/// List schedules.
///
/// # Endpoint
///
/// `GET /api/v1/schedules`
pub async fn list_schedules(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match params.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            ScheduleStatus::parse(&raw.to_uppercase())
                .ok_or_else(|| ApiError::validation(format!("unknown status filter: {raw}")))?,
        ),
    };

    let schedules = state
        .schedules
        .list(
            params.user_id.as_deref(),
            status,
            params.limit.unwrap_or(50),
            params.offset.unwrap_or(0),
        )
        .await?;
    let responses: Vec<ScheduleResponse> = schedules.into_iter().map(Into::into).collect();
    Ok(Json(responses))
}

/// Get a schedule by ID.
///
/// # Endpoint
///
/// `GET /api/v1/schedules/{id}`
pub async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let schedule = state
        .schedules
        .get(&id)
        .await
        .map_err(|e| ApiError::from(e).with_schedule(id))?;
    Ok(Json(ScheduleResponse::from(schedule)))
}

/// Partially update a schedule.
///
/// # Endpoint
///
/// `PATCH /api/v1/schedules/{id}`
pub async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let schedule = state
        .schedules
        .update(
            &id,
            UpdateScheduleInput {
                name: req.name,
                description: req.description,
                cron_expression: req.cron_expression,
                timezone: req.timezone,
                task_query: req.task_query,
                task_context: req.task_context,
                max_budget_per_run_usd: req.max_budget_per_run_usd,
                timeout_seconds: req.timeout_seconds,
            },
        )
        .await
        .map_err(|e| ApiError::from(e).with_schedule(id))?;
    Ok(Json(ScheduleResponse::from(schedule)))
}

/// Delete a schedule (soft).
///
/// # Endpoint
///
/// `DELETE /api/v1/schedules/{id}`
pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .schedules
        .delete(&id)
        .await
        .map_err(|e| ApiError::from(e).with_schedule(id))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Pause a schedule.
///
/// # Endpoint
///
/// `POST /api/v1/schedules/{id}/pause`
pub async fn pause_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReasonBody>,
) -> Result<impl IntoResponse, ApiError> {
    let reason = body.reason.unwrap_or_else(|| "paused via API".to_string());
    let schedule = state
        .schedules
        .pause(&id, &reason)
        .await
        .map_err(|e| ApiError::from(e).with_schedule(id))?;
    Ok(Json(ScheduleResponse::from(schedule)))
}

/// Resume a schedule.
///
/// # Endpoint
///
/// `POST /api/v1/schedules/{id}/resume`
pub async fn resume_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReasonBody>,
) -> Result<impl IntoResponse, ApiError> {
    let reason = body.reason.unwrap_or_else(|| "resumed via API".to_string());
    let schedule = state
        .schedules
        .resume(&id, &reason)
        .await
        .map_err(|e| ApiError::from(e).with_schedule(id))?;
    Ok(Json(ScheduleResponse::from(schedule)))
}
