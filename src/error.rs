//! API error taxonomy.
//!
//! One error surface for every HTTP handler. Validation problems map to
//! 400, authentication to 401 (without leaking internals), missing
//! resources to 404, breaker rejections and exhausted retries to 503, and
//! everything else to 500. Responses always carry
//! `{error, workflow_id?, schedule_id?}` JSON.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Serialize;

use crate::breaker::BreakerError;
use crate::engine::EngineError;
use crate::scheduler::ScheduleError;

/// Error category, deciding the status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiErrorKind {
    Validation,
    Unauthorized,
    NotFound,
    Conflict,
    Unavailable,
    Internal,
}

/// User-visible API error.
#[derive(Debug, Clone)]
pub struct ApiError {
    kind: ApiErrorKind,
    message: String,
    workflow_id: Option<String>,
    schedule_id: Option<String>,
}

impl ApiError {
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Validation, message)
    }

    #[must_use]
    pub fn unauthorized() -> Self {
        // Deliberately unspecific.
        Self::new(ApiErrorKind::Unauthorized, "unauthorized")
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::NotFound, message)
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Conflict, message)
    }

    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Unavailable, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Internal, message)
    }

    fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            workflow_id: None,
            schedule_id: None,
        }
    }

    /// Attach workflow context to the response body.
    #[must_use]
    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Attach schedule context to the response body.
    #[must_use]
    pub fn with_schedule(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = Some(schedule_id.into());
        self
    }

    #[must_use]
    pub fn kind(&self) -> &ApiErrorKind {
        &self.kind
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self.kind {
            ApiErrorKind::Validation => StatusCode::BAD_REQUEST,
            ApiErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorKind::NotFound => StatusCode::NOT_FOUND,
            ApiErrorKind::Conflict => StatusCode::CONFLICT,
            ApiErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    workflow_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schedule_id: Option<&'a str>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: &self.message,
            workflow_id: self.workflow_id.as_deref(),
            schedule_id: self.schedule_id.as_deref(),
        };
        (self.status(), Json(&body)).into_response()
    }
}

impl From<ScheduleError> for ApiError {
    fn from(err: ScheduleError) -> Self {
        let message = err.to_string();
        match err {
            e if e.is_validation() => Self::validation(message),
            ScheduleError::NotFound(_) => Self::not_found(message),
            ScheduleError::Unavailable(_) => Self::unavailable(message),
            ScheduleError::Engine(engine) => Self::from(engine),
            ScheduleError::Catalog(_) => Self::internal(message),
            _ => Self::internal(message),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::NotFound(_) => Self::not_found(message),
            EngineError::InvalidArgument(_) => Self::validation(message),
            EngineError::AlreadyExists(_) => Self::conflict(message),
            EngineError::Unavailable(_) | EngineError::DeadlineExceeded(_) => {
                Self::unavailable(message)
            }
            EngineError::Internal(_) => Self::internal(message),
        }
    }
}

impl<E: Into<ApiError> + std::fmt::Display> From<BreakerError<E>> for ApiError {
    fn from(err: BreakerError<E>) -> Self {
        match err {
            BreakerError::Open | BreakerError::TooManyRequests => {
                Self::unavailable(err.to_string())
            }
            BreakerError::Inner(inner) => inner.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::validation("bad").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::unauthorized().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::unavailable("down").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_breaker_rejection_maps_to_503() {
        let err: ApiError = BreakerError::<EngineError>::Open.into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_schedule_validation_maps_to_400() {
        let err: ApiError = ScheduleError::IntervalTooShort { min_minutes: 60 }.into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_engine_not_found_maps_to_404() {
        let err: ApiError = EngineError::NotFound("wf".into()).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
