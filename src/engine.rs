//! Contracts for the external durable workflow engine.
//!
//! The engine (Temporal in the cloud deployment) lives outside this crate.
//! Everything here is a narrow interface: the transport layer validates
//! workflow existence and sends signals through [`DurableEngine`], the
//! timeline builder reads history through it, and the scheduled-task
//! manager drives cron starts through [`ScheduleClient`]. Concrete clients
//! are injected at wiring time; tests use in-memory fakes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tonic::Code;

use crate::breaker::grpc::GrpcCoded;

/// Error surface of the durable engine boundary.
///
/// Variants mirror the gRPC status codes the engine speaks so the breaker
/// wrapper can classify them without losing the original cause.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid request: {0}")]
    InvalidArgument(String),
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("engine internal error: {0}")]
    Internal(String),
}

impl EngineError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<tonic::Status> for EngineError {
    fn from(status: tonic::Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::NotFound => Self::NotFound(message),
            Code::AlreadyExists => Self::AlreadyExists(message),
            Code::InvalidArgument | Code::FailedPrecondition => Self::InvalidArgument(message),
            Code::Unavailable => Self::Unavailable(message),
            Code::DeadlineExceeded | Code::Cancelled => Self::DeadlineExceeded(message),
            _ => Self::Internal(message),
        }
    }
}

impl GrpcCoded for EngineError {
    fn grpc_code(&self) -> Option<Code> {
        Some(match self {
            Self::NotFound(_) => Code::NotFound,
            Self::AlreadyExists(_) => Code::AlreadyExists,
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::Unavailable(_) => Code::Unavailable,
            Self::DeadlineExceeded(_) => Code::DeadlineExceeded,
            Self::Internal(_) => Code::Internal,
        })
    }
}

/// Terminal/visible status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowRunStatus {
    Running,
    Completed,
    Failed,
    Canceled,
    Terminated,
    TimedOut,
    Unknown,
}

impl WorkflowRunStatus {
    /// True once the run can no longer produce events.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !matches!(self, Self::Running | Self::Unknown)
    }
}

/// Result of describing a workflow execution.
#[derive(Debug, Clone)]
pub struct WorkflowDescription {
    pub workflow_id: String,
    pub run_id: String,
    pub status: WorkflowRunStatus,
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub close_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// Request to start a workflow.
#[derive(Debug, Clone)]
pub struct StartWorkflowRequest {
    pub workflow_type: String,
    pub task_queue: String,
    pub workflow_id: String,
    pub run_timeout: Option<Duration>,
    pub memo: HashMap<String, String>,
    pub input: Value,
}

/// Identifiers of a started workflow.
#[derive(Debug, Clone)]
pub struct StartedWorkflow {
    pub workflow_id: String,
    pub run_id: String,
}

/// One event from the durable history of a workflow run.
#[derive(Debug, Clone)]
pub struct HistoryEvent {
    pub event_id: i64,
    pub event_type: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Kind-specific attributes, already decoded to JSON.
    pub attributes: Value,
}

/// Durable workflow engine operations the core consumes.
#[async_trait]
pub trait DurableEngine: Send + Sync {
    async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<StartedWorkflow, EngineError>;

    async fn signal_workflow(
        &self,
        workflow_id: &str,
        run_id: Option<&str>,
        signal: &str,
        payload: Value,
    ) -> Result<(), EngineError>;

    async fn describe_workflow(
        &self,
        workflow_id: &str,
        run_id: Option<&str>,
    ) -> Result<WorkflowDescription, EngineError>;

    async fn get_workflow_history(
        &self,
        workflow_id: &str,
        run_id: Option<&str>,
    ) -> Result<Vec<HistoryEvent>, EngineError>;
}

/// Cron/timezone pair driving an external schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSpec {
    pub cron: String,
    pub timezone: String,
}

/// Action args the external scheduler replays on every fire.
#[derive(Debug, Clone)]
pub struct ScheduleAction {
    pub workflow_type: String,
    pub task_queue: String,
    pub input: Value,
    pub run_timeout: Duration,
}

/// Request to create an external schedule.
#[derive(Debug, Clone)]
pub struct CreateScheduleRequest {
    pub schedule_id: String,
    pub spec: ScheduleSpec,
    pub action: ScheduleAction,
    pub memo: HashMap<String, String>,
    pub paused: bool,
}

/// Result of describing an external schedule.
#[derive(Debug, Clone)]
pub struct ScheduleDescription {
    pub schedule_id: String,
    pub spec: ScheduleSpec,
    pub action: ScheduleAction,
    pub paused: bool,
    /// The scheduler's authoritative next fire time.
    pub next_action_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// External scheduler operations.
///
/// `update` carries describe-and-modify semantics: the implementation must
/// replace any compiled calendars/intervals with the new spec and rewrite
/// the action args wholesale.
#[async_trait]
pub trait ScheduleClient: Send + Sync {
    async fn create(&self, request: CreateScheduleRequest) -> Result<(), EngineError>;

    async fn describe(&self, schedule_id: &str) -> Result<ScheduleDescription, EngineError>;

    async fn update(
        &self,
        schedule_id: &str,
        spec: ScheduleSpec,
        action: ScheduleAction,
    ) -> Result<(), EngineError>;

    async fn pause(&self, schedule_id: &str, note: &str) -> Result<(), EngineError>;

    async fn unpause(&self, schedule_id: &str, note: &str) -> Result<(), EngineError>;

    async fn delete(&self, schedule_id: &str) -> Result<(), EngineError>;
}

/// Stand-in engine for deployments that have not wired a durable engine
/// client yet. Streaming and ingest keep working; anything that needs the
/// engine answers `Unavailable`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredEngine;

impl UnconfiguredEngine {
    fn unavailable() -> EngineError {
        EngineError::Unavailable("durable engine not configured".to_string())
    }
}

#[async_trait]
impl DurableEngine for UnconfiguredEngine {
    async fn start_workflow(
        &self,
        _request: StartWorkflowRequest,
    ) -> Result<StartedWorkflow, EngineError> {
        Err(Self::unavailable())
    }

    async fn signal_workflow(
        &self,
        _workflow_id: &str,
        _run_id: Option<&str>,
        _signal: &str,
        _payload: Value,
    ) -> Result<(), EngineError> {
        Err(Self::unavailable())
    }

    async fn describe_workflow(
        &self,
        _workflow_id: &str,
        _run_id: Option<&str>,
    ) -> Result<WorkflowDescription, EngineError> {
        Err(Self::unavailable())
    }

    async fn get_workflow_history(
        &self,
        _workflow_id: &str,
        _run_id: Option<&str>,
    ) -> Result<Vec<HistoryEvent>, EngineError> {
        Err(Self::unavailable())
    }
}

#[async_trait]
impl ScheduleClient for UnconfiguredEngine {
    async fn create(&self, _request: CreateScheduleRequest) -> Result<(), EngineError> {
        Err(Self::unavailable())
    }

    async fn describe(&self, _schedule_id: &str) -> Result<ScheduleDescription, EngineError> {
        Err(Self::unavailable())
    }

    async fn update(
        &self,
        _schedule_id: &str,
        _spec: ScheduleSpec,
        _action: ScheduleAction,
    ) -> Result<(), EngineError> {
        Err(Self::unavailable())
    }

    async fn pause(&self, _schedule_id: &str, _note: &str) -> Result<(), EngineError> {
        Err(Self::unavailable())
    }

    async fn unpause(&self, _schedule_id: &str, _note: &str) -> Result<(), EngineError> {
        Err(Self::unavailable())
    }

    async fn delete(&self, _schedule_id: &str) -> Result<(), EngineError> {
        Err(Self::unavailable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_preserves_code() {
        let err = EngineError::from(tonic::Status::not_found("wf gone"));
        assert!(err.is_not_found());
        assert_eq!(err.grpc_code(), Some(Code::NotFound));

        let err = EngineError::from(tonic::Status::unavailable("down"));
        assert_eq!(err.grpc_code(), Some(Code::Unavailable));
    }

    #[test]
    fn test_run_status_closed() {
        assert!(!WorkflowRunStatus::Running.is_closed());
        assert!(WorkflowRunStatus::Completed.is_closed());
        assert!(WorkflowRunStatus::TimedOut.is_closed());
    }
}
