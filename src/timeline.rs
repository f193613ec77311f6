//! Timeline builder.
//!
//! Turns raw durable-engine history into human-readable rows for the
//! timeline endpoint. Rows can optionally be mirrored into the event log,
//! which lets operators rebuild the archive for workflows whose streaming
//! events were lost or trimmed.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::breaker::grpc::GrpcBreaker;
use crate::breaker::BreakerError;
use crate::engine::{DurableEngine, EngineError, HistoryEvent};
use crate::events::{types, WorkflowEvent};

/// Rendering mode for the timeline endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimelineMode {
    /// Milestones only.
    #[default]
    Summary,
    /// Every history event.
    Full,
}

impl TimelineMode {
    /// Parse the `mode` query parameter; anything but `full` is summary.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("full") {
            Self::Full
        } else {
            Self::Summary
        }
    }
}

/// One rendered timeline row.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineRow {
    #[serde(rename = "type")]
    pub event_type: String,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Builds timelines from durable history.
pub struct TimelineBuilder {
    engine: Arc<dyn DurableEngine>,
    breaker: GrpcBreaker,
}

impl TimelineBuilder {
    #[must_use]
    pub fn new(engine: Arc<dyn DurableEngine>, breaker: GrpcBreaker) -> Self {
        Self { engine, breaker }
    }

    /// Read history and mint sorted rows.
    pub async fn build(
        &self,
        workflow_id: &str,
        run_id: Option<&str>,
        mode: TimelineMode,
        include_payloads: bool,
    ) -> Result<Vec<TimelineRow>, BreakerError<EngineError>> {
        let engine = Arc::clone(&self.engine);
        let workflow_id_owned = workflow_id.to_string();
        let run_id_owned = run_id.map(ToString::to_string);
        let history = self
            .breaker
            .execute(|| async move {
                engine
                    .get_workflow_history(&workflow_id_owned, run_id_owned.as_deref())
                    .await
            })
            .await?;

        let mut rows: Vec<TimelineRow> = history
            .iter()
            .filter(|event| mode == TimelineMode::Full || is_milestone(&event.event_type))
            .map(|event| render_row(event, include_payloads))
            .collect();
        rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
        Ok(rows)
    }

    /// Convert rows to archivable events for the given workflow.
    #[must_use]
    pub fn to_events(workflow_id: &str, rows: &[TimelineRow]) -> Vec<WorkflowEvent> {
        rows.iter()
            .map(|row| {
                let mut event = WorkflowEvent::new(workflow_id, row.event_type.clone())
                    .with_message(row.message.clone());
                event.timestamp = row.timestamp;
                event.seq = row.seq;
                if let Some(Value::Object(map)) = row.payload.clone() {
                    event.payload = map;
                }
                event
            })
            .collect()
    }
}

impl std::fmt::Debug for TimelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineBuilder").finish_non_exhaustive()
    }
}

/// History kinds worth showing in summary mode.
fn is_milestone(kind: &str) -> bool {
    matches!(
        kind,
        "WorkflowExecutionStarted"
            | "WorkflowExecutionCompleted"
            | "WorkflowExecutionFailed"
            | "WorkflowExecutionCanceled"
            | "WorkflowExecutionTimedOut"
            | "WorkflowExecutionSignaled"
            | "ActivityTaskCompleted"
            | "ActivityTaskFailed"
            | "ActivityTaskTimedOut"
    )
}

fn render_row(event: &HistoryEvent, include_payloads: bool) -> TimelineRow {
    let (event_type, message) = humanize(event);
    TimelineRow {
        event_type,
        message,
        timestamp: event.timestamp,
        seq: u64::try_from(event.event_id).unwrap_or(0),
        payload: include_payloads.then(|| event.attributes.clone()),
    }
}

fn attr<'a>(event: &'a HistoryEvent, key: &str) -> Option<&'a str> {
    event.attributes.get(key).and_then(Value::as_str)
}

/// Map a raw history kind to a normalized tag and a readable message.
fn humanize(event: &HistoryEvent) -> (String, String) {
    match event.event_type.as_str() {
        "WorkflowExecutionStarted" => (
            types::WORKFLOW_STARTED.to_string(),
            "Workflow started".to_string(),
        ),
        "WorkflowExecutionCompleted" => (
            types::WORKFLOW_COMPLETED.to_string(),
            "Workflow completed".to_string(),
        ),
        "WorkflowExecutionFailed" => (
            types::WORKFLOW_FAILED.to_string(),
            match attr(event, "failure") {
                Some(reason) => format!("Workflow failed: {reason}"),
                None => "Workflow failed".to_string(),
            },
        ),
        "WorkflowExecutionCanceled" => (
            types::WORKFLOW_FAILED.to_string(),
            "Workflow canceled".to_string(),
        ),
        "WorkflowExecutionTimedOut" => (
            types::WORKFLOW_FAILED.to_string(),
            "Workflow timed out".to_string(),
        ),
        "WorkflowExecutionSignaled" => (
            types::WAITING_INPUT.to_string(),
            match attr(event, "signal_name") {
                Some(name) => format!("Signal received: {name}"),
                None => "Signal received".to_string(),
            },
        ),
        "ActivityTaskScheduled" => (
            types::TOOL_INVOKED.to_string(),
            match attr(event, "activity_type") {
                Some(name) => format!("Activity scheduled: {name}"),
                None => "Activity scheduled".to_string(),
            },
        ),
        "ActivityTaskStarted" => (
            types::DATA_PROCESSING.to_string(),
            "Activity started".to_string(),
        ),
        "ActivityTaskCompleted" => (
            types::TOOL_OBSERVATION.to_string(),
            match attr(event, "activity_type") {
                Some(name) => format!("Activity completed: {name}"),
                None => "Activity completed".to_string(),
            },
        ),
        "ActivityTaskFailed" | "ActivityTaskTimedOut" => (
            types::TOOL_ERROR.to_string(),
            match attr(event, "failure") {
                Some(reason) => format!("Activity failed: {reason}"),
                None => "Activity failed".to_string(),
            },
        ),
        "TimerStarted" => (types::PROGRESS.to_string(), "Timer started".to_string()),
        "TimerFired" => (types::PROGRESS.to_string(), "Timer fired".to_string()),
        other => (other.to_string(), other.replace('_', " ")),
    }
}
