//! Workflow event model.
//!
//! Events are the unit of observation flowing from workflow activities to
//! SSE/WebSocket subscribers. Every event carries a per-workflow monotonic
//! sequence number assigned at publish time and, once written to the stream
//! backend, an opaque backend-assigned stream id that serves as the preferred
//! resume cursor.

pub mod sanitize;

use serde::{Deserialize, Serialize};

/// Event type tags, mirroring the vocabulary emitted by workflow activities.
pub mod types {
    pub const WORKFLOW_STARTED: &str = "WORKFLOW_STARTED";
    pub const WORKFLOW_COMPLETED: &str = "WORKFLOW_COMPLETED";
    pub const WORKFLOW_FAILED: &str = "WORKFLOW_FAILED";
    pub const STREAM_END: &str = "STREAM_END";
    pub const ERROR_OCCURRED: &str = "ERROR_OCCURRED";

    pub const AGENT_STARTED: &str = "AGENT_STARTED";
    pub const AGENT_COMPLETED: &str = "AGENT_COMPLETED";
    pub const AGENT_FAILED: &str = "AGENT_FAILED";
    pub const AGENT_THINKING: &str = "AGENT_THINKING";

    pub const TOOL_INVOKED: &str = "TOOL_INVOKED";
    pub const TOOL_OBSERVATION: &str = "TOOL_OBSERVATION";
    pub const TOOL_ERROR: &str = "TOOL_ERROR";

    pub const LLM_PROMPT: &str = "LLM_PROMPT";
    pub const LLM_PARTIAL: &str = "LLM_PARTIAL";
    pub const LLM_OUTPUT: &str = "LLM_OUTPUT";

    pub const ROLE_ASSIGNED: &str = "ROLE_ASSIGNED";
    pub const DELEGATION: &str = "DELEGATION";
    pub const BUDGET_THRESHOLD: &str = "BUDGET_THRESHOLD";

    pub const PROGRESS: &str = "PROGRESS";
    pub const WAITING_INPUT: &str = "WAITING_INPUT";
    pub const WAITING_APPROVAL: &str = "WAITING_APPROVAL";
    pub const DATA_PROCESSING: &str = "DATA_PROCESSING";

    pub const HEARTBEAT: &str = "HEARTBEAT";
    pub const PING: &str = "PING";
}

/// Role assigned to events whose producer did not identify an agent.
pub const DEFAULT_ROLE: &str = "generalist";

/// A single observation produced by a workflow or one of its activities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Workflow this event belongs to.
    pub workflow_id: String,
    /// Event type tag (see [`types`]).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Agent that produced the event, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Human-readable message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Structured payload. Non-null after publish; the publisher injects a
    /// `role` key when the producer omitted one.
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    /// Event timestamp (nanosecond precision, RFC 3339 on the wire).
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Per-workflow monotonic sequence number, assigned at publish time.
    #[serde(default)]
    pub seq: u64,
    /// Backend-assigned stream id, present once the event hit the stream.
    /// Preferred resume cursor: opaque, lexicographically ordered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
}

impl WorkflowEvent {
    /// Create an event with the current timestamp and an empty payload.
    #[must_use]
    pub fn new(workflow_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            event_type: event_type.into(),
            agent_id: None,
            message: None,
            payload: serde_json::Map::new(),
            timestamp: chrono::Utc::now(),
            seq: 0,
            stream_id: None,
        }
    }

    /// Attach a message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach an agent id.
    #[must_use]
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Attach a payload map.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Map<String, serde_json::Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Terminal error event emitted on transport validation failures.
    #[must_use]
    pub fn error(workflow_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(workflow_id, types::ERROR_OCCURRED).with_message(message)
    }

    /// Whether this event should be mirrored to the relational event log.
    ///
    /// Streaming deltas, heartbeats and pings are ephemeral; everything
    /// else, including unknown types, is persisted.
    #[must_use]
    pub fn is_persistable(&self) -> bool {
        !matches!(
            self.event_type.as_str(),
            types::LLM_PARTIAL | types::LLM_PROMPT | types::HEARTBEAT | types::PING
        )
    }

    /// Whether a delivery failure for this event warrants error-level logs.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            types::WORKFLOW_FAILED
                | types::WORKFLOW_COMPLETED
                | types::AGENT_FAILED
                | types::ERROR_OCCURRED
                | types::TOOL_ERROR
        )
    }

    /// Whether this event marks the end of the workflow's stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            types::WORKFLOW_COMPLETED | types::WORKFLOW_FAILED | types::STREAM_END
        )
    }

    /// Return a copy with `payload.role` populated.
    ///
    /// The role is derived from the agent id (lowercased, hyphens mapped to
    /// underscores), falling back to [`DEFAULT_ROLE`]. An existing non-empty
    /// role wins. The original event is left untouched.
    #[must_use]
    pub fn with_injected_role(&self) -> Self {
        let has_role = self
            .payload
            .get("role")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|r| !r.is_empty());
        if has_role {
            return self.clone();
        }

        let mut event = self.clone();
        let role = derive_role(self.agent_id.as_deref());
        event
            .payload
            .insert("role".to_string(), serde_json::Value::String(role));
        event
    }
}

/// Derive the payload role from an agent id.
#[must_use]
pub fn derive_role(agent_id: Option<&str>) -> String {
    match agent_id {
        Some(id) if !id.is_empty() => id.to_lowercase().replace('-', "_"),
        _ => DEFAULT_ROLE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistable_filter_skips_deltas() {
        let partial = WorkflowEvent::new("wf-1", types::LLM_PARTIAL);
        assert!(!partial.is_persistable());

        let prompt = WorkflowEvent::new("wf-1", types::LLM_PROMPT);
        assert!(!prompt.is_persistable());

        let heartbeat = WorkflowEvent::new("wf-1", types::HEARTBEAT);
        assert!(!heartbeat.is_persistable());
    }

    #[test]
    fn test_persistable_filter_keeps_lifecycle_and_unknown() {
        for ty in [
            types::WORKFLOW_COMPLETED,
            types::AGENT_THINKING,
            types::TOOL_OBSERVATION,
            types::LLM_OUTPUT,
            types::BUDGET_THRESHOLD,
            "SOME_FUTURE_TYPE",
        ] {
            assert!(
                WorkflowEvent::new("wf-1", ty).is_persistable(),
                "{ty} should be persistable"
            );
        }
    }

    #[test]
    fn test_critical_types() {
        assert!(WorkflowEvent::new("wf-1", types::WORKFLOW_FAILED).is_critical());
        assert!(WorkflowEvent::new("wf-1", types::TOOL_ERROR).is_critical());
        assert!(!WorkflowEvent::new("wf-1", types::LLM_OUTPUT).is_critical());
    }

    #[test]
    fn test_role_derived_from_agent_id() {
        assert_eq!(derive_role(Some("Research-Agent")), "research_agent");
        assert_eq!(derive_role(Some("writer")), "writer");
        assert_eq!(derive_role(None), DEFAULT_ROLE);
        assert_eq!(derive_role(Some("")), DEFAULT_ROLE);
    }

    #[test]
    fn test_role_injection_preserves_existing() {
        let mut event = WorkflowEvent::new("wf-1", types::LLM_OUTPUT);
        event
            .payload
            .insert("role".into(), serde_json::Value::String("critic".into()));

        let injected = event.with_injected_role();
        assert_eq!(injected.payload["role"], "critic");
    }

    #[test]
    fn test_role_injection_does_not_mutate_original() {
        let event = WorkflowEvent::new("wf-1", types::LLM_OUTPUT).with_agent("Solver-One");

        let injected = event.with_injected_role();
        assert_eq!(injected.payload["role"], "solver_one");
        assert!(event.payload.get("role").is_none());
    }

    #[test]
    fn test_round_trip_serde() {
        let mut event = WorkflowEvent::new("wf-9", types::TOOL_INVOKED).with_message("calling");
        event.seq = 7;
        event.stream_id = Some("1700000000000-3".to_string());

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"TOOL_INVOKED\""));

        let back: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.seq, 7);
        assert_eq!(back.stream_id.as_deref(), Some("1700000000000-3"));
    }
}
