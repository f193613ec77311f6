//! Event Streaming Manager.
//!
//! Durable fan-out of workflow events to in-process subscribers with
//! resume support and best-effort archival.
//!
//! # Architecture
//!
//! ```text
//! activities → publish() → stream backend (Redis / in-memory)
//!                   │             │
//!                   │             ├─ reader fiber ─→ subscriber channel ─→ SSE
//!                   │             └─ reader fiber ─→ subscriber channel ─→ WS
//!                   └─ persistence batcher ─→ event_log table
//! ```
//!
//! Each subscription owns its delivery channel and a reader fiber; the
//! fiber is the sole closer of the channel. The publish path never blocks
//! on slow subscribers or on the relational store.

pub mod backend;
pub mod persistence;
mod reader;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::{sanitize::sanitize_event, WorkflowEvent};
use crate::metrics;
use backend::{StreamBackend, StreamEntry, StreamError, CURSOR_BEGINNING};
use persistence::EventLogBatcher;
use reader::ReaderFiber;

/// Stream key TTL, refreshed on every publish.
const STREAM_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Counter TTL. Outlives the stream so `seq` cannot reset after a trim.
const COUNTER_TTL: Duration = Duration::from_secs(48 * 60 * 60);
/// Bounds for the completion tail scan.
const COMPLETION_SCAN_COUNT: usize = 10;
const COMPLETION_SCAN_TIMEOUT: Duration = Duration::from_millis(100);

/// Stream key for a workflow.
#[must_use]
pub fn stream_key(workflow_id: &str) -> String {
    format!("shannon:workflow:events:{workflow_id}")
}

/// Sequence-counter key for a workflow.
#[must_use]
pub fn counter_key(workflow_id: &str) -> String {
    format!("shannon:workflow:events:{workflow_id}:seq")
}

/// Encode an event into stream fields.
#[must_use]
pub fn encode_event(event: &WorkflowEvent) -> Vec<(String, String)> {
    let mut fields = vec![
        ("workflow_id".to_string(), event.workflow_id.clone()),
        ("type".to_string(), event.event_type.clone()),
        (
            "timestamp".to_string(),
            event.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        ),
        ("seq".to_string(), event.seq.to_string()),
        (
            "payload".to_string(),
            serde_json::Value::Object(event.payload.clone()).to_string(),
        ),
    ];
    if let Some(agent_id) = &event.agent_id {
        fields.push(("agent_id".to_string(), agent_id.clone()));
    }
    if let Some(message) = &event.message {
        fields.push(("message".to_string(), message.clone()));
    }
    fields
}

/// Decode a stream entry back into an event. Returns `None` for entries
/// missing the mandatory fields (foreign writers, corruption).
#[must_use]
pub fn decode_entry(entry: StreamEntry) -> Option<WorkflowEvent> {
    let StreamEntry { id, mut fields } = entry;
    let workflow_id = fields.remove("workflow_id")?;
    let event_type = fields.remove("type")?;

    let timestamp = fields
        .remove("timestamp")
        .and_then(|raw| chrono::DateTime::parse_from_rfc3339(&raw).ok())
        .map_or_else(chrono::Utc::now, |t| t.with_timezone(&chrono::Utc));
    let seq = fields
        .remove("seq")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0);
    let payload = fields
        .remove("payload")
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
        .and_then(|value| match value {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default();

    Some(WorkflowEvent {
        workflow_id,
        event_type,
        agent_id: fields.remove("agent_id"),
        message: fields.remove("message"),
        payload,
        timestamp,
        seq,
        stream_id: Some(id),
    })
}

/// Shutdown failure.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("shutdown deadline exceeded")]
    DeadlineExceeded,
}

/// A live subscription: the delivery channel plus its identity.
///
/// Receive events from `receiver`; never close it manually — the reader
/// fiber closes the channel when the subscription is cancelled.
#[derive(Debug)]
pub struct Subscription {
    pub receiver: mpsc::Receiver<WorkflowEvent>,
    id: u64,
    workflow_id: String,
}

impl Subscription {
    /// Workflow this subscription follows.
    #[must_use]
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Process-unique subscription id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct SubscriptionRecord {
    /// Weak handle for direct fallback delivery; the reader fiber owns the
    /// only strong sender so the channel closes with the fiber.
    sender: mpsc::WeakSender<WorkflowEvent>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// Process-wide streaming manager. Cheap to share behind an [`Arc`].
pub struct EventStreamManager {
    backend: Arc<dyn StreamBackend>,
    batcher: Option<Arc<EventLogBatcher>>,
    capacity: usize,
    registry: RwLock<HashMap<String, HashMap<u64, SubscriptionRecord>>>,
    /// Serializes seq assignment + append per workflow, so stream order
    /// always equals seq order even under concurrent publishers.
    publish_locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    next_subscription: AtomicU64,
    root_cancel: CancellationToken,
}

impl EventStreamManager {
    /// Create a manager over a backend with an optional persistence batcher.
    ///
    /// `capacity` bounds each workflow stream (approximate trim).
    #[must_use]
    pub fn new(
        backend: Arc<dyn StreamBackend>,
        batcher: Option<Arc<EventLogBatcher>>,
        capacity: usize,
    ) -> Self {
        Self {
            backend,
            batcher,
            capacity: capacity.max(1),
            registry: RwLock::new(HashMap::new()),
            publish_locks: parking_lot::Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            root_cancel: CancellationToken::new(),
        }
    }

    /// Publish an event for a workflow.
    ///
    /// Infallible from the caller's perspective: the sequence counter is
    /// bumped atomically, the record is appended with an approximate trim
    /// and TTLs are refreshed. On backend failure the event is lost for
    /// durable replay but still handed to any registered in-process
    /// subscribers, and a metric records the miss.
    pub async fn publish(&self, event: WorkflowEvent) {
        let workflow_id = event.workflow_id.clone();
        let stream = stream_key(&workflow_id);
        let counter = counter_key(&workflow_id);

        let mut event = event.with_injected_role();

        // Seq assignment and append must land in the same order; the
        // per-workflow guard closes the window between the two calls.
        let publish_lock = {
            let mut locks = self.publish_locks.lock();
            Arc::clone(locks.entry(workflow_id.clone()).or_default())
        };
        let guard = publish_lock.lock().await;

        match self.backend.next_seq(&counter).await {
            Ok(seq) => event.seq = seq,
            Err(e) => {
                drop(guard);
                tracing::error!(
                    workflow_id = %workflow_id,
                    error = %e,
                    "Sequence increment failed; delivering in-memory only"
                );
                metrics::inc_published("backend_error");
                self.deliver_direct(&workflow_id, event);
                return;
            }
        }

        let fields = encode_event(&event);
        let appended = self.backend.append(&stream, &fields, self.capacity).await;
        drop(guard);

        match appended {
            Ok(stream_id) => {
                event.stream_id = Some(stream_id);
                metrics::inc_published("ok");

                // Best-effort TTL refresh; a miss only shortens retention.
                if let Err(e) = self.backend.expire(&stream, STREAM_TTL).await {
                    tracing::debug!(workflow_id = %workflow_id, error = %e, "Stream TTL refresh failed");
                }
                if let Err(e) = self.backend.expire(&counter, COUNTER_TTL).await {
                    tracing::debug!(workflow_id = %workflow_id, error = %e, "Counter TTL refresh failed");
                }
            }
            Err(e) => {
                tracing::error!(
                    workflow_id = %workflow_id,
                    seq = event.seq,
                    error = %e,
                    "Stream append failed; delivering in-memory only"
                );
                metrics::inc_published("backend_error");
                self.deliver_direct(&workflow_id, event.clone());
            }
        }

        if event.is_persistable() {
            if let Some(batcher) = &self.batcher {
                batcher.enqueue(sanitize_event(&event));
            }
        }
    }

    /// Subscribe from the beginning of the stream.
    #[must_use]
    pub fn subscribe(&self, workflow_id: &str, buffer: usize) -> Subscription {
        self.subscribe_from(workflow_id, buffer, CURSOR_BEGINNING)
    }

    /// Subscribe from a cursor: [`backend::CURSOR_BEGINNING`],
    /// [`backend::CURSOR_TAIL`] or a prior stream id.
    #[must_use]
    pub fn subscribe_from(&self, workflow_id: &str, buffer: usize, cursor: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let cancel = self.root_cancel.child_token();

        let fiber = ReaderFiber {
            backend: Arc::clone(&self.backend),
            stream_key: stream_key(workflow_id),
            workflow_id: workflow_id.to_string(),
            subscription_id: id,
            cursor: cursor.to_string(),
            sender: tx.clone(),
            cancel: cancel.clone(),
        };
        let weak = tx.downgrade();
        drop(tx);
        let handle = tokio::spawn(fiber.run());

        self.registry
            .write()
            .entry(workflow_id.to_string())
            .or_default()
            .insert(
                id,
                SubscriptionRecord {
                    sender: weak,
                    cancel,
                    handle,
                },
            );
        metrics::add_subscriptions(1.0);

        Subscription {
            receiver: rx,
            id,
            workflow_id: workflow_id.to_string(),
        }
    }

    /// Cancel a subscription. The reader fiber drains and closes the
    /// delivery channel; callers must not close it themselves.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.unsubscribe_by_id(&subscription.workflow_id, subscription.id);
    }

    /// Id-based variant of [`Self::unsubscribe`] for teardown guards that
    /// cannot borrow the subscription handle.
    pub fn unsubscribe_by_id(&self, workflow_id: &str, subscription_id: u64) {
        let removed = {
            let mut registry = self.registry.write();
            let removed = registry
                .get_mut(workflow_id)
                .and_then(|subs| subs.remove(&subscription_id));
            if registry.get(workflow_id).is_some_and(HashMap::is_empty) {
                registry.remove(workflow_id);
            }
            removed
        };

        if let Some(record) = removed {
            record.cancel.cancel();
            metrics::add_subscriptions(-1.0);
            tracing::debug!(
                workflow_id = %workflow_id,
                subscription_id,
                "Unsubscribed"
            );
        }
    }

    /// Past events with `seq` strictly greater than `min_seq`.
    pub async fn replay_since(
        &self,
        workflow_id: &str,
        min_seq: u64,
    ) -> Result<Vec<WorkflowEvent>, StreamError> {
        let entries = self
            .backend
            .range_after(&stream_key(workflow_id), CURSOR_BEGINNING, self.scan_limit())
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(decode_entry)
            .filter(|event| event.seq > min_seq)
            .collect())
    }

    /// Past events with a stream id strictly greater than `stream_id`.
    pub async fn replay_from_stream_id(
        &self,
        workflow_id: &str,
        stream_id: &str,
    ) -> Result<Vec<WorkflowEvent>, StreamError> {
        let entries = self
            .backend
            .range_after(&stream_key(workflow_id), stream_id, self.scan_limit())
            .await?;
        Ok(entries.into_iter().filter_map(decode_entry).collect())
    }

    /// Id of the newest record. `Ok(None)` means the stream is empty;
    /// backend failures surface as `Err` rather than an empty cursor.
    pub async fn get_last_stream_id(
        &self,
        workflow_id: &str,
    ) -> Result<Option<String>, StreamError> {
        self.backend.last_id(&stream_key(workflow_id)).await
    }

    /// Bounded tail scan for a completion record. Used by the transport to
    /// resolve the completed-but-not-yet-visible race; errs on `false`.
    pub async fn has_emitted_completion(&self, workflow_id: &str) -> bool {
        let key = stream_key(workflow_id);
        let scan = self.backend.rev_range(&key, COMPLETION_SCAN_COUNT);
        match tokio::time::timeout(COMPLETION_SCAN_TIMEOUT, scan).await {
            Ok(Ok(entries)) => entries.iter().any(|entry| {
                entry.fields.get("type").map(String::as_str)
                    == Some(crate::events::types::WORKFLOW_COMPLETED)
            }),
            Ok(Err(e)) => {
                tracing::debug!(workflow_id = %workflow_id, error = %e, "Completion scan failed");
                false
            }
            Err(_) => false,
        }
    }

    /// Number of live subscriptions for a workflow.
    #[must_use]
    pub fn subscriber_count(&self, workflow_id: &str) -> usize {
        self.registry
            .read()
            .get(workflow_id)
            .map_or(0, HashMap::len)
    }

    /// Cancel all subscriptions, close the persistence intake and wait for
    /// fibers and the batcher. Idempotent. Returns
    /// [`ShutdownError::DeadlineExceeded`] if work remains at the deadline.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownError> {
        self.root_cancel.cancel();

        let mut handles = Vec::new();
        {
            let mut registry = self.registry.write();
            for (_, subs) in registry.drain() {
                for (_, record) in subs {
                    record.cancel.cancel();
                    metrics::add_subscriptions(-1.0);
                    handles.push(record.handle);
                }
            }
        }
        if let Some(batcher) = &self.batcher {
            if let Some(handle) = batcher.close() {
                handles.push(handle);
            }
        }

        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        tokio::time::timeout(deadline, join_all)
            .await
            .map_err(|_| ShutdownError::DeadlineExceeded)
    }

    fn deliver_direct(&self, workflow_id: &str, event: WorkflowEvent) {
        let registry = self.registry.read();
        let Some(subs) = registry.get(workflow_id) else {
            return;
        };
        for record in subs.values() {
            let Some(sender) = record.sender.upgrade() else {
                continue;
            };
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    metrics::inc_dropped(&event.event_type);
                    tracing::warn!(
                        workflow_id = %workflow_id,
                        event_type = %event.event_type,
                        "Subscriber buffer full during direct delivery; event dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    fn scan_limit(&self) -> usize {
        self.capacity.max(1024)
    }
}

impl std::fmt::Debug for EventStreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStreamManager")
            .field("capacity", &self.capacity)
            .field("workflows", &self.registry.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types;

    #[test]
    fn test_keys() {
        assert_eq!(stream_key("wf-1"), "shannon:workflow:events:wf-1");
        assert_eq!(counter_key("wf-1"), "shannon:workflow:events:wf-1:seq");
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut event = WorkflowEvent::new("wf-1", types::LLM_OUTPUT)
            .with_agent("writer")
            .with_message("done");
        event.seq = 12;
        event
            .payload
            .insert("role".into(), serde_json::Value::String("writer".into()));

        let fields = encode_event(&event);
        let entry = StreamEntry {
            id: "17000-3".to_string(),
            fields: fields.into_iter().collect(),
        };
        let decoded = decode_entry(entry).unwrap();

        assert_eq!(decoded.workflow_id, "wf-1");
        assert_eq!(decoded.event_type, types::LLM_OUTPUT);
        assert_eq!(decoded.agent_id.as_deref(), Some("writer"));
        assert_eq!(decoded.message.as_deref(), Some("done"));
        assert_eq!(decoded.seq, 12);
        assert_eq!(decoded.stream_id.as_deref(), Some("17000-3"));
        assert_eq!(decoded.payload["role"], "writer");
        assert_eq!(decoded.timestamp, event.timestamp);
    }

    #[test]
    fn test_decode_rejects_incomplete_entries() {
        let entry = StreamEntry {
            id: "1-0".to_string(),
            fields: std::collections::HashMap::from([(
                "message".to_string(),
                "no type".to_string(),
            )]),
        };
        assert!(decode_entry(entry).is_none());
    }
}
