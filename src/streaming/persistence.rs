//! Asynchronous event-log persistence.
//!
//! Publishing must never wait on the relational store, so persistable
//! events go through a bounded intake channel into a single worker that
//! batches inserts by size or age, whichever fills first. A full intake
//! drops the event (the stream itself is unaffected) and a closed intake
//! means the manager is shutting down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::WorkflowEvent;
use crate::metrics;

/// Deadline applied to every batch flush.
const FLUSH_DEADLINE: Duration = Duration::from_secs(5);

/// Durable sink for sanitized events.
///
/// Implementations must tolerate per-record failures without aborting the
/// rest of the batch and must deduplicate on `(workflow_id, seq)`.
#[async_trait]
pub trait EventLogStore: Send + Sync {
    async fn insert_batch(&self, events: &[WorkflowEvent]) -> anyhow::Result<()>;
}

/// Batching knobs, env-tunable via `EVENTLOG_BATCH_SIZE` and
/// `EVENTLOG_BATCH_INTERVAL_MS`.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_millis(100),
        }
    }
}

/// Handle to the persistence worker.
pub struct EventLogBatcher {
    intake: Mutex<Option<mpsc::Sender<WorkflowEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventLogBatcher {
    /// Spawn the worker fiber and return its handle.
    #[must_use]
    pub fn spawn(store: Arc<dyn EventLogStore>, config: BatcherConfig) -> Self {
        let capacity = config.batch_size.max(1) * 4;
        let (tx, rx) = mpsc::channel(capacity);
        let worker = tokio::spawn(run_worker(rx, store, config));
        Self {
            intake: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue an event without blocking.
    ///
    /// Overflow means the event is not persisted; critical event types
    /// escalate the log severity. Streaming delivery is unaffected either
    /// way.
    pub fn enqueue(&self, event: WorkflowEvent) {
        let Some(tx) = self.intake.lock().as_ref().cloned() else {
            tracing::debug!(
                workflow_id = %event.workflow_id,
                "Persistence intake closed; event not persisted"
            );
            return;
        };

        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                metrics::inc_eventlog_overflow(&event.event_type);
                if event.is_critical() {
                    tracing::error!(
                        workflow_id = %event.workflow_id,
                        event_type = %event.event_type,
                        seq = event.seq,
                        "Persistence intake full; critical event not persisted"
                    );
                } else {
                    tracing::warn!(
                        workflow_id = %event.workflow_id,
                        event_type = %event.event_type,
                        seq = event.seq,
                        "Persistence intake full; event not persisted"
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::debug!(
                    workflow_id = %event.workflow_id,
                    "Persistence worker gone; event not persisted"
                );
            }
        }
    }

    /// Close the intake. The worker drains, flushes once more and exits.
    /// Returns the worker handle so shutdown can await it under a deadline.
    pub fn close(&self) -> Option<JoinHandle<()>> {
        self.intake.lock().take();
        self.worker.lock().take()
    }
}

impl std::fmt::Debug for EventLogBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLogBatcher")
            .field("open", &self.intake.lock().is_some())
            .finish()
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<WorkflowEvent>,
    store: Arc<dyn EventLogStore>,
    config: BatcherConfig,
) {
    let batch_size = config.batch_size.max(1);
    let mut buffer: Vec<WorkflowEvent> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(event) => {
                    buffer.push(event);
                    if buffer.len() >= batch_size {
                        flush(store.as_ref(), &mut buffer).await;
                    }
                }
                // Intake closed: drain whatever is buffered and exit.
                None => break,
            },
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(store.as_ref(), &mut buffer).await;
                }
            }
        }
    }

    if !buffer.is_empty() {
        flush(store.as_ref(), &mut buffer).await;
    }
    tracing::debug!("Event-log batcher stopped");
}

async fn flush(store: &dyn EventLogStore, buffer: &mut Vec<WorkflowEvent>) {
    let count = buffer.len();
    let started = std::time::Instant::now();

    match tokio::time::timeout(FLUSH_DEADLINE, store.insert_batch(buffer)).await {
        Ok(Ok(())) => {
            metrics::observe_flush("ok", started.elapsed().as_secs_f64());
            tracing::debug!(count, "Flushed event-log batch");
        }
        Ok(Err(e)) => {
            metrics::observe_flush("error", started.elapsed().as_secs_f64());
            tracing::error!(count, error = %e, "Event-log batch flush failed");
        }
        Err(_) => {
            metrics::observe_flush("timeout", started.elapsed().as_secs_f64());
            tracing::error!(count, "Event-log batch flush exceeded deadline");
        }
    }
    buffer.clear();
}

/// In-memory store used by tests and Redis-less deployments.
#[derive(Debug, Default)]
pub struct MemoryEventLogStore {
    rows: Mutex<Vec<WorkflowEvent>>,
}

impl MemoryEventLogStore {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of everything persisted so far.
    #[must_use]
    pub fn rows(&self) -> Vec<WorkflowEvent> {
        self.rows.lock().clone()
    }
}

#[async_trait]
impl EventLogStore for MemoryEventLogStore {
    async fn insert_batch(&self, events: &[WorkflowEvent]) -> anyhow::Result<()> {
        let mut rows = self.rows.lock();
        for event in events {
            let duplicate = rows
                .iter()
                .any(|row| row.workflow_id == event.workflow_id && row.seq == event.seq);
            if !duplicate {
                rows.push(event.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types;

    fn event(seq: u64) -> WorkflowEvent {
        let mut event = WorkflowEvent::new("wf-1", types::LLM_OUTPUT);
        event.seq = seq;
        event
    }

    #[tokio::test]
    async fn test_flush_on_batch_size() {
        let store = MemoryEventLogStore::new();
        let batcher = EventLogBatcher::spawn(
            Arc::clone(&store) as Arc<dyn EventLogStore>,
            BatcherConfig {
                batch_size: 3,
                flush_interval: Duration::from_secs(60),
            },
        );

        for seq in 1..=3 {
            batcher.enqueue(event(seq));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.rows().len(), 3);

        if let Some(handle) = batcher.close() {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_flush_on_interval() {
        let store = MemoryEventLogStore::new();
        let batcher = EventLogBatcher::spawn(
            Arc::clone(&store) as Arc<dyn EventLogStore>,
            BatcherConfig {
                batch_size: 100,
                flush_interval: Duration::from_millis(20),
            },
        );

        batcher.enqueue(event(1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.rows().len(), 1);

        if let Some(handle) = batcher.close() {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_close_drains_remaining() {
        let store = MemoryEventLogStore::new();
        let batcher = EventLogBatcher::spawn(
            Arc::clone(&store) as Arc<dyn EventLogStore>,
            BatcherConfig {
                batch_size: 100,
                flush_interval: Duration::from_secs(60),
            },
        );

        for seq in 1..=5 {
            batcher.enqueue(event(seq));
        }
        if let Some(handle) = batcher.close() {
            handle.await.unwrap();
        }
        assert_eq!(store.rows().len(), 5);
    }

    #[tokio::test]
    async fn test_enqueue_after_close_is_noop() {
        let store = MemoryEventLogStore::new();
        let batcher = EventLogBatcher::spawn(
            Arc::clone(&store) as Arc<dyn EventLogStore>,
            BatcherConfig::default(),
        );
        if let Some(handle) = batcher.close() {
            handle.await.unwrap();
        }
        batcher.enqueue(event(9));
        assert!(store.rows().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_seq_deduplicated() {
        let store = MemoryEventLogStore::new();
        store.insert_batch(&[event(1), event(1), event(2)]).await.unwrap();
        assert_eq!(store.rows().len(), 2);
    }
}
