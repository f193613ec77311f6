//! Per-subscription reader fiber.
//!
//! Each subscription owns exactly one reader: a spawned task that follows
//! the workflow's stream from its cursor, decodes entries and hands them to
//! the subscriber's channel without ever blocking. The fiber — and only the
//! fiber — closes the delivery channel, by dropping the sole sender when it
//! exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::backend::{StreamBackend, CURSOR_BEGINNING, CURSOR_TAIL};
use super::decode_entry;
use crate::events::WorkflowEvent;
use crate::metrics;

/// Blocking-read window against the backend.
const READ_BLOCK: Duration = Duration::from_secs(5);
/// Max entries fetched per read.
const READ_BATCH: usize = 64;
/// Backoff bounds for transient backend errors.
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

pub(super) struct ReaderFiber {
    pub backend: Arc<dyn StreamBackend>,
    pub stream_key: String,
    pub workflow_id: String,
    pub subscription_id: u64,
    pub cursor: String,
    pub sender: mpsc::Sender<WorkflowEvent>,
    pub cancel: CancellationToken,
}

impl ReaderFiber {
    pub async fn run(mut self) {
        tracing::debug!(
            workflow_id = %self.workflow_id,
            subscription_id = self.subscription_id,
            cursor = %self.cursor,
            "Reader fiber starting"
        );

        // Resolve the tail sentinel to a concrete id once, so nothing
        // appended between two blocking reads can slip past the cursor.
        if self.cursor == CURSOR_TAIL {
            match self.backend.last_id(&self.stream_key).await {
                Ok(id) => self.cursor = id.unwrap_or_else(|| CURSOR_BEGINNING.to_string()),
                Err(e) => {
                    tracing::warn!(
                        workflow_id = %self.workflow_id,
                        error = %e,
                        "Failed to resolve tail cursor; starting from beginning"
                    );
                    self.cursor = CURSOR_BEGINNING.to_string();
                }
            }
        }

        let mut backoff = BACKOFF_MIN;
        let mut last_seq: u64 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let read = tokio::select! {
                () = self.cancel.cancelled() => break,
                read = self.backend.read_blocking(
                    &self.stream_key,
                    &self.cursor,
                    READ_BATCH,
                    READ_BLOCK,
                ) => read,
            };

            match read {
                Ok(entries) => {
                    backoff = BACKOFF_MIN;
                    for entry in entries {
                        self.cursor = entry.id.clone();
                        let Some(event) = decode_entry(entry) else {
                            continue;
                        };

                        // seq regression is an impossible-invariant breach;
                        // tear down this subscriber, leave the stream alone.
                        if event.seq > 0 && last_seq > 0 && event.seq <= last_seq {
                            tracing::error!(
                                workflow_id = %self.workflow_id,
                                subscription_id = self.subscription_id,
                                seq = event.seq,
                                last_seq,
                                stream_id = ?event.stream_id,
                                "Sequence went backward; tearing down subscriber"
                            );
                            return;
                        }
                        if event.seq > 0 {
                            last_seq = event.seq;
                        }

                        if !self.deliver(event) {
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        workflow_id = %self.workflow_id,
                        subscription_id = self.subscription_id,
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "Stream read failed; backing off"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }

        tracing::debug!(
            workflow_id = %self.workflow_id,
            subscription_id = self.subscription_id,
            "Reader fiber stopped"
        );
        // Dropping `self.sender` here closes the delivery channel, exactly once.
    }

    /// Non-blocking hand-off to the subscriber. Returns false when the
    /// receiver is gone and the fiber should exit.
    fn deliver(&self, event: WorkflowEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                metrics::inc_dropped(&event.event_type);
                if event.is_critical() {
                    tracing::error!(
                        workflow_id = %self.workflow_id,
                        subscription_id = self.subscription_id,
                        event_type = %event.event_type,
                        seq = event.seq,
                        "Subscriber buffer full; critical event dropped"
                    );
                } else {
                    tracing::warn!(
                        workflow_id = %self.workflow_id,
                        subscription_id = self.subscription_id,
                        event_type = %event.event_type,
                        seq = event.seq,
                        "Subscriber buffer full; event dropped"
                    );
                }
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}
