//! PostgreSQL event-log store.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::breaker::sql::SqlBreaker;
use crate::events::WorkflowEvent;
use crate::streaming::persistence::EventLogStore;

/// Durable event mirror in the `event_log` table.
///
/// Batches land as one statement: the columns are bound as parallel
/// arrays and expanded server-side with `UNNEST`. Inserts deduplicate on
/// `(workflow_id, seq)`, so replayed batches and timeline re-persistence
/// are harmless.
#[derive(Debug, Clone)]
pub struct PgEventLogStore {
    pool: PgPool,
    breaker: SqlBreaker,
}

impl PgEventLogStore {
    #[must_use]
    pub fn new(pool: PgPool, breaker: SqlBreaker) -> Self {
        Self { pool, breaker }
    }

    async fn insert_one(&self, event: &WorkflowEvent) -> Result<(), sqlx::Error> {
        let pool = self.pool.clone();
        let event = event.clone();
        self.breaker
            .execute(|| async move {
                sqlx::query(
                    "INSERT INTO event_log \
                     (workflow_id, seq, stream_id, type, agent_id, message, payload, timestamp) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                     ON CONFLICT (workflow_id, seq) DO NOTHING",
                )
                .bind(&event.workflow_id)
                .bind(i64::try_from(event.seq).unwrap_or(i64::MAX))
                .bind(&event.stream_id)
                .bind(&event.event_type)
                .bind(&event.agent_id)
                .bind(&event.message)
                .bind(serde_json::Value::Object(event.payload.clone()))
                .bind(event.timestamp)
                .execute(&pool)
                .await
                .map(|_| ())
            })
            .await
            .map_err(|e| match e.into_inner() {
                Some(inner) => inner,
                None => sqlx::Error::PoolClosed,
            })
    }
}

#[async_trait]
impl EventLogStore for PgEventLogStore {
    async fn insert_batch(&self, events: &[WorkflowEvent]) -> anyhow::Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut workflow_ids = Vec::with_capacity(events.len());
        let mut seqs = Vec::with_capacity(events.len());
        let mut stream_ids = Vec::with_capacity(events.len());
        let mut event_types = Vec::with_capacity(events.len());
        let mut agent_ids = Vec::with_capacity(events.len());
        let mut messages = Vec::with_capacity(events.len());
        let mut payloads = Vec::with_capacity(events.len());
        let mut timestamps = Vec::with_capacity(events.len());
        for event in events {
            workflow_ids.push(event.workflow_id.clone());
            seqs.push(i64::try_from(event.seq).unwrap_or(i64::MAX));
            stream_ids.push(event.stream_id.clone());
            event_types.push(event.event_type.clone());
            agent_ids.push(event.agent_id.clone());
            messages.push(event.message.clone());
            payloads.push(serde_json::Value::Object(event.payload.clone()));
            timestamps.push(event.timestamp);
        }

        let pool = self.pool.clone();
        let bulk = self
            .breaker
            .execute(|| async move {
                sqlx::query(
                    "INSERT INTO event_log \
                     (workflow_id, seq, stream_id, type, agent_id, message, payload, timestamp) \
                     SELECT * FROM UNNEST(\
                         $1::text[], $2::bigint[], $3::text[], $4::text[], \
                         $5::text[], $6::text[], $7::jsonb[], $8::timestamptz[]\
                     ) AS v(workflow_id, seq, stream_id, type, agent_id, message, payload, \
                            timestamp) \
                     ON CONFLICT (workflow_id, seq) DO NOTHING",
                )
                .bind(&workflow_ids)
                .bind(&seqs)
                .bind(&stream_ids)
                .bind(&event_types)
                .bind(&agent_ids)
                .bind(&messages)
                .bind(&payloads)
                .bind(&timestamps)
                .execute(&pool)
                .await
                .map(|_| ())
            })
            .await;

        if let Err(e) = bulk {
            // One bad record must not sink the batch: retry row by row and
            // log the individual failures.
            tracing::warn!(
                count = events.len(),
                error = %e,
                "Bulk event-log insert failed; retrying per record"
            );
            for event in events {
                if let Err(row_err) = self.insert_one(event).await {
                    tracing::error!(
                        workflow_id = %event.workflow_id,
                        seq = event.seq,
                        error = %row_err,
                        "Event-log record insert failed"
                    );
                }
            }
        }
        Ok(())
    }
}
