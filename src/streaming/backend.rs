//! Stream backend abstraction.
//!
//! The streaming manager talks to an append-only, cursor-addressable stream
//! per workflow. [`RedisStreamBackend`] is the production implementation
//! (Redis streams behind the Redis circuit breaker); [`MemoryStreamBackend`]
//! keeps the same semantics in-process for deployments without Redis and
//! for tests. Both assign entry ids of the form `millis-seq`, ordered by
//! their numeric components.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::{streams, AsyncCommands};
use tokio::sync::Notify;

use crate::breaker::redis::RedisBreaker;
use crate::breaker::BreakerError;

/// Cursor sentinel: read from the beginning of the stream.
pub const CURSOR_BEGINNING: &str = "0-0";
/// Cursor sentinel: read only entries appended after the call.
pub const CURSOR_TAIL: &str = "$";

/// Backend failure. Breaker rejections are folded in so callers see a
/// single error surface.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream backend error: {0}")]
    Backend(String),
    #[error("stream backend rejected: {0}")]
    Rejected(String),
}

impl From<BreakerError<redis::RedisError>> for StreamError {
    fn from(err: BreakerError<redis::RedisError>) -> Self {
        if err.is_rejection() {
            Self::Rejected(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}

/// One entry read back from a stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Backend-assigned id (`millis-seq`).
    pub id: String,
    /// Field-value pairs as appended.
    pub fields: HashMap<String, String>,
}

/// Parse a stream id into its numeric components.
#[must_use]
pub fn parse_stream_id(id: &str) -> Option<(u64, u64)> {
    match id.split_once('-') {
        Some((ms, seq)) => Some((ms.parse().ok()?, seq.parse().ok()?)),
        None => Some((id.parse().ok()?, 0)),
    }
}

/// Whether id `a` orders strictly after id `b`.
#[must_use]
pub fn id_after(a: &str, b: &str) -> bool {
    match (parse_stream_id(a), parse_stream_id(b)) {
        (Some(a), Some(b)) => a > b,
        // Unparseable ids only come from a corrupted backend; fall back to
        // lexicographic order rather than silently dropping entries.
        _ => a > b,
    }
}

/// Append-only stream operations the manager depends on.
#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Atomically increment a sequence counter and return the new value.
    async fn next_seq(&self, counter_key: &str) -> Result<u64, StreamError>;

    /// Append an entry, trimming the stream to roughly `maxlen` entries.
    async fn append(
        &self,
        stream_key: &str,
        fields: &[(String, String)],
        maxlen: usize,
    ) -> Result<String, StreamError>;

    /// Block up to `block` for entries strictly after `cursor`.
    ///
    /// `cursor` may be [`CURSOR_TAIL`] to wait for entries appended after
    /// this call. An empty result means the block timed out.
    async fn read_blocking(
        &self,
        stream_key: &str,
        cursor: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Entries strictly after `cursor`, oldest first, without blocking.
    async fn range_after(
        &self,
        stream_key: &str,
        cursor: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Most recent entries, newest first.
    async fn rev_range(&self, stream_key: &str, count: usize)
        -> Result<Vec<StreamEntry>, StreamError>;

    /// Id of the newest entry, `None` when the stream is empty.
    async fn last_id(&self, stream_key: &str) -> Result<Option<String>, StreamError>;

    /// Refresh a key's time-to-live.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StreamError>;
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

/// Redis streams backend. All calls go through the Redis circuit breaker.
#[derive(Clone)]
pub struct RedisStreamBackend {
    conn: redis::aio::ConnectionManager,
    breaker: RedisBreaker,
}

impl RedisStreamBackend {
    #[must_use]
    pub fn new(conn: redis::aio::ConnectionManager, breaker: RedisBreaker) -> Self {
        Self { conn, breaker }
    }

    fn range_start(cursor: &str) -> String {
        if cursor == CURSOR_BEGINNING || cursor == "0" {
            "-".to_string()
        } else {
            // Exclusive start (Redis 6.2+).
            format!("({cursor}")
        }
    }
}

impl std::fmt::Debug for RedisStreamBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamBackend").finish_non_exhaustive()
    }
}

fn entry_from_redis(id: String, map: HashMap<String, redis::Value>) -> StreamEntry {
    let fields = map
        .into_iter()
        .filter_map(|(key, value)| {
            redis::from_redis_value::<String>(value)
                .ok()
                .map(|v| (key, v))
        })
        .collect();
    StreamEntry { id, fields }
}

#[async_trait]
impl StreamBackend for RedisStreamBackend {
    async fn next_seq(&self, counter_key: &str) -> Result<u64, StreamError> {
        let mut conn = self.conn.clone();
        let value: i64 = self
            .breaker
            .execute(|| async move { conn.incr(counter_key, 1i64).await })
            .await?;
        Ok(u64::try_from(value).unwrap_or(0))
    }

    async fn append(
        &self,
        stream_key: &str,
        fields: &[(String, String)],
        maxlen: usize,
    ) -> Result<String, StreamError> {
        let mut conn = self.conn.clone();
        let fields = fields.to_vec();
        let id: String = self
            .breaker
            .execute(|| async move {
                conn.xadd_maxlen(
                    stream_key,
                    streams::StreamMaxlen::Approx(maxlen),
                    "*",
                    &fields,
                )
                .await
            })
            .await?;
        Ok(id)
    }

    async fn read_blocking(
        &self,
        stream_key: &str,
        cursor: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.conn.clone();
        let options = streams::StreamReadOptions::default()
            .count(count)
            .block(usize::try_from(block.as_millis()).unwrap_or(5000));
        let reply: Option<streams::StreamReadReply> = self
            .breaker
            .execute(|| async move {
                conn.xread_options(&[stream_key], &[cursor], &options).await
            })
            .await?;

        let mut entries = Vec::new();
        if let Some(reply) = reply {
            for key in reply.keys {
                for id in key.ids {
                    entries.push(entry_from_redis(id.id, id.map));
                }
            }
        }
        Ok(entries)
    }

    async fn range_after(
        &self,
        stream_key: &str,
        cursor: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.conn.clone();
        let start = Self::range_start(cursor);
        let reply: streams::StreamRangeReply = self
            .breaker
            .execute(|| async move { conn.xrange_count(stream_key, start, "+", count).await })
            .await?;
        Ok(reply
            .ids
            .into_iter()
            .map(|id| entry_from_redis(id.id, id.map))
            .collect())
    }

    async fn rev_range(
        &self,
        stream_key: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.conn.clone();
        let reply: streams::StreamRangeReply = self
            .breaker
            .execute(|| async move { conn.xrevrange_count(stream_key, "+", "-", count).await })
            .await?;
        Ok(reply
            .ids
            .into_iter()
            .map(|id| entry_from_redis(id.id, id.map))
            .collect())
    }

    async fn last_id(&self, stream_key: &str) -> Result<Option<String>, StreamError> {
        Ok(self.rev_range(stream_key, 1).await?.into_iter().next().map(|e| e.id))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StreamError> {
        let mut conn = self.conn.clone();
        let secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let _: bool = self
            .breaker
            .execute(|| async move { conn.expire(key, secs).await })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryStream {
    entries: VecDeque<StreamEntry>,
    last_ms: u64,
    last_seq: u64,
}

impl MemoryStream {
    fn next_id(&mut self) -> String {
        let now_ms = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        if now_ms > self.last_ms {
            self.last_ms = now_ms;
            self.last_seq = 0;
        } else {
            self.last_seq += 1;
        }
        format!("{}-{}", self.last_ms, self.last_seq)
    }
}

/// In-process stream backend with the same cursor semantics as Redis.
///
/// Used when no Redis url is configured and throughout the test suite.
/// TTLs are a no-op: streams live as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStreamBackend {
    streams: Mutex<HashMap<String, MemoryStream>>,
    counters: Mutex<HashMap<String, u64>>,
    appended: Notify,
}

impl MemoryStreamBackend {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn entries_after(&self, stream_key: &str, cursor: &str, count: usize) -> Vec<StreamEntry> {
        let streams = self.streams.lock();
        let Some(stream) = streams.get(stream_key) else {
            return Vec::new();
        };
        stream
            .entries
            .iter()
            .filter(|entry| id_after(&entry.id, cursor))
            .take(count)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StreamBackend for MemoryStreamBackend {
    async fn next_seq(&self, counter_key: &str) -> Result<u64, StreamError> {
        let mut counters = self.counters.lock();
        let counter = counters.entry(counter_key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn append(
        &self,
        stream_key: &str,
        fields: &[(String, String)],
        maxlen: usize,
    ) -> Result<String, StreamError> {
        let id = {
            let mut streams = self.streams.lock();
            let stream = streams.entry(stream_key.to_string()).or_default();
            let id = stream.next_id();
            stream.entries.push_back(StreamEntry {
                id: id.clone(),
                fields: fields.iter().cloned().collect(),
            });
            while stream.entries.len() > maxlen {
                stream.entries.pop_front();
            }
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_blocking(
        &self,
        stream_key: &str,
        cursor: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let cursor = if cursor == CURSOR_TAIL {
            self.last_id(stream_key)
                .await?
                .unwrap_or_else(|| CURSOR_BEGINNING.to_string())
        } else {
            cursor.to_string()
        };

        let deadline = tokio::time::Instant::now() + block;
        loop {
            // Register for wakeups before checking, so an append between the
            // check and the wait cannot be missed.
            let notified = self.appended.notified();

            let entries = self.entries_after(stream_key, &cursor, count);
            if !entries.is_empty() {
                return Ok(entries);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
            if tokio::time::Instant::now() >= deadline {
                let entries = self.entries_after(stream_key, &cursor, count);
                return Ok(entries);
            }
        }
    }

    async fn range_after(
        &self,
        stream_key: &str,
        cursor: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        Ok(self.entries_after(stream_key, cursor, count))
    }

    async fn rev_range(
        &self,
        stream_key: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let streams = self.streams.lock();
        let Some(stream) = streams.get(stream_key) else {
            return Ok(Vec::new());
        };
        Ok(stream.entries.iter().rev().take(count).cloned().collect())
    }

    async fn last_id(&self, stream_key: &str) -> Result<Option<String>, StreamError> {
        let streams = self.streams.lock();
        Ok(streams
            .get(stream_key)
            .and_then(|s| s.entries.back())
            .map(|e| e.id.clone()))
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), StreamError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(n: u64) -> Vec<(String, String)> {
        vec![("seq".to_string(), n.to_string())]
    }

    #[test]
    fn test_id_ordering_by_components() {
        assert!(id_after("2-0", "1-9"));
        assert!(id_after("1-10", "1-9"));
        assert!(!id_after("1-9", "1-9"));
        // Numeric, not lexicographic: 10 > 9 even though "10" < "9".
        assert!(id_after("10-0", "9-0"));
    }

    #[tokio::test]
    async fn test_memory_append_and_range() {
        let backend = MemoryStreamBackend::new();
        let id1 = backend.append("s", &fields(1), 100).await.unwrap();
        let id2 = backend.append("s", &fields(2), 100).await.unwrap();
        assert!(id_after(&id2, &id1));

        let all = backend.range_after("s", CURSOR_BEGINNING, 10).await.unwrap();
        assert_eq!(all.len(), 2);

        let after_first = backend.range_after("s", &id1, 10).await.unwrap();
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].id, id2);
    }

    #[tokio::test]
    async fn test_memory_trim_to_maxlen() {
        let backend = MemoryStreamBackend::new();
        for n in 0..10 {
            backend.append("s", &fields(n), 4).await.unwrap();
        }
        let all = backend.range_after("s", CURSOR_BEGINNING, 100).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all.last().unwrap().fields["seq"], "9");
    }

    #[tokio::test]
    async fn test_memory_counter_monotonic() {
        let backend = MemoryStreamBackend::new();
        assert_eq!(backend.next_seq("c").await.unwrap(), 1);
        assert_eq!(backend.next_seq("c").await.unwrap(), 2);
        assert_eq!(backend.next_seq("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_blocking_read_wakes_on_append() {
        let backend = MemoryStreamBackend::new();

        let reader = {
            let backend = std::sync::Arc::clone(&backend);
            tokio::spawn(async move {
                backend
                    .read_blocking("s", CURSOR_BEGINNING, 10, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.append("s", &fields(1), 100).await.unwrap();

        let entries = reader.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_blocking_read_times_out_empty() {
        let backend = MemoryStreamBackend::new();
        let entries = backend
            .read_blocking("s", CURSOR_TAIL, 10, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_memory_rev_range_and_last_id() {
        let backend = MemoryStreamBackend::new();
        assert!(backend.last_id("s").await.unwrap().is_none());

        for n in 0..5 {
            backend.append("s", &fields(n), 100).await.unwrap();
        }
        let newest = backend.rev_range("s", 2).await.unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].fields["seq"], "4");

        let last = backend.last_id("s").await.unwrap().unwrap();
        assert_eq!(newest[0].id, last);
    }
}
