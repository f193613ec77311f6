//! Prometheus metrics for the streaming substrate.
//!
//! Metrics are registered once into the default registry and exposed at the
//! `/metrics` scrape endpoint. All recording helpers are no-ops until
//! [`init_metrics`] has run, so library consumers and unit tests never pay
//! for registration they did not ask for.

use anyhow::{Context, Result};
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// Streaming metrics
pub static EVENTS_PUBLISHED: OnceLock<CounterVec> = OnceLock::new();
pub static EVENTS_DROPPED: OnceLock<CounterVec> = OnceLock::new();
pub static ACTIVE_SUBSCRIPTIONS: OnceLock<Gauge> = OnceLock::new();

// Persistence batcher metrics
pub static EVENTLOG_FLUSHES: OnceLock<CounterVec> = OnceLock::new();
pub static EVENTLOG_FLUSH_DURATION: OnceLock<HistogramVec> = OnceLock::new();
pub static EVENTLOG_OVERFLOW: OnceLock<CounterVec> = OnceLock::new();

// Circuit breaker metrics
pub static BREAKER_STATE: OnceLock<GaugeVec> = OnceLock::new();
pub static BREAKER_TRANSITIONS: OnceLock<CounterVec> = OnceLock::new();

// Transport metrics
pub static STREAM_CONNECTIONS: OnceLock<GaugeVec> = OnceLock::new();

// Scheduler metrics
pub static SCHEDULE_OPS: OnceLock<CounterVec> = OnceLock::new();

// Thread-safe initialization result
static INIT_RESULT: OnceLock<Result<()>> = OnceLock::new();

/// Initialize and register all metrics. Idempotent.
pub fn init_metrics() -> Result<()> {
    match INIT_RESULT.get_or_init(init_metrics_internal) {
        Ok(()) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("Metrics initialization failed: {}", e)),
    }
}

fn init_metrics_internal() -> Result<()> {
    if EVENTS_PUBLISHED.get().is_some() {
        return Ok(());
    }

    let events_published = register_counter_vec!(
        "shannon_streaming_events_published_total",
        "Workflow events published, by outcome",
        &["status"]
    )
    .context("Failed to register EVENTS_PUBLISHED metric")?;

    let events_dropped = register_counter_vec!(
        "shannon_streaming_events_dropped_total",
        "Events dropped on saturated subscriber buffers",
        &["event_type"]
    )
    .context("Failed to register EVENTS_DROPPED metric")?;

    let active_subscriptions = register_gauge!(
        "shannon_streaming_active_subscriptions",
        "Currently registered event subscriptions"
    )
    .context("Failed to register ACTIVE_SUBSCRIPTIONS metric")?;

    let eventlog_flushes = register_counter_vec!(
        "shannon_streaming_eventlog_flushes_total",
        "Event-log batch flushes, by outcome",
        &["status"]
    )
    .context("Failed to register EVENTLOG_FLUSHES metric")?;

    let eventlog_flush_duration = register_histogram_vec!(
        "shannon_streaming_eventlog_flush_duration_seconds",
        "Event-log batch flush duration in seconds",
        &["status"]
    )
    .context("Failed to register EVENTLOG_FLUSH_DURATION metric")?;

    let eventlog_overflow = register_counter_vec!(
        "shannon_streaming_eventlog_overflow_total",
        "Events rejected by a full persistence intake, by event type",
        &["event_type"]
    )
    .context("Failed to register EVENTLOG_OVERFLOW metric")?;

    let breaker_state = register_gauge_vec!(
        "shannon_streaming_circuit_breaker_state",
        "Circuit breaker state (0=closed, 1=half_open, 2=open)",
        &["breaker"]
    )
    .context("Failed to register BREAKER_STATE metric")?;

    let breaker_transitions = register_counter_vec!(
        "shannon_streaming_circuit_breaker_transitions_total",
        "Circuit breaker state transitions",
        &["breaker", "from", "to"]
    )
    .context("Failed to register BREAKER_TRANSITIONS metric")?;

    let stream_connections = register_gauge_vec!(
        "shannon_streaming_stream_connections",
        "Open streaming connections, by transport",
        &["transport"]
    )
    .context("Failed to register STREAM_CONNECTIONS metric")?;

    let schedule_ops = register_counter_vec!(
        "shannon_streaming_schedule_operations_total",
        "Scheduled-task manager operations, by outcome",
        &["operation", "status"]
    )
    .context("Failed to register SCHEDULE_OPS metric")?;

    EVENTS_PUBLISHED
        .set(events_published)
        .map_err(|_| anyhow::anyhow!("Failed to set EVENTS_PUBLISHED"))?;
    EVENTS_DROPPED
        .set(events_dropped)
        .map_err(|_| anyhow::anyhow!("Failed to set EVENTS_DROPPED"))?;
    ACTIVE_SUBSCRIPTIONS
        .set(active_subscriptions)
        .map_err(|_| anyhow::anyhow!("Failed to set ACTIVE_SUBSCRIPTIONS"))?;
    EVENTLOG_FLUSHES
        .set(eventlog_flushes)
        .map_err(|_| anyhow::anyhow!("Failed to set EVENTLOG_FLUSHES"))?;
    EVENTLOG_FLUSH_DURATION
        .set(eventlog_flush_duration)
        .map_err(|_| anyhow::anyhow!("Failed to set EVENTLOG_FLUSH_DURATION"))?;
    EVENTLOG_OVERFLOW
        .set(eventlog_overflow)
        .map_err(|_| anyhow::anyhow!("Failed to set EVENTLOG_OVERFLOW"))?;
    BREAKER_STATE
        .set(breaker_state)
        .map_err(|_| anyhow::anyhow!("Failed to set BREAKER_STATE"))?;
    BREAKER_TRANSITIONS
        .set(breaker_transitions)
        .map_err(|_| anyhow::anyhow!("Failed to set BREAKER_TRANSITIONS"))?;
    STREAM_CONNECTIONS
        .set(stream_connections)
        .map_err(|_| anyhow::anyhow!("Failed to set STREAM_CONNECTIONS"))?;
    SCHEDULE_OPS
        .set(schedule_ops)
        .map_err(|_| anyhow::anyhow!("Failed to set SCHEDULE_OPS"))?;

    Ok(())
}

/// Render all registered metrics in the Prometheus text format.
#[must_use]
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    // If encoding fails, return empty metrics rather than panic
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Count a publish outcome (`"ok"`, `"backend_error"`, ...).
pub fn inc_published(status: &str) {
    if let Some(counter) = EVENTS_PUBLISHED.get() {
        counter.with_label_values(&[status]).inc();
    }
}

/// Count an event dropped on a full subscriber buffer.
pub fn inc_dropped(event_type: &str) {
    if let Some(counter) = EVENTS_DROPPED.get() {
        counter.with_label_values(&[event_type]).inc();
    }
}

/// Adjust the live subscription gauge.
pub fn add_subscriptions(delta: f64) {
    if let Some(gauge) = ACTIVE_SUBSCRIPTIONS.get() {
        gauge.add(delta);
    }
}

/// Count a batch flush and observe its duration.
pub fn observe_flush(status: &str, seconds: f64) {
    if let Some(counter) = EVENTLOG_FLUSHES.get() {
        counter.with_label_values(&[status]).inc();
    }
    if let Some(histogram) = EVENTLOG_FLUSH_DURATION.get() {
        histogram.with_label_values(&[status]).observe(seconds);
    }
}

/// Count an event rejected by a saturated persistence intake.
pub fn inc_eventlog_overflow(event_type: &str) {
    if let Some(counter) = EVENTLOG_OVERFLOW.get() {
        counter.with_label_values(&[event_type]).inc();
    }
}

/// Record a breaker state change on the gauge and transition counter.
pub fn record_breaker_transition(breaker: &str, from: &str, to: &str, state_value: f64) {
    if let Some(gauge) = BREAKER_STATE.get() {
        gauge.with_label_values(&[breaker]).set(state_value);
    }
    if let Some(counter) = BREAKER_TRANSITIONS.get() {
        counter.with_label_values(&[breaker, from, to]).inc();
    }
}

/// Adjust the open-connection gauge for a transport (`"sse"`, `"ws"`).
pub fn add_stream_connections(transport: &str, delta: f64) {
    if let Some(gauge) = STREAM_CONNECTIONS.get() {
        gauge.with_label_values(&[transport]).add(delta);
    }
}

/// Count a scheduler operation outcome.
pub fn inc_schedule_op(operation: &str, status: &str) {
    if let Some(counter) = SCHEDULE_OPS.get() {
        counter.with_label_values(&[operation, status]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_are_noops_before_init() {
        // Must not panic when the registry was never initialized.
        inc_published("ok");
        inc_dropped("LLM_OUTPUT");
        add_subscriptions(1.0);
        record_breaker_transition("redis", "closed", "open", 2.0);
    }

    #[test]
    fn test_init_metrics_idempotent() {
        init_metrics().unwrap();
        init_metrics().unwrap();
        inc_published("ok");
        let rendered = get_metrics();
        assert!(rendered.contains("shannon_streaming_events_published_total"));
    }
}
