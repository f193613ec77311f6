//! Circuit breaker for protecting against cascading failures.
//!
//! Every outward-facing client (Redis, PostgreSQL, the durable engine's
//! gRPC surface, plain HTTP) runs its calls through a breaker. The breaker
//! tracks request outcomes per *generation*: every state transition and
//! every closed-state interval rollover bumps the generation, and outcomes
//! reported against a stale generation are discarded, so a slow call that
//! straddles a transition can never corrupt the counters that drove it.
//!
//! # States
//!
//! - **Closed**: normal operation; counters cleared every `interval`
//! - **Open**: requests rejected with [`BreakerError::Open`] until `timeout`
//!   elapses
//! - **HalfOpen**: at most `max_requests` concurrent trial calls;
//!   `success_threshold` consecutive successes close the circuit, any
//!   failure reopens it

pub mod grpc;
pub mod http;
pub mod redis;
pub mod sql;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation, requests pass through.
    Closed,
    /// Failing fast, no requests admitted.
    Open,
    /// Probing recovery with a bounded number of trial requests.
    HalfOpen,
}

impl BreakerState {
    /// String form used in logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Numeric form for the state gauge.
    #[must_use]
    const fn gauge_value(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

/// Request outcome counters for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Tunable breaker parameters. Per-transport values come from
/// `CB_<TRANSPORT>_*` environment variables (see the config module).
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Name used in logs and metric labels (e.g. `"redis"`, `"grpc"`).
    pub name: String,
    /// Concurrent trial calls admitted while half-open.
    pub max_requests: u32,
    /// Closed-state counter-clearing cycle. Zero disables rollover.
    pub interval: Duration,
    /// Open-state cooldown before probing.
    pub timeout: Duration,
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
}

impl BreakerSettings {
    /// Settings with conventional defaults for the given breaker name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_requests: 3,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            failure_threshold: 5,
            success_threshold: 2,
        }
    }
}

/// Rejection or pass-through error from [`CircuitBreaker::execute`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the call was not attempted.
    #[error("circuit breaker is open")]
    Open,
    /// The half-open trial budget is exhausted; the call was not attempted.
    #[error("too many requests in half-open state")]
    TooManyRequests,
    /// The call ran and failed; the original error is preserved.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// True when the breaker rejected the call without running it.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Open | Self::TooManyRequests)
    }

    /// The wrapped downstream error, if the call actually ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// Three-state circuit breaker with generation-tracked outcomes.
///
/// Cheap to clone; clones share state. The internal mutex is held only for
/// state inspection and transition, never across the guarded call.
#[derive(Clone)]
pub struct CircuitBreaker {
    settings: Arc<BreakerSettings>,
    inner: Arc<Mutex<Inner>>,
}

impl CircuitBreaker {
    /// Create a breaker from settings.
    #[must_use]
    pub fn new(settings: BreakerSettings) -> Self {
        let interval = settings.interval;
        Self {
            settings: Arc::new(settings),
            inner: Arc::new(Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: (interval > Duration::ZERO).then(|| Instant::now() + interval),
            })),
        }
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Run `f` through the breaker. Any `Err` counts as a failure.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.execute_classified(f, |result: &Result<T, E>| result.is_ok())
            .await
    }

    /// Run `f` through the breaker with a custom success classifier.
    ///
    /// The classifier decides what the breaker records; the caller always
    /// receives the original outcome. Transport wrappers use this to keep
    /// client-side errors (HTTP 4xx, gRPC `INVALID_ARGUMENT`, absent Redis
    /// keys) from tripping the circuit.
    ///
    /// A panic inside `f` is recorded as a failure and then resumed.
    pub async fn execute_classified<T, E, F, Fut, C>(
        &self,
        f: F,
        is_success: C,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        C: FnOnce(&Result<T, E>) -> bool,
    {
        let generation = self.before_request()?;

        match std::panic::AssertUnwindSafe(f()).catch_unwind().await {
            Err(panic) => {
                self.after_request(generation, false);
                std::panic::resume_unwind(panic);
            }
            Ok(result) => {
                self.after_request(generation, is_success(&result));
                result.map_err(BreakerError::Inner)
            }
        }
    }

    /// Current state, advancing open→half-open when the cooldown elapsed.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.current_state(&mut inner, Instant::now()).0
    }

    /// Snapshot of the current generation's counters.
    #[must_use]
    pub fn counts(&self) -> Counts {
        self.inner.lock().counts
    }

    fn before_request<E>(&self) -> Result<u64, BreakerError<E>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let (state, generation) = self.current_state(&mut inner, now);

        match state {
            BreakerState::Open => Err(BreakerError::Open),
            BreakerState::HalfOpen if inner.counts.requests >= self.settings.max_requests => {
                Err(BreakerError::TooManyRequests)
            }
            _ => {
                inner.counts.on_request();
                Ok(generation)
            }
        }
    }

    fn after_request(&self, generation: u64, success: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let (state, current_generation) = self.current_state(&mut inner, now);
        if generation != current_generation {
            // Outcome from a previous generation; discard.
            return;
        }

        if success {
            self.on_success(&mut inner, state, now);
        } else {
            self.on_failure(&mut inner, state, now);
        }
    }

    fn on_success(&self, inner: &mut Inner, state: BreakerState, now: Instant) {
        match state {
            BreakerState::Closed => inner.counts.on_success(),
            BreakerState::HalfOpen => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.settings.success_threshold {
                    self.set_state(inner, BreakerState::Closed, now);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut Inner, state: BreakerState, now: Instant) {
        match state {
            BreakerState::Closed => {
                inner.counts.on_failure();
                if inner.counts.consecutive_failures >= self.settings.failure_threshold {
                    self.set_state(inner, BreakerState::Open, now);
                }
            }
            BreakerState::HalfOpen => {
                self.set_state(inner, BreakerState::Open, now);
            }
            BreakerState::Open => {}
        }
    }

    /// Resolve the effective state, applying timer-driven transitions:
    /// open→half-open after the cooldown, and the closed-state interval
    /// rollover that clears counters without changing state.
    fn current_state(&self, inner: &mut Inner, now: Instant) -> (BreakerState, u64) {
        match inner.state {
            BreakerState::Closed => {
                if let Some(expiry) = inner.expiry {
                    if now >= expiry {
                        self.new_generation(inner, now);
                    }
                }
            }
            BreakerState::Open => {
                if let Some(expiry) = inner.expiry {
                    if now >= expiry {
                        self.set_state(inner, BreakerState::HalfOpen, now);
                    }
                }
            }
            BreakerState::HalfOpen => {}
        }
        (inner.state, inner.generation)
    }

    fn set_state(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        self.new_generation(inner, now);

        tracing::info!(
            breaker = %self.settings.name,
            from = from.as_str(),
            to = to.as_str(),
            "Circuit breaker state change"
        );
        crate::metrics::record_breaker_transition(
            &self.settings.name,
            from.as_str(),
            to.as_str(),
            to.gauge_value(),
        );
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts.clear();
        inner.expiry = match inner.state {
            BreakerState::Closed => {
                (self.settings.interval > Duration::ZERO).then(|| now + self.settings.interval)
            }
            BreakerState::Open => Some(now + self.settings.timeout),
            BreakerState::HalfOpen => None,
        };
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.settings.name)
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field("counts", &inner.counts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_settings() -> BreakerSettings {
        BreakerSettings {
            name: "test".to_string(),
            max_requests: 5,
            interval: Duration::from_secs(60),
            timeout: Duration::from_millis(100),
            failure_threshold: 3,
            success_threshold: 2,
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute(|| async { Err::<(), _>("boom") })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        breaker
            .execute(|| async { Ok::<_, &str>(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_initial_state_closed() {
        let breaker = CircuitBreaker::new(fast_settings());
        assert_eq!(breaker.state(), BreakerState::Closed);
        succeed(&breaker).await;
        assert_eq!(breaker.counts().total_successes, 1);
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new(fast_settings());

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        // Rejected without invoking the closure.
        let mut invoked = false;
        let result = breaker
            .execute(|| {
                invoked = true;
                async { Ok::<_, &str>(()) }
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open)));
        assert!(!invoked);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new(fast_settings());

        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await;
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_open_to_half_open_to_closed() {
        let breaker = CircuitBreaker::new(fast_settings());

        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;
        succeed(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        succeed(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(fast_settings());

        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_half_open_saturation_rejected() {
        let mut settings = fast_settings();
        settings.max_requests = 1;
        let breaker = CircuitBreaker::new(settings);

        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Hold one trial slot open across the second attempt.
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok::<_, &str>(())
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let result = breaker.execute(|| async { Ok::<_, &str>(()) }).await;
        assert!(matches!(result, Err(BreakerError::TooManyRequests)));

        let _ = release_tx.send(());
        trial.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stale_generation_outcome_discarded() {
        let breaker = CircuitBreaker::new(fast_settings());

        // Trip the breaker while a successful call from the closed
        // generation is still in flight; its outcome must not count
        // against the open generation.
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok::<_, &str>(())
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        let open_counts = breaker.counts();

        let _ = release_tx.send(());
        slow.await.unwrap().unwrap();

        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.counts(), open_counts);
    }

    #[tokio::test]
    async fn test_classifier_overrides_error_outcome() {
        let breaker = CircuitBreaker::new(fast_settings());

        for _ in 0..5 {
            let result = breaker
                .execute_classified(
                    || async { Err::<(), _>("not found") },
                    |_| true, // caller-side error, not a downstream outage
                )
                .await;
            assert!(matches!(result, Err(BreakerError::Inner("not found"))));
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_panic_counts_as_failure() {
        let mut settings = fast_settings();
        settings.failure_threshold = 1;
        let breaker = CircuitBreaker::new(settings);

        async fn panicking() -> Result<(), &'static str> {
            panic!("kaboom")
        }

        let breaker_clone = breaker.clone();
        let handle = tokio::spawn(async move { breaker_clone.execute(panicking).await });
        assert!(handle.await.is_err());
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
