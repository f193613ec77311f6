//! Redis client wrapper.
//!
//! Absent keys are a normal answer, not an outage. In the `redis` crate a
//! nil reply surfaces either as `Ok(None)` (typed as `Option<_>`) or as a
//! type-conversion error; neither counts against the breaker.

use redis::{ErrorKind, RedisError};

use super::{BreakerError, CircuitBreaker};

/// Whether a Redis error reflects the value shape rather than the server.
#[must_use]
pub fn is_client_side(error: &RedisError) -> bool {
    matches!(error.kind(), ErrorKind::UnexpectedReturnType)
}

/// Circuit-breaker wrapper for Redis calls.
#[derive(Debug, Clone)]
pub struct RedisBreaker {
    breaker: CircuitBreaker,
}

impl RedisBreaker {
    #[must_use]
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self { breaker }
    }

    /// Underlying breaker, for state inspection.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run a Redis call through the breaker.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T, BreakerError<RedisError>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        self.breaker
            .execute_classified(f, |result| match result {
                Ok(_) => true,
                Err(e) => is_client_side(e),
            })
            .await
    }
}
