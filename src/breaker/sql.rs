//! SQL store wrapper.
//!
//! Connection-level failures (I/O, pool exhaustion, protocol, TLS) count
//! against the breaker. Query-level outcomes — no rows, constraint
//! violations, decode errors — are answers about the data and pass through
//! without tripping it. Every pool, transaction and statement operation in
//! the crate goes through [`SqlBreaker::execute`].

use sqlx::Error as SqlxError;

use super::{BreakerError, CircuitBreaker};

/// Whether a sqlx error indicates the database itself is unhealthy.
#[must_use]
pub fn is_connection_failure(error: &SqlxError) -> bool {
    matches!(
        error,
        SqlxError::Io(_)
            | SqlxError::Tls(_)
            | SqlxError::Protocol(_)
            | SqlxError::PoolTimedOut
            | SqlxError::PoolClosed
            | SqlxError::WorkerCrashed
    )
}

/// Circuit-breaker wrapper for PostgreSQL access.
#[derive(Debug, Clone)]
pub struct SqlBreaker {
    breaker: CircuitBreaker,
}

impl SqlBreaker {
    #[must_use]
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self { breaker }
    }

    /// Underlying breaker, for state inspection.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run a database operation through the breaker.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T, BreakerError<SqlxError>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, SqlxError>>,
    {
        self.breaker
            .execute_classified(f, |result| match result {
                Ok(_) => true,
                Err(e) => !is_connection_failure(e),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerSettings, BreakerState};
    use std::time::Duration;

    fn breaker() -> SqlBreaker {
        SqlBreaker::new(CircuitBreaker::new(BreakerSettings {
            name: "db-test".to_string(),
            max_requests: 3,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            failure_threshold: 3,
            success_threshold: 1,
        }))
    }

    #[tokio::test]
    async fn test_row_not_found_keeps_breaker_closed() {
        let sql = breaker();
        for _ in 0..5 {
            let result: Result<(), _> = sql
                .execute(|| async { Err(SqlxError::RowNotFound) })
                .await;
            assert!(matches!(result, Err(BreakerError::Inner(_))));
        }
        assert_eq!(sql.breaker().state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_pool_timeout_trips_breaker() {
        let sql = breaker();
        for _ in 0..3 {
            let result: Result<(), _> = sql
                .execute(|| async { Err(SqlxError::PoolTimedOut) })
                .await;
            assert!(matches!(result, Err(BreakerError::Inner(_))));
        }
        assert_eq!(sql.breaker().state(), BreakerState::Open);
    }
}
