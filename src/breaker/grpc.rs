//! gRPC client wrapper.
//!
//! Server-side and transient status codes (`UNAVAILABLE`,
//! `DEADLINE_EXCEEDED`, `RESOURCE_EXHAUSTED`, `INTERNAL`) count as breaker
//! failures. Client-caused codes (`INVALID_ARGUMENT`, `NOT_FOUND`,
//! `ALREADY_EXISTS`, `PERMISSION_DENIED`, `UNAUTHENTICATED`) never trip the
//! circuit. The original error always reaches the caller unchanged.

use tonic::Code;

use super::{BreakerError, CircuitBreaker};

/// Errors that can surface a gRPC status code for breaker classification.
pub trait GrpcCoded {
    /// The status code behind this error, if any. `None` means the error
    /// did not originate from a gRPC call and is treated as transient.
    fn grpc_code(&self) -> Option<Code>;
}

impl GrpcCoded for tonic::Status {
    fn grpc_code(&self) -> Option<Code> {
        Some(self.code())
    }
}

/// Whether a status code indicates a downstream outage.
#[must_use]
pub fn is_failure_code(code: Code) -> bool {
    matches!(
        code,
        Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted | Code::Internal
    )
}

/// Circuit-breaker wrapper for durable-engine gRPC calls.
#[derive(Debug, Clone)]
pub struct GrpcBreaker {
    breaker: CircuitBreaker,
}

impl GrpcBreaker {
    #[must_use]
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self { breaker }
    }

    /// Underlying breaker, for state inspection.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run a gRPC call through the breaker.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        E: GrpcCoded,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.breaker
            .execute_classified(f, |result| match result {
                Ok(_) => true,
                Err(e) => match e.grpc_code() {
                    Some(code) => !is_failure_code(code),
                    None => false,
                },
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerSettings, BreakerState};
    use std::time::Duration;

    fn breaker() -> GrpcBreaker {
        GrpcBreaker::new(CircuitBreaker::new(BreakerSettings {
            name: "grpc-test".to_string(),
            max_requests: 3,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            failure_threshold: 3,
            success_threshold: 1,
        }))
    }

    #[tokio::test]
    async fn test_invalid_argument_keeps_breaker_closed() {
        let grpc = breaker();
        for _ in 0..5 {
            let result: Result<(), _> = grpc
                .execute(|| async { Err(tonic::Status::invalid_argument("bad cron")) })
                .await;
            match result {
                Err(BreakerError::Inner(status)) => {
                    assert_eq!(status.code(), Code::InvalidArgument);
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(grpc.breaker().state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_unavailable_trips_breaker() {
        let grpc = breaker();
        for _ in 0..3 {
            let result: Result<(), _> = grpc
                .execute(|| async { Err(tonic::Status::unavailable("engine down")) })
                .await;
            // Original status propagates, never a synthetic OK.
            match result {
                Err(BreakerError::Inner(status)) => {
                    assert_eq!(status.code(), Code::Unavailable);
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(grpc.breaker().state(), BreakerState::Open);

        let rejected: Result<(), _> = grpc
            .execute(|| async { Ok::<(), tonic::Status>(()) })
            .await;
        assert!(matches!(rejected, Err(BreakerError::Open)));
    }

    #[test]
    fn test_code_classification() {
        assert!(is_failure_code(Code::Unavailable));
        assert!(is_failure_code(Code::DeadlineExceeded));
        assert!(is_failure_code(Code::ResourceExhausted));
        assert!(is_failure_code(Code::Internal));

        assert!(!is_failure_code(Code::InvalidArgument));
        assert!(!is_failure_code(Code::NotFound));
        assert!(!is_failure_code(Code::AlreadyExists));
        assert!(!is_failure_code(Code::PermissionDenied));
        assert!(!is_failure_code(Code::Unauthenticated));
    }
}
