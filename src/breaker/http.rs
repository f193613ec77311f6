//! HTTP client wrapper.
//!
//! Network-level errors and 5xx responses count against the breaker; 4xx
//! responses are the caller's problem and pass through without tripping it.

use super::{BreakerError, CircuitBreaker};

/// Circuit-breaker wrapper for `reqwest`-based calls.
#[derive(Debug, Clone)]
pub struct HttpBreaker {
    breaker: CircuitBreaker,
}

impl HttpBreaker {
    #[must_use]
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self { breaker }
    }

    /// Underlying breaker, for state inspection.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run an HTTP call through the breaker.
    ///
    /// The response is returned to the caller regardless of status code;
    /// only the breaker's bookkeeping differs between 4xx and 5xx.
    pub async fn execute<F, Fut>(
        &self,
        f: F,
    ) -> Result<reqwest::Response, BreakerError<reqwest::Error>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        self.breaker
            .execute_classified(f, |result| match result {
                Ok(response) => !response.status().is_server_error(),
                Err(_) => false,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerSettings, BreakerState};
    use std::time::Duration;

    fn breaker() -> HttpBreaker {
        HttpBreaker::new(CircuitBreaker::new(BreakerSettings {
            name: "http-test".to_string(),
            max_requests: 3,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            failure_threshold: 3,
            success_threshold: 1,
        }))
    }

    fn response(status: u16) -> reqwest::Response {
        http::Response::builder()
            .status(status)
            .body("")
            .unwrap()
            .into()
    }

    #[tokio::test]
    async fn test_4xx_does_not_trip_breaker() {
        let http = breaker();
        for _ in 0..5 {
            let resp = http.execute(|| async { Ok(response(404)) }).await.unwrap();
            assert_eq!(resp.status(), 404);
        }
        assert_eq!(http.breaker().state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_5xx_counts_as_failure_but_returns_response() {
        let http = breaker();
        for _ in 0..3 {
            let resp = http.execute(|| async { Ok(response(502)) }).await.unwrap();
            assert_eq!(resp.status(), 502);
        }
        assert_eq!(http.breaker().state(), BreakerState::Open);
    }
}
