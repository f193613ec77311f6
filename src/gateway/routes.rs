//! Health and metrics routes.

use axum::{response::IntoResponse, routing::get, Json, Router};
use serde_json::json;

use crate::AppState;

/// Service routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
}

/// Liveness probe.
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Prometheus scrape endpoint.
pub async fn metrics() -> impl IntoResponse {
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        crate::metrics::get_metrics(),
    )
}
