//! Shannon Streaming - workflow event streaming and scheduling substrate.
//!
//! This crate sits between a durable workflow engine (Temporal in the cloud
//! deployment) and many concurrent SSE/WebSocket subscribers:
//!
//! - **Streaming**: durable, replayable, multi-subscriber fan-out of
//!   workflow events over a Redis-stream backend, with resume cursors,
//!   backpressure and best-effort relational archival
//! - **Transport**: SSE and WebSocket endpoints honoring `Last-Event-ID`,
//!   plus ingest, approval and timeline endpoints
//! - **Circuit breakers**: a generic three-state breaker wrapping every
//!   outward-facing client (HTTP, gRPC, Redis, SQL)
//! - **Scheduling**: cron-driven schedule CRUD synchronized between the
//!   external scheduler and the relational catalog
//!
//! # Architecture
//!
//! The service is organized into several key modules:
//!
//! - [`config`]: Configuration management and environment loading
//! - [`events`]: Event model and sanitization
//! - [`streaming`]: Event Streaming Manager, backends, persistence batcher
//! - [`breaker`]: Circuit breaker framework and transport wrappers
//! - [`engine`]: Durable workflow engine contracts
//! - [`scheduler`]: Cron parsing and the scheduled-task manager
//! - [`database`]: PostgreSQL stores
//! - [`gateway`]: HTTP surfaces (SSE, WebSocket, ingest, approvals,
//!   timeline, schedules, auth)
//! - [`timeline`]: Timeline builder over durable history
//!
//! # Example
//!
//! ```rust,ignore
//! use shannon_streaming::{config::AppConfig, server::create_app};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let (app, _state) = create_app(config).await?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod breaker;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod logging;
pub mod metrics;
pub mod scheduler;
pub mod server;
pub mod streaming;
pub mod timeline;

use std::sync::Arc;

use breaker::grpc::GrpcBreaker;
use config::AppConfig;
use database::UserStore;
use engine::DurableEngine;
use scheduler::ScheduleManager;
use streaming::persistence::EventLogStore;
use streaming::EventStreamManager;
use timeline::TimelineBuilder;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Event streaming manager.
    pub streaming: Arc<EventStreamManager>,
    /// Durable workflow engine client.
    pub engine: Arc<dyn DurableEngine>,
    /// Breaker guarding engine calls made directly by handlers.
    pub engine_breaker: GrpcBreaker,
    /// Scheduled-task manager.
    pub schedules: Arc<ScheduleManager>,
    /// Timeline builder.
    pub timeline: Arc<TimelineBuilder>,
    /// Account store for the auth endpoints.
    pub users: Arc<dyn UserStore>,
    /// Event-log store for timeline persistence; absent when running
    /// without a relational store.
    pub event_log: Option<Arc<dyn EventLogStore>>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"AppConfig")
            .field("streaming", &self.streaming)
            .field("event_log", &self.event_log.is_some())
            .finish_non_exhaustive()
    }
}
