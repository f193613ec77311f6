//! HTTP server setup and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::breaker::grpc::GrpcBreaker;
use crate::breaker::redis::RedisBreaker;
use crate::breaker::sql::SqlBreaker;
use crate::breaker::CircuitBreaker;
use crate::config::AppConfig;
use crate::database;
use crate::engine::{DurableEngine, ScheduleClient};
use crate::gateway;
use crate::logging::OpTimer;
use crate::scheduler::{MemoryScheduleCatalog, ScheduleCatalog, ScheduleManager};
use crate::streaming::backend::{MemoryStreamBackend, RedisStreamBackend, StreamBackend};
use crate::streaming::persistence::{EventLogBatcher, EventLogStore, MemoryEventLogStore};
use crate::streaming::EventStreamManager;
use crate::timeline::TimelineBuilder;
use crate::{log_init_step, log_init_warning, AppState};

/// Service version (from Cargo.toml).
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// External collaborators injected by the embedding binary.
pub struct EngineHandles {
    pub engine: Arc<dyn DurableEngine>,
    pub schedule_client: Arc<dyn ScheduleClient>,
}

/// Create the application with all routes and middleware.
///
/// Returns the router together with the shared state so the caller can
/// drive [`EventStreamManager::shutdown`] on exit.
pub async fn create_app(
    config: AppConfig,
    engines: EngineHandles,
) -> anyhow::Result<(Router, AppState)> {
    let overall_timer = OpTimer::new("server", "create_app");
    tracing::info!(version = VERSION, "Starting shannon-streaming");

    // [1/6] Metrics registry
    let step_timer = OpTimer::new("server", "metrics");
    crate::metrics::init_metrics()?;
    log_init_step!(1, 6, "Metrics", "prometheus registry ready");
    step_timer.finish();

    // [2/6] Stream backend (Redis when configured, in-memory otherwise)
    let step_timer = OpTimer::new("server", "stream_backend");
    let redis_breaker = RedisBreaker::new(CircuitBreaker::new(
        config.breakers.redis.settings("redis"),
    ));
    let backend: Arc<dyn StreamBackend> = match &config.redis.url {
        Some(url) => match init_redis(url).await {
            Ok(conn) => {
                log_init_step!(2, 6, "Stream backend", format!("redis at {url}"));
                Arc::new(RedisStreamBackend::new(conn, redis_breaker))
            }
            Err(e) => {
                log_init_warning!("Redis connection failed: {}. Using in-memory streams.", e);
                log_init_step!(2, 6, "Stream backend", "in-memory fallback");
                MemoryStreamBackend::new()
            }
        },
        None => {
            log_init_step!(2, 6, "Stream backend", "in-memory (no REDIS_URL)");
            MemoryStreamBackend::new()
        }
    };
    step_timer.finish();

    // [3/6] Relational stores
    let step_timer = OpTimer::new("server", "database");
    let sql_breaker = SqlBreaker::new(CircuitBreaker::new(config.breakers.db.settings("db")));
    let (event_log, catalog, users): (
        Arc<dyn EventLogStore>,
        Arc<dyn ScheduleCatalog>,
        Arc<dyn database::UserStore>,
    ) = match &config.database.url {
        Some(url) => {
            let pool = database::connect(url, config.database.max_connections).await?;
            log_init_step!(3, 6, "Database", "postgres connected, migrations applied");
            (
                Arc::new(database::PgEventLogStore::new(
                    pool.clone(),
                    sql_breaker.clone(),
                )),
                Arc::new(database::PgScheduleCatalog::new(
                    pool.clone(),
                    sql_breaker.clone(),
                )),
                Arc::new(database::PgUserStore::new(pool, sql_breaker)),
            )
        }
        None => {
            log_init_warning!("DATABASE_URL not set; using in-memory stores");
            log_init_step!(3, 6, "Database", "in-memory stores");
            (
                MemoryEventLogStore::new(),
                MemoryScheduleCatalog::new(),
                database::MemoryUserStore::new(),
            )
        }
    };
    step_timer.finish();

    // [4/6] Streaming manager + persistence batcher
    let step_timer = OpTimer::new("server", "streaming");
    let batcher = Arc::new(EventLogBatcher::spawn(
        Arc::clone(&event_log),
        config.eventlog.batcher_config(),
    ));
    let streaming = Arc::new(EventStreamManager::new(
        backend,
        Some(batcher),
        config.streaming.capacity,
    ));
    log_init_step!(
        4,
        6,
        "Streaming",
        format!(
            "capacity {} / batch {} @ {}ms",
            config.streaming.capacity, config.eventlog.batch_size, config.eventlog.batch_interval_ms
        )
    );
    step_timer.finish();

    // [5/6] Schedule manager + timeline builder
    let step_timer = OpTimer::new("server", "scheduler");
    let grpc_breaker = GrpcBreaker::new(CircuitBreaker::new(config.breakers.grpc.settings("grpc")));
    let schedules = Arc::new(ScheduleManager::new(
        engines.schedule_client,
        catalog,
        grpc_breaker.clone(),
        config.scheduler.manager_config(),
    ));
    let timeline = Arc::new(TimelineBuilder::new(
        Arc::clone(&engines.engine),
        grpc_breaker.clone(),
    ));
    log_init_step!(
        5,
        6,
        "Scheduler",
        format!(
            "min interval {}m, quota {}/user",
            config.scheduler.min_cron_interval_mins, config.scheduler.max_per_user
        )
    );
    step_timer.finish();

    let state = AppState {
        config: Arc::new(config.clone()),
        streaming,
        engine: engines.engine,
        engine_breaker: grpc_breaker,
        schedules,
        timeline,
        users,
        event_log: Some(event_log),
    };

    // [6/6] Router with middleware
    let step_timer = OpTimer::new("server", "router");
    let app = build_router(&config).with_state(state.clone());
    log_init_step!(6, 6, "Router", "routes + middleware configured");
    step_timer.finish();

    overall_timer.finish();
    Ok((app, state))
}

/// Assemble the application router: the gateway routes plus the CORS,
/// request-timeout and trace layers.
///
/// This is the only router-construction site; the HTTP test suites build
/// from it too, so they exercise the same middleware stack that ships.
/// The timeout bounds the response future, not streaming bodies, so
/// long-lived SSE/WebSocket connections are unaffected.
pub fn build_router(config: &AppConfig) -> Router<AppState> {
    gateway::create_router()
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TimeoutLayer::with_status_code(
            axum::http::StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.server.timeout_secs),
        ))
        .layer(TraceLayer::new_for_http())
}

/// Initialize Redis connection.
async fn init_redis(url: &str) -> anyhow::Result<redis::aio::ConnectionManager> {
    let client = redis::Client::open(url)?;
    let conn = redis::aio::ConnectionManager::new(client).await?;
    Ok(conn)
}
