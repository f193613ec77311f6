//! Configuration management.
//!
//! Settings load in layers: defaults, an optional `config/shannon-streaming`
//! file, `SHANNON__`-prefixed structured environment variables, then the
//! flat environment names operators already use (`REDIS_URL`,
//! `DATABASE_URL`, `EVENTLOG_BATCH_SIZE`, `CB_*` breaker tunables).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::breaker::BreakerSettings;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Redis configuration.
    #[serde(default)]
    pub redis: RedisConfig,
    /// Relational store configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Durable engine endpoint.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Gateway configuration (auth tokens).
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Event streaming configuration.
    #[serde(default)]
    pub streaming: StreamingConfig,
    /// Event-log persistence batching.
    #[serde(default)]
    pub eventlog: EventLogConfig,
    /// Scheduled-task policy.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Per-transport circuit breaker tunables.
    #[serde(default)]
    pub breakers: BreakersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Whole-request timeout applied by the tower layer, seconds.
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL; absent means the in-memory stream backend.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL URL; absent means in-memory stores (tests, embedded).
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Durable engine gRPC endpoint.
    pub endpoint: String,
    pub connect_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:7233".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Secret for signing JWTs issued by the auth endpoints.
    pub jwt_secret: String,
    /// Token lifetime, seconds.
    pub token_expiry_secs: u64,
    /// Bearer token required on ingest/approval endpoints; absent means
    /// those endpoints accept unauthenticated requests.
    pub ingest_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "dev-secret-change-me".to_string(),
            token_expiry_secs: 24 * 60 * 60,
            ingest_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Approximate per-workflow stream capacity (trim target).
    pub capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    pub batch_size: usize,
    pub batch_interval_ms: u64,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_interval_ms: 100,
        }
    }
}

impl EventLogConfig {
    #[must_use]
    pub fn batcher_config(&self) -> crate::streaming::persistence::BatcherConfig {
        crate::streaming::persistence::BatcherConfig {
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.batch_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub min_cron_interval_mins: u32,
    pub max_per_user: usize,
    pub max_budget_per_run_usd: f64,
    pub workflow_type: String,
    pub task_queue: String,
    pub default_timeout_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let defaults = crate::scheduler::ScheduleManagerConfig::default();
        Self {
            min_cron_interval_mins: defaults.min_cron_interval_mins,
            max_per_user: defaults.max_per_user,
            max_budget_per_run_usd: defaults.max_budget_per_run_usd,
            workflow_type: defaults.workflow_type,
            task_queue: defaults.task_queue,
            default_timeout_seconds: defaults.default_timeout_seconds,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn manager_config(&self) -> crate::scheduler::ScheduleManagerConfig {
        crate::scheduler::ScheduleManagerConfig {
            min_cron_interval_mins: self.min_cron_interval_mins,
            max_per_user: self.max_per_user,
            max_budget_per_run_usd: self.max_budget_per_run_usd,
            workflow_type: self.workflow_type.clone(),
            task_queue: self.task_queue.clone(),
            default_timeout_seconds: self.default_timeout_seconds,
        }
    }
}

/// One transport's breaker tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerTunables {
    pub max_requests: u32,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

impl BreakerTunables {
    const fn new(
        max_requests: u32,
        interval_secs: u64,
        timeout_secs: u64,
        failure_threshold: u32,
        success_threshold: u32,
    ) -> Self {
        Self {
            max_requests,
            interval_secs,
            timeout_secs,
            failure_threshold,
            success_threshold,
        }
    }

    /// Materialize breaker settings under the given name.
    #[must_use]
    pub fn settings(&self, name: &str) -> BreakerSettings {
        BreakerSettings {
            name: name.to_string(),
            max_requests: self.max_requests,
            interval: Duration::from_secs(self.interval_secs),
            timeout: Duration::from_secs(self.timeout_secs),
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
        }
    }

    /// Apply `CB_<PREFIX>_*` environment overrides.
    fn load_env(mut self, prefix: &str) -> Self {
        if let Some(v) = env_parse(&format!("CB_{prefix}_MAX_REQUESTS")) {
            self.max_requests = v;
        }
        if let Some(v) = env_parse(&format!("CB_{prefix}_INTERVAL")) {
            self.interval_secs = v;
        }
        if let Some(v) = env_parse(&format!("CB_{prefix}_TIMEOUT")) {
            self.timeout_secs = v;
        }
        if let Some(v) = env_parse(&format!("CB_{prefix}_FAILURE_THRESHOLD")) {
            self.failure_threshold = v;
        }
        if let Some(v) = env_parse(&format!("CB_{prefix}_SUCCESS_THRESHOLD")) {
            self.success_threshold = v;
        }
        self
    }
}

/// Breaker tunables per transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakersConfig {
    pub redis: BreakerTunables,
    pub db: BreakerTunables,
    pub grpc: BreakerTunables,
    pub grpc_conn: BreakerTunables,
    pub http: BreakerTunables,
}

impl Default for BreakersConfig {
    fn default() -> Self {
        Self {
            redis: BreakerTunables::new(3, 30, 15, 3, 1),
            db: BreakerTunables::new(3, 60, 30, 5, 2),
            grpc: BreakerTunables::new(5, 30, 15, 3, 2),
            grpc_conn: BreakerTunables::new(3, 30, 30, 3, 1),
            http: BreakerTunables::new(3, 60, 30, 5, 2),
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, files and the environment.
    pub fn load() -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/shannon-streaming").required(false))
            .add_source(
                config::Environment::with_prefix("SHANNON")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut app_config: AppConfig = config.try_deserialize().unwrap_or_default();

        // Flat environment names win over everything.
        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.is_empty() {
                app_config.redis.url = Some(url);
            }
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.is_empty() {
                app_config.database.url = Some(url);
            }
        }
        if let Ok(endpoint) = std::env::var("ENGINE_GRPC_ENDPOINT") {
            if !endpoint.is_empty() {
                app_config.engine.endpoint = endpoint;
            }
        }
        if let Ok(token) = std::env::var("INGEST_BEARER_TOKEN") {
            if !token.is_empty() {
                app_config.gateway.ingest_token = Some(token);
            }
        }
        if let Some(batch_size) = env_parse("EVENTLOG_BATCH_SIZE") {
            app_config.eventlog.batch_size = batch_size;
        }
        if let Some(interval_ms) = env_parse("EVENTLOG_BATCH_INTERVAL_MS") {
            app_config.eventlog.batch_interval_ms = interval_ms;
        }

        app_config.breakers.redis = app_config.breakers.redis.load_env("REDIS");
        app_config.breakers.db = app_config.breakers.db.load_env("DB");
        app_config.breakers.grpc = app_config.breakers.grpc.load_env("GRPC");
        app_config.breakers.grpc_conn = app_config.breakers.grpc_conn.load_env("GRPC_CONN");
        app_config.breakers.http = app_config.breakers.http.load_env("HTTP");

        Ok(app_config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|raw| raw.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_in_spec_ranges() {
        let breakers = BreakersConfig::default();
        for tunables in [
            &breakers.redis,
            &breakers.db,
            &breakers.grpc,
            &breakers.grpc_conn,
            &breakers.http,
        ] {
            assert!((3..=5).contains(&tunables.max_requests));
            assert!((30..=60).contains(&tunables.interval_secs));
            assert!((15..=30).contains(&tunables.timeout_secs));
            assert!((3..=5).contains(&tunables.failure_threshold));
            assert!((1..=2).contains(&tunables.success_threshold));
        }
    }

    #[test]
    #[serial]
    fn test_breaker_env_override() {
        std::env::set_var("CB_REDIS_FAILURE_THRESHOLD", "4");
        std::env::set_var("CB_REDIS_TIMEOUT", "20");

        let tunables = BreakerTunables::new(3, 30, 15, 3, 1).load_env("REDIS");
        assert_eq!(tunables.failure_threshold, 4);
        assert_eq!(tunables.timeout_secs, 20);
        assert_eq!(tunables.max_requests, 3);

        std::env::remove_var("CB_REDIS_FAILURE_THRESHOLD");
        std::env::remove_var("CB_REDIS_TIMEOUT");
    }

    #[test]
    #[serial]
    fn test_eventlog_env_override() {
        std::env::set_var("EVENTLOG_BATCH_SIZE", "250");
        std::env::set_var("EVENTLOG_BATCH_INTERVAL_MS", "50");

        let config = AppConfig::load().unwrap();
        assert_eq!(config.eventlog.batch_size, 250);
        assert_eq!(config.eventlog.batch_interval_ms, 50);

        std::env::remove_var("EVENTLOG_BATCH_SIZE");
        std::env::remove_var("EVENTLOG_BATCH_INTERVAL_MS");
    }
}
