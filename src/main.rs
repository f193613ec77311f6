//! Shannon Streaming - Main Entry Point
//!
//! Workflow event streaming and scheduling service for the Shannon AI
//! platform.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mimalloc::MiMalloc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shannon_streaming::config::AppConfig;
use shannon_streaming::engine::UnconfiguredEngine;
use shannon_streaming::server::{create_app, EngineHandles};

// Use mimalloc for better performance
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// How long shutdown waits for reader fibers and the batcher.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "shannon-streaming")]
#[command(about = "Shannon workflow event streaming and scheduling service")]
#[command(version)]
struct Args {
    /// Host to bind to.
    #[arg(long, env = "SHANNON_STREAMING_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(short, long, env = "SHANNON_STREAMING_PORT", default_value = "8080")]
    port: u16,

    /// Log level.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON.
    #[arg(long, env = "SHANNON_STREAMING_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_json);

    tracing::info!(
        "Starting shannon-streaming v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = AppConfig::load()?;

    // The durable engine client is injected by the deployment; the default
    // binary runs streaming and ingest standalone.
    let engine = Arc::new(UnconfiguredEngine);
    tracing::warn!(
        "Running with an unconfigured durable engine: approvals, timelines and \
         schedules will answer 503 until a client is wired in"
    );

    let (app, state) = create_app(
        config,
        EngineHandles {
            engine: Arc::clone(&engine) as _,
            schedule_client: engine,
        },
    )
    .await?;

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Draining subscriptions and persistence");
    if let Err(e) = state.streaming.shutdown(SHUTDOWN_DEADLINE).await {
        tracing::error!(error = %e, "Streaming shutdown incomplete");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install ctrl-c handler");
    }
    tracing::info!("Shutdown signal received");
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
