#![forbid(unsafe_code)]

//! **hive-scheduler** – Scheduler service binary.
//!
//! Runs the single-instance cron evaluation loop against the shared state
//! and coordination stores, and serves a small health endpoint. The control
//! plane API may be replicated; this process MUST NOT be.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde::Serialize;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hive_coord::{CoordStore, MemoryCoord, RedisCoord};
use hive_gateway::{AgentClient, HttpAgentClient};
use hive_ledger::ActivityLedger;
use hive_queue::ExecutionQueue;
use hive_scheduler::{Scheduler, SchedulerConfig};
use hive_store::StateStore;

#[derive(Parser)]
#[command(name = "hive-scheduler")]
#[command(about = "hive scheduler - single-instance cron dispatch for the agent fleet")]
#[command(version)]
struct Cli {
    /// SQLite database path shared with the API service
    #[arg(long, env = "HIVE_DB_PATH", default_value = "data/hive.db")]
    db_path: String,

    /// Coordination backend (redis, memory)
    #[arg(long, default_value = "redis")]
    coord: String,

    /// Redis URL for the coordination store
    #[arg(long, env = "HIVE_REDIS_URL", default_value = "redis://127.0.0.1/")]
    redis_url: String,

    /// Sandbox HTTP port agents listen on
    #[arg(long, env = "HIVE_SANDBOX_PORT", default_value = "8700")]
    sandbox_port: u16,

    /// Health endpoint port
    #[arg(long, default_value = "8091")]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    info!("Starting hive scheduler v{}", env!("CARGO_PKG_VERSION"));

    let store = StateStore::open(&cli.db_path)
        .await
        .with_context(|| format!("failed to open state store at {}", cli.db_path))?;
    let coord = build_coord(&cli.coord, &cli.redis_url).await?;
    let queue = ExecutionQueue::new(coord.clone());
    let ledger = ActivityLedger::new(store.clone(), coord.clone());
    let client: Arc<dyn AgentClient> = Arc::new(HttpAgentClient::new(cli.sandbox_port)?);

    let scheduler = Scheduler::new(
        store,
        coord,
        queue,
        ledger,
        client,
        SchedulerConfig::default(),
    );

    let app = Router::new().route("/health", get(health));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", cli.port))
        .await
        .with_context(|| format!("failed to bind to port {}", cli.port))?;
    info!("health endpoint on port {}", cli.port);

    tokio::select! {
        _ = scheduler.run() => {
            error!("scheduler loop exited unexpectedly");
        }
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!("health server error: {e}");
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("hive scheduler stopped");
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy", version: env!("CARGO_PKG_VERSION") })
}

fn init_logging(log_level: &str) {
    let filter = format!("hive_scheduler={log_level},hive_ledger={log_level},hive_queue={log_level}");
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn build_coord(kind: &str, redis_url: &str) -> Result<Arc<dyn CoordStore>> {
    match kind {
        "redis" => {
            let coord = RedisCoord::connect(redis_url)
                .await
                .with_context(|| format!("failed to connect to redis at {redis_url}"))?;
            Ok(Arc::new(coord))
        }
        "memory" => Ok(Arc::new(MemoryCoord::new())),
        other => anyhow::bail!("unsupported coordination backend: {other}"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
