#![forbid(unsafe_code)]

//! **hive-api** – Orchestrator API service binary.
//!
//! Wires the store, coordination store, container driver, lifecycle manager,
//! queue, ledger, and gateway together, reconciles the fleet at startup, and
//! serves the HTTP surface. May be replicated; the scheduler process must
//! not be.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hive_api::{router, AppState};
use hive_auth::StoreKeyResolver;
use hive_container::{ContainerDriver, DockerDriver};
use hive_coord::{CoordStore, MemoryCoord, RedisCoord};
use hive_gateway::{AgentClient, HttpAgentClient, RpcGateway};
use hive_ledger::ActivityLedger;
use hive_lifecycle::{LifecycleConfig, LifecycleManager};
use hive_queue::ExecutionQueue;
use hive_scheduler::{Scheduler, SchedulerConfig};
use hive_store::StateStore;

#[derive(Parser)]
#[command(name = "hive-api")]
#[command(about = "hive orchestrator API - lifecycle, execution, and scheduling for agent fleets")]
#[command(version)]
struct Cli {
    /// SQLite database path
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

    /// Platform LLM API key injected into platform-mode sandboxes
    #[arg(long, env = "HIVE_PLATFORM_API_KEY")]
    platform_api_key: Option<String>,

    /// Keep history rows when agents are deleted
    #[arg(long, env = "HIVE_COMPLIANCE_RETENTION")]
    compliance_retention: bool,

    /// Admin account created on first boot
    #[arg(long, env = "HIVE_ADMIN_EMAIL", default_value = "admin@hive.local")]
    admin_email: String,

    /// HTTP listen port
    #[arg(long, default_value = "8090")]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    info!("Starting hive API v{}", env!("CARGO_PKG_VERSION"));

    let store = StateStore::open(&cli.db_path)
        .await
        .with_context(|| format!("failed to open state store at {}", cli.db_path))?;
    let coord = build_coord(&cli.coord, &cli.redis_url).await?;
    let driver: Arc<dyn ContainerDriver> =
        Arc::new(DockerDriver::connect().context("failed to connect to the container engine")?);
    let client: Arc<dyn AgentClient> = Arc::new(HttpAgentClient::new(cli.sandbox_port)?);

    let queue = ExecutionQueue::new(coord.clone());
    let ledger = ActivityLedger::new(store.clone(), coord.clone());
    let lifecycle = LifecycleManager::new(
        driver,
        store.clone(),
        coord.clone(),
        client.clone(),
        LifecycleConfig {
            platform_api_key: cli.platform_api_key.clone(),
            compliance_retention: cli.compliance_retention,
            ..LifecycleConfig::default()
        },
    );
    let gateway = RpcGateway::new(store.clone(), queue.clone(), ledger.clone(), client.clone());
    let scheduler = Scheduler::new(
        store.clone(),
        coord.clone(),
        queue.clone(),
        ledger.clone(),
        client,
        SchedulerConfig::default(),
    );

    bootstrap(&store, &cli.admin_email).await?;

    // Make the fleet picture consistent before serving traffic.
    match lifecycle.reconcile().await {
        Ok(report) => info!(
            orphans = report.orphans.len(),
            stopped = report.stopped.len(),
            "startup reconciliation complete"
        ),
        Err(e) => warn!("startup reconciliation failed: {e}"),
    }

    let state = AppState {
        resolver: Arc::new(StoreKeyResolver::new(store.clone())),
        store,
        coord,
        queue,
        ledger,
        lifecycle,
        gateway,
        scheduler,
    };

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", cli.port))
        .await
        .with_context(|| format!("failed to bind to port {}", cli.port))?;
    info!("listening on port {}", cli.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("hive API stopped");
    Ok(())
}

/// First-boot provisioning: the admin user with a user-scoped key, and the
/// designated system agent with the single system-scoped key. The clear keys
/// are logged exactly once; afterwards only digests exist.
async fn bootstrap(store: &StateStore, admin_email: &str) -> Result<()> {
    if store.user_by_email(admin_email).await?.is_none() {
        let admin = store.create_user(admin_email, true).await?;
        let key = hive_auth::issue_user_key(store, admin.id).await?;
        info!(email = admin_email, "created admin user; api key: {}", key.clear);

        if store.system_agent().await?.is_none() {
            let name = hive_types::AgentName::sanitize("steward")?;
            store
                .create_agent(
                    &name,
                    admin.id,
                    "default",
                    hive_types::RuntimeKind::SandboxedLlm,
                    true,
                    &hive_types::AgentConfig::default(),
                    &[],
                )
                .await?;
            let system_key = hive_auth::issue_system_key(store, &name).await?;
            info!(agent = %name, "created system agent; system key: {}", system_key.clear);
        }
    }
    Ok(())
}

fn init_logging(log_level: &str) {
    let filter = format!(
        "hive_api={log_level},hive_lifecycle={log_level},hive_gateway={log_level},\
         hive_queue={log_level},hive_ledger={log_level},tower_http=warn"
    );
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
        "memory" => {
            warn!("memory coordination store selected; replicas will not share state");
            Ok(Arc::new(MemoryCoord::new()))
        }
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
