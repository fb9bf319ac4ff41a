//! scaled — the scalegrid daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb): rules + event log
//! - Instance pool with drain reaper
//! - Scaling engine with its periodic evaluation loop
//! - Load balancer
//! - Readiness driver (stands in for the external health-check signal)
//! - REST API
//!
//! # Usage
//!
//! ```text
//! scaled --port 8080 --data-dir /var/lib/scalegrid
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use scalegrid_balancer::LoadBalancer;
use scalegrid_cost::CostEstimator;
use scalegrid_engine::{GaugeMetrics, ScalingEngine};
use scalegrid_pool::{InstancePool, PoolConfig};
use scalegrid_state::{InstanceStatus, StateStore};

#[derive(Parser)]
#[command(name = "scaled", about = "scalegrid autoscaling daemon")]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Data directory for persistent state.
    #[arg(long, default_value = "/var/lib/scalegrid")]
    data_dir: PathBuf,

    /// Evaluation sweep interval in seconds.
    #[arg(long, default_value = "30")]
    evaluate_interval: u64,

    /// Drain-reaper sweep interval in seconds.
    #[arg(long, default_value = "5")]
    reap_interval: u64,

    /// Readiness-driver interval in seconds.
    #[arg(long, default_value = "2")]
    readiness_interval: u64,

    /// Drain window in seconds before a draining instance is force-stopped.
    #[arg(long, default_value = "30")]
    drain_window: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,scaled=debug,scalegrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    info!("scalegrid daemon starting");

    std::fs::create_dir_all(&cli.data_dir)?;
    let db_path = cli.data_dir.join("scalegrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let pool = Arc::new(InstancePool::new(PoolConfig {
        drain_window: Duration::from_secs(cli.drain_window),
        ..PoolConfig::default()
    }));

    // Gauges are fed by the external telemetry collaborator; until it
    // reports, deployments read as idle.
    let gauges = Arc::new(GaugeMetrics::new());

    let engine = Arc::new(ScalingEngine::new(
        store.clone(),
        pool.clone(),
        gauges.clone(),
    ));
    info!(interval = cli.evaluate_interval, "scaling engine initialized");

    let balancer = Arc::new(LoadBalancer::new(pool.clone()));
    let estimator = CostEstimator::new(store.clone());

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_shutdown = shutdown_rx.clone();
    let reaper_shutdown = shutdown_rx.clone();
    let readiness_shutdown = shutdown_rx.clone();

    // ── Start background tasks ─────────────────────────────────

    let engine_handle = {
        let engine = engine.clone();
        let interval = Duration::from_secs(cli.evaluate_interval);
        tokio::spawn(async move {
            engine.run(interval, engine_shutdown).await;
        })
    };

    let reaper_handle = {
        let pool = pool.clone();
        let interval = Duration::from_secs(cli.reap_interval);
        tokio::spawn(async move {
            pool.run_reaper(interval, reaper_shutdown).await;
        })
    };

    let readiness_handle = {
        let pool = pool.clone();
        let interval = Duration::from_secs(cli.readiness_interval);
        tokio::spawn(async move {
            run_readiness(pool, interval, readiness_shutdown).await;
        })
    };

    // ── Start API server ───────────────────────────────────────

    let router = scalegrid_api::build_router(scalegrid_api::ApiState {
        store,
        pool,
        engine,
        balancer,
        estimator,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));

    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    let _ = engine_handle.await;
    let _ = reaper_handle.await;
    let _ = readiness_handle.await;

    info!("scalegrid daemon stopped");
    Ok(())
}

/// Readiness driver — stands in for the external health-check signal in
/// standalone mode by promoting `starting` instances to `running` on the
/// next sweep.
async fn run_readiness(
    pool: Arc<InstancePool>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "readiness driver started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                for deployment_id in pool.deployment_ids().await {
                    for instance in pool.list(&deployment_id).await {
                        if instance.status == InstanceStatus::Starting {
                            let _ = pool.mark_ready(&deployment_id, &instance.id).await;
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("readiness driver shutting down");
                break;
            }
        }
    }
}
