//! tracegate-daemon - deterministic transaction gate daemon.
//!
//! Serves the gate HTTP API over a persistent store, journal, and policy.
//! Configuration comes from `GATE_POLICY` / `GATE_DATA_DIR` with CLI
//! overrides taking precedence.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tracegate_core::clock::SystemClock;
use tracegate_daemon::config::GateConfig;
use tracegate_daemon::http::{AppState, router};
use tracegate_daemon::orchestrator::GateOrchestrator;

/// tracegate - deterministic transaction gate
#[derive(Parser, Debug)]
#[command(name = "tracegate-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the policy file or directory (overrides GATE_POLICY)
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Persistence root (overrides GATE_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Listen address for the HTTP API
    #[arg(long, default_value = "127.0.0.1:8088")]
    listen: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GateConfig::resolve(args.policy, args.data_dir)
        .context("failed to resolve gate configuration")?;
    info!(
        data_dir = %config.data_dir.display(),
        policy_version = %config.policy.version,
        rollback_rules = config.rules.rules().len(),
        "gate configuration loaded"
    );

    let orchestrator = GateOrchestrator::new(
        &config.data_dir,
        config.policy,
        Arc::new(config.rules),
        Arc::new(SystemClock),
    )
    .context("failed to open gate orchestrator")?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(serve(args.listen, Arc::new(orchestrator)))
}

async fn serve(listen: SocketAddr, orchestrator: Arc<GateOrchestrator>) -> Result<()> {
    let app = router(AppState::new(orchestrator));
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(addr = %listen, "gate API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
    info!("shutdown signal received");
}
