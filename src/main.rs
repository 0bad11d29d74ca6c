use clap::{Parser, ValueEnum};
use futures::FutureExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::http::{admin, check_router, HttpServer, RateLimit};
use tollgate::ratelimit::AdmissionEngine;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Sliding-window admission control service.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the check service address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Override the admin service address
    #[arg(long)]
    admin_addr: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting Tollgate admission control service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(addr) = args.admin_addr {
        config.server.admin_addr = addr;
    }
    info!(
        http_addr = %config.server.http_addr,
        admin_addr = %config.server.admin_addr,
        "Configuration loaded"
    );

    let limits = &config.rate_limiting;
    let store = limits.store.connect().await?;
    let policies = Arc::new(limits.policy_registry()?);
    info!(policies = policies.list().len(), "Policy registry initialized");

    let engine = AdmissionEngine::new(store, policies).with_reaper(limits.reaper()?);
    let sweeper = limits
        .sweep_interval()
        .map(|interval| engine.spawn_sweeper(interval));

    let resolver = Arc::new(limits.identifier_resolver()?);
    let check_server = HttpServer::bind(
        "check",
        config.server.http_addr,
        check_router(RateLimit::tiered(engine.clone(), resolver)),
    )
    .await?;
    let admin_server =
        HttpServer::bind("admin", config.server.admin_addr, admin::router(engine)).await?;

    let shutdown = shutdown_signal().shared();
    tokio::try_join!(
        check_server.serve_with_shutdown(shutdown.clone()),
        admin_server.serve_with_shutdown(shutdown),
    )?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    info!("Tollgate admission control service stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
