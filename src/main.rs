//! Egress - Entry Point
//!
//! Builds the egress pool, keeps it maintained, and shuts it down cleanly on
//! Ctrl+C or SIGTERM.

use anyhow::Context;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use egress::config::LogConfig;
use egress::{Config, ProxyManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("failed to load configuration")?;

    init_tracing(&config.log);
    info!("Starting egress pool");
    info!(
        paid_upstreams = config.paid.upstreams.len(),
        forwarders = config.paid.forwarder_count,
        free_sources = config.free.sources.len(),
        "Configuration loaded"
    );

    let manager = ProxyManager::new(config).context("failed to build egress pool")?;
    manager.init().await.context("failed to initialize egress pool")?;

    match serde_json::to_string(&manager.snapshot()) {
        Ok(snapshot) => info!(%snapshot, "Egress pool ready"),
        Err(e) => error!("Cannot serialize pool snapshot: {}", e),
    }

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    manager.shutdown().await;
    info!("Egress pool stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("egress={}", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
