//! deskgate broker daemon
//!
//! Serves the connection API and brokers remote desktop sessions through
//! the remote-access gateway.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dg_broker::{api, DaemonState};
use dg_core::config::{self, BrokerConfig};

#[derive(Parser)]
#[command(name = "dg-broker")]
#[command(about = "deskgate connection broker daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "DESKGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("deskgate broker starting...");

    let config: BrokerConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                BrokerConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            BrokerConfig::default()
        }
    };
    config.validate().context("Invalid configuration")?;

    let bind_addr = args.bind.unwrap_or_else(|| config.bind_address.clone());

    let state = Arc::new(
        DaemonState::from_config(config).context("Failed to set up gateway client")?,
    );
    tracing::info!(
        "Gateway at {} ({} machines registered)",
        state.config.gateway.base_url,
        state.config.machines.len()
    );

    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        cancel_clone.cancel();
    });

    let sync_task = tokio::spawn(state.synchronizer().run(cancel.clone()));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!("Listening on {}", bind_addr);

    let shutdown = cancel.clone();
    axum::serve(listener, api::router(Arc::clone(&state)))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    // Server may also stop on its own; make sure background tasks follow
    cancel.cancel();
    state.broker.shutdown().await;
    if let Err(e) = sync_task.await {
        tracing::warn!("Status synchronizer ended abnormally: {}", e);
    }

    tracing::info!("deskgate broker shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
