//! relayfleet Orchestrator Daemon
//!
//! Drives the tunnel containers on backend hosts and forwards the public
//! listen ports of this machine to them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rf_core::config::{self, OrchestratorConfig};
use rf_orchestrator::ipc::IpcServer;
use rf_orchestrator::remote::SshConnector;
use rf_orchestrator::store::FileStore;
use rf_orchestrator::OrchestratorState;

#[derive(Parser)]
#[command(name = "rf-orchestrator")]
#[command(about = "relayfleet orchestrator daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// IPC port on localhost (overrides config)
    #[arg(long, env = "RF_IPC_PORT")]
    ipc: Option<u16>,

    /// Endpoint store file (overrides config)
    #[arg(long)]
    store: Option<PathBuf>,

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

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("relayfleet Orchestrator starting...");

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                OrchestratorConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            OrchestratorConfig::default()
        }
    };

    if let Some(port) = args.ipc {
        config.ipc_port = port;
    }
    if let Some(store) = args.store {
        config.store_path = store;
    }

    let store = FileStore::open(&config.store_path)
        .await
        .with_context(|| format!("Failed to open endpoint store {:?}", config.store_path))?;
    tracing::info!("Endpoint store: {:?}", store.path());

    let cancel = CancellationToken::new();
    let ipc_address = config.ipc_address();
    let state = Arc::new(OrchestratorState::new(
        config,
        Arc::new(store),
        Arc::new(SshConnector::default()),
        cancel.clone(),
    ));

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
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

        cancel_clone.cancel();
    });

    let loaded = state
        .start()
        .await
        .context("Failed to restore endpoints from the store")?;
    tracing::info!("Restored {} endpoints", loaded);

    let server = IpcServer::bind(&ipc_address, Arc::clone(&state)).await?;
    let result = server.run().await;

    state.shutdown().await;
    tracing::info!("Orchestrator shutdown complete");
    result
}
