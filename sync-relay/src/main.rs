//! sync-relay binary entry point.
//!
//! Usage:
//! ```bash
//! sync-relay --config relay.toml
//! sync-relay --help
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use syncstuff_relay::http::{build_router, health};
use syncstuff_relay::maintenance::spawn_maintenance_task;
use syncstuff_relay::protocol::serve;
use syncstuff_relay::{Config, SignalRelay};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Store-nothing signaling relay for syncstuff.
#[derive(Parser, Debug)]
#[command(name = "sync-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the signaling bind address
    #[arg(long)]
    bind: Option<String>,

    /// Enable verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info".into()),
        1 => tracing_subscriber::EnvFilter::new("debug"),
        _ => tracing_subscriber::EnvFilter::new("trace"),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path.display());
            Config::from_file(path)?
        }
        None => {
            tracing::info!("Using default configuration");
            Config::default()
        }
    };
    if let Some(bind) = cli.bind {
        config.server.bind_address = bind;
    }
    config.validate()?;

    health::init_start_time();
    let relay = Arc::new(SignalRelay::new(config.clone()));
    let shutdown = CancellationToken::new();

    let listener = TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_address))?;

    if config.http.enabled {
        let http_listener = TcpListener::bind(&config.http.bind_address)
            .await
            .with_context(|| format!("failed to bind {}", config.http.bind_address))?;
        tracing::info!("HTTP endpoints on {}", config.http.bind_address);

        let router = build_router(relay.clone());
        let token = shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(http_listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    let maintenance =
        spawn_maintenance_task(relay.clone(), config.maintenance.clone(), shutdown.clone());

    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown requested");
                token.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    serve(listener, relay.clone(), shutdown.clone()).await?;

    let _ = maintenance.await;
    relay.clear();
    tracing::info!("sync-relay stopped");
    Ok(())
}
