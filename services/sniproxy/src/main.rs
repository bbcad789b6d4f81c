//! sniproxy
//!
//! TLS passthrough proxy with SNI routing.
//!
//! This service:
//! - Accepts TCP connections on one listener
//! - Reads the TLS ClientHello and extracts the SNI hostname
//! - Routes allowed hostnames to their configured backend
//! - Forwards bytes untouched in both directions

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sniproxy::{Listener, LogFormat, ProxyConfig, Settings};

fn main() -> Result<()> {
    let settings = Settings::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to SNIPROXY_LOG_LEVEL)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| settings.log_level.clone().into());
    match settings.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    let config = settings
        .proxy_config()
        .context("Invalid configuration")?;

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = settings.workers {
        runtime.worker_threads(workers);
    }
    let runtime = runtime
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: ProxyConfig) -> Result<()> {
    info!("Starting sniproxy");
    if config.routes.is_allow_all() {
        info!("Routing every SNI hostname to itself on port 443");
    } else {
        let remotes: Vec<String> = config.routes.targets().iter().map(ToString::to_string).collect();
        info!(remotes = ?remotes, "Remote hosts configured");
    }

    let bind_addr = config.listener.bind_addr;
    let listener = match Listener::bind(
        config.listener,
        Arc::new(config.routes),
        config.session,
    )
    .await
    {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(bind_addr = %bind_addr, error = %e, "Failed to bind listener");
            return Err(e.into());
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(Arc::clone(&listener).run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Listener error"),
        Err(e) => error!(error = %e, "Listener task failed"),
    }

    let stats = listener.stats().snapshot();
    info!(
        connections_accepted = stats.connections_accepted,
        connections_rejected = stats.connections_rejected,
        sni_found = stats.sni_found,
        sni_failed = stats.sni_failed,
        routes_matched = stats.routes_matched,
        routes_rejected = stats.routes_rejected,
        backend_connected = stats.backend_connected,
        backend_failed = stats.backend_failed,
        bytes_to_backend = stats.bytes_to_backend,
        bytes_from_backend = stats.bytes_from_backend,
        "Final statistics"
    );

    Ok(())
}
