//! Rondo - Entry Point
//!
//! Runs the rotation engine standalone as a pool-maintainer daemon with
//! graceful shutdown support.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod client;
mod config;
mod engine;
mod error;
mod mint;
mod models;

use config::Config;
use engine::{EngineEvent, RotationEngine};
use mint::HttpMinter;

#[tokio::main]
async fn main() -> error::Result<()> {
    // Load configuration first so the log format honors LOG_FORMAT.
    let config = Config::from_env()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rondo={}", config.log.level).into());
    if config.log.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Rondo");
    info!(
        paths = config.paths.len(),
        pool_target = config.pool.target_size,
        workers = config.factory.worker_count,
        "Configuration loaded"
    );

    let drain_timeout = config.drain_timeout;
    let minter = Arc::new(HttpMinter::new(&config.upstream));
    let engine = RotationEngine::new(config, minter)?;

    // Forward engine events into the log stream.
    let mut events = engine.subscribe_events();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    info!(missed, "Event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    engine.shutdown(drain_timeout).await;
    event_task.abort();

    info!("Rondo stopped");
    Ok(())
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::MintFailed { path_id, error: e } => {
            error!(path = %path_id, "Mint failed: {}", e);
        }
        EngineEvent::PathStatusChanged {
            path_id,
            address,
            status,
            health,
        } => {
            info!(path = %path_id, address = %address, status = %status, health, "Path status changed");
        }
        other => match serde_json::to_string(other) {
            Ok(json) => info!(event = %json, "Engine event"),
            Err(_) => {}
        },
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
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
