//! NAT Rendezvous Server
//!
//! Runs the TCP coordination channel and the UDP relay channel that together
//! let clients behind NAT discover each other's public endpoints and exchange
//! messages without port forwarding.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use natpunch::coordinator::{CoordinatorConfig, CoordinatorMetrics, CoordinatorService};
use natpunch::directory::{AdvertisedDirectory, DirectoryConfig, EndpointDirectory};
use natpunch::health::{self, HealthState};
use natpunch::protocol::MAX_PAYLOAD_LEN;
use natpunch::relay::{RelayConfig, RelayMetrics, RelayService};

/// NAT Rendezvous Server
#[derive(Parser, Debug)]
#[command(name = "natpunchd")]
#[command(about = "NAT traversal rendezvous server (TCP coordination + UDP relay)")]
struct Args {
    /// TCP port for the coordination channel
    #[arg(long, default_value_t = 5000, env = "NATPUNCH_COORDINATOR_PORT")]
    coordinator_port: u16,

    /// UDP port for the relay channel
    #[arg(long, default_value_t = 5001, env = "NATPUNCH_RELAY_PORT")]
    relay_port: u16,

    /// Port for health check HTTP endpoint
    #[arg(long, default_value_t = 5002, env = "NATPUNCH_HEALTH_PORT")]
    health_port: u16,

    /// Inactivity TTL for NAT mappings (seconds)
    #[arg(long, default_value_t = 300, env = "NATPUNCH_TTL")]
    ttl: u64,

    /// Interval between expiry sweeps (seconds)
    #[arg(long, default_value_t = 60, env = "NATPUNCH_SWEEP_INTERVAL")]
    sweep_interval: u64,

    /// Maximum concurrent coordinator connections
    #[arg(long, default_value_t = 10000, env = "NATPUNCH_MAX_CONNECTIONS")]
    max_connections: usize,

    /// Largest payload a TCP frame may declare (bytes)
    #[arg(long, default_value_t = MAX_PAYLOAD_LEN, env = "NATPUNCH_MAX_FRAME_BYTES")]
    max_frame_bytes: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting natpunch server");
    tracing::info!(
        coordinator_port = args.coordinator_port,
        relay_port = args.relay_port,
        health_port = args.health_port,
        ttl_secs = args.ttl,
        "Configuration"
    );

    let server_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(%server_id, "Server ID");

    // Shared state: the observed-endpoint directory and the advertised hints
    let directory = Arc::new(EndpointDirectory::new(DirectoryConfig {
        ttl: Duration::from_secs(args.ttl),
        sweep_interval: Duration::from_secs(args.sweep_interval),
    }));
    let advertised = Arc::new(AdvertisedDirectory::new());

    let coordinator_metrics = Arc::new(CoordinatorMetrics::new());
    let relay_metrics = Arc::new(RelayMetrics::new());

    // Bind both channels up front; a bind failure aborts startup
    let coordinator = CoordinatorService::bind(
        CoordinatorConfig {
            listen_port: args.coordinator_port,
            max_frame_payload: args.max_frame_bytes,
            max_connections: args.max_connections,
        },
        Arc::clone(&advertised),
        Arc::clone(&coordinator_metrics),
    )
    .await?;

    let relay = RelayService::bind(
        &RelayConfig {
            listen_port: args.relay_port,
        },
        Arc::clone(&directory),
        Arc::clone(&relay_metrics),
    )
    .await?;

    // Background expiry reaper
    let reaper_handle = Arc::clone(&directory).start_reaper();

    // Shutdown channel shared by every loop
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Health endpoint
    let health_state = Arc::new(HealthState {
        coordinator_metrics: Arc::clone(&coordinator_metrics),
        relay_metrics: Arc::clone(&relay_metrics),
        directory: Arc::clone(&directory),
        start_time: Instant::now(),
        server_id,
    });
    let health_handle = tokio::spawn(health::run_health_server(health_state, args.health_port));

    // Both channels
    let coordinator_shutdown = shutdown_rx.clone();
    let coordinator_handle =
        tokio::spawn(async move { coordinator.run(coordinator_shutdown).await });

    let relay_shutdown = shutdown_rx.clone();
    let relay_handle = tokio::spawn(async move { relay.run(relay_shutdown).await });

    // Wait for shutdown signal
    shutdown_signal().await;

    tracing::info!("Initiating graceful shutdown...");
    let _ = shutdown_tx.send(true);

    // Give the loops a moment to observe the signal and wind down
    let drain_timeout = Duration::from_secs(5);
    tokio::select! {
        _ = tokio::time::sleep(drain_timeout) => {
            tracing::warn!("Drain timeout reached, forcing shutdown");
        }
        _ = async {
            let _ = coordinator_handle.await;
            let _ = relay_handle.await;
        } => {
            tracing::info!("Channels stopped");
        }
    }

    reaper_handle.abort();
    health_handle.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
