//! TCP coordination channel
//!
//! One long-lived connection per client. Each connection is a sequential
//! stream of 14-byte-header frames: registrations advertising the client's
//! UDP port, and heartbeats. Registrations land in the advertised-endpoint
//! table; relay routing never reads it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::directory::AdvertisedDirectory;
use crate::protocol::{self, Flag, FrameHeader, HEADER_SIZE, MAX_PAYLOAD_LEN};

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// TCP port to listen on
    pub listen_port: u16,
    /// Largest payload a peer may declare before the connection is dropped
    pub max_frame_payload: usize,
    /// Maximum concurrent client connections
    pub max_connections: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_port: 5000,
            max_frame_payload: MAX_PAYLOAD_LEN,
            max_connections: 10_000,
        }
    }
}

/// Coordination-plane counters
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    pub active_connections: AtomicUsize,
    pub total_connections: AtomicU64,
    pub registrations: AtomicU64,
    pub heartbeats: AtomicU64,
    pub protocol_errors: AtomicU64,
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_started(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_ended(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CoordinatorMetricsSnapshot {
        CoordinatorMetricsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CoordinatorMetricsSnapshot {
    pub active_connections: usize,
    pub total_connections: u64,
    pub registrations: u64,
    pub heartbeats: u64,
    pub protocol_errors: u64,
}

/// The TCP coordination service
pub struct CoordinatorService {
    listener: TcpListener,
    config: CoordinatorConfig,
    advertised: Arc<AdvertisedDirectory>,
    metrics: Arc<CoordinatorMetrics>,
}

impl CoordinatorService {
    /// Bind the listener. Failure here is fatal for the service.
    pub async fn bind(
        config: CoordinatorConfig,
        advertised: Arc<AdvertisedDirectory>,
        metrics: Arc<CoordinatorMetrics>,
    ) -> anyhow::Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "Coordinator listening");

        Ok(Self {
            listener,
            config,
            advertised,
            metrics,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Spawns one handler task per connection; stops on the
    /// shutdown signal, which also cancels live handlers.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Shutdown signal received, stopping accept loop");
                        break;
                    }
                }

                accept = self.listener.accept() => {
                    match accept {
                        Ok((stream, peer_addr)) => {
                            let active = self.metrics.active_connections.load(Ordering::Relaxed);
                            if active >= self.config.max_connections {
                                tracing::warn!(active, max = self.config.max_connections, "Connection limit reached");
                                drop(stream);
                                continue;
                            }

                            let advertised = Arc::clone(&self.advertised);
                            let metrics = Arc::clone(&self.metrics);
                            let config = self.config.clone();
                            let shutdown = shutdown_rx.clone();

                            tokio::spawn(async move {
                                metrics.connection_started();

                                if let Err(e) =
                                    handle_connection(stream, peer_addr, &config, &advertised, &metrics, shutdown).await
                                {
                                    tracing::debug!(%peer_addr, error = %e, "Connection error");
                                }

                                metrics.connection_ended();
                                tracing::debug!(%peer_addr, "Connection closed");
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Accept failed");
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Service one client connection until it disconnects, misbehaves, or
/// shutdown is signaled.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    config: &CoordinatorConfig,
    advertised: &AdvertisedDirectory,
    metrics: &CoordinatorMetrics,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::debug!(%peer_addr, "New coordinator connection");

    let mut header_buf = [0u8; HEADER_SIZE];

    loop {
        // read_exact blocks until a whole header is buffered; frames split
        // across TCP segments are reassembled here, not treated as errors
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return Ok(());
                }
            }

            read = stream.read_exact(&mut header_buf) => {
                match read {
                    Ok(_) => {}
                    // clean disconnect between frames
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                    Err(e) => return Err(e.into()),
                }

                let header = match FrameHeader::decode(&header_buf) {
                    Ok(h) => h,
                    Err(e) => {
                        metrics.protocol_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(%peer_addr, error = %e, "Closing connection");
                        return Ok(());
                    }
                };

                let declared = header.payload_len as usize;
                if declared > config.max_frame_payload {
                    metrics.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(%peer_addr, declared, "Oversized frame declared, closing connection");
                    return Ok(());
                }

                let mut payload = vec![0u8; declared];
                stream.read_exact(&mut payload).await?;

                dispatch_frame(&header, &payload, peer_addr, advertised, metrics);
            }
        }
    }
}

fn dispatch_frame(
    header: &FrameHeader,
    payload: &[u8],
    peer_addr: SocketAddr,
    advertised: &AdvertisedDirectory,
    metrics: &CoordinatorMetrics,
) {
    match Flag::from_u8(header.flag) {
        Some(Flag::Registration) => {
            let Some((client_id, udp_port)) = protocol::parse_registration(payload) else {
                tracing::debug!(%peer_addr, "Malformed registration payload, dropping frame");
                return;
            };

            // IP from the TCP peer, port from the payload
            let endpoint = SocketAddr::new(peer_addr.ip(), udp_port);
            advertised.record(&client_id, endpoint);
            metrics.registrations.fetch_add(1, Ordering::Relaxed);
            tracing::info!(client_id, %endpoint, "Client registered advertised endpoint");
        }

        Some(Flag::Heartbeat) => {
            let Some(client_id) = protocol::parse_client_id(payload) else {
                tracing::debug!(%peer_addr, "Heartbeat without client id, dropping frame");
                return;
            };

            metrics.heartbeats.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(client_id, %peer_addr, "Heartbeat");
        }

        _ => {
            tracing::debug!(
                %peer_addr,
                flag = format_args!("0x{:02x}", header.flag),
                "Unknown command on coordinator channel, ignoring"
            );
        }
    }
}
