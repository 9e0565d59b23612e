//! UDP relay channel
//!
//! A single shared socket serves every client: it observes each sender's
//! post-NAT source address (the authoritative mapping), forwards relay
//! payloads to their addressed target, and primes NAT pinholes on
//! punch-through requests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::directory::EndpointDirectory;
use crate::protocol::{self, Flag, Packet};

/// Largest datagram the receive loop will accept. Anything bigger is
/// truncated by the socket and fails header validation.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// UDP port to bind
    pub listen_port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { listen_port: 5001 }
    }
}

/// Relay traffic counters
#[derive(Debug, Default)]
pub struct RelayMetrics {
    pub datagrams_received: AtomicU64,
    pub relayed: AtomicU64,
    pub unknown_target: AtomicU64,
    pub mapping_updates: AtomicU64,
    pub punch_requests: AtomicU64,
    pub decode_errors: AtomicU64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RelayMetricsSnapshot {
        RelayMetricsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            unknown_target: self.unknown_target.load(Ordering::Relaxed),
            mapping_updates: self.mapping_updates.load(Ordering::Relaxed),
            punch_requests: self.punch_requests.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RelayMetricsSnapshot {
    pub datagrams_received: u64,
    pub relayed: u64,
    pub unknown_target: u64,
    pub mapping_updates: u64,
    pub punch_requests: u64,
    pub decode_errors: u64,
}

/// The relay service: one UDP socket plus the shared endpoint directory
pub struct RelayService {
    socket: UdpSocket,
    directory: Arc<EndpointDirectory>,
    metrics: Arc<RelayMetrics>,
}

impl RelayService {
    /// Bind the relay socket. Failure here is fatal for the service.
    pub async fn bind(
        config: &RelayConfig,
        directory: Arc<EndpointDirectory>,
        metrics: Arc<RelayMetrics>,
    ) -> anyhow::Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!(addr = %socket.local_addr()?, "Relay socket bound");

        Ok(Self {
            socket,
            directory,
            metrics,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive loop. Per-datagram errors never terminate it; only the
    /// shutdown signal does.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Shutdown signal received, stopping relay loop");
                        break;
                    }
                }

                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, src)) => {
                            self.metrics.datagrams_received.fetch_add(1, Ordering::Relaxed);
                            self.handle_datagram(&buf[..len], src).await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Relay receive failed");
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        let packet = match Packet::decode(data) {
            Ok(p) => p,
            Err(e) => {
                self.metrics.decode_errors.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(%src, error = %e, "Dropping undecodable datagram");
                return;
            }
        };

        match packet.flag() {
            Some(Flag::RelayData) => self.forward(&packet, src).await,
            Some(Flag::UdpRegistration) | Some(Flag::Heartbeat) => {
                self.refresh_mapping(&packet, src)
            }
            Some(Flag::PunchThroughRequest) => self.punch_through(&packet, src).await,
            Some(Flag::Registration) => {
                tracing::debug!(%src, "TCP registration flag on relay socket, ignoring");
            }
            None => {
                tracing::debug!(%src, flag = format_args!("0x{:02x}", packet.flag), "Unknown flag");
            }
        }
    }

    /// Forward a `target|message` payload to the target's observed endpoint.
    /// The payload is forwarded verbatim; attribution relies on the outer
    /// datagram's source address, not on rewriting the payload.
    async fn forward(&self, packet: &Packet, src: SocketAddr) {
        let Some((target_id, message)) = protocol::split_pair(&packet.payload) else {
            tracing::debug!(%src, "Malformed relay payload, dropping");
            return;
        };

        let Some(target_ep) = self.directory.lookup(target_id) else {
            self.metrics.unknown_target.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%src, target_id, "Unknown relay target");
            return;
        };

        // rebuilt with the ports swapped: source = observed sender port,
        // destination = target's mapped port
        let out = Packet::new(
            Flag::RelayData,
            src.port() as u32,
            target_ep.port() as u32,
            packet.payload.clone(),
        );

        match self.socket.send_to(&out.encode(), target_ep).await {
            Ok(_) => {
                self.metrics.relayed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%src, %target_ep, target_id, len = message.len(), "Relayed");
            }
            Err(e) => {
                tracing::warn!(%target_ep, error = %e, "Relay send failed");
            }
        }
    }

    /// Bind the sender-declared id to the socket-observed source address.
    /// This is the NAT discovery step: `src` is what the sender's NAT
    /// actually mapped, not whatever private address the client believes
    /// it has.
    fn refresh_mapping(&self, packet: &Packet, src: SocketAddr) {
        let Some(client_id) = protocol::parse_client_id(&packet.payload) else {
            tracing::debug!(%src, "Registration datagram without client id, dropping");
            return;
        };

        self.directory.upsert(client_id, src);
        self.metrics.mapping_updates.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(client_id, %src, "NAT mapping refreshed");
    }

    /// Send a zero-length nudge to the target so its NAT opens a pinhole
    /// toward the requester. The requester's own pinhole is already fresh:
    /// this very request traversed it.
    async fn punch_through(&self, packet: &Packet, src: SocketAddr) {
        let Some(target_id) = protocol::parse_client_id(&packet.payload) else {
            tracing::debug!(%src, "Punch-through request without target id, dropping");
            return;
        };

        let Some(target_ep) = self.directory.lookup(target_id) else {
            tracing::warn!(%src, target_id, "Punch-through target not registered");
            return;
        };

        match self.socket.send_to(&[], target_ep).await {
            Ok(_) => {
                self.metrics.punch_requests.fetch_add(1, Ordering::Relaxed);
                tracing::info!(%src, %target_ep, target_id, "Punch-through nudge sent");
            }
            Err(e) => {
                tracing::warn!(%target_ep, error = %e, "Punch-through send failed");
            }
        }
    }
}
