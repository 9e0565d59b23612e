//! Peer-side agent
//!
//! Drives both server channels through the connect -> register -> keepalive
//! -> relay lifecycle:
//!
//! 1. TCP-connect to the coordinator and advertise the local UDP port.
//! 2. UDP-register against the relay so it learns this peer's post-NAT
//!    source address.
//! 3. Keep that mapping alive with periodic re-registration, and exchange
//!    relay-framed payloads with other clients by id.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;

use crate::protocol::{self, Flag, Packet};

/// Buffered incoming relay messages before the caller must drain them
const INBOX_CAPACITY: usize = 64;

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// This peer's identifier in the endpoint directory
    pub client_id: String,
    /// Rendezvous server address
    pub server_ip: IpAddr,
    /// Coordinator TCP port
    pub coordinator_port: u16,
    /// Relay UDP port
    pub relay_port: u16,
    /// How often to re-register the NAT mapping. Must stay comfortably
    /// under the server-side TTL or the mapping can expire between
    /// refreshes; TTL/2 by default.
    pub keepalive_interval: Duration,
}

impl AgentConfig {
    pub fn new(client_id: impl Into<String>, server_ip: IpAddr) -> Self {
        Self {
            client_id: client_id.into(),
            server_ip,
            coordinator_port: 5000,
            relay_port: 5001,
            keepalive_interval: Duration::from_secs(150),
        }
    }
}

/// Lifecycle states, in order of progression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    TcpConnected,
    TcpRegistered,
    UdpRegistered,
    Active,
}

/// One message delivered through the relay.
///
/// `sender_id` is the first pipe-delimited field of the payload. The relay
/// forwards payloads verbatim, so this is the id the frame was addressed
/// with; attribution beyond that relies on out-of-band agreement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub sender_id: String,
    pub content: String,
}

/// The peer-side NAT traversal agent
pub struct ClientAgent {
    config: AgentConfig,
    state: AgentState,
    udp: Arc<UdpSocket>,
    tcp: TcpStream,
    relay_addr: SocketAddr,
    local_udp_port: u16,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ClientAgent {
    /// Open the UDP socket on an ephemeral port and the TCP coordination
    /// connection. The agent is `TcpConnected` on return.
    pub async fn connect(config: AgentConfig) -> anyhow::Result<Self> {
        let udp = UdpSocket::bind((IpAddr::from([0, 0, 0, 0]), 0))
            .await
            .context("binding local UDP socket")?;
        let local_udp_port = udp.local_addr()?.port();

        let coordinator_addr = SocketAddr::new(config.server_ip, config.coordinator_port);
        let tcp = TcpStream::connect(coordinator_addr)
            .await
            .with_context(|| format!("connecting to coordinator at {coordinator_addr}"))?;

        let relay_addr = SocketAddr::new(config.server_ip, config.relay_port);
        tracing::info!(
            client_id = %config.client_id,
            %coordinator_addr,
            %relay_addr,
            local_udp_port,
            "Connected to rendezvous server"
        );

        Ok(Self {
            config,
            state: AgentState::TcpConnected,
            udp: Arc::new(udp),
            tcp,
            relay_addr,
            local_udp_port,
            tasks: Vec::new(),
        })
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn local_udp_port(&self) -> u16 {
        self.local_udp_port
    }

    /// Advertise `clientId|localUdpPort` to the coordinator. Fire-and-forget:
    /// the protocol sends no acknowledgment.
    pub async fn register_tcp(&mut self) -> anyhow::Result<()> {
        let payload = format!("{}|{}", self.config.client_id, self.local_udp_port);
        let packet = Packet::new(
            Flag::Registration,
            self.local_udp_port as u32,
            self.config.coordinator_port as u32,
            payload.into_bytes(),
        );

        self.tcp
            .write_all(&packet.encode())
            .await
            .context("sending TCP registration")?;

        self.state = AgentState::TcpRegistered;
        tracing::debug!(client_id = %self.config.client_id, "TCP registration sent");
        Ok(())
    }

    /// Register this peer's id against the relay so it records the
    /// NAT-observed source address.
    pub async fn register_udp(&mut self) -> anyhow::Result<()> {
        send_udp_registration(&self.udp, &self.config.client_id, self.relay_addr, self.local_udp_port)
            .await
            .context("sending UDP registration")?;

        self.state = AgentState::UdpRegistered;
        tracing::debug!(client_id = %self.config.client_id, "UDP registration sent");
        Ok(())
    }

    /// Spawn the receive loop and the keepalive timer; returns the channel
    /// on which incoming relay messages are delivered. The agent is
    /// `Active` on return.
    pub fn start(&mut self) -> mpsc::Receiver<RelayMessage> {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);

        let socket = Arc::clone(&self.udp);
        let client_id = self.config.client_id.clone();
        self.tasks.push(tokio::spawn(async move {
            receive_loop(socket, client_id, inbox_tx).await;
        }));

        let socket = Arc::clone(&self.udp);
        let client_id = self.config.client_id.clone();
        let relay_addr = self.relay_addr;
        let local_udp_port = self.local_udp_port;
        let interval = self.config.keepalive_interval;
        self.tasks.push(tokio::spawn(async move {
            keepalive_loop(socket, client_id, relay_addr, local_udp_port, interval).await;
        }));

        self.state = AgentState::Active;
        inbox_rx
    }

    /// Send `remoteId|message` through the relay. Best-effort; no delivery
    /// confirmation exists in the protocol.
    pub async fn send_relay(&self, remote_id: &str, message: &str) -> anyhow::Result<()> {
        let payload = format!("{remote_id}|{message}");
        let packet = Packet::new(
            Flag::RelayData,
            self.local_udp_port as u32,
            self.relay_addr.port() as u32,
            payload.into_bytes(),
        );

        self.udp
            .send_to(&packet.encode(), self.relay_addr)
            .await
            .context("sending relay data")?;

        tracing::debug!(remote_id, len = message.len(), "Relay data sent");
        Ok(())
    }

    /// Stop the background tasks and drop back to `Disconnected`.
    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.state = AgentState::Disconnected;
    }
}

impl Drop for ClientAgent {
    fn drop(&mut self) {
        self.close();
    }
}

async fn send_udp_registration(
    socket: &UdpSocket,
    client_id: &str,
    relay_addr: SocketAddr,
    local_udp_port: u16,
) -> std::io::Result<()> {
    let packet = Packet::new(
        Flag::UdpRegistration,
        local_udp_port as u32,
        relay_addr.port() as u32,
        client_id.as_bytes().to_vec(),
    );
    socket.send_to(&packet.encode(), relay_addr).await?;
    Ok(())
}

/// Drain incoming datagrams: relay payloads go to the inbox, punch nudges
/// and anything else is logged and dropped. Transport errors are logged and
/// the loop keeps going.
async fn receive_loop(
    socket: Arc<UdpSocket>,
    client_id: String,
    inbox_tx: mpsc::Sender<RelayMessage>,
) {
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(%client_id, error = %e, "UDP receive failed");
                // back off so a persistently failing socket cannot spin
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        // zero-length datagrams are hole-punch nudges
        if len == 0 {
            tracing::debug!(%client_id, %src, "Punch-through nudge received");
            continue;
        }

        let packet = match Packet::decode(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(%client_id, %src, error = %e, "Dropping undecodable datagram");
                continue;
            }
        };

        match packet.flag() {
            Some(Flag::RelayData) => {
                let Some((sender_id, content)) = protocol::split_pair(&packet.payload) else {
                    tracing::debug!(%client_id, %src, "Malformed relay payload");
                    continue;
                };

                let message = RelayMessage {
                    sender_id: sender_id.to_string(),
                    content: content.to_string(),
                };

                if inbox_tx.send(message).await.is_err() {
                    tracing::debug!(%client_id, "Inbox closed, stopping receive loop");
                    return;
                }
            }
            other => {
                tracing::debug!(%client_id, %src, flag = ?other, "Ignoring non-relay datagram");
            }
        }
    }
}

/// Re-register on a fixed interval so the server-side mapping never ages
/// out. Send failures are logged; the next tick retries.
async fn keepalive_loop(
    socket: Arc<UdpSocket>,
    client_id: String,
    relay_addr: SocketAddr,
    local_udp_port: u16,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match send_udp_registration(&socket, &client_id, relay_addr, local_udp_port).await {
            Ok(()) => tracing::debug!(%client_id, "Keepalive sent"),
            Err(e) => tracing::warn!(%client_id, error = %e, "Keepalive send failed"),
        }
    }
}
