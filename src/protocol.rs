//! Wire protocol definitions for the NAT rendezvous service
//!
//! Binary frame format (big-endian), 14-byte header followed by the payload:
//!
//!   - flag: u8 (command type)
//!   - version: u8 (must equal PROTOCOL_VERSION)
//!   - src_port: u32 (advisory, not used for routing)
//!   - dest_port: u32 (advisory, not used for routing)
//!   - payload_len: u32 (number of payload bytes that follow)
//!
//! Payloads are UTF-8 text, pipe-delimited where two fields are carried:
//!
//!   Registration:        `clientId|udpPort`
//!   UdpRegistration:     `clientId`
//!   Heartbeat:           `clientId`
//!   RelayData:           `targetOrSenderId|messageContent`
//!   PunchThroughRequest: `targetId`

use thiserror::Error;

/// Size of the fixed frame header in bytes
pub const HEADER_SIZE: usize = 14;

/// The single supported protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Upper bound on a declared payload length accepted over the TCP
/// coordination channel. A peer declaring more is treated as protocol
/// abuse and disconnected.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

/// Frame command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Flag {
    /// TCP: advertise a client's UDP port to the coordinator
    Registration = 0x01,
    /// UDP: bind the sender's id to its NAT-observed source address
    UdpRegistration = 0x02,
    /// UDP: payload addressed to another client, forwarded by the relay
    RelayData = 0x03,
    /// Liveness probe; on UDP it also refreshes the NAT mapping
    Heartbeat = 0x04,
    /// Ask the relay to nudge the target's NAT pinhole open
    PunchThroughRequest = 0x06,
}

impl Flag {
    /// Returns `None` for flag bytes this version does not know about.
    /// Unknown flags still decode into a [`Packet`]; dispatch decides
    /// what to do with them.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Flag::Registration),
            0x02 => Some(Flag::UdpRegistration),
            0x03 => Some(Flag::RelayData),
            0x04 => Some(Flag::Heartbeat),
            0x06 => Some(Flag::PunchThroughRequest),
            _ => None,
        }
    }
}

/// A decoded frame. Transient: built per send/receive, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw flag byte; see [`Packet::flag`]
    pub flag: u8,
    pub version: u8,
    pub src_port: u32,
    pub dest_port: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(flag: Flag, src_port: u32, dest_port: u32, payload: Vec<u8>) -> Self {
        Self {
            flag: flag as u8,
            version: PROTOCOL_VERSION,
            src_port,
            dest_port,
            payload,
        }
    }

    /// The flag as a known command, if it is one
    pub fn flag(&self) -> Option<Flag> {
        Flag::from_u8(self.flag)
    }

    /// Serialize to wire format: 14-byte header + payload
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.push(self.flag);
        buf.push(self.version);
        buf.extend_from_slice(&self.src_port.to_be_bytes());
        buf.extend_from_slice(&self.dest_port.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse one frame from wire format.
    ///
    /// Fails only on a short header, a payload shorter than the declared
    /// length, or a version mismatch. Any flag byte decodes.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let header = FrameHeader::decode(data)?;
        let declared = header.payload_len as usize;
        if data.len() < HEADER_SIZE + declared {
            return Err(ProtocolError::TruncatedPayload {
                declared,
                available: data.len() - HEADER_SIZE,
            });
        }

        Ok(Self {
            flag: header.flag,
            version: header.version,
            src_port: header.src_port,
            dest_port: header.dest_port,
            payload: data[HEADER_SIZE..HEADER_SIZE + declared].to_vec(),
        })
    }
}

/// Just the fixed 14 bytes, for readers that fetch the payload separately
/// (the TCP coordination channel reads header then payload).
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub flag: u8,
    pub version: u8,
    pub src_port: u32,
    pub dest_port: u32,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::MalformedHeader { got: data.len() });
        }

        let version = data[1];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion { got: version });
        }

        Ok(Self {
            flag: data[0],
            version,
            src_port: u32::from_be_bytes([data[2], data[3], data[4], data[5]]),
            dest_port: u32::from_be_bytes([data[6], data[7], data[8], data[9]]),
            payload_len: u32::from_be_bytes([data[10], data[11], data[12], data[13]]),
        })
    }
}

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed header: need 14 bytes, got {got}")]
    MalformedHeader { got: usize },

    #[error("truncated payload: declared {declared} bytes, {available} available")]
    TruncatedPayload { declared: usize, available: usize },

    #[error("unsupported protocol version: 0x{got:02x}")]
    UnsupportedVersion { got: u8 },
}

/// Split a UTF-8 payload on its first `|`. The left field (a client id)
/// must be non-empty. Returns `None` for non-UTF-8 payloads or payloads
/// without a delimiter.
pub fn split_pair(payload: &[u8]) -> Option<(&str, &str)> {
    let text = std::str::from_utf8(payload).ok()?;
    let (left, right) = text.split_once('|')?;
    if left.is_empty() {
        return None;
    }
    Some((left, right))
}

/// Parse a TCP registration payload `clientId|udpPort`
pub fn parse_registration(payload: &[u8]) -> Option<(String, u16)> {
    let (client_id, port) = split_pair(payload)?;
    let port: u16 = port.parse().ok()?;
    Some((client_id.to_string(), port))
}

/// Parse a bare-clientId payload (UdpRegistration / Heartbeat)
pub fn parse_client_id(payload: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(payload).ok()?;
    if text.is_empty() {
        return None;
    }
    Some(text)
}
