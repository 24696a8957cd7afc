//! Wire protocol shared by the session server and its clients
//!
//! Two independent protocols travel between client and server:
//! - a reliable stream protocol ([`TcpMessage`]) for session control and snapshots
//! - an unreliable datagram protocol ([`UdpMessage`]) for high-frequency player updates
//!
//! Every message is encoded into a fixed-size frame: the bincode body followed by
//! zero padding up to [`TCP_FRAME_SIZE`] or [`UDP_FRAME_SIZE`]. A receiver that reads
//! anything other than exactly one frame rejects it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Number of session slots and player records held by the server
pub const MAX_PLAYERS: usize = 16;
/// Conventional port shared by the stream listener and the datagram socket
pub const DEFAULT_PORT: u16 = 4444;
/// Size in bytes of every stream frame
pub const TCP_FRAME_SIZE: usize = 1024;
/// Size in bytes of every datagram frame
pub const UDP_FRAME_SIZE: usize = 128;
/// Longest hostname accepted in a resolve request
pub const MAX_HOST_LEN: usize = 255;
/// Longest service string accepted in a resolve request
pub const MAX_SERVICE_LEN: usize = 32;

/// Index of a session slot, `0..MAX_PLAYERS`
pub type SessionId = u8;

/// Errors produced while framing or unframing protocol messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame has {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },
    #[error("encoded message needs {size} bytes but frames hold {limit}")]
    FrameOverflow { size: usize, limit: usize },
    #[error("{field} is {len} bytes long, limit is {limit}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        limit: usize,
    },
    #[error("malformed frame: {0}")]
    Decode(#[from] bincode::Error),
}

/// Position, orientation and scale of a player
///
/// The server never interprets this payload; it is stored and relayed verbatim.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: [f32; 3],
    pub rotation: [f32; 4],
    pub scale: [f32; 3],
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        position: [0.0, 0.0, 0.0],
        rotation: [0.0, 0.0, 0.0, 1.0],
        scale: [1.0, 1.0, 1.0],
    };

    pub fn at(x: f32, y: f32, z: f32) -> Self {
        Self {
            position: [x, y, z],
            ..Self::IDENTITY
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Authoritative state of one player, indexed by its session id
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct PlayerRecord {
    /// Owning session id, or -1 for an unused slot
    pub id: i8,
    pub transform: Transform,
}

impl PlayerRecord {
    /// Placeholder occupying slots with no player so snapshots stay full-sized
    pub const FILLER: PlayerRecord = PlayerRecord {
        id: -1,
        transform: Transform::IDENTITY,
    };

    /// Record a freshly onboarded session starts with
    pub fn spawn(id: SessionId) -> Self {
        Self {
            id: id as i8,
            transform: Transform::IDENTITY,
        }
    }

    pub fn new(id: SessionId, transform: Transform) -> Self {
        Self {
            id: id as i8,
            transform,
        }
    }

    /// Session id this record belongs to, if it names a valid slot
    pub fn session_id(&self) -> Option<SessionId> {
        if self.id >= 0 && (self.id as usize) < MAX_PLAYERS {
            Some(self.id as SessionId)
        } else {
            None
        }
    }

    pub fn is_filler(&self) -> bool {
        self.id < 0
    }
}

impl Default for PlayerRecord {
    fn default() -> Self {
        Self::FILLER
    }
}

/// Why a session left, carried in `DisconnectTell`
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client announced its departure
    Standard,
    /// The stream closed or failed without an announcement
    ConnectionLost,
}

/// Reliable-stream message: timestamp plus a tagged payload
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TcpMessage {
    pub timestamp: u64,
    pub payload: TcpPayload,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum TcpPayload {
    // Server to client
    YouAreConnected {
        id: SessionId,
    },
    Snapshot {
        records: [PlayerRecord; MAX_PLAYERS],
    },
    ConnectTell {
        record: PlayerRecord,
    },
    DisconnectTell {
        id: SessionId,
        reason: DisconnectReason,
    },

    // Client to server
    RequestResolveV4 {
        host: String,
        service: String,
        id: SessionId,
    },
    RequestResolveV6 {
        host: String,
        service: String,
        id: SessionId,
    },
    Disconnecting {
        id: SessionId,
    },

    // Either direction
    KeepaliveRequest,
    KeepaliveReply,
}

impl TcpMessage {
    pub fn new(payload: TcpPayload) -> Self {
        Self {
            timestamp: timestamp(),
            payload,
        }
    }

    /// Stable name of the payload kind, used in logs
    pub fn kind(&self) -> &'static str {
        match self.payload {
            TcpPayload::YouAreConnected { .. } => "YouAreConnected",
            TcpPayload::Snapshot { .. } => "Snapshot",
            TcpPayload::ConnectTell { .. } => "ConnectTell",
            TcpPayload::DisconnectTell { .. } => "DisconnectTell",
            TcpPayload::RequestResolveV4 { .. } => "RequestResolveV4",
            TcpPayload::RequestResolveV6 { .. } => "RequestResolveV6",
            TcpPayload::Disconnecting { .. } => "Disconnecting",
            TcpPayload::KeepaliveRequest => "KeepaliveRequest",
            TcpPayload::KeepaliveReply => "KeepaliveReply",
        }
    }
}

/// Who produced a datagram: a client, or the server relaying it
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SenderKind {
    Client,
    Server,
}

/// Unreliable-datagram message
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UdpMessage {
    pub timestamp: u64,
    pub sender: SenderKind,
    pub payload: UdpPayload,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum UdpPayload {
    PlayerUpdate { record: PlayerRecord },
    Keepalive,
}

impl UdpMessage {
    pub fn player_update(record: PlayerRecord, timestamp: u64, sender: SenderKind) -> Self {
        Self {
            timestamp,
            sender,
            payload: UdpPayload::PlayerUpdate { record },
        }
    }
}

/// Encodes a stream message into exactly [`TCP_FRAME_SIZE`] bytes
pub fn encode_tcp(message: &TcpMessage) -> Result<Vec<u8>, ProtocolError> {
    match &message.payload {
        TcpPayload::RequestResolveV4 { host, service, .. }
        | TcpPayload::RequestResolveV6 { host, service, .. } => {
            check_field("host", host, MAX_HOST_LEN)?;
            check_field("service", service, MAX_SERVICE_LEN)?;
        }
        _ => {}
    }
    encode_frame(message, TCP_FRAME_SIZE)
}

/// Decodes one stream frame
pub fn decode_tcp(frame: &[u8]) -> Result<TcpMessage, ProtocolError> {
    decode_frame(frame, TCP_FRAME_SIZE)
}

/// Encodes a datagram message into exactly [`UDP_FRAME_SIZE`] bytes
pub fn encode_udp(message: &UdpMessage) -> Result<Vec<u8>, ProtocolError> {
    encode_frame(message, UDP_FRAME_SIZE)
}

/// Decodes one datagram frame
pub fn decode_udp(frame: &[u8]) -> Result<UdpMessage, ProtocolError> {
    decode_frame(frame, UDP_FRAME_SIZE)
}

fn check_field(field: &'static str, value: &str, limit: usize) -> Result<(), ProtocolError> {
    if value.len() > limit {
        return Err(ProtocolError::FieldTooLong {
            field,
            len: value.len(),
            limit,
        });
    }
    Ok(())
}

fn encode_frame<T: Serialize>(message: &T, frame_size: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut frame = bincode::serialize(message)?;
    if frame.len() > frame_size {
        return Err(ProtocolError::FrameOverflow {
            size: frame.len(),
            limit: frame_size,
        });
    }
    frame.resize(frame_size, 0);
    Ok(frame)
}

fn decode_frame<T: DeserializeOwned>(frame: &[u8], frame_size: usize) -> Result<T, ProtocolError> {
    if frame.len() != frame_size {
        return Err(ProtocolError::FrameSize {
            expected: frame_size,
            actual: frame.len(),
        });
    }
    // Trailing zero padding is ignored by the legacy bincode config.
    Ok(bincode::deserialize(frame)?)
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn timestamp() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    millis.min(u64::MAX as u128) as u64
}
