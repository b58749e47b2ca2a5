//! Core types for the LSP protocol

use bytes::Bytes;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Connection identifier. Zero is never assigned to a live connection.
pub type ConnId = u16;

/// Data sequence number. Zero is reserved for the handshake acknowledgment.
pub type SeqNum = u16;

/// Size of the fixed header: message type, connection id, sequence number.
pub const HEADER_LEN: usize = 6;

/// Largest datagram the engine sends or accepts.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Largest payload that fits in a single datagram.
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM_SIZE - HEADER_LEN;

/// LSP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    Connect = 0,
    Data = 1,
    Ack = 2,
}

impl MsgType {
    /// Convert from the wire value
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(MsgType::Connect),
            1 => Some(MsgType::Data),
            2 => Some(MsgType::Ack),
            _ => None,
        }
    }

    /// Convert to the wire value
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsgType::Connect => write!(f, "CONNECT"),
            MsgType::Data => write!(f, "DATA"),
            MsgType::Ack => write!(f, "ACK"),
        }
    }
}

/// A decoded LSP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub typ: MsgType,
    pub conn_id: ConnId,
    pub seq: SeqNum,
    pub payload: Bytes,
}

impl Frame {
    /// `CONNECT(0, 0)`, the only well-formed connect request
    pub fn connect() -> Self {
        Self {
            typ: MsgType::Connect,
            conn_id: 0,
            seq: 0,
            payload: Bytes::new(),
        }
    }

    pub fn data(conn_id: ConnId, seq: SeqNum, payload: Bytes) -> Self {
        Self {
            typ: MsgType::Data,
            conn_id,
            seq,
            payload,
        }
    }

    pub fn ack(conn_id: ConnId, seq: SeqNum) -> Self {
        Self {
            typ: MsgType::Ack,
            conn_id,
            seq,
            payload: Bytes::new(),
        }
    }

    /// Encoded size of this frame in bytes
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Application-visible unit of data exchanged over a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pack {
    conn_id: ConnId,
    payload: Bytes,
}

impl Pack {
    pub fn new(conn_id: ConnId, payload: impl Into<Bytes>) -> Self {
        Self {
            conn_id,
            payload: payload.into(),
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Fail with [`LspError::PayloadTooLarge`] if the payload cannot fit in one datagram.
    pub fn check_size(&self) -> Result<()> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(LspError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        Ok(())
    }
}

/// A [`Pack`] that has been admitted into a connection's flow-control slot.
///
/// Carries the sequence number it was assigned and the address of the
/// connection it belongs to, so the frame can be rebuilt for retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalPack {
    pack: Pack,
    seq: SeqNum,
    remote: SocketAddr,
}

impl InternalPack {
    pub(crate) fn new(pack: Pack, seq: SeqNum, remote: SocketAddr) -> Self {
        Self { pack, seq, remote }
    }

    pub fn conn_id(&self) -> ConnId {
        self.pack.conn_id
    }

    pub fn seq(&self) -> SeqNum {
        self.seq
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn payload(&self) -> &Bytes {
        &self.pack.payload
    }

    /// The DATA frame carrying this pack
    pub fn to_frame(&self) -> Frame {
        Frame::data(self.pack.conn_id, self.seq, self.pack.payload.clone())
    }
}

/// Canonical identity of a remote endpoint: the literal IP address and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteKey {
    ip: IpAddr,
    port: u16,
}

impl From<SocketAddr> for RemoteKey {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip().to_canonical(),
            port: addr.port(),
        }
    }
}

/// Result type for LSP operations
pub type Result<T> = std::result::Result<T, LspError>;

/// LSP error types
#[derive(Error, Debug)]
pub enum LspError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection {0} is closed")]
    ClosedConnection(ConnId),

    #[error("endpoint is not active")]
    NotActive,

    #[error("queue is full")]
    QueueFull,

    #[error("connect not acknowledged after {attempts} attempts")]
    ConnectTimeout { attempts: u32 },

    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),
}

impl LspError {
    /// Check if this error means the connection or endpoint is gone for good
    pub fn is_closed(&self) -> bool {
        matches!(self, LspError::ClosedConnection(_) | LspError::NotActive)
    }

    /// Check if retrying the same operation later may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            LspError::QueueFull => true,
            LspError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
