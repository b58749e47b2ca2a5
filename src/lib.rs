//! # LSP - Lossy Sequenced Packets
//!
//! A small connection-oriented transport over UDP that is:
//!
//! * **Reliable**: every data message is acknowledged and retransmitted until it is
//! * **Ordered**: at most one unacknowledged message per connection
//! * **Self-healing**: idle connections are detected and dropped by epoch timers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lsp::{Client, Pack, Params, Server};
//!
//! # async fn run() -> lsp::Result<()> {
//! let params = Params::with_millis(500, 5);
//! let server = Server::open(9000, params).await?;
//!
//! let client = Client::connect("127.0.0.1", 9000, params).await?;
//! client.write(&b"Hello, LSP!"[..])?;
//!
//! let pack = server.read().await?;
//! server.write(Pack::new(pack.conn_id(), pack.into_payload()))?;
//!
//! let echoed = client.read().await?;
//! assert_eq!(echoed.as_deref(), Some(&b"Hello, LSP!"[..]));
//! # Ok(())
//! # }
//! ```
//!
//! ## Protocol Overview
//!
//! Every datagram starts with a fixed 6-byte header, all fields big-endian:
//!
//! - TYPE (2B): Message type
//! - CONN_ID (2B): Connection id assigned by the server, 0 during the handshake
//! - SEQ (2B): Sequence number of the data message, 0 for handshake ACKs
//! - PAYLOAD: Raw bytes, DATA only, at most [`MAX_PAYLOAD`] bytes
//!
//! ## Message Types
//!
//! | Type | Name    | Direction       | Description                        |
//! |------|---------|-----------------|------------------------------------|
//! | 0x00 | CONNECT | Client → Server | Request a connection               |
//! | 0x01 | DATA    | Both            | Application data                   |
//! | 0x02 | ACK     | Both            | Acknowledge DATA or a CONNECT      |
//!
//! ## Epochs
//!
//! Each connection runs a timer. On every tick it resends whatever the peer may
//! have missed (the unacknowledged DATA, else the last ACK) and counts the ticks
//! without any datagram from the peer. After [`Params::epoch_limit`] silent ticks
//! the connection is closed.

pub mod codec;
pub mod frame;
pub mod params;
pub mod types;
pub mod udp;

// Re-export main types for convenience
pub use types::{
    ConnId, Frame, InternalPack, LspError, MsgType, Pack, RemoteKey, Result, SeqNum,
    HEADER_LEN, MAX_DATAGRAM_SIZE, MAX_PAYLOAD,
};

pub use codec::LspCodec;
pub use frame::{decode_frame, encode_frame};
pub use params::Params;
pub use udp::{Client, Connection, ConnectionState, LspSocket, Server};
