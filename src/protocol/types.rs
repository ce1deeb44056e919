//! Carrier protocol type definitions
//!
//! Messages exchanged with the relay. Every message travels as one
//! length-delimited, bincode-encoded frame (see [`super::codec`]).

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hash width in bytes (SHA-256 produces 32 bytes)
pub const HASH_WIDTH_IN_BYTES: usize = 32;

/// Protocol version type
type ProtocolVersion = u8;

/// Current protocol version
pub const CURRENT_PROTO_VERSION: ProtocolVersion = 1;

/// Digest type (32-byte SHA-256 hash)
pub type Digest = [u8; HASH_WIDTH_IN_BYTES];

/// Logical stream identifier inside one tunnel
pub type StreamId = u32;

/// Transport protocol of a proxied request
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP byte stream
    Tcp,
    /// UDP datagrams
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Whether a tunnel carries one stream or many
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharingMode {
    /// Exactly one logical stream; the tunnel closes with it
    Exclusive,
    /// Many multiplexed streams; the tunnel outlives them
    Shared,
}

impl fmt::Display for SharingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SharingMode::Exclusive => write!(f, "exclusive"),
            SharingMode::Shared => write!(f, "shared"),
        }
    }
}

/// First message on a new carrier connection
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub enum Hello {
    /// Start a new tunnel
    Open {
        /// Protocol version
        version: ProtocolVersion,
        /// Relay account name
        user: String,
        /// Sharing mode of the tunnel
        mode: SharingMode,
        /// Cipher identifier, if any
        algo: Option<String>,
        /// Random per-tunnel key material
        key: Vec<u8>,
        /// Compress frames after the handshake
        deflate: bool,
    },
    /// Reattach to a tunnel whose carrier was lost
    Resume {
        /// Protocol version
        version: ProtocolVersion,
        /// Session id handed out by the relay
        session: Digest,
    },
}

impl Hello {
    /// Get the protocol version from the hello message
    pub fn version(&self) -> ProtocolVersion {
        match self {
            Hello::Open { version, .. } | Hello::Resume { version, .. } => *version,
        }
    }
}

/// Nonce sent by the relay after a hello
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Challenge(pub Digest);

/// Authentication message
///
/// Sent by the client in answer to the relay's [`Challenge`].
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Auth(pub Digest);

impl Auth {
    /// Compute the proof for `user`/`pass` over the relay nonce
    pub fn new(user: &str, pass: &str, nonce: &Digest) -> Self {
        let mut concat = Vec::with_capacity(user.len() + pass.len() + 1 + nonce.len());
        concat.extend_from_slice(user.as_bytes());
        concat.push(b':');
        concat.extend_from_slice(pass.as_bytes());
        concat.extend_from_slice(nonce);
        Auth(super::digest::digest(&concat))
    }
}

/// Handshake acknowledgment
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub enum Ack {
    /// Accepted; carries the session id used to resume
    Ok(Digest),
    /// Wrong credentials
    AuthFailed,
    /// Resume for a session the relay no longer knows
    UnknownSession,
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Ack::Ok(_) => "Ok",
                Ack::AuthFailed => "Incorrect credentials",
                Ack::UnknownSession => "Unknown session",
            }
        )
    }
}

/// Multiplexed traffic after the handshake
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub enum Frame {
    /// Ask the relay to open a logical stream
    Open {
        /// Stream id chosen by the client
        id: StreamId,
        /// Stream protocol
        protocol: Protocol,
        /// Target host
        addr: String,
        /// Target port
        port: u16,
    },
    /// Relay answer to [`Frame::Open`]
    OpenAck {
        /// Stream id
        id: StreamId,
        /// Failure reason, `None` on success
        error: Option<String>,
    },
    /// Payload for one stream; one UDP datagram per frame for UDP streams
    Data {
        /// Stream id
        id: StreamId,
        /// Payload
        payload: Bytes,
    },
    /// One side is done with a stream
    Close {
        /// Stream id
        id: StreamId,
    },
    /// Keepalive probe
    Ping,
    /// Keepalive answer
    Pong,
    /// Whole-tunnel teardown
    Shutdown {
        /// Close code
        code: u16,
        /// Human readable reason
        reason: String,
    },
}

impl Frame {
    /// Stream the frame belongs to, if any
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Frame::Open { id, .. }
            | Frame::OpenAck { id, .. }
            | Frame::Data { id, .. }
            | Frame::Close { id } => Some(*id),
            Frame::Ping | Frame::Pong | Frame::Shutdown { .. } => None,
        }
    }
}
