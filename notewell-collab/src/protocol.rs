//! Binary relay protocol for document and awareness synchronization.
//!
//! Every frame on the wire is a bincode-encoded [`RelayMessage`] envelope:
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ kind     │ peer_id   │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ variable │ 8 bytes  │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! The payload is interpreted per kind: `Hello` carries the auth token and
//! peer identity, `SyncStep1` a Yrs state vector, `SyncStep2`/`Delta` a Yrs
//! v1 update, `Awareness` a presence record. `DeltaAck` echoes the clock of
//! the highest locally-originated delta the relay has applied.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::{AwarenessUpdate, PeerInfo};

/// Frame kinds understood by both client and relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Connection handshake: auth token + peer identity
    Hello = 1,
    /// Relay accepted the handshake
    HelloAck = 2,
    /// Yrs state vector, requesting the missing diff
    SyncStep1 = 3,
    /// Yrs state diff answering a SyncStep1
    SyncStep2 = 4,
    /// Incremental CRDT update
    Delta = 5,
    /// Cumulative acknowledgment of applied deltas (by clock)
    DeltaAck = 6,
    /// Cursor/selection presence update
    Awareness = 7,
    /// Peer joined the document
    PeerJoined = 8,
    /// Peer left the document
    PeerLeft = 9,
    /// Heartbeat ping
    Ping = 10,
    /// Heartbeat pong
    Pong = 11,
}

/// Handshake payload: per-connection credential plus who is connecting.
///
/// The token is fetched fresh for every connection attempt and is never
/// reused across reconnects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HelloPayload {
    pub token: String,
    pub peer: PeerInfo,
}

/// Top-level protocol envelope.
///
/// `doc_id` is the host application's document identifier (opaque string);
/// `peer_id` is the ephemeral per-connection identity of the sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    pub kind: MessageKind,
    pub peer_id: Uuid,
    pub doc_id: String,
    /// Delta ordering clock; zero for frames that carry none
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl RelayMessage {
    /// Create a handshake frame carrying the auth token and peer identity.
    pub fn hello(doc_id: &str, payload: &HelloPayload) -> Result<Self, ProtocolError> {
        let encoded = bincode::serde::encode_to_vec(payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(Self {
            kind: MessageKind::Hello,
            peer_id: payload.peer.peer_id,
            doc_id: doc_id.to_owned(),
            clock: 0,
            payload: encoded,
        })
    }

    /// Create a handshake acknowledgment.
    pub fn hello_ack(peer_id: Uuid, doc_id: &str) -> Self {
        Self {
            kind: MessageKind::HelloAck,
            peer_id,
            doc_id: doc_id.to_owned(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Create a sync step 1 frame (state vector request).
    pub fn sync_step1(peer_id: Uuid, doc_id: &str, state_vector: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::SyncStep1,
            peer_id,
            doc_id: doc_id.to_owned(),
            clock: 0,
            payload: state_vector,
        }
    }

    /// Create a sync step 2 frame (state diff response).
    pub fn sync_step2(peer_id: Uuid, doc_id: &str, diff: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::SyncStep2,
            peer_id,
            doc_id: doc_id.to_owned(),
            clock: 0,
            payload: diff,
        }
    }

    /// Create an incremental delta frame.
    pub fn delta(peer_id: Uuid, doc_id: &str, clock: u64, update: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Delta,
            peer_id,
            doc_id: doc_id.to_owned(),
            clock,
            payload: update,
        }
    }

    /// Create a delta acknowledgment covering every clock up to `clock`.
    pub fn delta_ack(peer_id: Uuid, doc_id: &str, clock: u64) -> Self {
        Self {
            kind: MessageKind::DeltaAck,
            peer_id,
            doc_id: doc_id.to_owned(),
            clock,
            payload: Vec::new(),
        }
    }

    /// Create an awareness frame.
    pub fn awareness(
        peer_id: Uuid,
        doc_id: &str,
        update: &AwarenessUpdate,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(update, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(Self {
            kind: MessageKind::Awareness,
            peer_id,
            doc_id: doc_id.to_owned(),
            clock: 0,
            payload,
        })
    }

    /// Create a peer-joined notification.
    pub fn peer_joined(doc_id: &str, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(Self {
            kind: MessageKind::PeerJoined,
            peer_id: info.peer_id,
            doc_id: doc_id.to_owned(),
            clock: 0,
            payload,
        })
    }

    /// Create a peer-left notification.
    pub fn peer_left(peer_id: Uuid, doc_id: &str) -> Self {
        Self {
            kind: MessageKind::PeerLeft,
            peer_id,
            doc_id: doc_id.to_owned(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Create a heartbeat ping.
    pub fn ping(peer_id: Uuid, doc_id: &str) -> Self {
        Self {
            kind: MessageKind::Ping,
            peer_id,
            doc_id: doc_id.to_owned(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Create a heartbeat pong.
    pub fn pong(peer_id: Uuid, doc_id: &str) -> Self {
        Self {
            kind: MessageKind::Pong,
            peer_id,
            doc_id: doc_id.to_owned(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the handshake payload.
    pub fn hello_payload(&self) -> Result<HelloPayload, ProtocolError> {
        if self.kind != MessageKind::Hello {
            return Err(ProtocolError::UnexpectedKind);
        }
        let (payload, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(payload)
    }

    /// Parse the awareness payload.
    pub fn awareness_update(&self) -> Result<AwarenessUpdate, ProtocolError> {
        if self.kind != MessageKind::Awareness {
            return Err(ProtocolError::UnexpectedKind);
        }
        let (update, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(update)
    }

    /// Parse the peer-joined payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.kind != MessageKind::PeerJoined {
            return Err(ProtocolError::UnexpectedKind);
        }
        let (info, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(info)
    }
}

/// Protocol-level errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
    UnexpectedKind,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::UnexpectedKind => write!(f, "unexpected frame kind"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Timeout => write!(f, "connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
