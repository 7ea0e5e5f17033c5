//! Binary envelope for document updates, awareness, and the resync handshake.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! The payload of an `Update` is an opaque yrs v1 update. It is never
//! inspected here; merging is the replica's job.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector announcing what the sender already has
    SyncStep1 = 1,
    /// Diff answering a `SyncStep1`
    SyncStep2 = 2,
    /// Incremental document update
    Update = 3,
    /// Ephemeral presence state
    Awareness = 4,
    /// Peer joined notification
    PeerJoined = 5,
    /// Peer left notification
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Transient identifier of one editing session (one replica).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Durable identity of the human behind a session.
///
/// Supplied by the identity collaborator at session start and never
/// mutated by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    /// Display name for caret labels
    pub name: String,
}

impl UserIdentity {
    /// Identity whose display name is its id.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self { name: id.clone(), id }
    }

    pub fn with_name(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    /// Per-origin counter; strictly increasing across a peer's updates
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create a document update message.
    pub fn update(peer_id: Uuid, doc_id: Uuid, clock: u64, update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            peer_id,
            doc_id,
            clock,
            payload: update,
        }
    }

    /// Create a sync step 1 (state vector).
    pub fn sync_step1(peer_id: Uuid, doc_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            peer_id,
            doc_id,
            clock: 0,
            payload: state_vector,
        }
    }

    /// Create a sync step 2 (diff against a received state vector).
    pub fn sync_step2(peer_id: Uuid, doc_id: Uuid, diff: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            peer_id,
            doc_id,
            clock: 0,
            payload: diff,
        }
    }

    /// Create an awareness message around an already-encoded awareness update.
    pub fn awareness(peer_id: Uuid, doc_id: Uuid, clock: u64, encoded: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Awareness,
            peer_id,
            doc_id,
            clock,
            payload: encoded,
        }
    }

    /// Create a peer joined announcement.
    pub fn peer_joined(
        peer_id: Uuid,
        doc_id: Uuid,
        user: &UserIdentity,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(user, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::PeerJoined,
            peer_id,
            doc_id,
            clock: 0,
            payload,
        })
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::PeerLeft,
            peer_id,
            doc_id,
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Create a ping message.
    pub fn ping(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            peer_id,
            doc_id,
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Create a pong message.
    pub fn pong(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            peer_id,
            doc_id,
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the identity carried by a `PeerJoined`.
    pub fn user_identity(&self) -> Result<UserIdentity, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (user, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(user)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type")]
    InvalidMessageType,
}
