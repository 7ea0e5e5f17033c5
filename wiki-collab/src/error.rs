//! Error taxonomy for the collaboration core.
//!
//! Nothing here is fatal to the process: every variant describes a
//! rejected input or a degraded connection, and the local replica stays
//! at its last-good state.

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::transport::TransportError;

/// Errors surfaced by the collaboration core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CollabError {
    /// A remote Update could not be decoded or integrated.
    #[error("malformed update: {0}")]
    MalformedUpdate(String),

    /// An awareness payload could not be decoded.
    #[error("malformed awareness payload: {0}")]
    MalformedAwareness(String),

    /// A local mutation addressed content outside the document.
    #[error("mutation out of bounds: index {index} (+{len}) exceeds length {doc_len}")]
    OutOfBounds { index: u32, len: u32, doc_len: u32 },

    /// A local mutation addressed a byte inside a multi-byte character.
    #[error("index {index} is not on a character boundary")]
    NotCharBoundary { index: u32 },

    /// A local mutation that would not change anything.
    #[error("mutation has no effect")]
    EmptyMutation,

    /// No logical position could be created for the given index.
    #[error("no logical position available at index {0}")]
    PositionUnavailable(u32),

    /// Snapshot compression or decoding failed.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// The offline queue is at capacity.
    #[error("offline queue full ({capacity} frames)")]
    QueueFull { capacity: usize },

    /// An operation that needs a live transport was attempted offline.
    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<yrs::encoding::read::Error> for CollabError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        CollabError::MalformedUpdate(e.to_string())
    }
}
