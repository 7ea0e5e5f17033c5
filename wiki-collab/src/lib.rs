//! # wiki-collab: Real-time collaboration core for the wiki editor
//!
//! Keeps one shared document converged across clients, carries presence
//! (who is where) next to it, and gives the editor everything it needs to
//! paint remote carets and undo its own edits.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   Update / Awareness   ┌──────────────┐
//! │ CollabSession│ ◄────────────────────► │ Relay service│
//! │ (per client) │     Binary Proto       │ (external)   │
//! └──────┬───────┘                        └──────────────┘
//!        │
//!   ┌────┴─────────────┬───────────────┬──────────────┐
//!   ▼                  ▼               ▼              ▼
//! ┌─────────┐   ┌─────────────┐  ┌───────────┐  ┌───────────┐
//! │ Replica │   │ Awareness   │  │ History   │  │ Update    │
//! │ (yrs)   │   │ Channel     │  │ (undo)    │  │ Relay     │
//! └────┬────┘   └──────┬──────┘  └───────────┘  └───────────┘
//!      │               │
//!      ▼               ▼
//! Attribution    SelectionDecorator
//! ```
//!
//! ## Modules
//!
//! - [`replica`] yrs-backed document, local/remote apply, logical positions
//! - [`protocol`] Binary wire envelope (bincode-encoded `SyncMessage`)
//! - [`transport`] `Transport` seam, offline queue, inbound routing
//! - [`client`] WebSocket transport
//! - [`attribution`] client → user mapping, written on first edit
//! - [`awareness`] ephemeral presence with last-write-wins clocks
//! - [`decorator`] remote caret/highlight decorations with recency fade
//! - [`history`] undo/redo of local edits only
//! - [`snapshot`] compressed snapshots for persistence
//! - [`session`] `CollabSession`, the object that wires it all together

pub mod attribution;
pub mod awareness;
pub mod client;
pub mod config;
pub mod decorator;
pub mod error;
pub mod history;
pub mod protocol;
pub mod replica;
pub mod session;
pub mod snapshot;
pub mod transport;

// Re-exports for convenience
pub use attribution::{Attribution, AttributionState, IdentityAttribution};
pub use awareness::{
    AwarenessChannel, AwarenessEntry, AwarenessEvent, AwarenessFields, AwarenessUpdate,
    Selection, SubscriptionId,
};
pub use client::{connect, ConnectionEvent, WsTransport};
pub use config::CollabConfig;
pub use decorator::{
    color_seed, CursorColor, Decoration, DecorationKind, DecorationStyle, SelectionCacheEntry,
    SelectionDecorator,
};
pub use error::CollabError;
pub use history::HistoryCoordinator;
pub use protocol::{ClientId, MessageType, ProtocolError, SyncMessage, UserIdentity};
pub use replica::{DocUpdate, DocumentState, LogicalPosition, Mutation, Replica};
pub use session::{CollabSession, FrameOutcome};
pub use snapshot::{CompressedSnapshot, SnapshotSchedule};
pub use transport::{Inbound, OfflineQueue, Transport, TransportError, UpdateRelay};
