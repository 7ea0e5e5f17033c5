//! Update transport adapter.
//!
//! Sits between the replica and whatever moves bytes between peers.
//! Outbound updates go through a FIFO offline queue: each frame is only
//! removed after the transport accepted it, so a disconnect mid-flush
//! loses nothing and a reconnect resumes from the first unsent frame.
//!
//! ```text
//!  DocUpdate ──► UpdateRelay::ship_update()
//!                    │  clock += 1, encode SyncMessage::Update
//!                    ▼
//!               OfflineQueue (FIFO) ──flush()──► Transport::send()
//!                    ▲                               │
//!                    └──── kept on Backpressure ─────┤
//!                          detach on Closed ◄────────┘
//!
//!  Transport ──frame──► UpdateRelay::route() ──► Inbound
//!                         (drops own echoes and other documents)
//! ```
//!
//! Awareness frames are never queued: presence is ephemeral and the
//! session re-broadcasts its current state on every reconnect.
//!
//! Reference: Kleppmann, DDIA Chapter 5 (Replication)

use std::collections::VecDeque;
use std::time::Instant;

use log::{debug, info, warn};
use thiserror::Error;
use uuid::Uuid;

use crate::error::CollabError;
use crate::protocol::{MessageType, SyncMessage, UserIdentity};
use crate::replica::DocUpdate;

/// Something that can carry an encoded frame to the other peers.
pub trait Transport {
    /// Hand one frame to the transport.
    ///
    /// `Backpressure` means "try again later" and keeps the transport
    /// attached; `Closed` detaches it.
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;
}

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("transport busy")]
    Backpressure,
    #[error("connect failed: {0}")]
    Connect(String),
}

// ───────────────────────────────────────────────────────────────────
// Offline queue
// ───────────────────────────────────────────────────────────────────

/// FIFO of encoded update frames awaiting delivery.
pub struct OfflineQueue {
    queue: VecDeque<QueuedFrame>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedFrame {
    clock: u64,
    frame: Vec<u8>,
    queued_at: Instant,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Append a frame. Returns `false` when the queue is full.
    pub fn enqueue(&mut self, clock: u64, frame: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedFrame {
            clock,
            frame,
            queued_at: Instant::now(),
        });
        true
    }

    /// Oldest frame, left in place.
    pub fn front(&self) -> Option<&[u8]> {
        self.queue.front().map(|q| q.frame.as_slice())
    }

    /// Remove the oldest frame after it was delivered.
    pub fn pop_front(&mut self) -> Option<(u64, Vec<u8>)> {
        self.queue.pop_front().map(|q| (q.clock, q.frame))
    }

    /// Drain every queued frame in order.
    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|q| (q.clock, q.frame)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|q| q.frame.len()).sum()
    }

    /// How long the oldest frame has been waiting.
    pub fn oldest_age(&self) -> Option<std::time::Duration> {
        self.queue.front().map(|q| q.queued_at.elapsed())
    }
}

// ───────────────────────────────────────────────────────────────────
// Inbound routing
// ───────────────────────────────────────────────────────────────────

/// A decoded frame addressed to this replica.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Update { peer_id: Uuid, clock: u64, update: Vec<u8> },
    SyncStep1 { peer_id: Uuid, state_vector: Vec<u8> },
    SyncStep2 { peer_id: Uuid, diff: Vec<u8> },
    Awareness { peer_id: Uuid, payload: Vec<u8> },
    PeerJoined { peer_id: Uuid, user: UserIdentity },
    PeerLeft { peer_id: Uuid },
    Ping { peer_id: Uuid },
    Pong { peer_id: Uuid },
}

impl Inbound {
    /// The sending peer.
    pub fn peer_id(&self) -> Uuid {
        match self {
            Inbound::Update { peer_id, .. }
            | Inbound::SyncStep1 { peer_id, .. }
            | Inbound::SyncStep2 { peer_id, .. }
            | Inbound::Awareness { peer_id, .. }
            | Inbound::PeerJoined { peer_id, .. }
            | Inbound::PeerLeft { peer_id }
            | Inbound::Ping { peer_id }
            | Inbound::Pong { peer_id } => *peer_id,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Relay
// ───────────────────────────────────────────────────────────────────

/// Per-session outbound pipeline and inbound filter.
pub struct UpdateRelay<T: Transport> {
    peer_id: Uuid,
    doc_id: Uuid,
    /// Per-origin counter stamped on every shipped update
    clock: u64,
    transport: Option<T>,
    queue: OfflineQueue,
}

impl<T: Transport> UpdateRelay<T> {
    pub fn new(peer_id: Uuid, doc_id: Uuid, queue_capacity: usize) -> Self {
        Self {
            peer_id,
            doc_id,
            clock: 0,
            transport: None,
            queue: OfflineQueue::new(queue_capacity),
        }
    }

    /// Queue a local update and try to deliver everything pending.
    ///
    /// The update always enters the queue first so delivery order equals
    /// generation order, connected or not.
    pub fn ship_update(&mut self, update: &DocUpdate) -> Result<(), CollabError> {
        let clock = self.clock + 1;
        let frame =
            SyncMessage::update(self.peer_id, self.doc_id, clock, update.as_bytes().to_vec())
                .encode()?;
        if !self.queue.enqueue(clock, frame) {
            return Err(CollabError::QueueFull {
                capacity: self.queue.capacity(),
            });
        }
        self.clock = clock;
        self.flush();
        Ok(())
    }

    /// Send an awareness frame if connected. Returns whether it went out.
    pub fn ship_awareness(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.transport.is_none() {
            debug!("Dropping awareness frame while offline");
            return false;
        }
        let msg = SyncMessage::awareness(self.peer_id, self.doc_id, clock, payload);
        match self.send_now(&msg) {
            Ok(()) => true,
            Err(e) => {
                debug!("Awareness frame not sent: {e}");
                false
            }
        }
    }

    /// Send a control frame immediately, bypassing the queue.
    pub fn send_now(&mut self, msg: &SyncMessage) -> Result<(), CollabError> {
        let frame = msg.encode()?;
        let transport = self.transport.as_mut().ok_or(CollabError::NotConnected)?;
        match transport.send(&frame) {
            Ok(()) => Ok(()),
            Err(TransportError::Backpressure) => Err(TransportError::Backpressure.into()),
            Err(e) => {
                warn!("Transport lost while sending {:?}: {e}", msg.msg_type);
                self.transport = None;
                Err(e.into())
            }
        }
    }

    /// Deliver queued frames in order until the queue empties or the
    /// transport pushes back. Returns the number of frames delivered.
    pub fn flush(&mut self) -> usize {
        let Some(transport) = self.transport.as_mut() else {
            return 0;
        };

        let mut sent = 0;
        let mut lost = false;
        while let Some(frame) = self.queue.front() {
            match transport.send(frame) {
                Ok(()) => {
                    self.queue.pop_front();
                    sent += 1;
                }
                Err(TransportError::Backpressure) => {
                    debug!("Transport busy, {} frames still queued", self.queue.len());
                    break;
                }
                Err(e) => {
                    warn!("Transport lost during flush: {e}");
                    lost = true;
                    break;
                }
            }
        }
        if lost {
            self.transport = None;
        }
        sent
    }

    /// Attach a live transport and replay the offline queue.
    pub fn attach(&mut self, transport: T) -> usize {
        self.transport = Some(transport);
        let pending = self.queue.len();
        let sent = self.flush();
        if pending > 0 {
            info!("Replayed {sent} of {pending} queued updates");
        }
        sent
    }

    /// Detach the transport. Subsequent updates queue.
    pub fn detach(&mut self) -> Option<T> {
        self.transport.take()
    }

    /// Decode an inbound frame and keep it only if it is for us.
    ///
    /// Echoes of our own frames and frames for other documents yield `None`.
    pub fn route(&self, frame: &[u8]) -> Result<Option<Inbound>, CollabError> {
        let msg = SyncMessage::decode(frame)?;
        if msg.peer_id == self.peer_id {
            return Ok(None);
        }
        if msg.doc_id != self.doc_id {
            debug!("Ignoring frame for document {}", msg.doc_id);
            return Ok(None);
        }

        let peer_id = msg.peer_id;
        let inbound = match msg.msg_type {
            MessageType::Update => Inbound::Update {
                peer_id,
                clock: msg.clock,
                update: msg.payload,
            },
            MessageType::SyncStep1 => Inbound::SyncStep1 {
                peer_id,
                state_vector: msg.payload,
            },
            MessageType::SyncStep2 => Inbound::SyncStep2 {
                peer_id,
                diff: msg.payload,
            },
            MessageType::Awareness => Inbound::Awareness {
                peer_id,
                payload: msg.payload,
            },
            MessageType::PeerJoined => Inbound::PeerJoined {
                peer_id,
                user: msg.user_identity()?,
            },
            MessageType::PeerLeft => Inbound::PeerLeft { peer_id },
            MessageType::Ping => Inbound::Ping { peer_id },
            MessageType::Pong => Inbound::Pong { peer_id },
        };
        Ok(Some(inbound))
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Updates generated but not yet accepted by a transport.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn transport_mut(&mut self) -> Option<&mut T> {
        self.transport.as_mut()
    }
}
