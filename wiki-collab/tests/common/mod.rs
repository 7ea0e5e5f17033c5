//! Shared fakes for the integration tests.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use uuid::Uuid;
use wiki_collab::{
    CollabConfig, CollabSession, MessageType, SyncMessage, Transport, TransportError, UserIdentity,
};

pub const DOC_ID: Uuid = Uuid::from_u128(0x5157_0000_0000_0000_0000_0000_0000_0001);

/// In-memory transport whose sent frames the test can read back.
pub struct RecordingTransport {
    frames: Rc<RefCell<Vec<Vec<u8>>>>,
    closed: Rc<Cell<bool>>,
}

/// The test's handle on a `RecordingTransport`.
#[derive(Clone)]
pub struct Wire {
    frames: Rc<RefCell<Vec<Vec<u8>>>>,
    closed: Rc<Cell<bool>>,
}

impl Transport for RecordingTransport {
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed.get() {
            return Err(TransportError::Closed);
        }
        self.frames.borrow_mut().push(frame.to_vec());
        Ok(())
    }
}

impl Wire {
    /// Take every frame sent so far.
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.frames.borrow_mut())
    }

    /// Frames sent so far, left in place for `settle`.
    pub fn peek(&self) -> Vec<Vec<u8>> {
        self.frames.borrow().clone()
    }

    /// Make the next send fail as if the socket dropped.
    pub fn close(&self) {
        self.closed.set(true);
    }
}

pub fn wire() -> (RecordingTransport, Wire) {
    let frames = Rc::new(RefCell::new(Vec::new()));
    let closed = Rc::new(Cell::new(false));
    (
        RecordingTransport {
            frames: frames.clone(),
            closed: closed.clone(),
        },
        Wire { frames, closed },
    )
}

pub fn session(user: &str, config: CollabConfig) -> CollabSession<RecordingTransport> {
    CollabSession::new(DOC_ID, UserIdentity::new(user), config)
}

/// Create a session and connect it to a fresh wire.
pub fn connected(user: &str, config: CollabConfig, now: Instant) -> (CollabSession<RecordingTransport>, Wire) {
    let mut s = session(user, config);
    let (transport, wire) = wire();
    s.connect(transport, now).unwrap();
    (s, wire)
}

/// Hand frames to a session as if the relay forwarded them.
pub fn deliver(frames: &[Vec<u8>], to: &mut CollabSession<RecordingTransport>, now: Instant) {
    for frame in frames {
        to.handle_frame(frame, now).unwrap();
    }
}

/// Move everything each session sent to every other session until quiet.
pub fn settle(sessions: &mut [(&mut CollabSession<RecordingTransport>, &Wire)], now: Instant) {
    for _ in 0..8 {
        let outgoing: Vec<Vec<Vec<u8>>> = sessions.iter().map(|(_, w)| w.take()).collect();
        if outgoing.iter().all(Vec::is_empty) {
            return;
        }
        for (from, frames) in outgoing.iter().enumerate() {
            for (to, (session, _)) in sessions.iter_mut().enumerate() {
                if to != from {
                    deliver(frames, session, now);
                }
            }
        }
    }
}

/// `(clock, payload)` of every Update frame, in send order.
pub fn updates(frames: &[Vec<u8>]) -> Vec<(u64, Vec<u8>)> {
    frames
        .iter()
        .map(|f| SyncMessage::decode(f).unwrap())
        .filter(|m| m.msg_type == MessageType::Update)
        .map(|m| (m.clock, m.payload))
        .collect()
}
