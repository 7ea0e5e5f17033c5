//! Collaboration session: the context object that owns one open document.
//!
//! Everything the editor needs (document, awareness, identity, history,
//! transport) hangs off a `CollabSession` that is passed explicitly to
//! whoever needs it. There is no global store.
//!
//! ```text
//!                    ┌──────────────────────── CollabSession ───────────────────────┐
//!  edit(Mutation) ──►│ Replica ──DocUpdate──► UpdateRelay ──► Transport             │
//!                    │   │  └─ IdentityAttribution (first edit)                      │
//!                    │   └─ HistoryCoordinator (local origin only)                   │
//!                    │                                                               │
//!  handle_frame() ──►│ UpdateRelay::route ──► Replica / AwarenessChannel             │
//!                    │                                                               │
//!  decorations() ◄───│ SelectionDecorator ◄── AwarenessChannel + Replica             │
//!                    └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The session is driven from a single thread: network tasks hand it frames,
//! and it never blocks on the network to apply a local edit.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use uuid::Uuid;

use crate::attribution::{Attribution, IdentityAttribution};
use crate::awareness::{AwarenessChannel, AwarenessEvent, AwarenessFields, Selection, SubscriptionId};
use crate::config::CollabConfig;
use crate::decorator::{Decoration, SelectionDecorator};
use crate::error::CollabError;
use crate::history::HistoryCoordinator;
use crate::protocol::{ClientId, SyncMessage, UserIdentity};
use crate::replica::{DocUpdate, DocumentState, Mutation, Replica};
use crate::snapshot::{CompressedSnapshot, SnapshotSchedule};
use crate::transport::{Inbound, Transport, UpdateRelay};

/// What an inbound frame did to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Document content or attribution may have changed
    DocumentChanged,
    /// Remote presence changed
    AwarenessChanged,
    PeerJoined(UserIdentity),
    PeerLeft(ClientId),
    /// Echo, stale, foreign, or control frame
    Ignored,
}

/// One client's view of one shared document.
pub struct CollabSession<T: Transport> {
    doc_id: Uuid,
    client_id: ClientId,
    replica: Replica,
    attribution: IdentityAttribution,
    history: HistoryCoordinator,
    awareness: AwarenessChannel,
    decorator: SelectionDecorator,
    relay: UpdateRelay<T>,
    schedule: SnapshotSchedule,
    peers: HashMap<ClientId, UserIdentity>,
    /// Last frame received from each announced peer
    peer_seen: HashMap<ClientId, Instant>,
    liveness_timeout: Duration,
    heartbeat_interval: Duration,
    last_heartbeat: Option<Instant>,
    /// Updates generated by this session (local edits, undo, redo)
    generated: u64,
}

impl<T: Transport> CollabSession<T> {
    /// Start a session on an empty document.
    pub fn new(doc_id: Uuid, user: UserIdentity, config: CollabConfig) -> Self {
        let client_id = ClientId::random();
        Self::with_replica(doc_id, user, config, Replica::new(client_id))
    }

    /// Start a session seeded from a stored snapshot.
    pub fn from_snapshot(
        doc_id: Uuid,
        user: UserIdentity,
        config: CollabConfig,
        snapshot: &CompressedSnapshot,
    ) -> Result<Self, CollabError> {
        let state = snapshot.decompress()?;
        let replica = Replica::from_state(ClientId::random(), &state)?;
        info!("Seeded document {doc_id} from snapshot v{}", snapshot.version);
        Ok(Self::with_replica(doc_id, user, config, replica))
    }

    fn with_replica(doc_id: Uuid, user: UserIdentity, config: CollabConfig, replica: Replica) -> Self {
        let client_id = replica.client_id();
        let history = HistoryCoordinator::new(&replica);
        Self {
            doc_id,
            client_id,
            attribution: IdentityAttribution::new(client_id, user),
            history,
            awareness: AwarenessChannel::new(client_id, &config),
            decorator: SelectionDecorator::new(config.recency_window),
            relay: UpdateRelay::new(client_id.as_uuid(), doc_id, config.offline_queue_capacity),
            schedule: SnapshotSchedule::new(config.snapshot_threshold),
            peers: HashMap::new(),
            peer_seen: HashMap::new(),
            liveness_timeout: config.liveness_timeout,
            heartbeat_interval: config.renew_interval,
            last_heartbeat: None,
            generated: 0,
            replica,
        }
    }

    // ── Editing ────────────────────────────────────────────────────

    /// Apply a local edit and ship it. Works the same online or offline.
    pub fn edit(&mut self, mutation: Mutation) -> Result<DocUpdate, CollabError> {
        let update = self.replica.apply_local(&mutation, &mut self.attribution)?;
        self.history.seal();
        self.ship(&update);
        Ok(update)
    }

    /// Undo this session's most recent edit.
    pub fn undo(&mut self) -> Option<DocUpdate> {
        let update = self.history.undo(&self.replica)?;
        self.ship(&update);
        Some(update)
    }

    /// Redo the most recently undone edit.
    pub fn redo(&mut self) -> Option<DocUpdate> {
        let update = self.history.redo(&self.replica)?;
        self.ship(&update);
        Some(update)
    }

    fn ship(&mut self, update: &DocUpdate) {
        self.generated += 1;
        self.schedule.record();
        if let Err(e) = self.relay.ship_update(update) {
            warn!("Update not queued ({e}); it will resync on reconnect");
        }
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    // ── Presence ───────────────────────────────────────────────────

    /// Publish the local selection. `anchor == head` is a caret.
    pub fn set_selection(&mut self, anchor: u32, head: u32, now: Instant) -> Result<(), CollabError> {
        let selection = Selection {
            anchor: self.replica.logical_position(anchor)?,
            head: self.replica.logical_position(head)?,
        };
        let fields = AwarenessFields::new(self.attribution.user().clone()).with_selection(selection);
        self.publish_awareness(fields, now)
    }

    /// Publish presence without a selection.
    pub fn clear_selection(&mut self, now: Instant) -> Result<(), CollabError> {
        let fields = AwarenessFields::new(self.attribution.user().clone());
        self.publish_awareness(fields, now)
    }

    fn publish_awareness(&mut self, fields: AwarenessFields, now: Instant) -> Result<(), CollabError> {
        let payload = self.awareness.set_local_state(fields, now)?;
        self.relay.ship_awareness(self.awareness.local_clock(), payload);
        Ok(())
    }

    /// Local selection resolved against the current document.
    pub fn local_selection(&self) -> Option<(u32, u32)> {
        let selection = self.awareness.local_state()?.selection.as_ref()?;
        Some((
            self.replica.resolve_position(&selection.anchor)?,
            self.replica.resolve_position(&selection.head)?,
        ))
    }

    pub fn subscribe_awareness<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&AwarenessEvent) + Send + 'static,
    {
        self.awareness.subscribe(listener)
    }

    pub fn unsubscribe_awareness(&mut self, id: SubscriptionId) -> bool {
        self.awareness.unsubscribe(id)
    }

    /// Remote carets and highlights in current document indices.
    pub fn decorations(&mut self, now: Instant) -> Vec<Decoration> {
        self.decorator
            .decorate(&self.replica, self.client_id, self.awareness.entries(), now)
    }

    // ── Connection lifecycle ───────────────────────────────────────

    /// Attach a live transport and run the resume handshake.
    ///
    /// Queued updates go out first, in generation order, followed by a
    /// state-vector exchange that recovers anything lost in transit.
    /// Returns the number of queued updates delivered.
    pub fn connect(&mut self, transport: T, now: Instant) -> Result<usize, CollabError> {
        let replayed = self.relay.attach(transport);

        let peer = self.client_id.as_uuid();
        self.relay.send_now(&SyncMessage::sync_step1(
            peer,
            self.doc_id,
            self.replica.state_vector(),
        ))?;
        self.relay.send_now(&SyncMessage::peer_joined(
            peer,
            self.doc_id,
            self.attribution.user(),
        )?)?;
        self.rebroadcast_awareness(now)?;

        info!(
            "Session {} joined document {} ({replayed} queued updates replayed)",
            self.client_id, self.doc_id
        );
        Ok(replayed)
    }

    /// Drop the transport. Edits keep working and queue until reconnect.
    pub fn disconnect(&mut self) -> Option<T> {
        let transport = self.relay.detach();
        if transport.is_some() {
            info!("Session {} went offline", self.client_id);
        }
        transport
    }

    /// Announce departure, withdraw presence, and detach.
    pub fn leave(&mut self, now: Instant) -> Result<Option<T>, CollabError> {
        let payload = self.awareness.clear_local_state(now)?;
        if self.relay.is_connected() {
            self.relay.ship_awareness(self.awareness.local_clock(), payload);
            self.reply(SyncMessage::peer_left(self.client_id.as_uuid(), self.doc_id));
        }
        Ok(self.disconnect())
    }

    fn rebroadcast_awareness(&mut self, now: Instant) -> Result<(), CollabError> {
        if let Some(payload) = self.awareness.broadcast_local(now)? {
            self.relay.ship_awareness(self.awareness.local_clock(), payload);
        }
        Ok(())
    }

    /// Best-effort control reply; failures only matter to the next handshake.
    fn reply(&mut self, msg: SyncMessage) {
        if let Err(e) = self.relay.send_now(&msg) {
            debug!("Reply {:?} not sent: {e}", msg.msg_type);
        }
    }

    /// Process one frame received from the transport.
    pub fn handle_frame(&mut self, frame: &[u8], now: Instant) -> Result<FrameOutcome, CollabError> {
        let Some(inbound) = self.relay.route(frame)? else {
            return Ok(FrameOutcome::Ignored);
        };
        let sender = ClientId(inbound.peer_id());
        if let Some(seen) = self.peer_seen.get_mut(&sender) {
            *seen = now;
        }

        let outcome = match inbound {
            Inbound::Update { peer_id, clock, update } => {
                trace!("Update #{clock} from {peer_id} ({} bytes)", update.len());
                self.apply_remote(&update)?
            }
            Inbound::SyncStep1 { peer_id, state_vector } => {
                let diff = self.replica.encode_diff(&state_vector)?;
                debug!("Answering sync step 1 from {peer_id} with {} bytes", diff.len());
                self.reply(SyncMessage::sync_step2(
                    self.client_id.as_uuid(),
                    self.doc_id,
                    diff.into_bytes(),
                ));
                FrameOutcome::Ignored
            }
            Inbound::SyncStep2 { diff, .. } => self.apply_remote(&diff)?,
            Inbound::Awareness { payload, .. } => {
                if self.awareness.apply_remote(&payload, now)? {
                    FrameOutcome::AwarenessChanged
                } else {
                    FrameOutcome::Ignored
                }
            }
            Inbound::PeerJoined { peer_id, user } => {
                info!("Peer {} ({}) joined", peer_id, user.name);
                self.peers.insert(ClientId(peer_id), user.clone());
                self.peer_seen.insert(ClientId(peer_id), now);
                // Pull anything the joiner holds that never reached us.
                self.reply(SyncMessage::sync_step1(
                    self.client_id.as_uuid(),
                    self.doc_id,
                    self.replica.state_vector(),
                ));
                self.rebroadcast_awareness(now)?;
                FrameOutcome::PeerJoined(user)
            }
            Inbound::PeerLeft { peer_id } => {
                let client = ClientId(peer_id);
                self.forget_peer(client);
                info!("Peer {peer_id} left");
                FrameOutcome::PeerLeft(client)
            }
            Inbound::Ping { .. } => {
                self.reply(SyncMessage::pong(self.client_id.as_uuid(), self.doc_id));
                FrameOutcome::Ignored
            }
            Inbound::Pong { peer_id } => {
                trace!("Pong from {peer_id}");
                FrameOutcome::Ignored
            }
        };
        Ok(outcome)
    }

    fn apply_remote(&mut self, update: &[u8]) -> Result<FrameOutcome, CollabError> {
        self.replica.apply_remote(update)?;
        self.attribution.verify(&self.replica.attribution());
        Ok(FrameOutcome::DocumentChanged)
    }

    /// Periodic housekeeping: expire silent peers, renew our presence,
    /// retry frames held back by backpressure.
    ///
    /// A peer counts as gone once its awareness entry times out, or once it
    /// has sent nothing at all for the liveness timeout.
    pub fn tick(&mut self, now: Instant) -> Result<Vec<ClientId>, CollabError> {
        let mut expired = self.awareness.expire(now);
        for client in &expired {
            self.peers.remove(client);
            self.peer_seen.remove(client);
        }

        let timeout = self.liveness_timeout;
        let silent: Vec<ClientId> = self
            .peer_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for client in silent {
            debug!("Peer {client} silent past the liveness timeout");
            self.forget_peer(client);
            expired.push(client);
        }

        if self.relay.is_connected() {
            if let Some(payload) = self.awareness.renew(now)? {
                self.relay.ship_awareness(self.awareness.local_clock(), payload);
                self.last_heartbeat = Some(now);
            } else if self.awareness.local_state().is_none() && self.heartbeat_due(now) {
                // Without presence to renew, a ping keeps peers counting us as live.
                self.reply(SyncMessage::ping(self.client_id.as_uuid(), self.doc_id));
                self.last_heartbeat = Some(now);
            }
            self.relay.flush();
        }
        Ok(expired)
    }

    fn heartbeat_due(&self, now: Instant) -> bool {
        self.last_heartbeat
            .map_or(true, |at| now.saturating_duration_since(at) >= self.heartbeat_interval)
    }

    fn forget_peer(&mut self, client: ClientId) {
        self.peers.remove(&client);
        self.peer_seen.remove(&client);
        self.awareness.remove_client(client);
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Whether enough updates accumulated to warrant a new snapshot.
    pub fn snapshot_due(&self) -> bool {
        self.schedule.is_due()
    }

    /// Compress the full document state for the persistence collaborator.
    pub fn export_snapshot(&mut self) -> Result<CompressedSnapshot, CollabError> {
        let state = self.replica.encode_state();
        let snapshot = CompressedSnapshot::compress(self.generated, state.as_bytes())?;
        self.schedule.reset();
        Ok(snapshot)
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn snapshot(&self) -> DocumentState {
        self.replica.snapshot()
    }

    pub fn attribution(&self) -> Attribution {
        self.replica.attribution()
    }

    pub fn is_attributed(&self) -> bool {
        self.attribution.is_attributed()
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn user(&self) -> &UserIdentity {
        self.attribution.user()
    }

    pub fn is_connected(&self) -> bool {
        self.relay.is_connected()
    }

    /// Updates waiting for a transport.
    pub fn pending_updates(&self) -> usize {
        self.relay.pending()
    }

    /// Peers announced via `PeerJoined` and not yet departed.
    pub fn peers(&self) -> &HashMap<ClientId, UserIdentity> {
        &self.peers
    }

    pub fn awareness(&self) -> &AwarenessChannel {
        &self.awareness
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn transport_mut(&mut self) -> Option<&mut T> {
        self.relay.transport_mut()
    }
}
