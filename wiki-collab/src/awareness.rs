//! Awareness channel: ephemeral per-client presence.
//!
//! Awareness is deliberately kept out of the replicated document. It is
//! never persisted and never enters undo history.
//!
//! ```text
//!  set_local_state() ──► AwarenessUpdate { client, clock+1, state } ──► wire
//!
//!  wire ──► apply_remote()
//!             │  clock > known            → accept
//!             │  clock == known, state None → accept (removal)
//!             │  otherwise                 → drop
//!             ▼
//!          entries ──► subscribers (AwarenessEvent)
//!
//!  tick: expire() drops entries silent past the liveness timeout,
//!        renew() re-broadcasts the local state before peers expire it
//! ```
//!
//! Reference: Kleppmann, DDIA Chapter 8 (Broadcast Protocols)

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::config::CollabConfig;
use crate::error::CollabError;
use crate::protocol::{ClientId, UserIdentity};
use crate::replica::LogicalPosition;

// ───────────────────────────────────────────────────────────────────
// Wire types
// ───────────────────────────────────────────────────────────────────

/// A selection expressed in logical positions. `anchor == head` is a caret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: LogicalPosition,
    pub head: LogicalPosition,
}

/// The fields a client publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessFields {
    pub user: UserIdentity,
    pub selection: Option<Selection>,
}

impl AwarenessFields {
    pub fn new(user: UserIdentity) -> Self {
        Self { user, selection: None }
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = Some(selection);
        self
    }
}

/// One awareness broadcast. `state: None` announces removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub client_id: ClientId,
    pub clock: u64,
    pub state: Option<AwarenessFields>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, CollabError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::MalformedAwareness(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CollabError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CollabError::MalformedAwareness(e.to_string()))?;
        Ok(update)
    }
}

// ───────────────────────────────────────────────────────────────────
// Local bookkeeping
// ───────────────────────────────────────────────────────────────────

/// Latest accepted state of a remote client.
#[derive(Debug, Clone)]
pub struct AwarenessEntry {
    pub state: AwarenessFields,
    pub clock: u64,
    /// Last accepted update, renewals included
    pub updated_at: Instant,
    /// Last time `state` actually differed from the previous one
    pub changed_at: Instant,
}

/// Change notification delivered to subscribers.
#[derive(Debug, Clone)]
pub struct AwarenessEvent {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    /// All known states after the change, local included
    pub states: Arc<BTreeMap<ClientId, AwarenessFields>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn FnMut(&AwarenessEvent) + Send>;

#[derive(Default)]
struct Changes {
    added: Vec<ClientId>,
    updated: Vec<ClientId>,
    removed: Vec<ClientId>,
}

/// Highest clock accepted from a client, and when.
#[derive(Debug, Clone, Copy)]
struct ClockRecord {
    clock: u64,
    seen_at: Instant,
}

impl Changes {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Presence state for one session.
pub struct AwarenessChannel {
    local_id: ClientId,
    local_clock: u64,
    local_state: Option<AwarenessFields>,
    last_broadcast: Option<Instant>,
    entries: BTreeMap<ClientId, AwarenessEntry>,
    /// Highest clock seen per client; outlives removed entries until pruned
    clocks: HashMap<ClientId, ClockRecord>,
    liveness_timeout: Duration,
    renew_interval: Duration,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
}

impl fmt::Debug for AwarenessChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwarenessChannel")
            .field("local_id", &self.local_id)
            .field("local_clock", &self.local_clock)
            .field("remote_entries", &self.entries.len())
            .field("known_clocks", &self.clocks.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl AwarenessChannel {
    pub fn new(local_id: ClientId, config: &CollabConfig) -> Self {
        Self {
            local_id,
            local_clock: 0,
            local_state: None,
            last_broadcast: None,
            entries: BTreeMap::new(),
            clocks: HashMap::new(),
            liveness_timeout: config.liveness_timeout,
            renew_interval: config.renew_interval,
            listeners: Vec::new(),
            next_subscription: 0,
        }
    }

    /// Replace the local state and return the encoded broadcast.
    pub fn set_local_state(
        &mut self,
        fields: AwarenessFields,
        now: Instant,
    ) -> Result<Vec<u8>, CollabError> {
        let mut changes = Changes::default();
        match &self.local_state {
            None => changes.added.push(self.local_id),
            Some(previous) if *previous != fields => changes.updated.push(self.local_id),
            Some(_) => {}
        }
        self.local_state = Some(fields);
        let encoded = self.bump_and_encode(now)?;
        self.emit(changes);
        Ok(encoded)
    }

    /// Withdraw the local state and return the encoded removal.
    pub fn clear_local_state(&mut self, now: Instant) -> Result<Vec<u8>, CollabError> {
        let mut changes = Changes::default();
        if self.local_state.take().is_some() {
            changes.removed.push(self.local_id);
        }
        let encoded = self.bump_and_encode(now)?;
        self.emit(changes);
        Ok(encoded)
    }

    /// Re-broadcast the current local state with a fresh clock.
    pub fn broadcast_local(&mut self, now: Instant) -> Result<Option<Vec<u8>>, CollabError> {
        if self.local_state.is_none() {
            return Ok(None);
        }
        self.bump_and_encode(now).map(Some)
    }

    /// Re-broadcast the local state if the renewal interval has elapsed.
    pub fn renew(&mut self, now: Instant) -> Result<Option<Vec<u8>>, CollabError> {
        let due = self
            .last_broadcast
            .map_or(true, |at| now.saturating_duration_since(at) >= self.renew_interval);
        if !due {
            return Ok(None);
        }
        self.broadcast_local(now)
    }

    fn bump_and_encode(&mut self, now: Instant) -> Result<Vec<u8>, CollabError> {
        self.local_clock += 1;
        self.last_broadcast = Some(now);
        AwarenessUpdate {
            client_id: self.local_id,
            clock: self.local_clock,
            state: self.local_state.clone(),
        }
        .encode()
    }

    /// Merge a remote awareness payload. Returns whether anything changed.
    ///
    /// Stale clocks and echoes of our own state are ignored, not errors.
    pub fn apply_remote(&mut self, payload: &[u8], now: Instant) -> Result<bool, CollabError> {
        let update = AwarenessUpdate::decode(payload)?;
        if update.client_id == self.local_id {
            return Ok(false);
        }

        let known = self.clocks.get(&update.client_id).map(|r| r.clock);
        let accept = match known {
            None => true,
            Some(k) => update.clock > k || (update.clock == k && update.state.is_none()),
        };
        if !accept {
            trace!(
                "Stale awareness from {} (clock {} <= {:?})",
                update.client_id,
                update.clock,
                known
            );
            return Ok(false);
        }
        self.clocks.insert(
            update.client_id,
            ClockRecord {
                clock: update.clock,
                seen_at: now,
            },
        );

        let mut changes = Changes::default();
        match update.state {
            Some(state) => match self.entries.get_mut(&update.client_id) {
                Some(entry) => {
                    if entry.state != state {
                        entry.state = state;
                        entry.changed_at = now;
                        changes.updated.push(update.client_id);
                    }
                    entry.clock = update.clock;
                    entry.updated_at = now;
                }
                None => {
                    self.entries.insert(
                        update.client_id,
                        AwarenessEntry {
                            state,
                            clock: update.clock,
                            updated_at: now,
                            changed_at: now,
                        },
                    );
                    changes.added.push(update.client_id);
                }
            },
            None => {
                if self.entries.remove(&update.client_id).is_some() {
                    changes.removed.push(update.client_id);
                }
            }
        }

        let changed = !changes.is_empty();
        self.emit(changes);
        Ok(changed)
    }

    /// Forget a client that left. Its clock is kept so late frames stay stale.
    pub fn remove_client(&mut self, client_id: ClientId) -> bool {
        if self.entries.remove(&client_id).is_none() {
            return false;
        }
        self.emit(Changes {
            removed: vec![client_id],
            ..Default::default()
        });
        true
    }

    /// Drop remote entries silent for longer than the liveness timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<ClientId> {
        let timeout = self.liveness_timeout;
        let expired: Vec<ClientId> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.updated_at) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.entries.remove(id);
            debug!("Awareness entry for {id} timed out");
        }

        // Clocks of departed clients only guard against late frames.
        let retention = timeout * 2;
        let entries = &self.entries;
        self.clocks.retain(|id, record| {
            entries.contains_key(id) || now.saturating_duration_since(record.seen_at) <= retention
        });
        if !expired.is_empty() {
            self.emit(Changes {
                removed: expired.clone(),
                ..Default::default()
            });
        }
        expired
    }

    // ── Subscriptions ──────────────────────────────────────────────

    /// Register a change listener.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&AwarenessEvent) + Send + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    fn emit(&mut self, changes: Changes) {
        if changes.is_empty() || self.listeners.is_empty() {
            return;
        }
        let event = AwarenessEvent {
            added: changes.added,
            updated: changes.updated,
            removed: changes.removed,
            states: Arc::new(self.states()),
        };
        for (_, listener) in &mut self.listeners {
            listener(&event);
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    /// All known states, local included.
    pub fn states(&self) -> BTreeMap<ClientId, AwarenessFields> {
        let mut states: BTreeMap<ClientId, AwarenessFields> = self
            .entries
            .iter()
            .map(|(id, e)| (*id, e.state.clone()))
            .collect();
        if let Some(local) = &self.local_state {
            states.insert(self.local_id, local.clone());
        }
        states
    }

    /// Remote entries with their timestamps.
    pub fn entries(&self) -> &BTreeMap<ClientId, AwarenessEntry> {
        &self.entries
    }

    pub fn local_state(&self) -> Option<&AwarenessFields> {
        self.local_state.as_ref()
    }

    pub fn local_clock(&self) -> u64 {
        self.local_clock
    }

    pub fn local_id(&self) -> ClientId {
        self.local_id
    }

    /// Clients whose last clock is still remembered.
    pub fn known_clients(&self) -> usize {
        self.clocks.len()
    }
}
