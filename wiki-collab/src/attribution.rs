//! Client → user attribution.
//!
//! Each session writes exactly one entry into the replicated `attribution`
//! map, keyed by its own client id, inside the transaction of its first
//! local content mutation. Viewing a document never creates an entry.
//!
//! ```text
//!  Unattributed ──first successful apply_local──► Attributed
//! ```

use std::collections::{BTreeMap, BTreeSet};

use log::{info, warn};
use yrs::{Map, MapRef, TransactionMut};

use crate::protocol::{ClientId, UserIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributionState {
    Unattributed,
    Attributed,
}

/// Per-session attribution writer.
#[derive(Debug, Clone)]
pub struct IdentityAttribution {
    client_id: ClientId,
    user: UserIdentity,
    state: AttributionState,
}

impl IdentityAttribution {
    pub fn new(client_id: ClientId, user: UserIdentity) -> Self {
        Self {
            client_id,
            user,
            state: AttributionState::Unattributed,
        }
    }

    /// Write the mapping if this session has not done so yet.
    ///
    /// Must be called inside the transaction carrying the mutation so the
    /// mapping ships in the same update. Returns whether an entry was written.
    pub fn record(&mut self, txn: &mut TransactionMut, map: &MapRef) -> bool {
        if self.state == AttributionState::Attributed {
            return false;
        }
        map.insert(txn, self.client_id.to_string(), self.user.id.clone());
        self.state = AttributionState::Attributed;
        info!("Attributed client {} to user {}", self.client_id, self.user.id);
        true
    }

    /// Warn when the shared map holds a different user under our client id.
    ///
    /// Only this session should ever write its own slot.
    pub fn verify(&self, shared: &Attribution) -> bool {
        match shared.user_for(self.client_id) {
            Some(user) if user != self.user.id => {
                warn!(
                    "Attribution slot for client {} claims user {user}, expected {}",
                    self.client_id, self.user.id
                );
                false
            }
            _ => true,
        }
    }

    pub fn state(&self) -> AttributionState {
        self.state
    }

    pub fn is_attributed(&self) -> bool {
        self.state == AttributionState::Attributed
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }
}

/// Read model of the shared attribution map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attribution {
    entries: BTreeMap<String, String>,
}

impl Attribution {
    pub fn user_for(&self, client_id: ClientId) -> Option<&str> {
        self.entries.get(&client_id.to_string()).map(String::as_str)
    }

    /// Distinct users who have edited the document.
    pub fn contributors(&self) -> BTreeSet<&str> {
        self.entries.values().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(c, u)| (c.as_str(), u.as_str()))
    }
}

impl From<BTreeMap<String, String>> for Attribution {
    fn from(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }
}
