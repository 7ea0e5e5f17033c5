//! Replicated document store backed by a yrs `Doc`.
//!
//! ```text
//!  Mutation ──► apply_local() ──► TransactionMut (origin "local:<client>")
//!                                    │  ├── content / properties change
//!                                    │  └── attribution (first edit only)
//!                                    ▼
//!                                DocUpdate (v1 bytes) ──► transport
//!
//!  transport ──► apply_remote() ──► TransactionMut (origin "remote")
//! ```
//!
//! Convergence and the concurrent-insert tie-break are yrs' YATA rules:
//! items racing for the same position are ordered by origin links and then
//! by ascending yrs client id, so every replica settles on the same text.
//!
//! Reference: Nicolaescu et al., YATA (GROUP 2016)

use std::collections::BTreeMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Assoc, Doc, GetString, IndexedSequence, Map, MapRef, Out, ReadTxn, StateVector,
    StickyIndex, Text, TextRef, Transact, Update,
};

use crate::attribution::{Attribution, IdentityAttribution};
use crate::error::CollabError;
use crate::protocol::ClientId;

const CONTENT: &str = "content";
const PROPERTIES: &str = "properties";
const ATTRIBUTION: &str = "attribution";
const REMOTE_ORIGIN: &str = "remote";

/// An opaque binary delta produced by one local transaction or a resync diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocUpdate(Vec<u8>);

impl DocUpdate {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for DocUpdate {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// A structured edit issued by the editing surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Insert { index: u32, text: String },
    Delete { index: u32, len: u32 },
    Replace { index: u32, len: u32, text: String },
    SetProperty { key: String, value: String },
    RemoveProperty { key: String },
}

impl Mutation {
    pub fn insert(index: u32, text: impl Into<String>) -> Self {
        Mutation::Insert { index, text: text.into() }
    }

    pub fn delete(index: u32, len: u32) -> Self {
        Mutation::Delete { index, len }
    }
}

/// Plain read model of the replicated document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentState {
    pub content: String,
    pub properties: BTreeMap<String, String>,
    /// `client id → user id`
    pub attribution: BTreeMap<String, String>,
}

/// Reference into the text that survives concurrent edits.
///
/// Wraps a v1-encoded yrs `StickyIndex` so it can ride inside awareness
/// payloads without this crate's callers touching yrs types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalPosition(pub Vec<u8>);

/// One replica of the shared document.
pub struct Replica {
    client_id: ClientId,
    doc: Doc,
    content: TextRef,
    properties: MapRef,
    attribution: MapRef,
    local_origin: String,
}

impl Replica {
    /// Create an empty replica for the given session.
    pub fn new(client_id: ClientId) -> Self {
        let doc = Doc::new();
        let content = doc.get_or_insert_text(CONTENT);
        let properties = doc.get_or_insert_map(PROPERTIES);
        let attribution = doc.get_or_insert_map(ATTRIBUTION);
        Self {
            client_id,
            doc,
            content,
            properties,
            attribution,
            local_origin: format!("local:{client_id}"),
        }
    }

    /// Seed a fresh replica from a full-state update (e.g. a stored snapshot).
    ///
    /// Seeded content is applied as remote history, so it is not undoable.
    pub fn from_state(client_id: ClientId, state: &[u8]) -> Result<Self, CollabError> {
        let replica = Self::new(client_id);
        replica.apply_remote(state)?;
        Ok(replica)
    }

    /// Apply a local mutation optimistically and return the update to ship.
    ///
    /// The mutation is validated before any transaction opens, so a rejected
    /// mutation leaves the replica untouched. On the session's first content
    /// mutation the attribution record is written in the same transaction.
    pub fn apply_local(
        &self,
        mutation: &Mutation,
        attribution: &mut IdentityAttribution,
    ) -> Result<DocUpdate, CollabError> {
        self.validate(mutation)?;

        let mut txn = self.doc.transact_mut_with(self.local_origin.as_str());
        match mutation {
            Mutation::Insert { index, text } => {
                self.content.insert(&mut txn, *index, text);
            }
            Mutation::Delete { index, len } => {
                self.content.remove_range(&mut txn, *index, *len);
            }
            Mutation::Replace { index, len, text } => {
                if *len > 0 {
                    self.content.remove_range(&mut txn, *index, *len);
                }
                if !text.is_empty() {
                    self.content.insert(&mut txn, *index, text);
                }
            }
            Mutation::SetProperty { key, value } => {
                self.properties.insert(&mut txn, key.as_str(), value.clone());
            }
            Mutation::RemoveProperty { key } => {
                self.properties.remove(&mut txn, key);
            }
        }
        attribution.record(&mut txn, &self.attribution);

        Ok(DocUpdate(txn.encode_update_v1()))
    }

    fn validate(&self, mutation: &Mutation) -> Result<(), CollabError> {
        let txn = self.doc.transact();
        let doc_len = self.content.len(&txn);
        match mutation {
            Mutation::Insert { index, text } => {
                if text.is_empty() {
                    return Err(CollabError::EmptyMutation);
                }
                if *index > doc_len {
                    return Err(CollabError::OutOfBounds { index: *index, len: 0, doc_len });
                }
                check_boundaries(&self.content.get_string(&txn), *index, 0)?;
            }
            Mutation::Delete { index, len } => {
                if *len == 0 {
                    return Err(CollabError::EmptyMutation);
                }
                check_range(*index, *len, doc_len)?;
                check_boundaries(&self.content.get_string(&txn), *index, *len)?;
            }
            Mutation::Replace { index, len, text } => {
                if *len == 0 && text.is_empty() {
                    return Err(CollabError::EmptyMutation);
                }
                check_range(*index, *len, doc_len)?;
                check_boundaries(&self.content.get_string(&txn), *index, *len)?;
            }
            Mutation::SetProperty { key, .. } => {
                if key.is_empty() {
                    return Err(CollabError::EmptyMutation);
                }
            }
            Mutation::RemoveProperty { key } => {
                if !self.properties.contains_key(&txn, key) {
                    return Err(CollabError::EmptyMutation);
                }
            }
        }
        Ok(())
    }

    /// Merge a remote update. Duplicate or out-of-order delivery is safe.
    ///
    /// Undecodable payloads are rejected before a transaction opens.
    pub fn apply_remote(&self, update: &[u8]) -> Result<(), CollabError> {
        let decoded = Update::decode_v1(update).map_err(|e| {
            warn!("Rejected malformed update ({} bytes): {e}", update.len());
            CollabError::MalformedUpdate(e.to_string())
        })?;

        let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
        txn.apply_update(decoded).map_err(|e| {
            warn!("Failed to integrate update ({} bytes): {e}", update.len());
            CollabError::MalformedUpdate(e.to_string())
        })?;
        Ok(())
    }

    /// Current content, properties, and attribution as plain data.
    pub fn snapshot(&self) -> DocumentState {
        let txn = self.doc.transact();
        DocumentState {
            content: self.content.get_string(&txn),
            properties: read_string_map(&self.properties, &txn),
            attribution: read_string_map(&self.attribution, &txn),
        }
    }

    /// Current attribution map.
    pub fn attribution(&self) -> Attribution {
        let txn = self.doc.transact();
        Attribution::from(read_string_map(&self.attribution, &txn))
    }

    /// Text length in yrs offset units.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.content.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode the replica's state vector.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode everything this replica has that `state_vector` lacks.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<DocUpdate, CollabError> {
        let sv = StateVector::decode_v1(state_vector)?;
        let txn = self.doc.transact();
        Ok(DocUpdate(txn.encode_diff_v1(&sv)))
    }

    /// Encode the complete document state.
    pub fn encode_state(&self) -> DocUpdate {
        let txn = self.doc.transact();
        DocUpdate(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    /// Create a logical position at `index`, clamped to the text length and
    /// moved back to the start of any character it lands inside.
    pub fn logical_position(&self, index: u32) -> Result<LogicalPosition, CollabError> {
        let mut txn = self.doc.transact_mut();
        let index = floor_char_boundary(&self.content.get_string(&txn), index);
        self.content
            .sticky_index(&mut txn, index, Assoc::After)
            .map(|sticky| LogicalPosition(sticky.encode_v1()))
            .ok_or(CollabError::PositionUnavailable(index))
    }

    /// Resolve a logical position to a current index.
    ///
    /// Positions referencing content this replica has not seen yet, or that
    /// resolve past the end, clamp to the text length. Returns `None` only
    /// when the position bytes cannot be decoded.
    pub fn resolve_position(&self, position: &LogicalPosition) -> Option<u32> {
        let sticky = match StickyIndex::decode_v1(&position.0) {
            Ok(sticky) => sticky,
            Err(e) => {
                debug!("Undecodable logical position: {e}");
                return None;
            }
        };

        let txn = self.doc.transact();
        let len = self.content.len(&txn);
        let index = sticky.get_offset(&txn).map_or(len, |offset| offset.index);
        Some(index.min(len))
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub(crate) fn doc(&self) -> &Doc {
        &self.doc
    }

    pub(crate) fn content(&self) -> &TextRef {
        &self.content
    }

    pub(crate) fn properties(&self) -> &MapRef {
        &self.properties
    }

    pub(crate) fn local_origin(&self) -> &str {
        &self.local_origin
    }
}

fn check_range(index: u32, len: u32, doc_len: u32) -> Result<(), CollabError> {
    match index.checked_add(len) {
        Some(end) if end <= doc_len => Ok(()),
        _ => Err(CollabError::OutOfBounds { index, len, doc_len }),
    }
}

/// Offsets are UTF-8 bytes; both ends of the range must fall between characters.
fn check_boundaries(content: &str, index: u32, len: u32) -> Result<(), CollabError> {
    for offset in [index, index + len] {
        if !content.is_char_boundary(offset as usize) {
            return Err(CollabError::NotCharBoundary { index: offset });
        }
    }
    Ok(())
}

/// Largest character boundary at or below `index`.
fn floor_char_boundary(content: &str, index: u32) -> u32 {
    let mut index = (index as usize).min(content.len());
    while !content.is_char_boundary(index) {
        index -= 1;
    }
    index as u32
}

fn read_string_map<T: ReadTxn>(map: &MapRef, txn: &T) -> BTreeMap<String, String> {
    map.iter(txn)
        .map(|(key, value)| {
            let value = match value {
                Out::Any(Any::String(s)) => s.to_string(),
                other => other.to_string(txn),
            };
            (key.to_string(), value)
        })
        .collect()
}
