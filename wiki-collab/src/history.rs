//! Local undo/redo over the shared document.
//!
//! Only transactions carrying this session's local origin are captured, so
//! undo never reverts a collaborator's work. Remote updates arrive with the
//! `remote` origin and are invisible to the stack. Inverse operations are
//! ordinary local edits: they are shipped like any other update.
//!
//! ```text
//!  apply_local (origin local:<client>) ──► UndoManager stack ──seal()──► step
//!
//!  undo() ──► sv_before ──► undo_blocking() ──► diff since sv_before ──► DocUpdate
//! ```

use log::debug;
use yrs::{ReadTxn, StateVector, Transact, UndoManager};

use crate::replica::{DocUpdate, Replica};

/// Undo/redo stack scoped to one replica's local origin.
pub struct HistoryCoordinator {
    manager: UndoManager,
}

impl HistoryCoordinator {
    pub fn new(replica: &Replica) -> Self {
        let mut manager = UndoManager::new(replica.doc(), replica.content());
        manager.expand_scope(replica.properties());
        manager.include_origin(replica.local_origin());
        Self { manager }
    }

    /// Close the current undo step so the next edit starts a new one.
    pub fn seal(&mut self) {
        self.manager.reset();
    }

    /// Revert the most recent local step. Returns the update to ship.
    pub fn undo(&mut self, replica: &Replica) -> Option<DocUpdate> {
        let before = state_vector(replica);
        if !self.manager.undo_blocking() {
            debug!("Nothing to undo");
            return None;
        }
        Some(diff_since(replica, &before))
    }

    /// Re-apply the most recently undone step. Returns the update to ship.
    pub fn redo(&mut self, replica: &Replica) -> Option<DocUpdate> {
        let before = state_vector(replica);
        if !self.manager.redo_blocking() {
            debug!("Nothing to redo");
            return None;
        }
        Some(diff_since(replica, &before))
    }

    pub fn can_undo(&self) -> bool {
        self.manager.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.manager.can_redo()
    }

    /// Drop both stacks.
    pub fn clear(&mut self) {
        self.manager.clear();
    }
}

fn state_vector(replica: &Replica) -> StateVector {
    replica.doc().transact().state_vector()
}

fn diff_since(replica: &Replica, before: &StateVector) -> DocUpdate {
    DocUpdate::from(replica.doc().transact().encode_state_as_update_v1(before))
}
