//! Durable snapshots for the persistence collaborator.
//!
//! A snapshot is the full encoded document state, LZ4-compressed. The
//! schedule counts shipped updates and tells the host when another
//! snapshot is worth taking.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │          CompressedSnapshot              │
//! │  version │ original_size │ LZ4 payload   │
//! └──────────────────────────────────────────┘
//!        ▲ export_snapshot()      │ from_snapshot()
//!        │                        ▼
//!     Replica ◄──────────── decompress + apply
//! ```
//!
//! Reference: Kleppmann, DDIA Chapter 3 (Log-Structured Storage)

use std::fs;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::CollabError;

/// Largest uncompressed state a snapshot may carry.
pub const MAX_SNAPSHOT_BYTES: u32 = 512 * 1024 * 1024;

/// A compressed full-state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedSnapshot {
    /// Number of updates this session had shipped when the snapshot was taken
    pub version: u64,
    /// Uncompressed size in bytes
    pub original_size: u32,
    /// LZ4 block, size-prepended
    pub compressed: Vec<u8>,
}

impl CompressedSnapshot {
    pub fn compress(version: u64, state: &[u8]) -> Result<Self, CollabError> {
        let original_size = u32::try_from(state.len())
            .ok()
            .filter(|size| *size <= MAX_SNAPSHOT_BYTES)
            .ok_or_else(|| {
                CollabError::Snapshot(format!("state of {} bytes is too large", state.len()))
            })?;
        Ok(Self {
            version,
            original_size,
            compressed: lz4_flex::compress_prepend_size(state),
        })
    }

    /// Decompress and check the recorded size.
    ///
    /// The LZ4 size prefix must agree with `original_size` before anything
    /// is allocated for the output.
    pub fn decompress(&self) -> Result<Vec<u8>, CollabError> {
        if self.original_size > MAX_SNAPSHOT_BYTES {
            return Err(CollabError::Snapshot(format!(
                "declared size {} exceeds limit",
                self.original_size
            )));
        }
        let prefix = self
            .compressed
            .get(..4)
            .and_then(|b| <[u8; 4]>::try_from(b).ok())
            .map(u32::from_le_bytes)
            .ok_or_else(|| CollabError::Snapshot("truncated payload".to_string()))?;
        if prefix != self.original_size {
            return Err(CollabError::Snapshot(format!(
                "size prefix {prefix} disagrees with recorded size {}",
                self.original_size
            )));
        }

        let state = lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| CollabError::Snapshot(format!("decompression failed: {e}")))?;
        if state.len() != self.original_size as usize {
            return Err(CollabError::Snapshot(format!(
                "size mismatch: expected {}, got {}",
                self.original_size,
                state.len()
            )));
        }
        Ok(state)
    }

    pub fn compression_ratio(&self) -> f64 {
        if self.compressed.is_empty() {
            return 0.0;
        }
        self.original_size as f64 / self.compressed.len() as f64
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CollabError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::Snapshot(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CollabError> {
        let (snapshot, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CollabError::Snapshot(e.to_string()))?;
        Ok(snapshot)
    }

    /// Write the snapshot to a file.
    pub fn save(&self, path: &Path) -> Result<(), CollabError> {
        let bytes = self.to_bytes()?;
        fs::write(path, &bytes)
            .map_err(|e| CollabError::Snapshot(format!("write {}: {e}", path.display())))?;
        debug!("Saved snapshot v{} ({} bytes) to {}", self.version, bytes.len(), path.display());
        Ok(())
    }

    /// Read a snapshot previously written with [`save`](Self::save).
    pub fn load(path: &Path) -> Result<Self, CollabError> {
        let bytes = fs::read(path)
            .map_err(|e| CollabError::Snapshot(format!("read {}: {e}", path.display())))?;
        Self::from_bytes(&bytes)
    }
}

/// Counts shipped updates between snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotSchedule {
    threshold: usize,
    updates_since: usize,
}

impl SnapshotSchedule {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            updates_since: 0,
        }
    }

    /// Count one update. Returns `true` once a snapshot is due.
    pub fn record(&mut self) -> bool {
        self.updates_since += 1;
        self.is_due()
    }

    pub fn is_due(&self) -> bool {
        self.updates_since >= self.threshold
    }

    pub fn reset(&mut self) {
        self.updates_since = 0;
    }

    pub fn updates_since(&self) -> usize {
        self.updates_since
    }
}
