//! Tunables for a collaboration session.

use std::time::Duration;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Remote selections untouched for longer than this fade to zero opacity.
    pub recency_window: Duration,
    /// Remote awareness entries silent for longer than this are removed.
    pub liveness_timeout: Duration,
    /// Interval at which the local awareness state is re-broadcast.
    pub renew_interval: Duration,
    /// Maximum frames held while disconnected.
    pub offline_queue_capacity: usize,
    /// Shipped updates between durable snapshots.
    pub snapshot_threshold: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            recency_window: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(30),
            renew_interval: Duration::from_secs(15),
            offline_queue_capacity: 10_000,
            snapshot_threshold: 100,
        }
    }
}

impl CollabConfig {
    /// Config for testing (short windows, small queue).
    pub fn for_testing() -> Self {
        Self {
            recency_window: Duration::from_millis(200),
            liveness_timeout: Duration::from_millis(500),
            renew_interval: Duration::from_millis(100),
            offline_queue_capacity: 16,
            snapshot_threshold: 4,
        }
    }
}
