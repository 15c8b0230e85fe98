//! Configuration types for LedgerFS
//!
//! This module defines the per-volume configuration consumed by the
//! metadata engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a single metadata volume
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Volume name (human-readable identifier)
    pub volume_name: String,
    /// Object-store account owning the checkpoint container
    pub account_name: String,
    /// Container holding checkpoint objects and the checkpoint header
    pub checkpoint_container_name: String,
    /// Storage policy applied when auto-formatting the container
    pub checkpoint_container_storage_policy: String,
    /// Local replay-log file; `None` disables the replay log entirely
    pub replay_log_path: Option<PathBuf>,
    /// Interval between timer-driven checkpoints
    pub checkpoint_interval: Duration,
    /// Close the open checkpoint object once it has grown past this size
    pub max_flush_size: u64,
    /// How many nonces to reserve (durably) at a time
    pub nonce_reserve_step: u64,
    /// Maximum entries per inode-record metadata node
    pub max_inodes_per_metadata_node: usize,
    /// Maximum entries per log-segment-record metadata node
    pub max_log_segments_per_metadata_node: usize,
    /// Maximum entries per B+Tree-object metadata node
    pub max_objects_per_metadata_node: usize,
    /// Capacity (in nodes) of each tree's node cache
    pub metadata_node_cache_entries: usize,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            volume_name: "volume0".to_string(),
            account_name: "AUTH_ledgerfs".to_string(),
            checkpoint_container_name: ".__checkpoint__".to_string(),
            checkpoint_container_storage_policy: "default".to_string(),
            replay_log_path: None,
            checkpoint_interval: Duration::from_secs(10),
            max_flush_size: 10 * 1024 * 1024, // 10 MB
            nonce_reserve_step: 1000,
            max_inodes_per_metadata_node: 128,
            max_log_segments_per_metadata_node: 64,
            max_objects_per_metadata_node: 64,
            metadata_node_cache_entries: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VolumeConfig::default();
        assert_eq!(config.volume_name, "volume0");
        assert!(config.replay_log_path.is_none());
        assert_eq!(config.nonce_reserve_step, 1000);
        assert_eq!(config.checkpoint_interval, Duration::from_secs(10));
    }
}
