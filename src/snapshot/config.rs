use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for snapshot files
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Write snapshots at all
    pub enabled: bool,

    /// Directory to store snapshots
    pub directory: PathBuf,

    /// Number of snapshots to keep (delete oldest)
    pub keep_count: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from("data/snapshots"),
            keep_count: 10,
        }
    }
}
