use crate::snapshot::{config::SnapshotConfig, recovery, Snapshot};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, error, info};

/// Writes snapshots of one record kind and prunes old ones.
pub struct SnapshotManager {
    config: SnapshotConfig,
    kind: String,
}

impl SnapshotManager {
    pub fn new(config: SnapshotConfig, kind: impl Into<String>) -> Self {
        Self {
            config,
            kind: kind.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Save `items` as a new snapshot and prune old ones.
    ///
    /// Returns the written path, or `None` when snapshots are disabled.
    pub fn save<T: Serialize>(&self, items: Vec<T>) -> Result<Option<PathBuf>> {
        if !self.config.enabled {
            return Ok(None);
        }

        fs::create_dir_all(&self.config.directory)
            .context("Failed to create snapshot directory")?;

        let snapshot = Snapshot::new(self.kind.clone(), items);
        let count = snapshot.item_count();
        let path = self.snapshot_path();
        snapshot.save_to_file(&path)?;

        debug!(
            kind = %self.kind,
            items = count,
            path = %path.display(),
            "Snapshot saved"
        );

        self.cleanup_old_snapshots()?;

        Ok(Some(path))
    }

    /// Newest readable snapshot of this kind, skipping corrupt files.
    pub fn load_latest<T: DeserializeOwned>(&self) -> Result<Option<Snapshot<T>>> {
        recovery::load_latest_snapshot(&self.config.directory, &self.kind)
    }

    /// Format: {kind}-{timestamp}.json.gz
    /// Example: couriers-20260212T153045.123456Z.json.gz
    fn snapshot_path(&self) -> PathBuf {
        let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        let filename = format!("{}-{}.json.gz", self.kind, timestamp);
        self.config.directory.join(filename)
    }

    /// Delete old snapshots, keeping only the most recent N
    fn cleanup_old_snapshots(&self) -> Result<()> {
        let mut snapshots = recovery::list_snapshots(&self.config.directory, &self.kind)?;

        if snapshots.len() <= self.config.keep_count {
            return Ok(());
        }

        // Timestamp is lexicographically sortable
        snapshots.sort();

        let delete_count = snapshots.len() - self.config.keep_count;
        for path in &snapshots[..delete_count] {
            if let Err(e) = fs::remove_file(path) {
                error!(error = %e, path = %path.display(), "Failed to delete old snapshot");
            } else {
                info!(path = %path.display(), "Deleted old snapshot");
            }
        }

        Ok(())
    }
}
