use crate::snapshot::Snapshot;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Load the most recent valid snapshot of `kind` from a directory.
///
/// Returns None if no snapshots exist or all are corrupt. Tries snapshots from
/// newest to oldest until one loads successfully.
pub fn load_latest_snapshot<T: DeserializeOwned>(
    snapshot_dir: &Path,
    kind: &str,
) -> Result<Option<Snapshot<T>>> {
    if !snapshot_dir.exists() {
        info!(
            directory = %snapshot_dir.display(),
            "Snapshot directory does not exist, starting without snapshot"
        );
        return Ok(None);
    }

    let mut snapshots = list_snapshots(snapshot_dir, kind)?;
    if snapshots.is_empty() {
        info!(kind, "No snapshots found");
        return Ok(None);
    }

    // Newest first
    snapshots.sort_by(|a, b| b.cmp(a));

    for path in snapshots {
        match Snapshot::<T>::load_from_file(&path) {
            Ok(snapshot) => {
                info!(
                    path = %path.display(),
                    items = snapshot.item_count(),
                    "Loaded snapshot"
                );
                return Ok(Some(snapshot));
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Corrupt snapshot, trying next oldest"
                );
            }
        }
    }

    error!(kind, "All snapshots are corrupt, starting without snapshot");
    Ok(None)
}

/// Snapshot files of `kind` in the directory, unsorted.
pub(crate) fn list_snapshots(snapshot_dir: &Path, kind: &str) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(snapshot_dir).context("Failed to read snapshot directory")?;
    let prefix = format!("{}-", kind);

    let mut snapshots = Vec::new();
    for entry in entries {
        let path = entry.context("Failed to read directory entry")?.path();
        if !path.is_file() {
            continue;
        }
        if let Some(filename) = path.file_name().and_then(|n| n.to_str()) {
            if filename.starts_with(&prefix) && filename.ends_with(".json.gz") {
                snapshots.push(path);
            }
        }
    }

    Ok(snapshots)
}
