use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

pub mod config;
pub mod manager;
pub mod recovery;

pub use config::SnapshotConfig;
pub use manager::SnapshotManager;
pub use recovery::load_latest_snapshot;


/// Point-in-time copy of a set of records (courier state, for one).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot<T> {
    /// Snapshot format version
    pub snapshot_version: String,

    /// Timestamp when snapshot was created
    pub created_at: DateTime<Utc>,

    /// What the records are, e.g. "couriers"
    pub kind: String,

    pub items: Vec<T>,
}

impl<T> Snapshot<T> {
    pub fn new(kind: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            snapshot_version: "1".to_string(),
            created_at: Utc::now(),
            kind: kind.into(),
            items,
        }
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }
}

impl<T: Serialize> Snapshot<T> {
    /// Save snapshot to filesystem as compressed JSON (gzip)
    ///
    /// Uses atomic write: writes to .tmp file, fsyncs, then renames.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(self).context("Failed to serialize snapshot to JSON")?;

        let tmp_path = path.with_extension("tmp");
        {
            let tmp_file =
                File::create(&tmp_path).context("Failed to create temporary snapshot file")?;

            let mut encoder = GzEncoder::new(tmp_file, Compression::default());
            encoder
                .write_all(&json)
                .context("Failed to write compressed snapshot data")?;

            let file = encoder.finish().context("Failed to finish compression")?;
            file.sync_all()
                .context("Failed to sync snapshot file to disk")?;
        }

        fs::rename(&tmp_path, path).context("Failed to rename temporary snapshot file")?;

        Ok(())
    }
}

impl<T: DeserializeOwned> Snapshot<T> {
    /// Load snapshot from a compressed JSON file (.json.gz)
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).context("Failed to open snapshot file")?;

        let mut decoder = GzDecoder::new(file);
        let mut json = String::new();
        decoder
            .read_to_string(&mut json)
            .context("Failed to decompress snapshot file")?;

        serde_json::from_str(&json).context("Failed to deserialize snapshot JSON")
    }
}
