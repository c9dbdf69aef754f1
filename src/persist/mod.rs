//! Durable point storage.
//!
//! The store is payload-opaque: it keeps a position and a serialized record per ID.
//! Decoding (and legacy migration) happens in the entity store at load time.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;

mod sqlite;

pub use sqlite::SqlitePointStore;

/// A persisted point.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredPoint {
    pub lat: f64,
    pub lon: f64,
    /// Serialized entity record
    pub record: String,
}

/// Durable key/value store for points.
pub trait PointStore: Send + Sync {
    /// Insert or replace the point for `id`.
    fn save(&self, id: &str, point: &StoredPoint) -> Result<()>;

    /// Delete the point for `id`. Deleting a missing ID is not an error.
    fn delete(&self, id: &str) -> Result<()>;

    /// Every persisted point keyed by ID.
    fn list(&self) -> Result<HashMap<String, StoredPoint>>;

    /// Release the underlying resources. Later calls fail.
    fn close(&self) -> Result<()>;
}

/// In-memory point store for tests and persistence-disabled runs.
#[derive(Default)]
pub struct MemoryPointStore {
    points: Mutex<HashMap<String, StoredPoint>>,
}

impl MemoryPointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PointStore for MemoryPointStore {
    fn save(&self, id: &str, point: &StoredPoint) -> Result<()> {
        self.points
            .lock()
            .unwrap()
            .insert(id.to_string(), point.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.points.lock().unwrap().remove(id);
        Ok(())
    }

    fn list(&self) -> Result<HashMap<String, StoredPoint>> {
        Ok(self.points.lock().unwrap().clone())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
