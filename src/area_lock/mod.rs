// Per-cell locks serializing fetch-then-insert work for one area

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Grid cell key: coordinates rounded to two decimals (~1 km).
pub type CellKey = (i32, i32);

pub fn cell_key(lat: f64, lon: f64) -> CellKey {
    ((lat * 100.0).round() as i32, (lon * 100.0).round() as i32)
}

/// Registry of one async mutex per grid cell.
///
/// Locks are created on first use and never removed; the number of cells an
/// instance touches is bounded by where its agents live.
#[derive(Default)]
pub struct AreaLocks {
    cells: DashMap<CellKey, Arc<Mutex<()>>>,
}

impl AreaLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for the cell containing (`lat`, `lon`), created if absent.
    pub fn lock_for(&self, lat: f64, lon: f64) -> Arc<Mutex<()>> {
        self.cells
            .entry(cell_key(lat, lon))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to the cell.
    pub async fn acquire(&self, lat: f64, lon: f64) -> OwnedMutexGuard<()> {
        self.lock_for(lat, lon).lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
