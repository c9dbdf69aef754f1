//! Point persistence using SQLite.

use super::{PointStore, StoredPoint};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// Persists entity points in SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE points (
///     id         TEXT PRIMARY KEY,
///     lat        REAL NOT NULL,
///     lon        REAL NOT NULL,
///     record     TEXT NOT NULL,   -- serialized entity JSON
///     updated_at TEXT NOT NULL    -- ISO 8601
/// );
/// ```
pub struct SqlitePointStore {
    conn: Mutex<Option<Connection>>,
}

impl SqlitePointStore {
    /// Opens (or creates) the database and ensures the table exists.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open point DB at {}", db_path.display()))?;
        Self::init(conn)
    }

    /// In-memory database (tests).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory point DB")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS points (
                id         TEXT PRIMARY KEY,
                lat        REAL NOT NULL,
                lon        REAL NOT NULL,
                record     TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .context("Failed to create points table")?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().unwrap();
        let conn = guard
            .as_ref()
            .ok_or_else(|| anyhow!("point store is closed"))?;
        f(conn)
    }
}

impl PointStore for SqlitePointStore {
    fn save(&self, id: &str, point: &StoredPoint) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO points (id, lat, lon, record, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    lat = excluded.lat,
                    lon = excluded.lon,
                    record = excluded.record,
                    updated_at = excluded.updated_at",
                params![id, point.lat, point.lon, point.record, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("Failed to save point {}", id))?;
            Ok(())
        })
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM points WHERE id = ?1", params![id])
                .with_context(|| format!("Failed to delete point {}", id))?;
            Ok(())
        })
    }

    fn list(&self) -> Result<HashMap<String, StoredPoint>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, lat, lon, record FROM points")
                .context("Failed to prepare list query")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        StoredPoint {
                            lat: row.get(1)?,
                            lon: row.get(2)?,
                            record: row.get(3)?,
                        },
                    ))
                })
                .context("Failed to query points")?;

            let mut points = HashMap::new();
            for row in rows {
                let (id, point) = row.context("Failed to read point row")?;
                points.insert(id, point);
            }
            Ok(points)
        })
    }

    fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().unwrap().take() {
            conn.close()
                .map_err(|(_, e)| e)
                .context("Failed to close point DB")?;
        }
        Ok(())
    }
}
