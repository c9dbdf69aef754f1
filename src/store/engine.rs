use crate::entity::{derive_id, Entity, EntityType};
use crate::persist::{PointStore, StoredPoint};
use crate::spatial::geo::{bounding_box, valid_coordinates};
use crate::spatial::{BoundingBox, Point, QuadTree, SpatialIndex};
use crate::store::events::{EntityEvent, EventKind, EventLog};
use crate::store::metrics::StoreMetrics;
use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Events kept in memory for `recent_events`.
const EVENT_LOG_CAPACITY: usize = 10_000;

/// Outcome of loading the durable store at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped_expired: usize,
    pub failed: usize,
}

/// Aggregate store statistics.
#[derive(Clone, Debug, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    /// Physically present but logically expired
    pub expired: usize,
    pub inserts: u64,
    pub updates: u64,
    pub queries: u64,
    pub query_rate: f64,
    pub persist_failures: u64,
    pub events: u64,
    pub load: LoadReport,
}

/// Index plus the ID → position map used to find an entity's point.
struct StoreInner {
    index: Box<dyn SpatialIndex<Entity>>,
    positions: HashMap<String, (f64, f64)>,
}

impl StoreInner {
    /// Remove and return the entity stored under `id`.
    fn take(&mut self, id: &str) -> Option<Entity> {
        let (lat, lon) = self.positions.remove(id)?;
        self.index
            .remove(lat, lon, &|e: &Entity| e.id == id)
            .map(|p| p.data)
    }

    /// Insert an entity's point. Returns false if the index rejects it.
    fn put(&mut self, entity: Entity) -> bool {
        let id = entity.id.clone();
        let (lat, lon) = (entity.lat, entity.lon);
        if !self.index.insert(Point::new(lat, lon, entity)) {
            return false;
        }
        self.positions.insert(id, (lat, lon));
        true
    }

    fn get(&self, id: &str) -> Option<&Entity> {
        let &(lat, lon) = self.positions.get(id)?;
        let exact = BoundingBox {
            min_lat: lat,
            min_lon: lon,
            max_lat: lat,
            max_lon: lon,
        };
        self.index
            .k_nearest(&exact, 1, &|e: &Entity| e.id == id)
            .into_iter()
            .next()
            .map(|p| &p.data)
    }
}

/// TTL-aware spatial store of entities.
///
/// Readers share a single read-write lock; writers are exclusive. Durable writes
/// happen under the write lock so the durable store sees changes in memory
/// order. Expired entities stay physically present
/// until [`EntityStore::cleanup_expired`] runs but never appear in strict queries.
pub struct EntityStore {
    inner: RwLock<StoreInner>,
    persistence: Arc<dyn PointStore>,
    events: EventLog,
    pub metrics: StoreMetrics,
    load_report: LoadReport,
}

impl EntityStore {
    /// Open the store over a quadtree index, loading every durable point.
    pub fn open(persistence: Arc<dyn PointStore>) -> Result<Self> {
        Self::with_index(persistence, Box::new(QuadTree::new()))
    }

    /// Open the store over a caller-supplied index.
    pub fn with_index(
        persistence: Arc<dyn PointStore>,
        mut index: Box<dyn SpatialIndex<Entity>>,
    ) -> Result<Self> {
        let stored = persistence.list()?;
        let now = Utc::now();
        let mut report = LoadReport::default();
        let mut positions = HashMap::with_capacity(stored.len());

        for (id, point) in stored {
            let mut entity = match Entity::from_record(&point.record) {
                Ok(entity) => entity,
                Err(e) => {
                    warn!(entity_id = %id, error = %e, "Failed to decode stored entity");
                    report.failed += 1;
                    continue;
                }
            };

            if entity.is_expired_at(now, Duration::zero()) {
                report.skipped_expired += 1;
                continue;
            }

            entity.id = id.clone();
            let (lat, lon) = (entity.lat, entity.lon);
            if index.insert(Point::new(lat, lon, entity)) {
                positions.insert(id, (lat, lon));
                report.loaded += 1;
            } else {
                warn!(entity_id = %id, lat, lon, "Index rejected stored entity");
                report.failed += 1;
            }
        }

        info!(
            loaded = report.loaded,
            skipped_expired = report.skipped_expired,
            failed = report.failed,
            "Loaded entities from point store"
        );

        Ok(Self {
            inner: RwLock::new(StoreInner { index, positions }),
            persistence,
            events: EventLog::new(EVENT_LOG_CAPACITY),
            metrics: StoreMetrics::new(),
            load_report: report,
        })
    }

    pub fn load_report(&self) -> LoadReport {
        self.load_report
    }

    /// Insert or replace an entity.
    ///
    /// Assigns the derived ID if absent. An existing entity with the same ID is
    /// replaced and keeps its `created_at`. Fails only when the coordinates are
    /// rejected by the index.
    pub fn insert(&self, mut entity: Entity) -> Result<Entity> {
        if entity.id.is_empty() {
            entity.id = derive_id(entity.entity_type, entity.lat, entity.lon, &entity.name);
        }
        if !valid_coordinates(entity.lat, entity.lon) {
            bail!(
                "spatial index rejected entity {} at ({}, {})",
                entity.id,
                entity.lat,
                entity.lon
            );
        }

        entity.updated_at = Utc::now();

        let replaced = {
            let mut inner = self.inner.write().unwrap();
            let previous = inner.take(&entity.id);
            if let Some(prev) = &previous {
                entity.created_at = prev.created_at;
            }

            if !inner.put(entity.clone()) {
                if let Some(prev) = previous {
                    inner.put(prev);
                }
                bail!("spatial index rejected entity {}", entity.id);
            }
            self.persist(&entity);
            previous.is_some()
        };

        let kind = if replaced {
            EventKind::Updated
        } else {
            EventKind::Created
        };
        self.events.append(kind, &entity);
        self.metrics.record_insert(replaced);

        debug!(
            entity_id = %entity.id,
            entity_type = %entity.entity_type,
            replaced,
            "Entity stored"
        );

        Ok(entity)
    }

    /// Nearest entities inside the radius's bounding box.
    ///
    /// `max_staleness` admits entities expired by at most that long; zero is strict.
    pub fn query(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
        entity_type: Option<EntityType>,
        limit: usize,
        max_staleness: Duration,
    ) -> Vec<Entity> {
        self.query_where(lat, lon, radius_m, limit, max_staleness, |e| {
            entity_type.map_or(true, |t| e.entity_type == t)
        })
    }

    /// Places whose category matches (case-insensitive).
    pub fn query_by_category(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
        category: &str,
        limit: usize,
    ) -> Vec<Entity> {
        self.query_where(lat, lon, radius_m, limit, Duration::zero(), |e| {
            e.entity_type == EntityType::Place
                && e
                    .payload
                    .as_place()
                    .map_or(false, |p| p.category.eq_ignore_ascii_case(category))
        })
    }

    /// Entities whose name contains `needle` (case-insensitive).
    pub fn query_by_name(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
        needle: &str,
        entity_type: Option<EntityType>,
        limit: usize,
    ) -> Vec<Entity> {
        let needle = needle.to_lowercase();
        self.query_where(lat, lon, radius_m, limit, Duration::zero(), |e| {
            entity_type.map_or(true, |t| e.entity_type == t) && e.name.to_lowercase().contains(&needle)
        })
    }

    fn query_where(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
        limit: usize,
        max_staleness: Duration,
        predicate: impl Fn(&Entity) -> bool,
    ) -> Vec<Entity> {
        let bbox = bounding_box(lat, lon, radius_m);
        let now = Utc::now();
        let filter = |e: &Entity| !e.is_expired_at(now, max_staleness) && predicate(e);

        let results = {
            let inner = self.inner.read().unwrap();
            inner
                .index
                .k_nearest(&bbox, limit, &filter)
                .into_iter()
                .map(|p| p.data.clone())
                .collect()
        };
        self.metrics.record_query();
        results
    }

    /// Entity by ID, including logically expired ones.
    pub fn get(&self, id: &str) -> Option<Entity> {
        self.inner.read().unwrap().get(id).cloned()
    }

    /// Every live entity of a type.
    pub fn list_by_type(&self, entity_type: EntityType) -> Vec<Entity> {
        let now = Utc::now();
        let inner = self.inner.read().unwrap();
        inner
            .index
            .points()
            .into_iter()
            .filter(|p| p.data.entity_type == entity_type && !p.data.is_expired_at(now, Duration::zero()))
            .map(|p| p.data.clone())
            .collect()
    }

    /// Apply `f` to the entity under the write lock and store the result.
    ///
    /// The ID and `created_at` are preserved. Returns `Ok(None)` if no such entity.
    pub fn modify(&self, id: &str, f: impl FnOnce(&mut Entity)) -> Result<Option<Entity>> {
        let updated = {
            let mut inner = self.inner.write().unwrap();
            let Some(original) = inner.take(id) else {
                return Ok(None);
            };

            let mut entity = original.clone();
            f(&mut entity);
            entity.id = original.id.clone();
            entity.created_at = original.created_at;
            entity.updated_at = Utc::now();

            if !inner.put(entity.clone()) {
                inner.put(original);
                bail!("spatial index rejected update of entity {}", id);
            }
            self.persist(&entity);
            entity
        };

        self.events.append(EventKind::Updated, &updated);
        self.metrics.record_insert(true);
        Ok(Some(updated))
    }

    /// Push out the expiry of entities near a point.
    ///
    /// Every entity in range with an expiry gets `max(expires_at, now + extension)`,
    /// so expiry never moves backward. Used when a refresh comes back empty so
    /// known data does not flap to expired. Entities that expired more than one
    /// `extension` ago are left to cleanup. Returns the number extended.
    pub fn extend_ttl(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
        entity_type: Option<EntityType>,
        extension: Duration,
    ) -> usize {
        self.extend_ttl_where(lat, lon, radius_m, extension, |e| {
            entity_type.map_or(true, |t| e.entity_type == t)
        })
    }

    /// [`extend_ttl`](Self::extend_ttl) restricted to entities matching `predicate`.
    pub fn extend_ttl_where(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
        extension: Duration,
        predicate: impl Fn(&Entity) -> bool,
    ) -> usize {
        let now = Utc::now();
        let target = now + extension;
        let oldest = now - extension;
        let bbox = bounding_box(lat, lon, radius_m);

        let extended: Vec<Entity> = {
            let mut inner = self.inner.write().unwrap();
            let ids: Vec<String> = inner
                .index
                .k_nearest(&bbox, usize::MAX, &|e: &Entity| {
                    e.expires_at
                        .map_or(false, |exp| exp < target && exp >= oldest)
                        && predicate(e)
                })
                .into_iter()
                .map(|p| p.data.id.clone())
                .collect();

            let mut extended = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(mut entity) = inner.take(&id) {
                    entity.expires_at = entity.expires_at.map(|exp| exp.max(target));
                    self.persist(&entity);
                    extended.push(entity.clone());
                    inner.put(entity);
                }
            }
            extended
        };

        for entity in &extended {
            self.events.append(EventKind::Updated, entity);
        }

        if !extended.is_empty() {
            debug!(count = extended.len(), lat, lon, "Extended entity TTL");
        }
        extended.len()
    }

    /// Delete an entity from the index and the durable store.
    pub fn remove(&self, id: &str) -> Option<Entity> {
        let removed = {
            let mut inner = self.inner.write().unwrap();
            let removed = inner.take(id)?;
            self.unpersist(id);
            removed
        };
        self.events.append(EventKind::Deleted, &removed);
        Some(removed)
    }

    /// Physically remove entities expired by more than `grace`.
    pub fn cleanup_expired(&self, grace: Duration) -> usize {
        let now = Utc::now();
        let removed: Vec<Entity> = {
            let mut inner = self.inner.write().unwrap();
            let ids: Vec<String> = inner
                .index
                .points()
                .into_iter()
                .filter(|p| p.data.is_expired_at(now, grace))
                .map(|p| p.data.id.clone())
                .collect();
            let removed: Vec<Entity> = ids.iter().filter_map(|id| inner.take(id)).collect();
            for entity in &removed {
                self.unpersist(&entity.id);
            }
            removed
        };

        for entity in &removed {
            self.events.append(EventKind::Expired, entity);
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "Removed expired entities");
        }
        removed.len()
    }

    /// Remove copies of the same real-world object stored under different IDs.
    ///
    /// Entities are grouped by type and payload natural key; the most recently
    /// updated copy in each group survives.
    pub fn cleanup_duplicates(&self) -> usize {
        let removed: Vec<Entity> = {
            let mut inner = self.inner.write().unwrap();

            let mut groups: HashMap<(EntityType, String), Vec<(String, chrono::DateTime<Utc>)>> =
                HashMap::new();
            for point in inner.index.points() {
                if let Some(key) = point.data.payload.natural_key() {
                    groups
                        .entry((point.data.entity_type, key))
                        .or_default()
                        .push((point.data.id.clone(), point.data.updated_at));
                }
            }

            let mut doomed = Vec::new();
            for (_, mut members) in groups {
                if members.len() < 2 {
                    continue;
                }
                members.sort_by(|a, b| b.1.cmp(&a.1));
                doomed.extend(members.into_iter().skip(1).map(|(id, _)| id));
            }

            let removed: Vec<Entity> = doomed.iter().filter_map(|id| inner.take(id)).collect();
            for entity in &removed {
                self.unpersist(&entity.id);
            }
            removed
        };

        for entity in &removed {
            self.events.append(EventKind::Deleted, entity);
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "Removed duplicate entities");
        }
        removed.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntityEvent> {
        self.events.subscribe()
    }

    pub fn recent_events(&self, limit: usize) -> Vec<EntityEvent> {
        self.events.recent(limit)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let now = Utc::now();
        let mut by_type = BTreeMap::new();
        let mut expired = 0;
        let total = {
            let inner = self.inner.read().unwrap();
            for point in inner.index.points() {
                *by_type
                    .entry(point.data.entity_type.to_string())
                    .or_insert(0usize) += 1;
                if point.data.is_expired_at(now, Duration::zero()) {
                    expired += 1;
                }
            }
            inner.index.len()
        };

        StoreStats {
            total,
            by_type,
            expired,
            inserts: self.metrics.inserts(),
            updates: self.metrics.updates(),
            queries: self.metrics.queries(),
            query_rate: self.metrics.query_rate(),
            persist_failures: self.metrics.persist_failures(),
            events: self.events.total(),
            load: self.load_report,
        }
    }

    /// Run both cleanup passes every `interval` until shutdown is signalled.
    pub async fn run_maintenance(
        self: Arc<Self>,
        interval: std::time::Duration,
        grace: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "Starting store maintenance loop");
        let mut timer = tokio::time::interval(interval);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let expired = self.cleanup_expired(grace);
                    let duplicates = self.cleanup_duplicates();
                    debug!(expired, duplicates, "Store maintenance pass complete");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Store maintenance loop stopped");
    }

    /// Flush and close the durable store.
    pub fn close(&self) -> Result<()> {
        self.persistence.close()
    }

    fn persist(&self, entity: &Entity) {
        let result = entity.to_record().and_then(|record| {
            self.persistence.save(
                &entity.id,
                &StoredPoint {
                    lat: entity.lat,
                    lon: entity.lon,
                    record,
                },
            )
        });

        if let Err(e) = result {
            self.metrics.record_persist_failure();
            error!(entity_id = %entity.id, error = %e, "Failed to persist entity");
        }
    }

    fn unpersist(&self, id: &str) {
        if let Err(e) = self.persistence.delete(id) {
            self.metrics.record_persist_failure();
            error!(entity_id = %id, error = %e, "Failed to delete persisted entity");
        }
    }
}
