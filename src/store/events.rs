use crate::entity::{Entity, EntityType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    Expired,
}

/// Append-only record of a change to the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityEvent {
    /// UUIDv7 (time-ordered)
    pub event_id: String,
    pub kind: EventKind,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub lat: f64,
    pub lon: f64,
    pub timestamp: DateTime<Utc>,
}

/// Bounded in-memory event log with broadcast to live subscribers.
///
/// The log only grows; the oldest entries fall off once `capacity` is reached.
pub struct EventLog {
    tx: broadcast::Sender<EntityEvent>,
    recent: Mutex<VecDeque<EntityEvent>>,
    capacity: usize,
    total: AtomicU64,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(1000);
        Self {
            tx,
            recent: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            total: AtomicU64::new(0),
        }
    }

    pub fn append(&self, kind: EventKind, entity: &Entity) -> EntityEvent {
        let event = EntityEvent {
            event_id: uuid::Uuid::now_v7().to_string(),
            kind,
            entity_id: entity.id.clone(),
            entity_type: entity.entity_type,
            lat: entity.lat,
            lon: entity.lon,
            timestamp: Utc::now(),
        };

        {
            let mut recent = self.recent.lock().unwrap();
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
        self.total.fetch_add(1, Ordering::Relaxed);

        // No receivers is fine
        let _ = self.tx.send(event.clone());
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntityEvent> {
        self.tx.subscribe()
    }

    /// Up to `limit` most recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<EntityEvent> {
        let recent = self.recent.lock().unwrap();
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }

    /// Events appended since start (including those no longer retained).
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}
