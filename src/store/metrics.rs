use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Sliding window for query rate (milliseconds).
const RATE_WINDOW_MS: i64 = 5000;

/// Counters for store activity.
pub struct StoreMetrics {
    inserts: AtomicU64,
    updates: AtomicU64,
    queries: AtomicU64,
    persist_failures: AtomicU64,

    /// Query timestamps for rate calculation (sliding 5-second window)
    query_timestamps: RwLock<VecDeque<i64>>,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self {
            inserts: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            query_timestamps: RwLock::new(VecDeque::new()),
        }
    }

    /// Record an insert; `replaced` is true when an entity with the same ID existed.
    pub fn record_insert(&self, replaced: bool) {
        if replaced {
            self.updates.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inserts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);

        let now = Utc::now().timestamp_millis();
        let mut timestamps = self.query_timestamps.write().unwrap();
        timestamps.push_back(now);
        while let Some(&oldest) = timestamps.front() {
            if now - oldest > RATE_WINDOW_MS {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    /// Queries per second over the last 5 seconds.
    pub fn query_rate(&self) -> f64 {
        let now = Utc::now().timestamp_millis();
        let timestamps = self.query_timestamps.read().unwrap();
        let recent = timestamps
            .iter()
            .filter(|&&t| now - t <= RATE_WINDOW_MS)
            .count();
        recent as f64 / (RATE_WINDOW_MS as f64 / 1000.0)
    }
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}
