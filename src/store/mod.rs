// Spatial entity store: TTL-aware index over geotagged entities

mod engine;
mod events;
mod metrics;

pub use engine::{EntityStore, LoadReport, StoreStats};
pub use events::{EntityEvent, EventKind, EventLog};
pub use metrics::StoreMetrics;

#[cfg(test)]
mod tests;
