// Geodesy helpers and the point-region spatial index
pub mod spatial;

// Entity model, typed payloads and deterministic IDs
pub mod entity;

// Durable point storage (SQLite / in-memory)
pub mod persist;

// TTL-aware entity store, event log and metrics
pub mod store;

// Per-cell async locks
pub mod area_lock;

// Outbound call governor (spacing + backoff per API)
pub mod rate_limit;

// Classifier contract and JSON extraction
pub mod classifier;

// Per-agent observation log
pub mod awareness;

// TOML configuration and runtime flags
pub mod config;

// Gzip JSON snapshot files
pub mod snapshot;
