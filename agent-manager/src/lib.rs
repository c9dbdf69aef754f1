//! Atlas Agent Manager - background workers that keep the world model fresh.
//!
//! # Architecture
//!
//! ```text
//! Geo APIs (Nominatim, Overpass, OSRM, Open-Meteo, Aladhan, TfL)
//!          ↓  (CallGovernor: spacing + backoff per API)
//! ┌─────────────────────────────────────────┐
//! │  Agents                                 │
//! │  - Index POIs for their area            │
//! │  - Live loop: weather, prayer, transit  │
//! │  - Optional classifier-driven cycles    │
//! └─────────────────────────────────────────┘
//! ┌─────────────────────────────────────────┐
//! │  Walkers                                │
//! │  - Couriers connect agents by streets   │
//! │  - Explorers wander one agent's area    │
//! └─────────────────────────────────────────┘
//!          ↓
//!     atlas::store::EntityStore  ←  HTTP API (axum)
//! ```
//!
//! # Core Types
//!
//! - [`world::Atlas`] - Facade wiring every service at startup
//! - [`services::Services`] - Shared store, governor, locks and API clients
//! - [`geo::GeoApi`] - Seam between workers and the upstream APIs
//! - [`agents::AgentManager`] / [`simulation::CourierManager`] - Worker lifecycles

pub mod agents;
pub mod api;
pub mod classifier;
pub mod connectors;
pub mod geo;
pub mod services;
pub mod simulation;
pub mod world;

#[cfg(test)]
pub(crate) mod testing;

pub use world::{Atlas, WorldStats};
