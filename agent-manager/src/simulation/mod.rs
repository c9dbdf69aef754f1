//! Walker simulation: couriers between agents, explorers inside one agent's area.

pub mod connectivity;
pub mod courier;
pub mod explorer;
pub mod simplify;
pub mod walk;

pub use courier::{CourierManager, CourierState, TickOutcome, Waypoint};
pub use explorer::Explorer;
