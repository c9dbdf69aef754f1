//! Agents: background workers keeping one area's data fresh.
//!
//! Lifecycle per agent is `created → indexing → active`, re-entering
//! `indexing` when the index goes stale. Each started agent runs one indexing
//! task and one live refresh loop.

pub mod agentic;
pub mod indexer;
pub mod live;
pub mod manager;
pub mod state;

pub use indexer::{IndexOutcome, PoiIndexer};
pub use live::LiveRefresher;
pub use manager::{AgentManager, AgentView};
pub use state::{AgentRuntime, AgentStates, NextCycle};
