use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Recent activity lines kept per agent.
const MAX_EVENTS: usize = 10;

/// Delay chosen by the agentic planner for the next cycle.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NextCycle {
    #[serde(with = "duration_secs")]
    pub delay: Duration,
    pub reason: String,
}

/// In-memory runtime state of one agent (not persisted).
#[derive(Clone, Debug, Default, Serialize)]
pub struct AgentRuntime {
    pub active_users: usize,
    pub cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub next_cycle: Option<NextCycle>,
    pub events: VecDeque<String>,
    /// Last successful upstream refresh per data kind (`weather`, `bus`, `poi`, ...)
    pub fresh: BTreeMap<String, DateTime<Utc>>,
}

/// Runtime state for every started agent.
#[derive(Default)]
pub struct AgentStates {
    agents: DashMap<String, AgentRuntime>,
}

impl AgentStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRuntime> {
        self.agents.get(agent_id).map(|s| s.clone())
    }

    pub fn active_users(&self, agent_id: &str) -> usize {
        self.agents.get(agent_id).map_or(0, |s| s.active_users)
    }

    pub fn set_active_users(&self, agent_id: &str, count: usize) {
        self.agents.entry(agent_id.to_string()).or_default().active_users = count;
    }

    /// Append an activity line, dropping the oldest past the cap.
    pub fn push_event(&self, agent_id: &str, event: impl Into<String>) {
        let mut state = self.agents.entry(agent_id.to_string()).or_default();
        if state.events.len() >= MAX_EVENTS {
            state.events.pop_front();
        }
        state.events.push_back(event.into());
    }

    pub fn recent_events(&self, agent_id: &str) -> Vec<String> {
        self.agents
            .get(agent_id)
            .map(|s| s.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn mark_fresh(&self, agent_id: &str, kind: &str) {
        self.agents
            .entry(agent_id.to_string())
            .or_default()
            .fresh
            .insert(kind.to_string(), Utc::now());
    }

    pub fn fresh_at(&self, agent_id: &str, kind: &str) -> Option<DateTime<Utc>> {
        self.agents.get(agent_id)?.fresh.get(kind).copied()
    }

    pub fn record_cycle(&self, agent_id: &str, next_cycle: Option<NextCycle>) {
        let mut state = self.agents.entry(agent_id.to_string()).or_default();
        state.cycles += 1;
        state.last_cycle_at = Some(Utc::now());
        state.next_cycle = next_cycle;
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}
