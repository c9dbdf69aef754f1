//! Agentic live cycle: the classifier picks one tool at a time.

use super::live::LiveRefresher;
use super::state::NextCycle;
use crate::geo::TransitMode;
use anyhow::{anyhow, Context, Result};
use atlas::classifier::extract_json_object;
use atlas::entity::{Entity, EntityType};
use atlas::store::EntityStore;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::fmt::Write;
use std::time::Duration as StdDuration;
use tracing::{debug, info};

const MIN_DELAY_MINUTES: i64 = 1;
const MAX_DELAY_MINUTES: i64 = 60;

/// One tool invocation requested by the classifier.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    FetchWeather,
    FetchPrayer,
    FetchTransport {
        #[serde(rename = "type")]
        mode: TransitMode,
    },
    SetNextCycle {
        minutes: i64,
        #[serde(default)]
        reason: String,
    },
    Done {
        #[serde(default)]
        summary: String,
    },
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CycleOutcome {
    pub iterations: usize,
    pub tools: Vec<String>,
    pub next_cycle: Option<NextCycle>,
    pub summary: Option<String>,
}

/// Parse the first JSON object in a classifier response as a tool call.
pub fn parse_tool_call(response: &str) -> Result<ToolCall> {
    let value = extract_json_object(response)
        .ok_or_else(|| anyhow!("classifier response contained no JSON object"))?;
    serde_json::from_value(value).context("classifier returned an unknown tool call")
}

pub fn clamp_delay_minutes(minutes: i64) -> i64 {
    minutes.clamp(MIN_DELAY_MINUTES, MAX_DELAY_MINUTES)
}

fn describe_age(entity: Option<&Entity>, now: DateTime<Utc>) -> String {
    match entity {
        None => "missing".to_string(),
        Some(e) => {
            let age = (now - e.updated_at).num_minutes();
            match e.expires_at {
                Some(exp) if exp <= now => format!("stale ({} min old)", age),
                Some(exp) => format!("fresh ({} min old, expires in {} min)", age, (exp - now).num_minutes()),
                None => format!("fresh ({} min old)", age),
            }
        }
    }
}

/// Textual situation summary handed to the classifier.
pub fn build_summary(
    store: &EntityStore,
    agent: &Entity,
    cache_radius_m: f64,
    transit_radius_m: f64,
    active_users: usize,
    recent_events: &[String],
) -> String {
    let now = Utc::now();
    // Admit expired entries so the planner can see what went stale
    let stale_window = Duration::days(1);
    let latest = |entity_type: EntityType, radius: f64| {
        store
            .query(agent.lat, agent.lon, radius, Some(entity_type), 50, stale_window)
            .into_iter()
            .max_by_key(|e| e.updated_at)
    };

    let mut summary = String::new();
    let _ = writeln!(
        summary,
        "Agent: {} at ({:.4}, {:.4}), {} active users",
        agent.name, agent.lat, agent.lon, active_users
    );

    let weather = latest(EntityType::Weather, cache_radius_m);
    let _ = write!(summary, "Weather: {}", describe_age(weather.as_ref(), now));
    if let Some(w) = weather.as_ref().and_then(|e| e.payload.as_weather()) {
        let _ = write!(summary, ", {} {:.0}°C", w.condition, w.temperature_c);
    }
    summary.push('\n');

    let prayer = latest(EntityType::Prayer, cache_radius_m);
    let _ = writeln!(summary, "Prayer times: {}", describe_age(prayer.as_ref(), now));

    let arrivals = store.query(
        agent.lat,
        agent.lon,
        transit_radius_m,
        Some(EntityType::Arrival),
        50,
        stale_window,
    );
    for mode in TransitMode::ALL {
        let newest = arrivals
            .iter()
            .filter(|e| e.payload.as_transit().map_or(false, |t| t.mode == mode.as_str()))
            .max_by_key(|e| e.updated_at);
        let _ = writeln!(summary, "Transport {}: {}", mode, describe_age(newest, now));
    }

    if !recent_events.is_empty() {
        summary.push_str("Recent events:\n");
        for event in recent_events.iter().rev().take(5) {
            let _ = writeln!(summary, "- {}", event);
        }
    }
    summary
}

fn prompt(context: &str) -> String {
    format!(
        "You decide which live data to refresh for a neighbourhood agent.\n\n{}\n\
         Reply with exactly one JSON object choosing a tool:\n\
         {{\"tool\": \"fetch_weather\"}}\n\
         {{\"tool\": \"fetch_prayer\"}}\n\
         {{\"tool\": \"fetch_transport\", \"type\": \"bus\" | \"tube\" | \"rail\"}}\n\
         {{\"tool\": \"set_next_cycle\", \"minutes\": 1-60, \"reason\": \"...\"}}\n\
         {{\"tool\": \"done\", \"summary\": \"...\"}}\n",
        context
    )
}

fn report<T>(result: Result<Option<T>>, fetched: impl FnOnce(T) -> String) -> String {
    match result {
        Ok(Some(v)) => fetched(v),
        Ok(None) => "already fresh, skipped".to_string(),
        Err(e) => format!("failed: {}", e),
    }
}

/// Run one planner-driven cycle.
///
/// Classifier or parse errors abort the cycle with `Err`; the caller falls back
/// to the simple refresh. Tool failures are reported back to the classifier.
pub async fn run_cycle(refresher: &LiveRefresher, agent: &Entity, max_iterations: usize) -> Result<CycleOutcome> {
    let services = refresher.services();
    let classifier = services
        .classifier
        .as_ref()
        .ok_or_else(|| anyhow!("agentic mode requires a classifier"))?;
    let config = &services.config.agents;

    let mut context = build_summary(
        &services.store,
        agent,
        config.cache_radius_m,
        config.transit_radius_m,
        refresher.states().active_users(&agent.id),
        &refresher.states().recent_events(&agent.id),
    );
    let mut outcome = CycleOutcome::default();

    for _ in 0..max_iterations {
        outcome.iterations += 1;
        let response = classifier.complete(&prompt(&context)).await?;
        let call = parse_tool_call(&response)?;
        debug!(agent_id = %agent.id, tool = ?call, "Planner chose tool");

        let result = match &call {
            ToolCall::FetchWeather => report(refresher.fetch_weather(agent).await, |_| "weather stored".to_string()),
            ToolCall::FetchPrayer => report(refresher.fetch_prayer(agent).await, |_| "prayer times stored".to_string()),
            ToolCall::FetchTransport { mode } => report(refresher.fetch_transport(agent, *mode).await, |n| {
                format!("{} stops stored", n)
            }),
            ToolCall::SetNextCycle { minutes, reason } => {
                let minutes = clamp_delay_minutes(*minutes);
                outcome.next_cycle = Some(NextCycle {
                    delay: StdDuration::from_secs(minutes as u64 * 60),
                    reason: reason.clone(),
                });
                format!("next cycle in {} min", minutes)
            }
            ToolCall::Done { summary } => {
                outcome.tools.push("done".to_string());
                outcome.summary = Some(summary.clone());
                break;
            }
        };

        let name = tool_name(&call);
        outcome.tools.push(name.to_string());
        let _ = writeln!(context, "\n{} -> {}", name, result);
    }

    info!(
        agent_id = %agent.id,
        iterations = outcome.iterations,
        tools = ?outcome.tools,
        "Agentic cycle complete"
    );
    Ok(outcome)
}

fn tool_name(call: &ToolCall) -> &'static str {
    match call {
        ToolCall::FetchWeather => "fetch_weather",
        ToolCall::FetchPrayer => "fetch_prayer",
        ToolCall::FetchTransport { .. } => "fetch_transport",
        ToolCall::SetNextCycle { .. } => "set_next_cycle",
        ToolCall::Done { .. } => "done",
    }
}
