// Awareness log: notable per-agent observations, periodically triaged by the classifier

use crate::classifier::{extract_json_array, Classifier};
use crate::entity::{DisruptionData, WeatherData};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwarenessConfig {
    /// Observations kept per agent
    pub capacity: usize,
    /// Minimum spacing between runs while users are active (seconds)
    pub active_interval_seconds: i64,
    /// Minimum spacing between runs with no active users (seconds)
    pub idle_interval_seconds: i64,
}

impl Default for AwarenessConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            active_interval_seconds: 300,
            idle_interval_seconds: 600,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    WeatherWarning,
    Disruption,
    NewPlace,
    CourierArrival,
    Exploration,
}

impl ObservationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationKind::WeatherWarning => "weather_warning",
            ObservationKind::Disruption => "disruption",
            ObservationKind::NewPlace => "new_place",
            ObservationKind::CourierArrival => "courier_arrival",
            ObservationKind::Exploration => "exploration",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: ObservationKind,
    pub agent_id: String,
    pub data: Value,
    #[serde(default)]
    pub surfaced: bool,
}

/// One item the classifier judged worth telling users about.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SurfacedItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub emoji: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AwarenessAlert {
    pub agent_id: String,
    pub items: Vec<SurfacedItem>,
    pub timestamp: DateTime<Utc>,
}

/// Rain, storms, snow or an explicit warning.
pub fn is_notable_weather(weather: &WeatherData) -> bool {
    if weather.has_warning() {
        return true;
    }
    let condition = weather.condition.to_ascii_lowercase();
    ["rain", "storm", "thunder", "snow", "severe", "shower"]
        .iter()
        .any(|w| condition.contains(w))
}

pub fn is_notable_disruption(disruption: &DisruptionData) -> bool {
    disruption.is_severe()
}

#[derive(Default)]
struct AgentBuffer {
    observations: VecDeque<Observation>,
    last_run: Option<DateTime<Utc>>,
}

/// Per-agent capped observation buffers plus the triage debounce.
pub struct AwarenessLog {
    config: AwarenessConfig,
    classifier: Option<Arc<dyn Classifier>>,
    buffers: DashMap<String, AgentBuffer>,
    tx: broadcast::Sender<AwarenessAlert>,
}

impl AwarenessLog {
    pub fn new(config: AwarenessConfig, classifier: Option<Arc<dyn Classifier>>) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            config,
            classifier,
            buffers: DashMap::new(),
            tx,
        }
    }

    /// Record an observation, dropping the oldest once the buffer is full.
    pub fn observe(&self, agent_id: &str, kind: ObservationKind, data: Value) -> Observation {
        let observation = Observation {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            agent_id: agent_id.to_string(),
            data,
            surfaced: false,
        };

        let mut buffer = self.buffers.entry(agent_id.to_string()).or_default();
        if buffer.observations.len() >= self.config.capacity.max(1) {
            buffer.observations.pop_front();
        }
        buffer.observations.push_back(observation.clone());

        debug!(agent_id, kind = kind.as_str(), "Observation recorded");
        observation
    }

    /// Unsurfaced observations, oldest first.
    pub fn pending(&self, agent_id: &str) -> Vec<Observation> {
        self.buffers
            .get(agent_id)
            .map(|b| {
                b.observations
                    .iter()
                    .filter(|o| !o.surfaced)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every observation held for the agent.
    pub fn observations(&self, agent_id: &str) -> Vec<Observation> {
        self.buffers
            .get(agent_id)
            .map(|b| b.observations.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn should_process(&self, agent_id: &str, has_active_users: bool) -> bool {
        self.should_process_at(agent_id, has_active_users, Utc::now())
    }

    /// True on the first run, then once the debounce interval has passed.
    pub fn should_process_at(&self, agent_id: &str, has_active_users: bool, now: DateTime<Utc>) -> bool {
        let last_run = self.buffers.get(agent_id).and_then(|b| b.last_run);
        let Some(last_run) = last_run else {
            return true;
        };

        let interval = if has_active_users {
            self.config.active_interval_seconds
        } else {
            self.config.idle_interval_seconds
        };
        now - last_run > Duration::seconds(interval)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AwarenessAlert> {
        self.tx.subscribe()
    }

    /// Triage pending observations.
    ///
    /// Marks the run time first so a failing classifier is still debounced.
    /// Returns the surfaced items (empty when nothing is pending).
    pub async fn process(&self, agent_id: &str, context: &str) -> Result<Vec<SurfacedItem>> {
        self.buffers.entry(agent_id.to_string()).or_default().last_run = Some(Utc::now());

        let pending = self.pending(agent_id);
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let items = match &self.classifier {
            Some(classifier) => {
                let prompt = build_prompt(&pending, context);
                let response = classifier.complete(&prompt).await?;
                parse_items(&response)?
            }
            None => passthrough_items(&pending),
        };

        let kinds: HashSet<&str> = items.iter().map(|i| i.kind.as_str()).collect();
        let mut marked = 0;
        if let Some(mut buffer) = self.buffers.get_mut(agent_id) {
            for observation in buffer.observations.iter_mut() {
                if !observation.surfaced && kinds.contains(observation.kind.as_str()) {
                    observation.surfaced = true;
                    marked += 1;
                }
            }
        }

        if !items.is_empty() {
            info!(agent_id, items = items.len(), marked, "Surfacing awareness items");
            let _ = self.tx.send(AwarenessAlert {
                agent_id: agent_id.to_string(),
                items: items.clone(),
                timestamp: Utc::now(),
            });
        }

        Ok(items)
    }
}

fn build_prompt(pending: &[Observation], context: &str) -> String {
    let mut prompt = String::from(
        "You monitor a neighbourhood for the people in it. Decide which of these \
         observations are worth telling them about right now.\n\nObservations:\n",
    );
    for o in pending {
        let _ = writeln!(
            prompt,
            "- [{}] {} {}",
            o.kind.as_str(),
            o.timestamp.format("%H:%M"),
            o.data
        );
    }
    if !context.is_empty() {
        let _ = write!(prompt, "\nContext:\n{}\n", context);
    }
    prompt.push_str(
        "\nReply with a JSON array of objects {\"type\", \"message\", \"emoji\"} where \
         \"type\" is the observation type. Reply [] if nothing is worth mentioning.",
    );
    prompt
}

fn parse_items(response: &str) -> Result<Vec<SurfacedItem>> {
    let array = extract_json_array(response)
        .ok_or_else(|| anyhow!("classifier response contained no JSON array"))?;

    let items = array
        .as_array()
        .map(|values| {
            values
                .iter()
                .filter_map(|v| match serde_json::from_value::<SurfacedItem>(v.clone()) {
                    Ok(item) => Some(item),
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed awareness item");
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(items)
}

/// Without a classifier every pending observation is surfaced as-is.
fn passthrough_items(pending: &[Observation]) -> Vec<SurfacedItem> {
    pending
        .iter()
        .map(|o| SurfacedItem {
            kind: o.kind.as_str().to_string(),
            message: o
                .data
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| o.data.to_string()),
            emoji: None,
        })
        .collect()
}
