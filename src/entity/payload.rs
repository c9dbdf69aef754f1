use super::EntityType;
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Type-tagged entity payload.
///
/// Serialized as `{"kind": "...", "data": {...}}`. Older records carried a bare
/// key/value map instead; [`Payload::from_stored`] migrates those on load.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Place(PlaceData),
    Agent(AgentData),
    Weather(WeatherData),
    Prayer(PrayerData),
    Arrivals(TransitData),
    Street(StreetData),
    Location(LocationData),
    Disruption(DisruptionData),
    /// String tags for entity types without a dedicated shape
    Tags(BTreeMap<String, String>),
    Empty,
}

/// Point of interest.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaceData {
    pub category: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Upstream POI identifier (natural key for de-duplication)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poi_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Created,
    Indexing,
    Active,
}

/// Operational state persisted on agent entities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentData {
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default = "default_agent_radius")]
    pub radius_m: f64,
    #[serde(default)]
    pub poi_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_indexed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_live: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explorer: Option<ExplorerState>,
}

fn default_agent_radius() -> f64 {
    5_000.0
}

impl Default for AgentData {
    fn default() -> Self {
        Self {
            status: AgentStatus::Created,
            radius_m: default_agent_radius(),
            poi_count: 0,
            last_indexed: None,
            last_live: None,
            explorer: None,
        }
    }
}

/// Wander state of an agent's explorer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExplorerState {
    pub lat: f64,
    pub lon: f64,
    pub home_lat: f64,
    pub home_lon: f64,
    #[serde(default)]
    pub steps_today: u32,
    #[serde(default)]
    pub steps_total: u64,
    pub day: NaiveDate,
}

impl ExplorerState {
    /// Fresh explorer standing at its home position.
    pub fn at_home(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            home_lat: lat,
            home_lon: lon,
            steps_today: 0,
            steps_total: 0,
            day: Utc::now().date_naive(),
        }
    }

    /// Count one exploration step, resetting the daily counter on a new day.
    pub fn record_step(&mut self, today: NaiveDate) {
        if self.day != today {
            self.day = today;
            self.steps_today = 0;
        }
        self.steps_today += 1;
        self.steps_total += 1;
    }
}

/// Current conditions at a point.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherData {
    pub temperature_c: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feels_like_c: Option<f64>,
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather_code: Option<u16>,
    #[serde(default)]
    pub precipitation_mm: f64,
    #[serde(default)]
    pub wind_speed_kmh: f64,
    /// Set when rain or severe conditions are active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl WeatherData {
    pub fn has_warning(&self) -> bool {
        self.warning.is_some()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PrayerData {
    pub date: String,
    pub timings: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// Upcoming departures at one stop.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitData {
    pub stop_id: String,
    pub stop_name: String,
    pub mode: String,
    #[serde(default)]
    pub arrivals: Vec<Arrival>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Arrival {
    pub line: String,
    pub destination: String,
    pub minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_at: Option<DateTime<Utc>>,
}

/// Walked street geometry as `[lat, lon]` points.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreetData {
    pub points: Vec<[f64; 2]>,
    #[serde(default)]
    pub length_m: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_agent: Option<String>,
    #[serde(default)]
    pub source: String,
}

impl StreetData {
    /// First and last points, if the street has any geometry.
    pub fn endpoints(&self) -> Option<([f64; 2], [f64; 2])> {
        Some((*self.points.first()?, *self.points.last()?))
    }
}

/// Reverse-geocoded description of a point.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationData {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DisruptionData {
    pub line: String,
    pub severity: String,
    pub description: String,
}

impl DisruptionData {
    pub fn is_severe(&self) -> bool {
        let s = self.severity.to_ascii_lowercase();
        s.contains("severe") || s.contains("serious")
    }
}

impl Payload {
    /// Decode a persisted payload value into its typed form.
    ///
    /// Typed `{"kind", "data"}` values decode directly. A bare map is read as the
    /// entity type's typed shape where possible, otherwise kept as string tags.
    pub fn from_stored(entity_type: EntityType, value: Value) -> Payload {
        match value {
            Value::Null => Payload::Empty,
            Value::Object(map) => {
                if map.contains_key("kind") {
                    if let Ok(payload) = serde_json::from_value::<Payload>(Value::Object(map.clone())) {
                        return payload;
                    }
                }
                Self::migrate_legacy(entity_type, map)
            }
            other => {
                let mut tags = BTreeMap::new();
                tags.insert("value".to_string(), scalar_to_string(&other));
                Payload::Tags(tags)
            }
        }
    }

    fn migrate_legacy(entity_type: EntityType, map: Map<String, Value>) -> Payload {
        let typed = match entity_type {
            EntityType::Place => Some(Payload::Place(legacy_place(&map))),
            EntityType::Agent => try_typed::<AgentData>(&map).map(Payload::Agent),
            EntityType::Weather => try_typed::<WeatherData>(&map).map(Payload::Weather),
            EntityType::Prayer => try_typed::<PrayerData>(&map).map(Payload::Prayer),
            EntityType::Arrival => try_typed::<TransitData>(&map).map(Payload::Arrivals),
            EntityType::Street => try_typed::<StreetData>(&map).map(Payload::Street),
            EntityType::Location => try_typed::<LocationData>(&map).map(Payload::Location),
            EntityType::Disruption => try_typed::<DisruptionData>(&map).map(Payload::Disruption),
            _ => None,
        };

        typed.unwrap_or_else(|| {
            Payload::Tags(
                map.iter()
                    .map(|(k, v)| (k.clone(), scalar_to_string(v)))
                    .collect(),
            )
        })
    }

    pub fn as_place(&self) -> Option<&PlaceData> {
        match self {
            Payload::Place(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_agent(&self) -> Option<&AgentData> {
        match self {
            Payload::Agent(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_agent_mut(&mut self) -> Option<&mut AgentData> {
        match self {
            Payload::Agent(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_street(&self) -> Option<&StreetData> {
        match self {
            Payload::Street(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_weather(&self) -> Option<&WeatherData> {
        match self {
            Payload::Weather(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_transit(&self) -> Option<&TransitData> {
        match self {
            Payload::Arrivals(t) => Some(t),
            _ => None,
        }
    }

    /// Key identifying the same real-world object across re-fetches.
    pub fn natural_key(&self) -> Option<String> {
        match self {
            Payload::Arrivals(t) if !t.stop_id.is_empty() => Some(format!("stop:{}", t.stop_id)),
            Payload::Place(p) => p.poi_id.as_ref().map(|id| format!("poi:{}", id)),
            Payload::Street(s) => match (&s.from_agent, &s.to_agent) {
                (Some(from), Some(to)) => Some(format!("street:{}:{}", from, to)),
                _ => None,
            },
            _ => None,
        }
    }
}

fn try_typed<T: DeserializeOwned>(map: &Map<String, Value>) -> Option<T> {
    serde_json::from_value(Value::Object(map.clone())).ok()
}

/// Legacy place maps held the category next to raw upstream tags.
fn legacy_place(map: &Map<String, Value>) -> PlaceData {
    let category = map
        .get("category")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let poi_id = ["poi_id", "osm_id", "id"]
        .iter()
        .find_map(|k| map.get(*k))
        .map(scalar_to_string);
    let address = map.get("address").and_then(Value::as_str).map(str::to_string);

    let tags = map
        .iter()
        .filter(|(k, _)| !matches!(k.as_str(), "category" | "poi_id" | "osm_id" | "id" | "address"))
        .map(|(k, v)| (k.clone(), scalar_to_string(v)))
        .collect();

    PlaceData {
        category,
        tags,
        poi_id,
        address,
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
