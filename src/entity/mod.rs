use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

mod payload;

pub use payload::{
    AgentData, AgentStatus, Arrival, DisruptionData, ExplorerState, LocationData, Payload,
    PlaceData, PrayerData, StreetData, TransitData, WeatherData,
};

/// Kind of thing an entity represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Place,
    Agent,
    Vehicle,
    Person,
    Event,
    Zone,
    Sensor,
    Weather,
    Prayer,
    Arrival,
    Location,
    News,
    Disruption,
    Street,
}

impl EntityType {
    pub const ALL: [EntityType; 14] = [
        EntityType::Place,
        EntityType::Agent,
        EntityType::Vehicle,
        EntityType::Person,
        EntityType::Event,
        EntityType::Zone,
        EntityType::Sensor,
        EntityType::Weather,
        EntityType::Prayer,
        EntityType::Arrival,
        EntityType::Location,
        EntityType::News,
        EntityType::Disruption,
        EntityType::Street,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Place => "place",
            EntityType::Agent => "agent",
            EntityType::Vehicle => "vehicle",
            EntityType::Person => "person",
            EntityType::Event => "event",
            EntityType::Zone => "zone",
            EntityType::Sensor => "sensor",
            EntityType::Weather => "weather",
            EntityType::Prayer => "prayer",
            EntityType::Arrival => "arrival",
            EntityType::Location => "location",
            EntityType::News => "news",
            EntityType::Disruption => "disruption",
            EntityType::Street => "street",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("unknown entity type '{}'", s))
    }
}

/// Derive the deterministic ID for a `(type, lat, lon, name)` tuple.
///
/// Coordinates are fixed to six decimals (~0.1 m) so float noise from re-fetching
/// the same object does not produce a new ID.
pub fn derive_id(entity_type: EntityType, lat: f64, lon: f64, name: &str) -> String {
    let key = format!("{}:{:.6}:{:.6}:{}", entity_type, lat, lon, name);
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..16])
}

/// A geotagged record in the world model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Deterministic ID (see [`derive_id`]); empty until assigned by the store
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type")]
    pub entity_type: EntityType,

    pub name: String,

    pub lat: f64,
    pub lon: f64,

    pub payload: Payload,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Entity {
    /// Build a new entity with a derived ID and no expiry.
    pub fn new(entity_type: EntityType, name: impl Into<String>, lat: f64, lon: f64, payload: Payload) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            id: derive_id(entity_type, lat, lon, &name),
            entity_type,
            name,
            lat,
            lon,
            payload,
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    /// Set the expiry to `ttl` from now.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(Utc::now() + ttl);
        self
    }

    /// True once `now` is past `expires_at` by more than `grace`.
    pub fn is_expired_at(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at + grace <= now,
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now(), Duration::zero())
    }

    /// Serialize for the durable point store.
    pub fn to_record(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a persisted record, migrating legacy payloads to their typed form.
    pub fn from_record(record: &str) -> anyhow::Result<Self> {
        let mut value: Value = serde_json::from_str(record)?;
        let raw_payload = value
            .as_object_mut()
            .and_then(|obj| obj.remove("payload"))
            .unwrap_or(Value::Null);

        let stored: StoredEntity = serde_json::from_value(value)?;
        let payload = Payload::from_stored(stored.entity_type, raw_payload);

        let id = if stored.id.is_empty() {
            derive_id(stored.entity_type, stored.lat, stored.lon, &stored.name)
        } else {
            stored.id
        };

        Ok(Self {
            id,
            entity_type: stored.entity_type,
            name: stored.name,
            lat: stored.lat,
            lon: stored.lon,
            payload,
            created_at: stored.created_at.unwrap_or_else(Utc::now),
            updated_at: stored.updated_at.or(stored.created_at).unwrap_or_else(Utc::now),
            expires_at: stored.expires_at,
        })
    }
}

/// Entity envelope as found on disk; timestamps were optional in older records.
#[derive(Deserialize)]
struct StoredEntity {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    entity_type: EntityType,
    #[serde(default)]
    name: String,
    lat: f64,
    lon: f64,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}
