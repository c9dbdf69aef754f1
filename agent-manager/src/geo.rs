//! Geo content APIs consumed by agents and walkers.
//!
//! [`GeoApi`] is the seam between the worker layer and the outside world. The
//! HTTP implementation ([`crate::connectors::HttpGeoApi`]) routes every call
//! through the shared call governor; tests use an in-memory fake.
//!
//! Empty results (`None`, empty vec) mean "the upstream had nothing" and are
//! distinct from errors: callers extend cached TTLs on empty and skip on error.

use anyhow::Result;
use async_trait::async_trait;
use atlas::entity::{
    Arrival, DisruptionData, Entity, EntityType, LocationData, Payload, PlaceData, PrayerData,
    TransitData, WeatherData,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A point of interest returned by a POI search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoiResult {
    /// Upstream identifier, e.g. `node/123`
    pub poi_id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub category: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub address: Option<String>,
}

impl PoiResult {
    pub fn to_entity(&self) -> Entity {
        Entity::new(
            EntityType::Place,
            self.name.clone(),
            self.lat,
            self.lon,
            Payload::Place(PlaceData {
                category: self.category.clone(),
                tags: self.tags.clone(),
                poi_id: Some(self.poi_id.clone()),
                address: self.address.clone(),
            }),
        )
    }
}

/// Walking route as `[lat, lon]` points.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub points: Vec<[f64; 2]>,
    pub distance_m: f64,
    pub duration_s: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitMode {
    Bus,
    Tube,
    Rail,
}

impl TransitMode {
    pub const ALL: [TransitMode; 3] = [TransitMode::Bus, TransitMode::Tube, TransitMode::Rail];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransitMode::Bus => "bus",
            TransitMode::Tube => "tube",
            TransitMode::Rail => "rail",
        }
    }
}

impl fmt::Display for TransitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransitMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        TransitMode::ALL
            .iter()
            .copied()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("unknown transport type '{}'", s))
    }
}

/// Upcoming departures at one stop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StopArrivals {
    pub stop_id: String,
    pub stop_name: String,
    pub lat: f64,
    pub lon: f64,
    pub mode: TransitMode,
    pub arrivals: Vec<Arrival>,
}

impl StopArrivals {
    pub fn to_entity(&self) -> Entity {
        Entity::new(
            EntityType::Arrival,
            self.stop_name.clone(),
            self.lat,
            self.lon,
            Payload::Arrivals(TransitData {
                stop_id: self.stop_id.clone(),
                stop_name: self.stop_name.clone(),
                mode: self.mode.as_str().to_string(),
                arrivals: self.arrivals.clone(),
            }),
        )
    }
}

#[async_trait]
pub trait GeoApi: Send + Sync {
    async fn reverse_geocode(&self, lat: f64, lon: f64) -> Result<Option<LocationData>>;

    /// POIs carrying `tag` (`key` or `key=value`) within the radius.
    async fn search_pois(&self, lat: f64, lon: f64, radius_m: f64, tag: &str) -> Result<Vec<PoiResult>>;

    /// Named POIs whose name contains `name` (case-insensitive).
    async fn search_by_name(&self, lat: f64, lon: f64, radius_m: f64, name: &str) -> Result<Vec<PoiResult>>;

    async fn walking_route(&self, from: (f64, f64), to: (f64, f64)) -> Result<Option<Route>>;

    async fn current_weather(&self, lat: f64, lon: f64) -> Result<Option<WeatherData>>;

    async fn prayer_times(&self, lat: f64, lon: f64) -> Result<Option<PrayerData>>;

    async fn transit_arrivals(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
        mode: TransitMode,
    ) -> Result<Vec<StopArrivals>>;

    /// Current line disruptions for a mode (lines running normally are omitted).
    async fn line_disruptions(&self, mode: TransitMode) -> Result<Vec<DisruptionData>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transit_mode_parse() {
        assert_eq!("BUS".parse::<TransitMode>().unwrap(), TransitMode::Bus);
        assert_eq!("rail".parse::<TransitMode>().unwrap(), TransitMode::Rail);
        assert!("ferry".parse::<TransitMode>().is_err());
    }

    #[test]
    fn test_poi_entity_is_deterministic() {
        let poi = PoiResult {
            poi_id: "node/42".to_string(),
            name: "Cafe Nero".to_string(),
            lat: 51.41,
            lon: -0.30,
            category: "cafe".to_string(),
            tags: BTreeMap::new(),
            address: None,
        };
        let a = poi.to_entity();
        let b = poi.to_entity();
        assert_eq!(a.id, b.id);
        assert_eq!(a.payload.natural_key().as_deref(), Some("poi:node/42"));
    }
}
