// In-memory fakes for agent and simulation tests

use crate::geo::{GeoApi, PoiResult, Route, StopArrivals, TransitMode};
use crate::services::Services;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use atlas::classifier::Classifier;
use atlas::config::{AtlasConfig, RuntimeFlags};
use atlas::entity::{DisruptionData, LocationData, PrayerData, WeatherData};
use atlas::persist::MemoryPointStore;
use atlas::rate_limit::{CallGovernor, GovernorConfig};
use atlas::spatial::geo::haversine_m;
use atlas::store::EntityStore;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Scriptable [`GeoApi`] that counts calls per method.
#[derive(Default)]
pub struct FakeGeo {
    pub location: Mutex<Option<LocationData>>,
    pub weather: Mutex<Option<WeatherData>>,
    pub prayer: Mutex<Option<PrayerData>>,
    pub pois: Mutex<Vec<PoiResult>>,
    pub arrivals: Mutex<HashMap<TransitMode, Vec<StopArrivals>>>,
    pub disruptions: Mutex<Vec<DisruptionData>>,
    /// Fixed route; otherwise a straight line between the endpoints
    pub route: Mutex<Option<Route>>,
    /// Latency added to reverse geocoding
    pub geocode_delay: Mutex<Option<std::time::Duration>>,
    failing: Mutex<HashSet<&'static str>>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl FakeGeo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self, method: &'static str) -> usize {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    /// Make `method` return an error from now on.
    pub fn fail(&self, method: &'static str) {
        self.failing.lock().unwrap().insert(method);
    }

    fn record(&self, method: &'static str) -> Result<()> {
        *self.calls.lock().unwrap().entry(method).or_default() += 1;
        if self.failing.lock().unwrap().contains(method) {
            return Err(anyhow!("{} unavailable", method));
        }
        Ok(())
    }
}

/// Straight route from `from` to `to` with a point roughly every 50 m.
pub fn straight_route(from: (f64, f64), to: (f64, f64)) -> Route {
    let distance = haversine_m(from.0, from.1, to.0, to.1);
    let segments = ((distance / 50.0).ceil() as usize).max(1);
    let points = (0..=segments)
        .map(|i| {
            let t = i as f64 / segments as f64;
            [from.0 + (to.0 - from.0) * t, from.1 + (to.1 - from.1) * t]
        })
        .collect();
    Route {
        points,
        distance_m: distance,
        duration_s: distance / 1.4,
    }
}

#[async_trait]
impl GeoApi for FakeGeo {
    async fn reverse_geocode(&self, _lat: f64, _lon: f64) -> Result<Option<LocationData>> {
        self.record("reverse_geocode")?;
        let delay = *self.geocode_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.location.lock().unwrap().clone())
    }

    async fn search_pois(&self, _lat: f64, _lon: f64, _radius_m: f64, _tag: &str) -> Result<Vec<PoiResult>> {
        self.record("search_pois")?;
        Ok(self.pois.lock().unwrap().clone())
    }

    async fn search_by_name(&self, _lat: f64, _lon: f64, _radius_m: f64, name: &str) -> Result<Vec<PoiResult>> {
        self.record("search_by_name")?;
        let needle = name.to_lowercase();
        Ok(self
            .pois
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.name.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }

    async fn walking_route(&self, from: (f64, f64), to: (f64, f64)) -> Result<Option<Route>> {
        self.record("walking_route")?;
        let fixed = self.route.lock().unwrap().clone();
        Ok(Some(fixed.unwrap_or_else(|| straight_route(from, to))))
    }

    async fn current_weather(&self, _lat: f64, _lon: f64) -> Result<Option<WeatherData>> {
        self.record("current_weather")?;
        Ok(self.weather.lock().unwrap().clone())
    }

    async fn prayer_times(&self, _lat: f64, _lon: f64) -> Result<Option<PrayerData>> {
        self.record("prayer_times")?;
        Ok(self.prayer.lock().unwrap().clone())
    }

    async fn transit_arrivals(
        &self,
        _lat: f64,
        _lon: f64,
        _radius_m: f64,
        mode: TransitMode,
    ) -> Result<Vec<StopArrivals>> {
        self.record("transit_arrivals")?;
        Ok(self
            .arrivals
            .lock()
            .unwrap()
            .get(&mode)
            .cloned()
            .unwrap_or_default())
    }

    async fn line_disruptions(&self, _mode: TransitMode) -> Result<Vec<DisruptionData>> {
        self.record("line_disruptions")?;
        Ok(self.disruptions.lock().unwrap().clone())
    }
}

/// Classifier replaying queued responses in order.
#[derive(Default)]
pub struct ScriptedClassifier {
    responses: Mutex<VecDeque<Result<String, String>>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedClassifier {
    pub fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().map(|r| Ok(r.to_string())).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn push_error(&self, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(e)) => Err(anyhow!(e)),
            None => Err(anyhow!("no scripted response left")),
        }
    }
}

/// Defaults with every delay removed.
pub fn test_config() -> AtlasConfig {
    let mut config = AtlasConfig::default();
    config.store.persistence_enabled = false;
    config.agents.category_delay_ms = 0;
    config.agents.categories = vec!["amenity=cafe".to_string()];
    config.snapshot.enabled = false;
    config
}

pub fn test_services(geo: Arc<FakeGeo>, classifier: Option<Arc<ScriptedClassifier>>) -> Services {
    test_services_with(test_config(), geo, classifier)
}

pub fn test_services_with(
    config: AtlasConfig,
    geo: Arc<FakeGeo>,
    classifier: Option<Arc<ScriptedClassifier>>,
) -> Services {
    let store = Arc::new(EntityStore::open(Arc::new(MemoryPointStore::new())).unwrap());
    let governor = Arc::new(CallGovernor::new(GovernorConfig {
        default_interval_ms: 0,
        intervals_ms: HashMap::new(),
        call_timeout_seconds: 5,
        max_backoff_seconds: 60,
    }));
    Services::assemble(
        config,
        store,
        governor,
        Arc::new(RuntimeFlags::default()),
        geo,
        classifier.map(|c| c as Arc<dyn Classifier>),
    )
}
