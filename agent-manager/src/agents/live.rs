//! Live data refresh for one agent's area.
//!
//! Every fetch follows the same shape: skip when a fresh entity of that type is
//! already stored nearby, otherwise take the area lock, re-check, call the
//! upstream and store the result with its TTL. Empty upstream answers extend
//! the TTL of what is already stored; errors leave the cache untouched.

use super::agentic;
use super::state::{AgentStates, NextCycle};
use crate::geo::TransitMode;
use crate::services::Services;
use crate::simulation::explorer::Explorer;
use anyhow::Result;
use atlas::awareness::{is_notable_disruption, is_notable_weather, ObservationKind};
use atlas::entity::{Entity, EntityType, Payload};
use chrono::{Duration, Utc};
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Which refresh steps ran in one simple cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub fetched: Vec<&'static str>,
    pub skipped: Vec<&'static str>,
    pub failed: Vec<&'static str>,
}

impl RefreshReport {
    fn record<T>(&mut self, step: &'static str, result: Result<Option<T>>) {
        match result {
            Ok(Some(_)) => self.fetched.push(step),
            Ok(None) => self.skipped.push(step),
            Err(e) => {
                warn!(step, error = %e, "Refresh step failed");
                self.failed.push(step);
            }
        }
    }
}

pub struct LiveRefresher {
    services: Services,
    states: Arc<AgentStates>,
    explorer: Arc<Explorer>,
}

impl LiveRefresher {
    pub fn new(services: Services, states: Arc<AgentStates>, explorer: Arc<Explorer>) -> Self {
        Self {
            services,
            states,
            explorer,
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn states(&self) -> &AgentStates {
        &self.states
    }

    fn has_fresh(&self, lat: f64, lon: f64, radius_m: f64, entity_type: EntityType) -> bool {
        !self
            .services
            .store
            .query(lat, lon, radius_m, Some(entity_type), 1, Duration::zero())
            .is_empty()
    }

    fn fresh_arrivals(&self, lat: f64, lon: f64, mode: TransitMode) -> bool {
        let radius = self.services.config.agents.transit_radius_m;
        self.services
            .store
            .query(lat, lon, radius, Some(EntityType::Arrival), 50, Duration::zero())
            .iter()
            .any(|e| e.payload.as_transit().map_or(false, |t| t.mode == mode.as_str()))
    }

    /// Reverse-geocode the agent position. `None` when cached or nothing found.
    pub async fn refresh_location(&self, agent: &Entity) -> Result<Option<Entity>> {
        let config = &self.services.config.agents;
        let (lat, lon) = (agent.lat, agent.lon);
        if self.has_fresh(lat, lon, config.cache_radius_m, EntityType::Location) {
            return Ok(None);
        }

        let _guard = self.services.area_locks.acquire(lat, lon).await;
        if self.has_fresh(lat, lon, config.cache_radius_m, EntityType::Location) {
            return Ok(None);
        }

        let ttl = Duration::seconds(config.location_ttl_seconds);
        match self.services.geo.reverse_geocode(lat, lon).await? {
            Some(location) => {
                let entity = Entity::new(
                    EntityType::Location,
                    location.display_name.clone(),
                    lat,
                    lon,
                    Payload::Location(location),
                )
                .with_ttl(ttl);
                let stored = self.services.store.insert(entity)?;
                self.states.mark_fresh(&agent.id, "location");
                Ok(Some(stored))
            }
            None => {
                self.services
                    .store
                    .extend_ttl(lat, lon, config.cache_radius_m, Some(EntityType::Location), ttl);
                self.states.mark_fresh(&agent.id, "location");
                Ok(None)
            }
        }
    }

    /// Current weather at the agent. `None` when cached or the upstream had nothing.
    pub async fn fetch_weather(&self, agent: &Entity) -> Result<Option<Entity>> {
        let config = &self.services.config.agents;
        let (lat, lon) = (agent.lat, agent.lon);
        if self.has_fresh(lat, lon, config.cache_radius_m, EntityType::Weather) {
            debug!(agent_id = %agent.id, "Weather is fresh");
            return Ok(None);
        }

        let _guard = self.services.area_locks.acquire(lat, lon).await;
        if self.has_fresh(lat, lon, config.cache_radius_m, EntityType::Weather) {
            return Ok(None);
        }

        let ttl = Duration::seconds(config.weather_ttl_seconds);
        let Some(weather) = self.services.geo.current_weather(lat, lon).await? else {
            self.services
                .store
                .extend_ttl(lat, lon, config.cache_radius_m, Some(EntityType::Weather), ttl);
            self.states.mark_fresh(&agent.id, "weather");
            return Ok(None);
        };

        if is_notable_weather(&weather) {
            self.services.awareness.observe(
                &agent.id,
                ObservationKind::WeatherWarning,
                json!({
                    "condition": weather.condition,
                    "temperature_c": weather.temperature_c,
                    "warning": weather.warning,
                    "message": format!(
                        "{} ({:.0}°C)",
                        weather.warning.as_deref().unwrap_or(&weather.condition),
                        weather.temperature_c
                    ),
                }),
            );
        }

        let entity = Entity::new(
            EntityType::Weather,
            format!("Weather {}", agent.name),
            lat,
            lon,
            Payload::Weather(weather),
        )
        .with_ttl(ttl);
        let stored = self.services.store.insert(entity)?;
        self.states.mark_fresh(&agent.id, "weather");
        self.states.push_event(&agent.id, "weather refreshed");
        Ok(Some(stored))
    }

    pub async fn fetch_prayer(&self, agent: &Entity) -> Result<Option<Entity>> {
        let config = &self.services.config.agents;
        let (lat, lon) = (agent.lat, agent.lon);
        if self.has_fresh(lat, lon, config.cache_radius_m, EntityType::Prayer) {
            return Ok(None);
        }

        let _guard = self.services.area_locks.acquire(lat, lon).await;
        if self.has_fresh(lat, lon, config.cache_radius_m, EntityType::Prayer) {
            return Ok(None);
        }

        let ttl = Duration::seconds(config.prayer_ttl_seconds);
        let Some(prayer) = self.services.geo.prayer_times(lat, lon).await? else {
            self.services
                .store
                .extend_ttl(lat, lon, config.cache_radius_m, Some(EntityType::Prayer), ttl);
            self.states.mark_fresh(&agent.id, "prayer");
            return Ok(None);
        };

        let entity = Entity::new(
            EntityType::Prayer,
            format!("Prayer times {}", agent.name),
            lat,
            lon,
            Payload::Prayer(prayer),
        )
        .with_ttl(ttl);
        let stored = self.services.store.insert(entity)?;
        self.states.mark_fresh(&agent.id, "prayer");
        Ok(Some(stored))
    }

    /// Arrivals at stops of one mode near the agent.
    ///
    /// Returns the number of stops stored, `Some(0)` when the upstream had no
    /// stops (existing arrivals of the same mode are extended) and `None` when
    /// cached.
    pub async fn fetch_transport(&self, agent: &Entity, mode: TransitMode) -> Result<Option<usize>> {
        let config = &self.services.config.agents;
        let (lat, lon) = (agent.lat, agent.lon);
        if self.fresh_arrivals(lat, lon, mode) {
            return Ok(None);
        }

        let _guard = self.services.area_locks.acquire(lat, lon).await;
        if self.fresh_arrivals(lat, lon, mode) {
            return Ok(None);
        }

        let ttl = Duration::seconds(config.arrivals_ttl_seconds);
        let stops = self
            .services
            .geo
            .transit_arrivals(lat, lon, config.transit_radius_m, mode)
            .await?;

        self.states.mark_fresh(&agent.id, mode.as_str());
        if stops.is_empty() {
            let extended = self.services.store.extend_ttl_where(
                lat,
                lon,
                config.transit_radius_m,
                ttl,
                |e| {
                    e.entity_type == EntityType::Arrival
                        && e.payload.as_transit().map_or(false, |t| t.mode == mode.as_str())
                },
            );
            debug!(agent_id = %agent.id, mode = %mode, extended, "No stops returned, extended arrivals");
            return Ok(Some(0));
        }

        let mut stored = 0;
        for stop in &stops {
            match self.services.store.insert(stop.to_entity().with_ttl(ttl)) {
                Ok(_) => stored += 1,
                Err(e) => warn!(stop_id = %stop.stop_id, error = %e, "Failed to store arrivals"),
            }
        }
        self.states
            .push_event(&agent.id, format!("{} arrivals refreshed ({} stops)", mode, stored));
        Ok(Some(stored))
    }

    /// Line disruptions for tube and rail, stored at the agent position.
    pub async fn fetch_disruptions(&self, agent: &Entity) -> Result<Option<usize>> {
        let config = &self.services.config.agents;
        let (lat, lon) = (agent.lat, agent.lon);
        if self.has_fresh(lat, lon, config.cache_radius_m, EntityType::Disruption) {
            return Ok(None);
        }

        let ttl = Duration::seconds(config.disruption_ttl_seconds);
        let mut stored = 0;
        for mode in [TransitMode::Tube, TransitMode::Rail] {
            let disruptions = self.services.geo.line_disruptions(mode).await?;
            for disruption in disruptions {
                if is_notable_disruption(&disruption) {
                    self.services.awareness.observe(
                        &agent.id,
                        ObservationKind::Disruption,
                        json!({
                            "line": disruption.line,
                            "severity": disruption.severity,
                            "message": format!("{}: {}", disruption.line, disruption.severity),
                        }),
                    );
                }
                let entity = Entity::new(
                    EntityType::Disruption,
                    format!("{} ({})", disruption.line, agent.name),
                    lat,
                    lon,
                    Payload::Disruption(disruption),
                )
                .with_ttl(ttl);
                self.services.store.insert(entity)?;
                stored += 1;
            }
        }

        if stored == 0 {
            self.services
                .store
                .extend_ttl(lat, lon, config.cache_radius_m, Some(EntityType::Disruption), ttl);
        }
        self.states.mark_fresh(&agent.id, "disruptions");
        Ok(Some(stored))
    }

    /// Fixed-order refresh of every data type.
    pub async fn simple_refresh(&self, agent: &Entity) -> RefreshReport {
        let mut report = RefreshReport::default();
        report.record("weather", self.fetch_weather(agent).await);
        report.record("prayer", self.fetch_prayer(agent).await);
        for mode in TransitMode::ALL {
            report.record(mode.as_str(), self.fetch_transport(agent, mode).await);
        }
        report.record("disruptions", self.fetch_disruptions(agent).await);
        report
    }

    /// One live cycle. Returns the delay chosen by the agentic planner, if any.
    pub async fn run_cycle(&self, agent: &Entity) -> Option<NextCycle> {
        if let Err(e) = self.refresh_location(agent).await {
            warn!(agent_id = %agent.id, error = %e, "Location refresh failed");
        }

        let mut next_cycle = None;
        if self.services.flags.agentic_mode() && self.services.classifier.is_some() {
            let max_iterations = self.services.config.agents.agentic_max_iterations;
            match agentic::run_cycle(self, agent, max_iterations).await {
                Ok(outcome) => next_cycle = outcome.next_cycle,
                Err(e) => {
                    warn!(agent_id = %agent.id, error = %e, "Agentic cycle failed, falling back to simple refresh");
                    self.simple_refresh(agent).await;
                }
            }
        } else {
            let report = self.simple_refresh(agent).await;
            debug!(agent_id = %agent.id, fetched = ?report.fetched, failed = ?report.failed, "Live refresh done");
        }

        if let Err(e) = self.services.store.modify(&agent.id, |e| {
            if let Some(a) = e.payload.as_agent_mut() {
                a.last_live = Some(Utc::now());
            }
        }) {
            warn!(agent_id = %agent.id, error = %e, "Failed to update last_live");
        }

        if self.services.flags.exploration_mode() {
            if let Err(e) = self.explorer.step(agent).await {
                warn!(agent_id = %agent.id, error = %e, "Exploration step failed");
            }
        }

        let users = self.states.active_users(&agent.id);
        if self.services.awareness.should_process(&agent.id, users > 0) {
            let context = format!("{} active users near {}", users, agent.name);
            if let Err(e) = self.services.awareness.process(&agent.id, &context).await {
                warn!(agent_id = %agent.id, error = %e, "Awareness processing failed");
            }
        }

        self.states.record_cycle(&agent.id, next_cycle.clone());
        next_cycle
    }

    /// Simple-mode sleep: base interval plus random jitter.
    fn simple_delay(&self) -> StdDuration {
        let config = &self.services.config.agents;
        let jitter = if config.live_jitter_seconds > 0 {
            rand::thread_rng().gen_range(0..=config.live_jitter_seconds * 1000)
        } else {
            0
        };
        StdDuration::from_secs(config.live_interval_seconds) + StdDuration::from_millis(jitter)
    }

    /// Run cycles until shutdown or until the agent entity disappears.
    pub async fn run_live_loop(self: Arc<Self>, agent_id: String, mut shutdown: watch::Receiver<bool>) {
        info!(agent_id = %agent_id, "Live loop started");

        loop {
            let Some(agent) = self.services.store.get(&agent_id) else {
                warn!(agent_id = %agent_id, "Agent entity missing, stopping live loop");
                break;
            };

            let delay = match self.run_cycle(&agent).await {
                Some(next) => {
                    debug!(agent_id = %agent_id, delay_secs = next.delay.as_secs(), reason = %next.reason, "Planner set next cycle");
                    next.delay
                }
                None => self.simple_delay(),
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(agent_id = %agent_id, "Live loop stopped");
    }
}
