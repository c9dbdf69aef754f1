//! `Atlas` facade: every service wired once and the operations the API exposes.

use crate::agents::{AgentManager, AgentView, PoiIndexer};
use crate::services::Services;
use crate::simulation::{CourierManager, CourierState, Explorer, Waypoint};
use anyhow::{bail, Result};
use atlas::awareness::{Observation, SurfacedItem};
use atlas::config::{AtlasConfig, RuntimeFlags, RuntimeFlagsView};
use atlas::entity::{Entity, EntityType};
use atlas::rate_limit::ApiStats;
use atlas::spatial::geo::valid_coordinates;
use atlas::store::StoreStats;
use chrono::Duration;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Aggregate statistics across the store, governor and workers.
#[derive(Clone, Debug, Serialize)]
pub struct WorldStats {
    pub store: StoreStats,
    pub governor: BTreeMap<String, ApiStats>,
    pub agents: usize,
    pub agents_running: usize,
    pub couriers: usize,
    pub couriers_enabled: usize,
    pub flags: RuntimeFlagsView,
}

/// What [`Atlas::start`] brought up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub agents: usize,
    pub couriers: usize,
}

pub struct Atlas {
    services: Services,
    agents: AgentManager,
    couriers: Arc<CourierManager>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Atlas {
    /// Open the store and build HTTP-backed services from `config`.
    pub fn build(config: AtlasConfig, flags: Arc<RuntimeFlags>) -> Result<Self> {
        Ok(Self::with_services(Services::build(config, flags)?))
    }

    pub fn with_services(services: Services) -> Self {
        let indexer = Arc::new(PoiIndexer::new(services.clone()));
        let explorer = Arc::new(Explorer::new(services.clone(), indexer.clone()));
        let agents = AgentManager::new(services.clone(), indexer.clone(), explorer);
        let couriers = Arc::new(CourierManager::new(services.clone(), indexer));
        let (shutdown, _) = watch::channel(false);
        Self {
            services,
            agents,
            couriers,
            maintenance: Mutex::new(None),
            shutdown,
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn config(&self) -> &AtlasConfig {
        &self.services.config
    }

    /// Start store maintenance, restart persisted agents and restore couriers.
    pub fn start(&self) -> StartReport {
        let store_config = &self.services.config.store;
        let handle = tokio::spawn(self.services.store.clone().run_maintenance(
            std::time::Duration::from_secs(store_config.maintenance_interval_seconds),
            Duration::seconds(store_config.expiry_grace_seconds),
            self.shutdown.subscribe(),
        ));
        if let Some(old) = self.maintenance.lock().unwrap().replace(handle) {
            old.abort();
        }

        let agents = self.agents.restart_persisted();
        if let Err(e) = self.couriers.restore_from_snapshot() {
            warn!(error = %e, "Courier restore failed, starting without couriers");
        }
        let couriers = self.couriers.start_all();

        info!(agents, couriers, "Atlas started");
        StartReport { agents, couriers }
    }

    /// Non-expired entities within `radius_m`, nearest first.
    pub fn query(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
        entity_type: Option<EntityType>,
        limit: usize,
    ) -> Vec<Entity> {
        self.services
            .store
            .query(lat, lon, radius_m, entity_type, limit, Duration::zero())
    }

    pub fn query_by_category(&self, lat: f64, lon: f64, radius_m: f64, category: &str, limit: usize) -> Vec<Entity> {
        self.services
            .store
            .query_by_category(lat, lon, radius_m, category, limit)
    }

    pub fn query_by_name(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
        name: &str,
        entity_type: Option<EntityType>,
        limit: usize,
    ) -> Vec<Entity> {
        self.services
            .store
            .query_by_name(lat, lon, radius_m, name, entity_type, limit)
    }

    /// Places matching `name`, asking the POI search when nothing is stored and
    /// web search is on. Results from the search are stored.
    pub async fn search_places(&self, lat: f64, lon: f64, radius_m: f64, name: &str, limit: usize) -> Result<Vec<Entity>> {
        let stored = self.query_by_name(lat, lon, radius_m, name, Some(EntityType::Place), limit);
        if !stored.is_empty() || !self.services.flags.web_search() {
            return Ok(stored);
        }

        let pois = self.services.geo.search_by_name(lat, lon, radius_m, name).await?;
        let mut found = Vec::new();
        for poi in pois.into_iter().take(limit) {
            match self.services.store.insert(poi.to_entity()) {
                Ok(entity) => found.push(entity),
                Err(e) => warn!(poi_id = %poi.poi_id, error = %e, "Failed to store searched place"),
            }
        }
        info!(name, found = found.len(), "Place search fell back to POI search");
        Ok(found)
    }

    pub async fn find_or_create_agent(&self, lat: f64, lon: f64) -> Result<Entity> {
        self.agents.find_or_create_agent(lat, lon).await
    }

    pub fn list_agents(&self) -> Vec<AgentView> {
        self.agents.list_agents()
    }

    pub fn set_active_users(&self, agent_id: &str, count: usize) -> Result<()> {
        self.agents.set_active_users(agent_id, count)
    }

    /// Create a courier and start its tick loop.
    pub fn create_courier(&self, name: &str, lat: f64, lon: f64) -> Result<CourierState> {
        let courier = self.couriers.create_courier(name, lat, lon)?;
        self.couriers.start(&courier.id)?;
        Ok(courier)
    }

    pub fn list_couriers(&self) -> Vec<CourierState> {
        self.couriers.list()
    }

    pub fn get_courier(&self, id: &str) -> Option<CourierState> {
        self.couriers.get(id)
    }

    pub async fn enable_courier(&self, id: &str) -> Result<CourierState> {
        self.couriers.enable(id).await
    }

    pub async fn disable_courier(&self, id: &str) -> Result<CourierState> {
        self.couriers.disable(id).await
    }

    pub async fn send_courier(&self, id: &str, lat: f64, lon: f64, name: &str) -> Result<CourierState> {
        self.couriers.send_to(id, lat, lon, name).await
    }

    pub async fn set_courier_waypoints(&self, id: &str, waypoints: Vec<Waypoint>) -> Result<CourierState> {
        self.couriers.set_waypoints(id, waypoints).await
    }

    pub fn pending_observations(&self, agent_id: &str) -> Vec<Observation> {
        self.services.awareness.pending(agent_id)
    }

    /// Run awareness triage for one agent now, regardless of debounce.
    pub async fn process_awareness(&self, agent_id: &str) -> Result<Vec<SurfacedItem>> {
        let Some(agent) = self.services.store.get(agent_id) else {
            bail!("Unknown agent '{}'", agent_id);
        };
        let users = self.agents.states().active_users(agent_id);
        let context = format!("{} active users near {}", users, agent.name);
        self.services.awareness.process(agent_id, &context).await
    }

    pub fn flags(&self) -> RuntimeFlagsView {
        self.services.flags.view()
    }

    /// Apply the flags that are set; the others keep their value.
    pub fn update_flags(&self, agentic_mode: Option<bool>, exploration_mode: Option<bool>, web_search: Option<bool>) -> RuntimeFlagsView {
        let flags = &self.services.flags;
        if let Some(on) = agentic_mode {
            flags.set_agentic_mode(on);
        }
        if let Some(on) = exploration_mode {
            flags.set_exploration_mode(on);
        }
        if let Some(on) = web_search {
            flags.set_web_search(on);
        }
        info!(flags = ?flags.view(), "Runtime flags updated");
        flags.view()
    }

    pub fn stats(&self) -> WorldStats {
        WorldStats {
            store: self.services.store.stats(),
            governor: self.services.governor.stats(),
            agents: self.services.store.list_by_type(EntityType::Agent).len(),
            agents_running: self.agents.running_count(),
            couriers: self.couriers.len(),
            couriers_enabled: self.couriers.enabled_count(),
            flags: self.flags(),
        }
    }

    /// Stop agents, then couriers, then maintenance, and close the store.
    pub async fn shutdown(&self) {
        self.agents.shutdown().await;
        self.couriers.shutdown().await;

        self.shutdown.send_replace(true);
        let maintenance = self.maintenance.lock().unwrap().take();
        if let Some(handle) = maintenance {
            if let Err(e) = handle.await {
                warn!(error = %e, "Maintenance task panicked");
            }
        }

        if let Err(e) = self.services.store.close() {
            warn!(error = %e, "Failed to close entity store");
        }
        info!("Atlas stopped");
    }
}

/// Reject coordinates outside the world bounds.
pub fn check_coordinates(lat: f64, lon: f64) -> Result<()> {
    if !valid_coordinates(lat, lon) {
        bail!("Invalid coordinates ({}, {})", lat, lon);
    }
    Ok(())
}
