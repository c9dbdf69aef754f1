//! Agent manager - finds, creates and runs agents.

use super::indexer::PoiIndexer;
use super::live::LiveRefresher;
use super::state::{AgentRuntime, AgentStates};
use crate::services::Services;
use crate::simulation::explorer::Explorer;
use anyhow::{bail, Result};
use atlas::entity::{AgentData, Entity, EntityType, Payload};
use atlas::spatial::geo::{haversine_m, valid_coordinates};
use chrono::Duration;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Agents looked at when searching for an existing one nearby.
const NEARBY_AGENT_LIMIT: usize = 50;

/// Agent entity plus its in-memory runtime state.
#[derive(Clone, Debug, Serialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub agent: Entity,
    pub running: bool,
    pub runtime: Option<AgentRuntime>,
}

pub struct AgentManager {
    services: Services,
    states: Arc<AgentStates>,
    indexer: Arc<PoiIndexer>,
    refresher: Arc<LiveRefresher>,
    /// Indexing and live loop handles per agent
    running: DashMap<String, Vec<JoinHandle<()>>>,
    /// Serializes agent creation; area cells are smaller than the agent radius
    creating: Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl AgentManager {
    pub fn new(services: Services, indexer: Arc<PoiIndexer>, explorer: Arc<Explorer>) -> Self {
        let states = Arc::new(AgentStates::new());
        let refresher = Arc::new(LiveRefresher::new(
            services.clone(),
            states.clone(),
            explorer,
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            services,
            states,
            indexer,
            refresher,
            running: DashMap::new(),
            creating: Mutex::new(()),
            shutdown,
        }
    }

    pub fn states(&self) -> &AgentStates {
        &self.states
    }

    /// Nearest agent whose position is within the agent radius of (`lat`, `lon`).
    fn nearby_agent(&self, lat: f64, lon: f64) -> Option<Entity> {
        let radius = self.services.config.agents.radius_m;
        self.services
            .store
            .query(
                lat,
                lon,
                radius,
                Some(EntityType::Agent),
                NEARBY_AGENT_LIMIT,
                Duration::zero(),
            )
            .into_iter()
            .find(|a| haversine_m(lat, lon, a.lat, a.lon) <= radius)
    }

    /// Return the agent covering (`lat`, `lon`), creating and starting one if
    /// none exists.
    pub async fn find_or_create_agent(&self, lat: f64, lon: f64) -> Result<Entity> {
        if !valid_coordinates(lat, lon) {
            bail!("Invalid coordinates ({}, {})", lat, lon);
        }

        if let Some(agent) = self.nearby_agent(lat, lon) {
            debug!(agent_id = %agent.id, "Reusing existing agent");
            self.start_agent(&agent);
            return Ok(agent);
        }

        let _guard = self.creating.lock().await;
        if let Some(agent) = self.nearby_agent(lat, lon) {
            self.start_agent(&agent);
            return Ok(agent);
        }

        let name = self.area_name(lat, lon).await;
        let agent = self.services.store.insert(Entity::new(
            EntityType::Agent,
            name,
            lat,
            lon,
            Payload::Agent(AgentData {
                radius_m: self.services.config.agents.radius_m,
                ..Default::default()
            }),
        ))?;

        info!(agent_id = %agent.id, name = %agent.name, lat, lon, "Agent created");
        self.start_agent(&agent);
        Ok(agent)
    }

    async fn area_name(&self, lat: f64, lon: f64) -> String {
        match self.services.geo.reverse_geocode(lat, lon).await {
            Ok(Some(location)) => location
                .locality
                .filter(|l| !l.is_empty())
                .unwrap_or(location.display_name),
            Ok(None) => fallback_name(lat, lon),
            Err(e) => {
                warn!(lat, lon, error = %e, "Reverse geocoding failed, using fallback name");
                fallback_name(lat, lon)
            }
        }
    }

    pub fn list_agents(&self) -> Vec<AgentView> {
        let mut agents: Vec<AgentView> = self
            .services
            .store
            .list_by_type(EntityType::Agent)
            .into_iter()
            .map(|agent| AgentView {
                running: self.is_running(&agent.id),
                runtime: self.states.get(&agent.id),
                agent,
            })
            .collect();
        agents.sort_by(|a, b| a.agent.name.cmp(&b.agent.name));
        agents
    }

    pub fn is_running(&self, agent_id: &str) -> bool {
        self.running
            .get(agent_id)
            .map_or(false, |h| h.iter().any(|h| !h.is_finished()))
    }

    pub fn running_count(&self) -> usize {
        self.running
            .iter()
            .filter(|h| h.value().iter().any(|h| !h.is_finished()))
            .count()
    }

    /// Spawn the index loop and live loop for `agent`.
    ///
    /// Returns false if the agent's loops are already running.
    pub fn start_agent(&self, agent: &Entity) -> bool {
        if *self.shutdown.borrow() {
            warn!(agent_id = %agent.id, "Not starting agent during shutdown");
            return false;
        }

        let slot = match self.running.entry(agent.id.clone()) {
            Entry::Occupied(e) if e.get().iter().any(|h| !h.is_finished()) => return false,
            slot => slot,
        };

        let index_task = tokio::spawn(self.indexer.clone().run_index_loop(
            agent.id.clone(),
            self.states.clone(),
            self.shutdown.subscribe(),
        ));
        let live_task = tokio::spawn(
            self.refresher
                .clone()
                .run_live_loop(agent.id.clone(), self.shutdown.subscribe()),
        );
        slot.insert(vec![index_task, live_task]);

        info!(agent_id = %agent.id, name = %agent.name, "Agent started");
        true
    }

    /// Start every agent found in the store. Returns how many were started.
    pub fn restart_persisted(&self) -> usize {
        let agents = self.services.store.list_by_type(EntityType::Agent);
        let started = agents.iter().filter(|a| self.start_agent(a)).count();
        if started > 0 {
            info!(count = started, "Restarted persisted agents");
        }
        started
    }

    pub fn set_active_users(&self, agent_id: &str, count: usize) -> Result<()> {
        if self.services.store.get(agent_id).is_none() {
            bail!("Unknown agent '{}'", agent_id);
        }
        self.states.set_active_users(agent_id, count);
        Ok(())
    }

    /// Signal every agent task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let ids: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        let mut stopped = 0;
        for id in ids {
            let Some((_, handles)) = self.running.remove(&id) else {
                continue;
            };
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(agent_id = %id, error = %e, "Agent task panicked");
                }
            }
            stopped += 1;
        }
        info!(agents = stopped, "Agents stopped");
    }
}

fn fallback_name(lat: f64, lon: f64) -> String {
    format!("Area {:.2},{:.2}", lat, lon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_services, FakeGeo};
    use atlas::entity::LocationData;
    use chrono::Utc;
    use std::time::Duration as StdDuration;

    fn manager(geo: Arc<FakeGeo>) -> AgentManager {
        let services = test_services(geo, None);
        let indexer = Arc::new(PoiIndexer::new(services.clone()));
        let explorer = Arc::new(Explorer::new(services.clone(), indexer.clone()));
        AgentManager::new(services, indexer, explorer)
    }

    #[tokio::test]
    async fn test_creates_named_agent_once() {
        let geo = FakeGeo::new();
        *geo.location.lock().unwrap() = Some(LocationData {
            display_name: "Kingston upon Thames, London, England".to_string(),
            locality: Some("Kingston upon Thames".to_string()),
            country: Some("United Kingdom".to_string()),
        });
        let manager = manager(geo.clone());

        let agent = manager.find_or_create_agent(51.41, -0.30).await.unwrap();
        assert_eq!(agent.name, "Kingston upon Thames");
        assert!(manager.is_running(&agent.id));

        // 1 km away is inside the agent radius
        let again = manager.find_or_create_agent(51.419, -0.30).await.unwrap();
        assert_eq!(again.id, agent.id);
        assert_eq!(manager.services.store.list_by_type(EntityType::Agent).len(), 1);

        manager.shutdown().await;
        assert_eq!(manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_create_one_agent() {
        let manager = manager(FakeGeo::new());
        let (a, b) = tokio::join!(
            manager.find_or_create_agent(51.41, -0.30),
            manager.find_or_create_agent(51.411, -0.301),
        );
        assert_eq!(a.unwrap().id, b.unwrap().id);
        assert_eq!(manager.list_agents().len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_in_neighbouring_cells_share_agent() {
        let geo = FakeGeo::new();
        *geo.geocode_delay.lock().unwrap() = Some(StdDuration::from_millis(500));
        let manager = manager(geo);

        // ~2 km apart: different area cells, same agent radius
        let (a, b) = tokio::join!(
            manager.find_or_create_agent(51.41, -0.30),
            manager.find_or_create_agent(51.428, -0.30),
        );
        assert_eq!(a.unwrap().id, b.unwrap().id);
        assert_eq!(manager.services.store.list_by_type(EntityType::Agent).len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start_spawns_one_set_of_loops() {
        let manager = Arc::new(manager(FakeGeo::new()));
        let agent = manager
            .services
            .store
            .insert(Entity::new(
                EntityType::Agent,
                "Kingston",
                51.41,
                -0.30,
                Payload::Agent(AgentData::default()),
            ))
            .unwrap();

        let starts: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                let agent = agent.clone();
                tokio::spawn(async move { manager.start_agent(&agent) })
            })
            .collect();
        let mut started = 0;
        for start in starts {
            if start.await.unwrap() {
                started += 1;
            }
        }

        assert_eq!(started, 1);
        assert_eq!(manager.running.get(&agent.id).unwrap().len(), 2);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_index_is_refreshed_while_running() {
        let geo = FakeGeo::new();
        let manager = manager(geo.clone());
        let agent = manager.find_or_create_agent(51.41, -0.30).await.unwrap();
        let check = StdDuration::from_secs(manager.services.config.agents.reindex_check_seconds);

        tokio::time::sleep(StdDuration::from_secs(1)).await;
        assert_eq!(geo.calls("search_pois"), 1);
        let first = manager.states().fresh_at(&agent.id, "poi").unwrap();

        // Fresh index: the periodic check skips
        tokio::time::sleep(check).await;
        assert_eq!(geo.calls("search_pois"), 1);

        manager
            .services
            .store
            .modify(&agent.id, |e| {
                if let Some(a) = e.payload.as_agent_mut() {
                    a.last_indexed = Some(Utc::now() - Duration::hours(48));
                }
            })
            .unwrap();

        tokio::time::sleep(check).await;
        assert_eq!(geo.calls("search_pois"), 2);
        assert!(manager.states().fresh_at(&agent.id, "poi").unwrap() >= first);
        let data = manager.services.store.get(&agent.id).unwrap();
        assert!(Utc::now() - data.payload.as_agent().unwrap().last_indexed.unwrap() < Duration::hours(1));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_fallback_name_when_geocoding_fails() {
        let geo = FakeGeo::new();
        geo.fail("reverse_geocode");
        let manager = manager(geo);

        let agent = manager.find_or_create_agent(51.41, -0.30).await.unwrap();
        assert_eq!(agent.name, "Area 51.41,-0.30");
        assert!(manager.find_or_create_agent(91.0, 0.0).await.is_err());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_far_point_gets_new_agent() {
        let manager = manager(FakeGeo::new());
        let kingston = manager.find_or_create_agent(51.41, -0.30).await.unwrap();
        let camden = manager.find_or_create_agent(51.54, -0.14).await.unwrap();
        assert_ne!(kingston.id, camden.id);
        assert_eq!(manager.running_count(), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_persisted_starts_each_agent_once() {
        let manager = manager(FakeGeo::new());
        for (name, lat) in [("North", 51.50), ("South", 51.30)] {
            manager
                .services
                .store
                .insert(Entity::new(
                    EntityType::Agent,
                    name,
                    lat,
                    -0.30,
                    Payload::Agent(AgentData::default()),
                ))
                .unwrap();
        }

        assert_eq!(manager.restart_persisted(), 2);
        assert_eq!(manager.restart_persisted(), 0);
        assert_eq!(manager.running_count(), 2);

        let names: Vec<String> = manager
            .list_agents()
            .into_iter()
            .filter(|v| v.running)
            .map(|v| v.agent.name)
            .collect();
        assert_eq!(names, vec!["North", "South"]);

        manager.shutdown().await;
        assert_eq!(manager.running_count(), 0);
        // No restarts once shut down
        assert_eq!(manager.restart_persisted(), 0);
    }

    #[tokio::test]
    async fn test_set_active_users() {
        let manager = manager(FakeGeo::new());
        let agent = manager.find_or_create_agent(51.41, -0.30).await.unwrap();

        manager.set_active_users(&agent.id, 3).unwrap();
        assert_eq!(manager.states().active_users(&agent.id), 3);
        assert!(manager.set_active_users("missing", 1).is_err());
        manager.shutdown().await;
    }
}
