//! Couriers: simulated walkers travelling between agents' areas.
//!
//! Each courier owns a tick loop. On every tick it either plans a route (next
//! waypoint, else a destination picked from street connectivity) or walks about
//! `step_m` along the current one, indexing POIs near its position. Arriving
//! records the simplified track as a street entity joining the two agents.
//! Courier state survives restarts through gzip snapshots.

use super::connectivity::{self, AgentNode, Destination, Graph, SelectionReason};
use super::simplify::simplify;
use super::walk::advance;
use crate::agents::indexer::PoiIndexer;
use crate::services::Services;
use anyhow::{bail, Context, Result};
use atlas::awareness::ObservationKind;
use atlas::entity::{Entity, EntityType, Payload, StreetData};
use atlas::snapshot::SnapshotManager;
use atlas::spatial::geo::{polyline_length_m, valid_coordinates};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SNAPSHOT_KIND: &str = "couriers";

/// Agents considered when building the connectivity graph.
const MAX_CANDIDATE_AGENTS: usize = 500;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CourierState {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub enabled: bool,
    /// Current route as `[lat, lon]` points; empty when idle
    #[serde(default)]
    pub route: Vec<[f64; 2]>,
    #[serde(default)]
    pub route_index: usize,
    #[serde(default)]
    pub destination: Option<Destination>,
    /// Agent the current trip started from
    #[serde(default)]
    pub origin_agent: Option<String>,
    #[serde(default)]
    pub waypoints: VecDeque<Waypoint>,
    #[serde(default)]
    pub distance_m: f64,
    #[serde(default)]
    pub trips: u64,
    #[serde(default)]
    pub steps_since_persist: usize,
    pub updated_at: DateTime<Utc>,
}

impl CourierState {
    pub fn new(name: impl Into<String>, lat: f64, lon: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            lat,
            lon,
            enabled: true,
            route: Vec::new(),
            route_index: 0,
            destination: None,
            origin_agent: None,
            waypoints: VecDeque::new(),
            distance_m: 0.0,
            trips: 0,
            steps_since_persist: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_walking(&self) -> bool {
        !self.route.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Disabled,
    /// No waypoint and no destination candidate
    Idle,
    Routed,
    NoRoute,
    Moved,
    Arrived,
}

pub struct CourierManager {
    services: Services,
    indexer: Arc<PoiIndexer>,
    /// Live state, locked for the duration of a tick
    couriers: DashMap<String, Arc<Mutex<CourierState>>>,
    /// Copy of each courier as of its last tick or control call
    published: DashMap<String, CourierState>,
    snapshots: Arc<SnapshotManager>,
    handles: StdMutex<HashMap<String, JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl CourierManager {
    pub fn new(services: Services, indexer: Arc<PoiIndexer>) -> Self {
        let snapshots = Arc::new(SnapshotManager::new(
            services.config.snapshot.clone(),
            SNAPSHOT_KIND,
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            services,
            indexer,
            couriers: DashMap::new(),
            published: DashMap::new(),
            snapshots,
            handles: StdMutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Register a new courier at (`lat`, `lon`). The tick loop is started by
    /// [`CourierManager::start`].
    pub fn create_courier(&self, name: &str, lat: f64, lon: f64) -> Result<CourierState> {
        if !valid_coordinates(lat, lon) {
            bail!("Invalid coordinates ({}, {})", lat, lon);
        }
        let name = if name.trim().is_empty() {
            format!("Courier {}", self.couriers.len() + 1)
        } else {
            name.trim().to_string()
        };

        let state = CourierState::new(name, lat, lon);
        self.insert(state.clone());
        info!(courier_id = %state.id, name = %state.name, lat, lon, "Courier created");
        Ok(state)
    }

    fn insert(&self, state: CourierState) {
        self.published.insert(state.id.clone(), state.clone());
        self.couriers
            .insert(state.id.clone(), Arc::new(Mutex::new(state)));
    }

    pub fn get(&self, id: &str) -> Option<CourierState> {
        self.published.get(id).map(|c| c.value().clone())
    }

    /// All couriers ordered by name.
    pub fn list(&self) -> Vec<CourierState> {
        let mut couriers: Vec<CourierState> =
            self.published.iter().map(|c| c.value().clone()).collect();
        couriers.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        couriers
    }

    pub fn len(&self) -> usize {
        self.published.len()
    }

    pub fn is_empty(&self) -> bool {
        self.published.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.published.iter().filter(|c| c.enabled).count()
    }

    pub async fn enable(&self, id: &str) -> Result<CourierState> {
        self.update(id, |s| s.enabled = true).await
    }

    pub async fn disable(&self, id: &str) -> Result<CourierState> {
        self.update(id, |s| s.enabled = false).await
    }

    /// Abandon the current route and head for (`lat`, `lon`) on the next tick.
    pub async fn send_to(&self, id: &str, lat: f64, lon: f64, name: &str) -> Result<CourierState> {
        if !valid_coordinates(lat, lon) {
            bail!("Invalid coordinates ({}, {})", lat, lon);
        }
        let waypoint = Waypoint {
            lat,
            lon,
            name: name.to_string(),
        };
        self.update(id, move |s| {
            s.route.clear();
            s.route_index = 0;
            s.destination = None;
            s.waypoints.push_front(waypoint);
        })
        .await
    }

    /// Replace the waypoint queue. The current route, if any, is finished first.
    pub async fn set_waypoints(&self, id: &str, waypoints: Vec<Waypoint>) -> Result<CourierState> {
        if let Some(bad) = waypoints.iter().find(|w| !valid_coordinates(w.lat, w.lon)) {
            bail!("Invalid waypoint coordinates ({}, {})", bad.lat, bad.lon);
        }
        self.update(id, move |s| s.waypoints = waypoints.into()).await
    }

    async fn update(&self, id: &str, f: impl FnOnce(&mut CourierState)) -> Result<CourierState> {
        let cell = self.cell(id)?;
        let mut state = cell.lock().await;
        f(&mut state);
        state.updated_at = Utc::now();
        self.published.insert(id.to_string(), state.clone());
        Ok(state.clone())
    }

    fn cell(&self, id: &str) -> Result<Arc<Mutex<CourierState>>> {
        self.couriers
            .get(id)
            .map(|c| c.value().clone())
            .with_context(|| format!("Unknown courier '{}'", id))
    }

    /// Advance courier `id` by one tick.
    pub async fn tick(&self, id: &str) -> Result<TickOutcome> {
        let cell = self.cell(id)?;
        let mut state = cell.lock().await;
        if !state.enabled {
            return Ok(TickOutcome::Disabled);
        }

        let outcome = if state.is_walking() {
            self.walk(&mut state).await?
        } else {
            self.plan_route(&mut state).await?
        };

        let persist = match outcome {
            TickOutcome::Arrived => true,
            TickOutcome::Moved => state.steps_since_persist >= self.services.config.courier.persist_every_steps,
            _ => false,
        };
        if persist {
            state.steps_since_persist = 0;
        }
        state.updated_at = Utc::now();
        self.published.insert(id.to_string(), state.clone());
        drop(state);

        if persist {
            self.persist().await;
        }
        Ok(outcome)
    }

    async fn plan_route(&self, state: &mut CourierState) -> Result<TickOutcome> {
        let waypoint = state.waypoints.pop_front();
        let target = match &waypoint {
            Some(w) => Destination {
                agent_id: None,
                name: w.name.clone(),
                lat: w.lat,
                lon: w.lon,
                reason: SelectionReason::Manual,
            },
            None => match self.choose_destination(state.lat, state.lon) {
                Some(d) => d,
                None => return Ok(TickOutcome::Idle),
            },
        };

        let route = match self
            .services
            .geo
            .walking_route((state.lat, state.lon), (target.lat, target.lon))
            .await
        {
            Ok(route) => route,
            Err(e) => {
                // Keep the waypoint for the next attempt
                if let Some(w) = waypoint {
                    state.waypoints.push_front(w);
                }
                return Err(e);
            }
        };

        match route {
            Some(route) if route.points.len() >= 2 => {
                info!(
                    courier_id = %state.id,
                    destination = %target.name,
                    reason = ?target.reason,
                    distance_m = route.distance_m.round(),
                    "Courier routed"
                );
                state.origin_agent = self.agent_at(state.lat, state.lon);
                state.route = route.points;
                state.route_index = 0;
                state.destination = Some(target);
                Ok(TickOutcome::Routed)
            }
            _ => {
                warn!(courier_id = %state.id, destination = %target.name, "No walking route to destination");
                Ok(TickOutcome::NoRoute)
            }
        }
    }

    fn choose_destination(&self, lat: f64, lon: f64) -> Option<Destination> {
        let config = &self.services.config.courier;
        let store = &self.services.store;
        let agents: Vec<AgentNode> = store
            .query(
                lat,
                lon,
                config.candidate_radius_m,
                Some(EntityType::Agent),
                MAX_CANDIDATE_AGENTS,
                Duration::zero(),
            )
            .iter()
            .map(AgentNode::from)
            .collect();
        let streets: Vec<StreetData> = store
            .list_by_type(EntityType::Street)
            .into_iter()
            .filter_map(|e| e.payload.as_street().cloned())
            .collect();

        let graph = Graph::build(agents, &streets, config.connect_radius_m);
        connectivity::select_destination(&graph, lat, lon, config.connect_radius_m)
    }

    /// Agent whose position is within the connect radius, nearest first.
    fn agent_at(&self, lat: f64, lon: f64) -> Option<String> {
        self.services
            .store
            .query(
                lat,
                lon,
                self.services.config.courier.connect_radius_m,
                Some(EntityType::Agent),
                1,
                Duration::zero(),
            )
            .into_iter()
            .next()
            .map(|a| a.id)
    }

    async fn walk(&self, state: &mut CourierState) -> Result<TickOutcome> {
        let config = &self.services.config.courier;
        let step = advance(&state.route, state.route_index, config.step_m);

        state.steps_since_persist += step.index.saturating_sub(state.route_index);
        state.route_index = step.index;
        state.lat = step.position[0];
        state.lon = step.position[1];
        state.distance_m += step.walked_m;

        if let Err(e) = self
            .indexer
            .index_near(state.lat, state.lon, config.poi_radius_m)
            .await
        {
            warn!(courier_id = %state.id, error = %e, "Indexing near courier failed");
        }

        if step.finished {
            self.arrive(state);
            return Ok(TickOutcome::Arrived);
        }
        Ok(TickOutcome::Moved)
    }

    fn arrive(&self, state: &mut CourierState) {
        state.trips += 1;
        let destination = state.destination.take();
        let origin = state.origin_agent.take();
        let to_agent = destination
            .as_ref()
            .and_then(|d| d.agent_id.clone())
            .or_else(|| self.agent_at(state.lat, state.lon));

        let points = simplify(&state.route, self.services.config.courier.simplify_tolerance_m);
        let length_m = polyline_length_m(&points);
        let [start_lat, start_lon] = points[0];
        let street = Entity::new(
            EntityType::Street,
            format!("{} trip {}", state.name, state.trips),
            start_lat,
            start_lon,
            Payload::Street(StreetData {
                points,
                length_m,
                from_agent: origin,
                to_agent: to_agent.clone(),
                source: "courier".to_string(),
            }),
        );
        if let Err(e) = self.services.store.insert(street) {
            warn!(courier_id = %state.id, error = %e, "Failed to store courier street");
        }

        let destination_name = destination.map(|d| d.name).unwrap_or_default();
        if let Some(agent_id) = &to_agent {
            self.services.awareness.observe(
                agent_id,
                ObservationKind::CourierArrival,
                json!({
                    "courier": state.name,
                    "destination": destination_name,
                    "length_m": length_m.round(),
                    "message": format!("{} arrived after walking {:.0} m", state.name, length_m),
                }),
            );
        }

        info!(
            courier_id = %state.id,
            destination = %destination_name,
            trips = state.trips,
            length_m = length_m.round(),
            "Courier arrived"
        );

        state.route.clear();
        state.route_index = 0;
    }

    /// Write every courier to a new snapshot. Failures are logged.
    pub async fn persist(&self) {
        if !self.snapshots.is_enabled() {
            return;
        }
        let items = self.list();
        let snapshots = self.snapshots.clone();
        match tokio::task::spawn_blocking(move || snapshots.save(items)).await {
            Ok(Ok(Some(path))) => debug!(path = %path.display(), "Courier snapshot written"),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to write courier snapshot"),
            Err(e) => warn!(error = %e, "Courier snapshot task failed"),
        }
    }

    /// Load couriers from the newest readable snapshot. Returns how many were restored.
    pub fn restore_from_snapshot(&self) -> Result<usize> {
        if !self.snapshots.is_enabled() {
            return Ok(0);
        }
        let Some(snapshot) = self
            .snapshots
            .load_latest::<CourierState>()
            .context("Failed to load courier snapshot")?
        else {
            info!("No courier snapshot found");
            return Ok(0);
        };

        let count = snapshot.items.len();
        for state in snapshot.items {
            self.insert(state);
        }
        info!(count, created_at = %snapshot.created_at, "Couriers restored from snapshot");
        Ok(count)
    }

    /// Spawn the tick loop for courier `id` unless one is already running.
    pub fn start(self: &Arc<Self>, id: &str) -> Result<()> {
        self.cell(id)?;
        let mut handles = self.handles.lock().unwrap();
        if handles.get(id).map_or(false, |h| !h.is_finished()) {
            return Ok(());
        }
        let handle = tokio::spawn(
            self.clone()
                .run_tick_loop(id.to_string(), self.shutdown.subscribe()),
        );
        handles.insert(id.to_string(), handle);
        Ok(())
    }

    /// Start loops for every registered courier. Returns how many were started.
    pub fn start_all(self: &Arc<Self>) -> usize {
        let ids: Vec<String> = self.couriers.iter().map(|c| c.key().clone()).collect();
        ids.iter().filter(|id| self.start(id).is_ok()).count()
    }

    async fn run_tick_loop(self: Arc<Self>, id: String, mut shutdown: watch::Receiver<bool>) {
        let interval = std::time::Duration::from_secs(self.services.config.courier.tick_seconds);
        debug!(courier_id = %id, "Courier loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            match self.tick(&id).await {
                Ok(outcome) => debug!(courier_id = %id, outcome = ?outcome, "Courier tick"),
                Err(e) if !self.couriers.contains_key(&id) => {
                    debug!(courier_id = %id, error = %e, "Courier removed, stopping loop");
                    break;
                }
                Err(e) => warn!(courier_id = %id, error = %e, "Courier tick failed"),
            }
        }

        debug!(courier_id = %id, "Courier loop stopped");
    }

    pub fn running_count(&self) -> usize {
        self.handles
            .lock()
            .unwrap()
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Stop all tick loops and write a final snapshot.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .unwrap()
            .drain()
            .map(|(_, h)| h)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Courier loop panicked");
            }
        }
        self.persist().await;
        info!(couriers = self.len(), "Couriers stopped");
    }
}

#[cfg(test)]
mod tests;
