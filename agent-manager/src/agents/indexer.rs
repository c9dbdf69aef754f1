//! POI indexing: per-agent category passes and opportunistic indexing near walkers.

use super::state::AgentStates;
use crate::services::Services;
use anyhow::{anyhow, Result};
use atlas::awareness::ObservationKind;
use atlas::entity::{AgentStatus, Entity, EntityType};
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Tag used for opportunistic indexing along walks.
const NEARBY_TAG: &str = "amenity";

pub struct PoiIndexer {
    services: Services,
}

/// Outcome of [`PoiIndexer::index_agent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// Indexed within the reindex interval; nothing fetched
    Skipped { poi_count: usize },
    Indexed { poi_count: usize, new_places: usize },
    /// Shutdown arrived mid-pass
    Cancelled,
}

impl PoiIndexer {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Query every configured category around the agent and store the results.
    ///
    /// The agent moves to `indexing` for the pass and back to `active` with the
    /// POI count afterwards. Places not seen before are observed as `new_place`
    /// unless this is the agent's first pass.
    pub async fn index_agent(&self, agent_id: &str, mut shutdown: watch::Receiver<bool>) -> Result<IndexOutcome> {
        let store = &self.services.store;
        let config = &self.services.config.agents;

        let agent = store
            .get(agent_id)
            .ok_or_else(|| anyhow!("agent {} not found", agent_id))?;
        let data = agent.payload.as_agent().cloned().unwrap_or_default();

        if let Some(last) = data.last_indexed {
            if Utc::now() - last < Duration::hours(config.reindex_interval_hours) {
                debug!(agent_id, last_indexed = %last, "Index is fresh, skipping");
                return Ok(IndexOutcome::Skipped {
                    poi_count: data.poi_count,
                });
            }
        }
        let first_pass = data.last_indexed.is_none();

        set_status(&self.services, agent_id, AgentStatus::Indexing)?;
        info!(agent_id, name = %agent.name, categories = config.categories.len(), "Indexing agent area");

        let radius = data.radius_m;
        let delay = StdDuration::from_millis(config.category_delay_ms);
        let mut poi_count = 0;
        let mut new_places = 0;

        for (i, tag) in config.categories.iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        info!(agent_id, "Indexing cancelled by shutdown");
                        return Ok(IndexOutcome::Cancelled);
                    }
                }
            }

            let pois = {
                let _guard = self.services.area_locks.acquire(agent.lat, agent.lon).await;
                match self
                    .services
                    .geo
                    .search_pois(agent.lat, agent.lon, radius, tag)
                    .await
                {
                    Ok(pois) => pois,
                    Err(e) => {
                        warn!(agent_id, tag = %tag, error = %e, "POI search failed");
                        continue;
                    }
                }
            };

            for poi in pois {
                let entity = poi.to_entity();
                let is_new = store.get(&entity.id).is_none();
                match store.insert(entity) {
                    Ok(stored) => {
                        poi_count += 1;
                        if is_new && !first_pass {
                            new_places += 1;
                            self.services.awareness.observe(
                                agent_id,
                                ObservationKind::NewPlace,
                                json!({
                                    "name": stored.name,
                                    "category": poi.category,
                                    "message": format!("New {} nearby: {}", poi.category, stored.name),
                                }),
                            );
                        }
                    }
                    Err(e) => warn!(agent_id, poi_id = %poi.poi_id, error = %e, "Failed to store POI"),
                }
            }
        }

        store.modify(agent_id, |e| {
            if let Some(a) = e.payload.as_agent_mut() {
                a.status = AgentStatus::Active;
                a.poi_count = poi_count;
                a.last_indexed = Some(Utc::now());
            }
        })?;

        info!(agent_id, poi_count, new_places, "Agent indexing complete");
        Ok(IndexOutcome::Indexed {
            poi_count,
            new_places,
        })
    }

    /// Keep an agent's index current until shutdown.
    ///
    /// Runs a pass immediately, then re-checks every `reindex_check_seconds`;
    /// [`index_agent`](Self::index_agent) skips passes younger than the reindex
    /// interval, so the agent re-enters `indexing` once its index goes stale.
    pub async fn run_index_loop(
        self: Arc<Self>,
        agent_id: String,
        states: Arc<AgentStates>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let check = StdDuration::from_secs(self.services.config.agents.reindex_check_seconds.max(1));

        loop {
            if self.services.store.get(&agent_id).is_none() {
                warn!(agent_id = %agent_id, "Agent entity missing, stopping index loop");
                break;
            }

            match self.index_agent(&agent_id, shutdown.clone()).await {
                Ok(IndexOutcome::Indexed { poi_count, new_places }) => {
                    states.mark_fresh(&agent_id, "poi");
                    debug!(agent_id = %agent_id, poi_count, new_places, "Index pass finished");
                }
                Ok(IndexOutcome::Cancelled) => break,
                Ok(IndexOutcome::Skipped { .. }) => {}
                Err(e) => warn!(agent_id = %agent_id, error = %e, "Indexing failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(check) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(agent_id = %agent_id, "Index loop stopped");
    }

    /// Index places around a point unless some are already stored there.
    ///
    /// Returns the number of places stored (0 when skipped).
    pub async fn index_near(&self, lat: f64, lon: f64, radius_m: f64) -> Result<usize> {
        if self.has_places(lat, lon, radius_m) {
            return Ok(0);
        }

        let _guard = self.services.area_locks.acquire(lat, lon).await;
        if self.has_places(lat, lon, radius_m) {
            return Ok(0);
        }

        let pois = self
            .services
            .geo
            .search_pois(lat, lon, radius_m, NEARBY_TAG)
            .await?;
        let mut stored = 0;
        for poi in pois {
            match self.services.store.insert(poi.to_entity()) {
                Ok(_) => stored += 1,
                Err(e) => warn!(poi_id = %poi.poi_id, error = %e, "Failed to store POI"),
            }
        }

        debug!(lat, lon, stored, "Indexed places near walker");
        Ok(stored)
    }

    fn has_places(&self, lat: f64, lon: f64, radius_m: f64) -> bool {
        !self
            .services
            .store
            .query(lat, lon, radius_m, Some(EntityType::Place), 1, Duration::zero())
            .is_empty()
    }
}

fn set_status(services: &Services, agent_id: &str, status: AgentStatus) -> Result<Option<Entity>> {
    services.store.modify(agent_id, |e| {
        if let Some(a) = e.payload.as_agent_mut() {
            a.status = status;
        }
    })
}
