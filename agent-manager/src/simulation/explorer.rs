//! Explorer: a walker wandering inside one agent's area.
//!
//! Each step picks a target (an unconnected nearby place or a random point),
//! routes there on foot, indexes POIs along the way and records the walk as a
//! street entity. Explorer state lives on the agent entity.

use super::simplify::simplify;
use crate::agents::indexer::PoiIndexer;
use crate::services::Services;
use anyhow::Result;
use atlas::awareness::ObservationKind;
use atlas::config::CourierConfig;
use atlas::entity::{Entity, EntityType, ExplorerState, Payload, StreetData};
use atlas::spatial::geo::{destination, haversine_m, polyline_length_m};
use chrono::{Duration, Utc};
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A place counts as connected when a street ends this close to it.
const PLACE_CONNECTED_M: f64 = 50.0;

#[derive(Debug, Clone, PartialEq)]
pub enum ExploreTarget {
    Place { name: String, lat: f64, lon: f64 },
    Random { lat: f64, lon: f64, bearing: f64, distance_m: f64 },
}

impl ExploreTarget {
    pub fn position(&self) -> (f64, f64) {
        match self {
            ExploreTarget::Place { lat, lon, .. } | ExploreTarget::Random { lat, lon, .. } => (*lat, *lon),
        }
    }
}

/// Choose the next exploration target from (`lat`, `lon`).
///
/// With `explore_place_probability` the target is a random place within
/// `explore_max_m` that no street reaches yet; otherwise, or when there is no
/// such place, a random bearing at `explore_min_m..=explore_max_m`.
pub fn choose_target<R: Rng>(
    rng: &mut R,
    lat: f64,
    lon: f64,
    places: &[Entity],
    streets: &[StreetData],
    config: &CourierConfig,
) -> ExploreTarget {
    if rng.gen_bool(config.explore_place_probability.clamp(0.0, 1.0)) {
        let unconnected: Vec<&Entity> = places
            .iter()
            .filter(|p| haversine_m(lat, lon, p.lat, p.lon) <= config.explore_max_m)
            .filter(|p| {
                !streets.iter().filter_map(StreetData::endpoints).any(|(a, b)| {
                    haversine_m(a[0], a[1], p.lat, p.lon) <= PLACE_CONNECTED_M
                        || haversine_m(b[0], b[1], p.lat, p.lon) <= PLACE_CONNECTED_M
                })
            })
            .collect();

        if !unconnected.is_empty() {
            let place = unconnected[rng.gen_range(0..unconnected.len())];
            return ExploreTarget::Place {
                name: place.name.clone(),
                lat: place.lat,
                lon: place.lon,
            };
        }
    }

    let bearing = rng.gen_range(0.0..360.0);
    let max = config.explore_max_m.max(config.explore_min_m);
    let distance_m = rng.gen_range(config.explore_min_m..=max);
    let (lat, lon) = destination(lat, lon, bearing, distance_m);
    ExploreTarget::Random {
        lat,
        lon,
        bearing,
        distance_m,
    }
}

pub struct Explorer {
    services: Services,
    indexer: Arc<PoiIndexer>,
}

impl Explorer {
    pub fn new(services: Services, indexer: Arc<PoiIndexer>) -> Self {
        Self { services, indexer }
    }

    /// Take one exploration step for `agent`.
    ///
    /// Returns the updated explorer state, or `None` when no route was found.
    pub async fn step(&self, agent: &Entity) -> Result<Option<ExplorerState>> {
        let config = &self.services.config.courier;
        let store = &self.services.store;

        // Re-read so the explorer position written by the previous step is used
        let current = store.get(&agent.id).unwrap_or_else(|| agent.clone());
        let mut state = current
            .payload
            .as_agent()
            .and_then(|a| a.explorer.clone())
            .unwrap_or_else(|| ExplorerState::at_home(agent.lat, agent.lon));

        let places = store.query(
            state.lat,
            state.lon,
            config.explore_max_m,
            Some(EntityType::Place),
            50,
            Duration::zero(),
        );
        let streets: Vec<StreetData> = store
            .query(
                state.lat,
                state.lon,
                config.explore_max_m + PLACE_CONNECTED_M,
                Some(EntityType::Street),
                200,
                Duration::zero(),
            )
            .into_iter()
            .filter_map(|e| e.payload.as_street().cloned())
            .collect();

        let target = {
            let mut rng = rand::thread_rng();
            choose_target(&mut rng, state.lat, state.lon, &places, &streets, config)
        };
        let (to_lat, to_lon) = target.position();

        let Some(route) = self
            .services
            .geo
            .walking_route((state.lat, state.lon), (to_lat, to_lon))
            .await?
        else {
            debug!(agent_id = %agent.id, "No route for exploration target");
            return Ok(None);
        };
        if route.points.len() < 2 {
            return Ok(None);
        }

        let sample_every = (route.points.len() / 5).max(1);
        for point in route.points.iter().step_by(sample_every) {
            if let Err(e) = self
                .indexer
                .index_near(point[0], point[1], config.poi_radius_m)
                .await
            {
                warn!(agent_id = %agent.id, error = %e, "Indexing along exploration route failed");
            }
        }

        let points = simplify(&route.points, config.simplify_tolerance_m);
        let length_m = polyline_length_m(&points);
        let [end_lat, end_lon] = route.points[route.points.len() - 1];
        let [start_lat, start_lon] = points[0];

        let street = Entity::new(
            EntityType::Street,
            format!("{} walk {}", agent.name, state.steps_total + 1),
            start_lat,
            start_lon,
            Payload::Street(StreetData {
                points,
                length_m,
                from_agent: Some(agent.id.clone()),
                to_agent: None,
                source: "explorer".to_string(),
            }),
        );
        store.insert(street)?;

        state.lat = end_lat;
        state.lon = end_lon;
        state.record_step(Utc::now().date_naive());

        let saved = state.clone();
        store.modify(&agent.id, move |e| {
            if let Some(a) = e.payload.as_agent_mut() {
                a.explorer = Some(saved);
            }
        })?;

        let target_label = match &target {
            ExploreTarget::Place { name, .. } => name.clone(),
            ExploreTarget::Random { bearing, .. } => format!("bearing {:.0}°", bearing),
        };
        self.services.awareness.observe(
            &agent.id,
            ObservationKind::Exploration,
            json!({
                "target": target_label,
                "length_m": length_m.round(),
                "steps_today": state.steps_today,
                "message": format!("Explored {:.0} m towards {}", length_m, target_label),
            }),
        );

        info!(
            agent_id = %agent.id,
            target = %target_label,
            length_m = length_m.round(),
            steps_today = state.steps_today,
            "Exploration step complete"
        );
        Ok(Some(state))
    }
}
