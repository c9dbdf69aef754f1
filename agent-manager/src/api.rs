//! Atlas HTTP API.
//!
//! - `GET /api/entities`: entities near a point
//! - `GET /api/places/category`, `GET /api/places/search`: place lookups
//! - `GET|POST /api/agents`, `POST /api/agents/:id/users`: agents
//! - `GET|POST /api/couriers`, `POST /api/couriers/:id/{enable,disable,send,waypoints}`
//! - `GET /api/awareness/:agent_id`, `POST /api/awareness/:agent_id/process`
//! - `GET|POST /api/flags`, `GET /api/stats`

use crate::agents::AgentView;
use crate::simulation::{CourierState, Waypoint};
use crate::world::{check_coordinates, Atlas, WorldStats};
use atlas::awareness::{Observation, SurfacedItem};
use atlas::config::RuntimeFlagsView;
use atlas::entity::{Entity, EntityType};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

pub fn create_router(atlas: Arc<Atlas>) -> Router {
    Router::new()
        .route("/api/entities", get(list_entities))
        .route("/api/places/category", get(places_by_category))
        .route("/api/places/search", get(search_places))
        .route("/api/agents", get(list_agents).post(create_agent))
        .route("/api/agents/:id/users", post(set_active_users))
        .route("/api/couriers", get(list_couriers).post(create_courier))
        .route("/api/couriers/:id/enable", post(enable_courier))
        .route("/api/couriers/:id/disable", post(disable_courier))
        .route("/api/couriers/:id/send", post(send_courier))
        .route("/api/couriers/:id/waypoints", post(set_waypoints))
        .route("/api/awareness/:agent_id", get(pending_observations))
        .route("/api/awareness/:agent_id/process", post(process_awareness))
        .route("/api/flags", get(get_flags).post(update_flags))
        .route("/api/stats", get(stats))
        .with_state(atlas)
}

/// Common query parameters for spatial lookups.
#[derive(Debug, Deserialize)]
pub struct AreaParams {
    pub lat: f64,
    pub lon: f64,
    pub radius: Option<f64>,
    pub limit: Option<usize>,
    #[serde(rename = "type")]
    pub entity_type: Option<EntityType>,
    pub category: Option<String>,
    pub name: Option<String>,
}

impl AreaParams {
    fn resolve(&self, atlas: &Atlas) -> Result<(f64, usize), ApiError> {
        check_coordinates(self.lat, self.lon).map_err(|e| ApiError::BadRequest(e.to_string()))?;
        let config = &atlas.config().api;
        let radius = self.radius.unwrap_or(config.default_radius_m);
        if !radius.is_finite() || radius <= 0.0 {
            return Err(ApiError::BadRequest("radius must be positive".to_string()));
        }
        let radius = radius.min(config.max_radius_m);
        let limit = self
            .limit
            .unwrap_or(config.default_limit)
            .clamp(1, config.max_limit);
        Ok((radius, limit))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EntitiesResponse {
    pub count: usize,
    pub entities: Vec<Entity>,
}

impl From<Vec<Entity>> for EntitiesResponse {
    fn from(entities: Vec<Entity>) -> Self {
        Self {
            count: entities.len(),
            entities,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PointRequest {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Deserialize)]
pub struct ActiveUsersRequest {
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct CreateCourierRequest {
    #[serde(default)]
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Deserialize)]
pub struct SendCourierRequest {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct WaypointsRequest {
    pub waypoints: Vec<Waypoint>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FlagsRequest {
    pub agentic_mode: Option<bool>,
    pub exploration_mode: Option<bool>,
    pub web_search: Option<bool>,
}

/// GET /api/entities?lat=&lon=&radius=&type=&limit=
async fn list_entities(
    State(atlas): State<Arc<Atlas>>,
    Query(params): Query<AreaParams>,
) -> Result<Json<EntitiesResponse>, ApiError> {
    let (radius, limit) = params.resolve(&atlas)?;
    let entities = atlas.query(params.lat, params.lon, radius, params.entity_type, limit);
    Ok(Json(entities.into()))
}

/// GET /api/places/category?lat=&lon=&category=
async fn places_by_category(
    State(atlas): State<Arc<Atlas>>,
    Query(params): Query<AreaParams>,
) -> Result<Json<EntitiesResponse>, ApiError> {
    let (radius, limit) = params.resolve(&atlas)?;
    let category = params
        .category
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::BadRequest("category is required".to_string()))?;
    let places = atlas.query_by_category(params.lat, params.lon, radius, category, limit);
    Ok(Json(places.into()))
}

/// GET /api/places/search?lat=&lon=&name=
async fn search_places(
    State(atlas): State<Arc<Atlas>>,
    Query(params): Query<AreaParams>,
) -> Result<Json<EntitiesResponse>, ApiError> {
    let (radius, limit) = params.resolve(&atlas)?;
    let name = params
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::BadRequest("name is required".to_string()))?;
    let places = atlas
        .search_places(params.lat, params.lon, radius, name, limit)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(places.into()))
}

async fn list_agents(State(atlas): State<Arc<Atlas>>) -> Json<Vec<AgentView>> {
    Json(atlas.list_agents())
}

/// POST /api/agents - Find or create the agent covering a point
async fn create_agent(
    State(atlas): State<Arc<Atlas>>,
    Json(request): Json<PointRequest>,
) -> Result<Json<Entity>, ApiError> {
    check_coordinates(request.lat, request.lon).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let agent = atlas
        .find_or_create_agent(request.lat, request.lon)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(agent))
}

async fn set_active_users(
    State(atlas): State<Arc<Atlas>>,
    Path(id): Path<String>,
    Json(request): Json<ActiveUsersRequest>,
) -> Result<StatusCode, ApiError> {
    atlas
        .set_active_users(&id, request.count)
        .map_err(|e| ApiError::NotFound(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_couriers(State(atlas): State<Arc<Atlas>>) -> Json<Vec<CourierState>> {
    Json(atlas.list_couriers())
}

async fn create_courier(
    State(atlas): State<Arc<Atlas>>,
    Json(request): Json<CreateCourierRequest>,
) -> Result<(StatusCode, Json<CourierState>), ApiError> {
    let courier = atlas
        .create_courier(&request.name, request.lat, request.lon)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok((StatusCode::CREATED, Json(courier)))
}

fn require_courier(atlas: &Atlas, id: &str) -> Result<(), ApiError> {
    match atlas.get_courier(id) {
        Some(_) => Ok(()),
        None => Err(ApiError::NotFound(format!("Courier '{}' not found", id))),
    }
}

async fn enable_courier(
    State(atlas): State<Arc<Atlas>>,
    Path(id): Path<String>,
) -> Result<Json<CourierState>, ApiError> {
    require_courier(&atlas, &id)?;
    let courier = atlas.enable_courier(&id).await.map_err(ApiError::internal)?;
    Ok(Json(courier))
}

async fn disable_courier(
    State(atlas): State<Arc<Atlas>>,
    Path(id): Path<String>,
) -> Result<Json<CourierState>, ApiError> {
    require_courier(&atlas, &id)?;
    let courier = atlas.disable_courier(&id).await.map_err(ApiError::internal)?;
    Ok(Json(courier))
}

async fn send_courier(
    State(atlas): State<Arc<Atlas>>,
    Path(id): Path<String>,
    Json(request): Json<SendCourierRequest>,
) -> Result<Json<CourierState>, ApiError> {
    require_courier(&atlas, &id)?;
    let courier = atlas
        .send_courier(&id, request.lat, request.lon, &request.name)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(courier))
}

async fn set_waypoints(
    State(atlas): State<Arc<Atlas>>,
    Path(id): Path<String>,
    Json(request): Json<WaypointsRequest>,
) -> Result<Json<CourierState>, ApiError> {
    require_courier(&atlas, &id)?;
    let courier = atlas
        .set_courier_waypoints(&id, request.waypoints)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(courier))
}

async fn pending_observations(
    State(atlas): State<Arc<Atlas>>,
    Path(agent_id): Path<String>,
) -> Json<Vec<Observation>> {
    Json(atlas.pending_observations(&agent_id))
}

async fn process_awareness(
    State(atlas): State<Arc<Atlas>>,
    Path(agent_id): Path<String>,
) -> Result<Json<Vec<SurfacedItem>>, ApiError> {
    if atlas.services().store.get(&agent_id).is_none() {
        return Err(ApiError::NotFound(format!("Agent '{}' not found", agent_id)));
    }
    let items = atlas
        .process_awareness(&agent_id)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(items))
}

async fn get_flags(State(atlas): State<Arc<Atlas>>) -> Json<RuntimeFlagsView> {
    Json(atlas.flags())
}

async fn update_flags(
    State(atlas): State<Arc<Atlas>>,
    Json(request): Json<FlagsRequest>,
) -> Json<RuntimeFlagsView> {
    Json(atlas.update_flags(
        request.agentic_mode,
        request.exploration_mode,
        request.web_search,
    ))
}

async fn stats(State(atlas): State<Arc<Atlas>>) -> Json<WorldStats> {
    Json(atlas.stats())
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// API error types
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    fn internal(e: anyhow::Error) -> Self {
        warn!(error = %e, "Request failed");
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorResponse { error })).into_response()
    }
}
