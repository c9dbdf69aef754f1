pub mod runtime;
pub use runtime::{RuntimeFlags, RuntimeFlagsView};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

// Re-export config types that live beside their services
pub use crate::awareness::AwarenessConfig;
pub use crate::rate_limit::GovernorConfig;
pub use crate::snapshot::config::SnapshotConfig;

/// Complete Atlas configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtlasConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub courier: CourierConfig,
    #[serde(default)]
    pub awareness: AwarenessConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub apis: ApisConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Entity store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite file for durable points
    pub db_path: PathBuf,
    /// Keep everything in memory only
    pub persistence_enabled: bool,
    /// How often expired/duplicate cleanup runs (seconds)
    pub maintenance_interval_seconds: u64,
    /// How long past expiry an entity stays physically present (seconds)
    pub expiry_grace_seconds: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/atlas.db"),
            persistence_enabled: true,
            maintenance_interval_seconds: 300,
            expiry_grace_seconds: 3600,
        }
    }
}

/// Agent lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Area an agent covers; also the reuse radius for find-or-create
    pub radius_m: f64,
    /// Overpass `key=value` tags indexed on each pass
    pub categories: Vec<String>,
    /// Pause between category queries (ms)
    pub category_delay_ms: u64,
    pub reindex_interval_hours: i64,
    /// How often a running agent checks whether its index is due
    pub reindex_check_seconds: u64,
    pub live_interval_seconds: u64,
    pub live_jitter_seconds: u64,
    pub agentic_max_iterations: usize,
    /// Radius for per-agent weather/prayer/location lookups
    pub cache_radius_m: f64,
    /// Radius searched for transit stops
    pub transit_radius_m: f64,
    pub weather_ttl_seconds: i64,
    pub arrivals_ttl_seconds: i64,
    pub location_ttl_seconds: i64,
    pub prayer_ttl_seconds: i64,
    pub disruption_ttl_seconds: i64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            radius_m: 5000.0,
            categories: [
                "amenity=restaurant",
                "amenity=cafe",
                "amenity=pharmacy",
                "amenity=hospital",
                "public_transport=station",
                "shop=supermarket",
                "amenity=place_of_worship",
                "leisure=park",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            category_delay_ms: 2000,
            reindex_interval_hours: 24,
            reindex_check_seconds: 3600,
            live_interval_seconds: 30,
            live_jitter_seconds: 5,
            agentic_max_iterations: 5,
            cache_radius_m: 5000.0,
            transit_radius_m: 500.0,
            weather_ttl_seconds: 600,
            arrivals_ttl_seconds: 120,
            location_ttl_seconds: 3600,
            prayer_ttl_seconds: 21600,
            disruption_ttl_seconds: 600,
        }
    }
}

/// Courier and explorer simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// Distance covered per tick (meters)
    pub step_m: f64,
    pub tick_seconds: u64,
    /// POIs are indexed within this radius of the walker
    pub poi_radius_m: f64,
    /// Persist state every N route-index steps
    pub persist_every_steps: usize,
    /// Agents considered as destinations
    pub candidate_radius_m: f64,
    /// A street endpoint this close to an agent connects it
    pub connect_radius_m: f64,
    /// Track simplification tolerance (meters)
    pub simplify_tolerance_m: f64,
    /// Exploration: chance of targeting an unconnected place
    pub explore_place_probability: f64,
    pub explore_min_m: f64,
    pub explore_max_m: f64,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            step_m: 100.0,
            tick_seconds: 5,
            poi_radius_m: 100.0,
            persist_every_steps: 20,
            candidate_radius_m: 50_000.0,
            connect_radius_m: 500.0,
            simplify_tolerance_m: 10.0,
            explore_place_probability: 0.7,
            explore_min_m: 150.0,
            explore_max_m: 500.0,
        }
    }
}

/// External API endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApisConfig {
    pub nominatim_url: String,
    pub overpass_url: String,
    pub osrm_url: String,
    pub open_meteo_url: String,
    pub aladhan_url: String,
    pub tfl_url: String,
    pub tfl_app_key: Option<String>,
    pub user_agent: String,
    /// Prayer calculation method passed to Aladhan
    pub prayer_method: u8,
}

impl Default for ApisConfig {
    fn default() -> Self {
        Self {
            nominatim_url: "https://nominatim.openstreetmap.org".to_string(),
            overpass_url: "https://overpass-api.de".to_string(),
            osrm_url: "https://router.project-osrm.org".to_string(),
            open_meteo_url: "https://api.open-meteo.com".to_string(),
            aladhan_url: "https://api.aladhan.com".to_string(),
            tfl_url: "https://api.tfl.gov.uk".to_string(),
            tfl_app_key: None,
            user_agent: "atlas/0.1".to_string(),
            prayer_method: 2,
        }
    }
}

/// Chat-completions classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    /// Env var holding the bearer token
    pub api_key_env: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:11434/v1/chat/completions".to_string(),
            model: "llama3.1".to_string(),
            api_key_env: "ATLAS_CLASSIFIER_API_KEY".to_string(),
            max_tokens: 512,
            temperature: 0.2,
        }
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
    pub default_limit: usize,
    pub max_limit: usize,
    pub default_radius_m: f64,
    /// Largest radius a lookup may request
    pub max_radius_m: f64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8090".to_string(),
            default_limit: 50,
            max_limit: 500,
            default_radius_m: 1000.0,
            max_radius_m: 50_000.0,
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: impl AsRef<Path>) -> Result<AtlasConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: AtlasConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Load configuration, using defaults when the file does not exist.
pub fn load_config_or_default(path: impl AsRef<Path>) -> Result<AtlasConfig> {
    let path = path.as_ref();
    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return Ok(AtlasConfig::default());
    }
    load_config(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AtlasConfig::default();
        assert_eq!(config.agents.radius_m, 5000.0);
        assert_eq!(config.agents.categories.len(), 8);
        assert_eq!(config.agents.agentic_max_iterations, 5);
        assert_eq!(config.courier.step_m, 100.0);
        assert_eq!(config.governor.call_timeout_seconds, 20);
        assert_eq!(config.awareness.capacity, 50);
        assert!(config.snapshot.enabled);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [store]
            db_path = "/tmp/atlas.db"
            maintenance_interval_seconds = 60

            [governor]
            default_interval_ms = 500

            [governor.intervals_ms]
            overpass = 10000

            [agents]
            radius_m = 3000.0
            categories = ["amenity=cafe"]

            [courier]
            tick_seconds = 2

            [snapshot]
            directory = "/tmp/snapshots"
            keep_count = 5

            [api]
            bind = "127.0.0.1:9000"
        "#;

        let config: AtlasConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.store.db_path, PathBuf::from("/tmp/atlas.db"));
        assert_eq!(config.store.maintenance_interval_seconds, 60);
        assert_eq!(config.governor.default_interval_ms, 500);
        assert_eq!(config.governor.interval_for("overpass").as_millis(), 10000);
        assert_eq!(config.agents.categories, vec!["amenity=cafe".to_string()]);
        assert_eq!(config.courier.tick_seconds, 2);
        assert_eq!(config.snapshot.keep_count, 5);
        assert_eq!(config.api.bind, "127.0.0.1:9000");
    }

    #[test]
    fn test_partial_config() {
        // Missing sections and fields use defaults
        let toml = r#"
            [agents]
            live_interval_seconds = 60
        "#;

        let config: AtlasConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.agents.live_interval_seconds, 60);
        assert_eq!(config.agents.weather_ttl_seconds, 600);
        assert_eq!(config.courier.persist_every_steps, 20);
        assert_eq!(config.api.max_limit, 500);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.api.default_limit, 50);
    }

    #[test]
    fn test_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atlas.toml");
        std::fs::write(&path, "[agents\nradius_m = ").unwrap();
        assert!(load_config_or_default(&path).is_err());
    }
}
