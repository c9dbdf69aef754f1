//! Shared services constructed once at startup and passed to every worker.

use crate::classifier::HttpClassifier;
use crate::connectors::HttpGeoApi;
use crate::geo::GeoApi;
use anyhow::{Context, Result};
use atlas::area_lock::AreaLocks;
use atlas::awareness::AwarenessLog;
use atlas::classifier::Classifier;
use atlas::config::{AtlasConfig, RuntimeFlags};
use atlas::persist::{MemoryPointStore, PointStore, SqlitePointStore};
use atlas::rate_limit::CallGovernor;
use atlas::store::EntityStore;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct Services {
    pub config: Arc<AtlasConfig>,
    pub store: Arc<EntityStore>,
    pub governor: Arc<CallGovernor>,
    pub area_locks: Arc<AreaLocks>,
    pub awareness: Arc<AwarenessLog>,
    pub flags: Arc<RuntimeFlags>,
    pub geo: Arc<dyn GeoApi>,
    pub classifier: Option<Arc<dyn Classifier>>,
}

impl Services {
    /// Open the store and build the HTTP-backed geo API and classifier.
    pub fn build(config: AtlasConfig, flags: Arc<RuntimeFlags>) -> Result<Self> {
        let persistence: Arc<dyn PointStore> = if config.store.persistence_enabled {
            if let Some(parent) = config.store.db_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create data directory {}", parent.display())
                    })?;
                }
            }
            Arc::new(SqlitePointStore::new(&config.store.db_path)?)
        } else {
            info!("Persistence disabled, entities are kept in memory only");
            Arc::new(MemoryPointStore::new())
        };
        let store = Arc::new(EntityStore::open(persistence)?);

        let governor = Arc::new(CallGovernor::new(config.governor.clone()));
        let geo: Arc<dyn GeoApi> = Arc::new(HttpGeoApi::new(&config.apis, governor.clone())?);

        let classifier: Option<Arc<dyn Classifier>> = if config.classifier.enabled {
            info!(
                endpoint = %config.classifier.endpoint,
                model = %config.classifier.model,
                "Classifier enabled"
            );
            Some(Arc::new(HttpClassifier::new(
                config.classifier.clone(),
                &config.apis.user_agent,
                governor.clone(),
            )?))
        } else {
            None
        };

        Ok(Self::assemble(config, store, governor, flags, geo, classifier))
    }

    /// Wire services around an already-open store and API implementations.
    pub fn assemble(
        config: AtlasConfig,
        store: Arc<EntityStore>,
        governor: Arc<CallGovernor>,
        flags: Arc<RuntimeFlags>,
        geo: Arc<dyn GeoApi>,
        classifier: Option<Arc<dyn Classifier>>,
    ) -> Self {
        let awareness = Arc::new(AwarenessLog::new(
            config.awareness.clone(),
            classifier.clone(),
        ));
        Self {
            config: Arc::new(config),
            store,
            governor,
            area_locks: Arc::new(AreaLocks::new()),
            awareness,
            flags,
            geo,
            classifier,
        }
    }
}
