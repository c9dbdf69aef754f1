use agent_manager::api::create_router;
use agent_manager::Atlas;
use anyhow::{Context, Result};
use atlas::config::{load_config_or_default, RuntimeFlags};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_manager=info,atlas=info".into()),
        )
        .init();

    info!("Atlas agent manager starting...");

    let config_path = std::env::var("ATLAS_CONFIG").unwrap_or_else(|_| "atlas.toml".to_string());
    let config = load_config_or_default(&config_path)?;
    let flags = Arc::new(RuntimeFlags::from_env());

    info!(
        config = %config_path,
        db_path = %config.store.db_path.display(),
        persistence = config.store.persistence_enabled,
        bind = %config.api.bind,
        flags = ?flags.view(),
        "Configuration loaded"
    );

    let bind = config.api.bind.clone();
    let atlas = Arc::new(Atlas::build(config, flags).context("Failed to build Atlas services")?);
    let report = atlas.start();
    info!(
        agents = report.agents,
        couriers = report.couriers,
        entities = atlas.services().store.len(),
        "Workers started"
    );

    // Start HTTP API server
    let router = create_router(Arc::clone(&atlas)).layer(CorsLayer::permissive());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind API address {}", bind))?;
    info!(bind = %bind, "Atlas API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Atlas API server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    // Graceful shutdown
    server_handle.abort();
    atlas.shutdown().await;
    info!("Atlas agent manager stopped");

    Ok(())
}
