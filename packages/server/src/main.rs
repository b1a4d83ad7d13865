use std::sync::Arc;

use actors::HandlerRegistry;
use db::repositories::HandlerRepository;
use server::{ServerConfig, demo, events};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env()?;
    tracing::info!(
        endpoint = %config.db.endpoint,
        tick_secs = config.registry.tick_interval.as_secs(),
        loop_secs = config.registry.loop_interval.as_secs(),
        "Loaded server configuration"
    );

    // --- Catalog ---
    let database = db::init(config.db.clone()).await?;
    let catalog = HandlerRepository::new(database);

    // --- Registry ---
    let registry = HandlerRegistry::builder(config.registry.clone())
        .with_loader(Arc::new(demo::loader()))
        .with_catalog(catalog)
        .build();

    let event_log = tokio::spawn(events::log_events(registry.subscribe()));

    let restored = registry.restore().await?;
    tracing::info!(restored, "fleetd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    registry.teardown().await;
    event_log.abort();
    Ok(())
}
