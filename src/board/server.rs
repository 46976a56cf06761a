use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use super::api::{self, AppState, SharedState};
use super::db::{BoardDb, DbHandle};
use crate::bus::{ConsumerConfig, EVENTS_QUEUE, MessageBus, SqliteBus, run_consumer};
use crate::config::{DatabaseConfig, FlowConfig};
use crate::processor::EventProcessor;

pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Open the board database, creating its directory if needed.
pub fn open_database(config: &DatabaseConfig) -> Result<DbHandle> {
    if let Some(parent) = config.path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = BoardDb::new(&config.path).context("Failed to initialize board database")?;
    Ok(DbHandle::new(db))
}

/// Run the board API and the event processor until `shutdown` fires.
pub async fn serve(config: &FlowConfig, shutdown: CancellationToken) -> Result<()> {
    let db = open_database(&config.database)?;
    let bus = SqliteBus::open(&config.bus).await?;
    bus.recover(EVENTS_QUEUE)
        .await
        .context("Failed to recover outstanding deliveries")?;
    let bus: Arc<dyn MessageBus> = Arc::new(bus);

    let processor = Arc::new(EventProcessor::new(db.clone(), bus.clone()));
    let consumer = tokio::spawn(run_consumer::<flowboard_common::Event, _>(
        bus.clone(),
        EVENTS_QUEUE,
        processor,
        ConsumerConfig::from_bus_config(&config.bus),
        shutdown.clone(),
    ));

    let state = Arc::new(AppState::new(db, bus, config.projections.clone()));
    let mut app = build_router(state);
    if config.server.cors {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!(addr = %listener.local_addr()?, "board service listening");

    let token = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("Server error");

    shutdown.cancel();
    consumer.await.context("Event consumer panicked")?;
    tracing::info!("board service shut down");
    served
}
