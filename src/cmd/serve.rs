//! Long-running services: `flowboard serve` and `flowboard agent`.

use std::sync::Arc;

use anyhow::{Context, Result};

use flowboard::agent::{self, AllocatorAgent, BoardApiClient, DbBoardDirectory, DbDeadLetterSink};
use flowboard::board::server::{self, open_database};
use flowboard::bus::{MessageBus, RISK_QUEUE, SqliteBus};
use flowboard::config::FlowConfig;

use super::shutdown_signal;

pub async fn cmd_serve(config: &FlowConfig) -> Result<()> {
    tracing::info!(
        database = %config.database.path.display(),
        bus = %config.bus.path.display(),
        "starting board service"
    );
    server::serve(config, shutdown_signal()).await
}

pub async fn cmd_agent(config: &FlowConfig) -> Result<()> {
    let db = open_database(&config.database)?;
    let bus = SqliteBus::open(&config.bus).await?;
    let recovered = bus
        .recover(RISK_QUEUE)
        .await
        .context("Failed to recover outstanding alerts")?;
    if recovered > 0 {
        tracing::info!(recovered, "returned unacknowledged alerts to the queue");
    }
    let bus: Arc<dyn MessageBus> = Arc::new(bus);

    let client = Arc::new(
        BoardApiClient::new(&config.agent.api_base_url, config.agent.http_timeout())
            .context("Failed to build board API client")?,
    );
    tracing::info!(api = %client.base_url(), "starting allocator agent");

    let agent = Arc::new(AllocatorAgent::new(
        client.clone(),
        client,
        Arc::new(DbBoardDirectory::new(db.clone())),
        Arc::new(DbDeadLetterSink::new(db)),
        config.agent.max_retries,
    ));
    agent::run_agent(agent, bus, config, shutdown_signal()).await
}
