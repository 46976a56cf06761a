//! Event log replay: `flowboard replay`.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use flowboard::board::server::open_database;
use flowboard::bus::{MessageBus, SqliteBus};
use flowboard::config::FlowConfig;
use flowboard::events::EventLog;

pub async fn cmd_replay(
    config: &FlowConfig,
    board: Option<Uuid>,
    since: Option<DateTime<Utc>>,
) -> Result<()> {
    let db = open_database(&config.database)?;
    let bus: Arc<dyn MessageBus> = Arc::new(SqliteBus::open(&config.bus).await?);
    let log = EventLog::new(db, bus);

    let summary = log.replay(board, since).await?;
    println!(
        "Replayed {} event(s), {} failed to publish",
        summary.published, summary.failed
    );
    if summary.failed > 0 {
        anyhow::bail!("{} event(s) could not be republished", summary.failed);
    }
    Ok(())
}
