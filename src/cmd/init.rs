//! Project initialization: `flowboard init`.

use std::path::Path;

use anyhow::{Context, Result};

use flowboard::board::server::open_database;
use flowboard::bus::SqliteBus;
use flowboard::config::{DEFAULT_CONFIG_FILE, FlowConfig};

/// Write `flowboard.toml` (unless present and not forced), then create the
/// board database and the broker with its topology declared.
pub async fn cmd_init(project_dir: &Path, config: &FlowConfig, force: bool) -> Result<()> {
    std::fs::create_dir_all(project_dir)
        .with_context(|| format!("Failed to create {}", project_dir.display()))?;

    let config_path = project_dir.join(DEFAULT_CONFIG_FILE);
    if config_path.exists() && !force {
        println!("Keeping existing {}", config_path.display());
    } else {
        FlowConfig::default().save(&config_path)?;
        println!("Wrote {}", config_path.display());
    }

    open_database(&config.database)?;
    println!("Board database: {}", config.database.path.display());

    SqliteBus::open(&config.bus).await?;
    println!("Message broker: {}", config.bus.path.display());

    tracing::info!(dir = %project_dir.display(), "project initialized");
    Ok(())
}
