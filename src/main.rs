use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use flowboard::config::{FlowConfig, LogFormat};
use flowboard::logging;

mod cmd;

#[derive(Parser)]
#[command(name = "flowboard")]
#[command(version, about = "Kanban board service with an event log and an allocator agent")]
pub struct Cli {
    /// Path to a configuration file (defaults to flowboard.toml in the project directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory that relative storage and log paths are anchored to
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Log level or filter directive, e.g. "debug" or "flowboard=trace"
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log output format: pretty or json
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default flowboard.toml and create the databases
    Init {
        /// Overwrite an existing flowboard.toml
        #[arg(long)]
        force: bool,
    },
    /// Run the board API and the event processor
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Allow cross-origin requests
        #[arg(long)]
        cors: bool,
    },
    /// Run the allocator agent
    Agent {
        #[arg(short, long)]
        port: Option<u16>,

        /// Base URL of the board API
        #[arg(long)]
        api_base_url: Option<String>,
    },
    /// Republish logged events to the processor
    Replay {
        /// Only this board's events
        #[arg(long)]
        board: Option<Uuid>,

        /// Only events at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Check the configuration and report problems
    Validate,
}

fn load_config(cli: &Cli, project_dir: &std::path::Path) -> Result<FlowConfig> {
    let mut config = FlowConfig::load_or_default(cli.config.as_deref(), project_dir)?;
    config.apply_env()?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = LogFormat::from_str(format)?;
    }
    match &cli.command {
        Commands::Serve { host, port, cors } => {
            if let Some(host) = host {
                config.server.host = host.clone();
            }
            if let Some(port) = port {
                config.server.port = *port;
            }
            if *cors {
                config.server.cors = true;
            }
        }
        Commands::Agent { port, api_base_url } => {
            if let Some(port) = port {
                config.agent.port = *port;
            }
            if let Some(url) = api_base_url {
                config.agent.api_base_url = url.clone();
            }
        }
        _ => {}
    }
    config.resolve_paths(project_dir);
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    dotenvy::from_path(project_dir.join(".env")).ok();

    let config = load_config(&cli, &project_dir)?;

    // `config validate` reports problems itself instead of failing here.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&config, command.clone());
    }
    config.validate()?;
    let _log_guard = logging::init(&config.logging)?;

    match &cli.command {
        Commands::Init { force } => cmd::cmd_init(&project_dir, &config, *force).await?,
        Commands::Serve { .. } => cmd::cmd_serve(&config).await?,
        Commands::Agent { .. } => cmd::cmd_agent(&config).await?,
        Commands::Replay { board, since } => cmd::cmd_replay(&config, *board, *since).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
