//! Configuration view and validation commands: `flowboard config`.

use anyhow::{Context, Result};

use flowboard::config::FlowConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config: &FlowConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let rendered =
                toml::to_string_pretty(config).context("Failed to render configuration")?;
            print!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => match config.validate() {
            Ok(()) => println!("Configuration is valid."),
            Err(e) => {
                println!("{}", e);
                anyhow::bail!("configuration has errors");
            }
        },
    }
    Ok(())
}
