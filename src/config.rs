//! Layered configuration for flowboard.
//!
//! Values are resolved in order: built-in defaults, then `flowboard.toml` (or
//! the file passed with `--config`), then `FLOWBOARD_*` environment variables
//! (a `.env` file is loaded first), then CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! cors = false
//!
//! [database]
//! path = ".flowboard/board.db"
//!
//! [bus]
//! path = ".flowboard/bus.db"
//! poll_interval_ms = 500
//! retry_base_ms = 250
//! retry_max_ms = 30000
//! # max_deliveries = 20
//!
//! [agent]
//! host = "127.0.0.1"
//! port = 8081
//! api_base_url = "http://127.0.0.1:8080"
//! execute_interval_secs = 30
//! analysis_interval_secs = 300
//! max_retries = 3
//! http_timeout_secs = 10
//!
//! [projections]
//! sprint_days = 14
//! risk_trend_days = 30
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! # directory = ".flowboard/logs"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::projections::MAX_WINDOW_DAYS;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "flowboard.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Permissive CORS for a locally served UI
    #[serde(default)]
    pub cors: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_server_port(),
            cors: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from(".flowboard/board.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_path")]
    pub path: PathBuf,
    /// Idle poll interval when no publish notification arrives
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// First backoff after a handler failure
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Dead-letter a message after this many deliveries (unset: never)
    #[serde(default)]
    pub max_deliveries: Option<u32>,
}

fn default_bus_path() -> PathBuf {
    PathBuf::from(".flowboard/bus.db")
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_retry_base_ms() -> u64 {
    250
}

fn default_retry_max_ms() -> u64 {
    30_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            path: default_bus_path(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            max_deliveries: None,
        }
    }
}

impl BusConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_agent_port")]
    pub port: u16,
    /// Board API the agent reads workloads from and posts actions to
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_execute_interval_secs")]
    pub execute_interval_secs: u64,
    #[serde(default = "default_analysis_interval_secs")]
    pub analysis_interval_secs: u64,
    /// Attempts per action before it is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_agent_port() -> u16 {
    8081
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_execute_interval_secs() -> u64 {
    30
}

fn default_analysis_interval_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_http_timeout_secs() -> u64 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_agent_port(),
            api_base_url: default_api_base_url(),
            execute_interval_secs: default_execute_interval_secs(),
            analysis_interval_secs: default_analysis_interval_secs(),
            max_retries: default_max_retries(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl AgentConfig {
    pub fn execute_interval(&self) -> Duration {
        Duration::from_secs(self.execute_interval_secs)
    }

    pub fn analysis_interval(&self) -> Duration {
        Duration::from_secs(self.analysis_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionsConfig {
    #[serde(default = "default_sprint_days")]
    pub sprint_days: u32,
    #[serde(default = "default_risk_trend_days")]
    pub risk_trend_days: u32,
}

fn default_sprint_days() -> u32 {
    14
}

fn default_risk_trend_days() -> u32 {
    30
}

impl Default for ProjectionsConfig {
    fn default() -> Self {
        Self {
            sprint_days: default_sprint_days(),
            risk_trend_days: default_risk_trend_days(),
        }
    }
}

/// Console log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Also write JSON logs to a daily rolling file here
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

/// Resolved flowboard configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub projections: ProjectionsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FlowConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse flowboard.toml")
    }

    /// Load from an explicit path (which must exist) or from
    /// `flowboard.toml` in `dir` when present, else defaults.
    pub fn load_or_default(explicit: Option<&Path>, dir: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let config_path = dir.join(DEFAULT_CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize flowboard.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `FLOWBOARD_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply `FLOWBOARD_*` overrides read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FLOWBOARD_HOST") {
            self.server.host = v;
        }
        if let Some(v) = lookup("FLOWBOARD_PORT") {
            self.server.port = parse_env("FLOWBOARD_PORT", &v)?;
        }
        if let Some(v) = lookup("FLOWBOARD_CORS") {
            self.server.cors = parse_env("FLOWBOARD_CORS", &v)?;
        }
        if let Some(v) = lookup("FLOWBOARD_DATABASE_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FLOWBOARD_BUS_PATH") {
            self.bus.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FLOWBOARD_BUS_MAX_DELIVERIES") {
            self.bus.max_deliveries = Some(parse_env("FLOWBOARD_BUS_MAX_DELIVERIES", &v)?);
        }
        if let Some(v) = lookup("FLOWBOARD_AGENT_PORT") {
            self.agent.port = parse_env("FLOWBOARD_AGENT_PORT", &v)?;
        }
        if let Some(v) = lookup("FLOWBOARD_API_BASE_URL") {
            self.agent.api_base_url = v;
        }
        if let Some(v) = lookup("FLOWBOARD_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("FLOWBOARD_LOG_FORMAT") {
            self.logging.format = LogFormat::from_str(&v)?;
        }
        if let Some(v) = lookup("FLOWBOARD_LOG_DIR") {
            self.logging.directory = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Anchor relative storage and log paths at `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let anchor = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        anchor(&mut self.database.path);
        anchor(&mut self.bus.path);
        if let Some(dir) = self.logging.directory.as_mut() {
            anchor(dir);
        }
    }

    /// Reject values that would stall or spin the background loops.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.bus.poll_interval_ms == 0 {
            problems.push("bus.poll_interval_ms must be greater than 0".to_string());
        }
        if self.bus.retry_base_ms == 0 {
            problems.push("bus.retry_base_ms must be greater than 0".to_string());
        }
        if self.bus.retry_max_ms < self.bus.retry_base_ms {
            problems.push("bus.retry_max_ms must not be below bus.retry_base_ms".to_string());
        }
        if self.bus.max_deliveries == Some(0) {
            problems.push("bus.max_deliveries must be at least 1 when set".to_string());
        }
        if self.agent.execute_interval_secs == 0 {
            problems.push("agent.execute_interval_secs must be greater than 0".to_string());
        }
        if self.agent.analysis_interval_secs == 0 {
            problems.push("agent.analysis_interval_secs must be greater than 0".to_string());
        }
        if self.agent.max_retries == 0 {
            problems.push("agent.max_retries must be at least 1".to_string());
        }
        if self.agent.http_timeout_secs == 0 {
            problems.push("agent.http_timeout_secs must be greater than 0".to_string());
        }
        if !(1..=MAX_WINDOW_DAYS).contains(&self.projections.sprint_days) {
            problems.push(format!(
                "projections.sprint_days must be between 1 and {}",
                MAX_WINDOW_DAYS
            ));
        }
        if !(1..=MAX_WINDOW_DAYS).contains(&self.projections.risk_trend_days) {
            problems.push(format!(
                "projections.risk_trend_days must be between 1 and {}",
                MAX_WINDOW_DAYS
            ));
        }
        if problems.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Invalid configuration: {}", problems.join("; "))
        }
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("Invalid value '{}' for {}: {}", value, key, e))
}
