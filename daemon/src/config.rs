use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::inventory::StaticInventory;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Shared key expected in the `X-API-Key` header. Unset disables auth.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_listen_addr() -> String { common::DEFAULT_LISTEN_ADDR.to_string() }
fn default_db_path() -> PathBuf { PathBuf::from(common::DEFAULT_DB_PATH) }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            api_key: None,
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerMode {
    /// Owns the timers.
    #[default]
    Primary,
    /// Forwards every scheduling call to `primary_url`.
    Delegating,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub mode: SchedulerMode,
    #[serde(default = "default_primary_url")]
    pub primary_url: String,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// A fire later than this is skipped as a misfire.
    #[serde(default = "default_misfire_grace")]
    pub misfire_grace_seconds: u64,
    /// Collapse several missed fires into one run.
    #[serde(default = "default_true")]
    pub coalesce: bool,
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_refresh_min")]
    pub refresh_min_seconds: u64,
    #[serde(default = "default_refresh_max")]
    pub refresh_max_seconds: u64,
    #[serde(default = "default_max_idle_cycles")]
    pub max_idle_cycles: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_primary_url() -> String { common::DEFAULT_PRIMARY_URL.to_string() }
fn default_tick_interval() -> u64 { 1000 }
fn default_max_workers() -> usize { 10 }
fn default_misfire_grace() -> u64 { 30 }
fn default_true() -> bool { true }
fn default_max_instances() -> usize { 1 }
fn default_timezone() -> String { "UTC".to_string() }
fn default_refresh_min() -> u64 { 15 }
fn default_refresh_max() -> u64 { 45 }
fn default_max_idle_cycles() -> u32 { 10 }
fn default_request_timeout() -> u64 { 10 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: SchedulerMode::default(),
            primary_url: default_primary_url(),
            tick_interval_ms: default_tick_interval(),
            max_workers: default_max_workers(),
            misfire_grace_seconds: default_misfire_grace(),
            coalesce: default_true(),
            max_instances: default_max_instances(),
            timezone: default_timezone(),
            refresh_min_seconds: default_refresh_min(),
            refresh_max_seconds: default_refresh_max(),
            max_idle_cycles: default_max_idle_cycles(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl SchedulerConfig {
    /// Zone cron triggers are evaluated in. Unknown names fall back to UTC.
    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or_else(|_| {
            log::warn!("Unknown timezone {}, using UTC", self.timezone);
            Tz::UTC
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub output: Option<PathBuf>,
    pub jobs_output: Option<PathBuf>,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: None,
            jobs_output: None,
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub inventory: StaticInventory,
    /// Seeded at startup when no job of the same name exists.
    #[serde(default)]
    pub jobs: Vec<common::Job>,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Detect file type by extension and load
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let ext = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        match ext {
            "yaml" | "yml" => Self::from_yaml_file(path),
            "toml" => Self::from_toml_file(path),
            _ => Err(anyhow::anyhow!("Unsupported config file format. Use .yaml, .yml, or .toml")),
        }
    }

    /// `MESHFLOW_API_KEY` wins over the file.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("MESHFLOW_API_KEY") {
            if !key.is_empty() {
                self.server.api_key = Some(key);
            }
        }
    }

    /// Merge with another config, preferring values from other
    pub fn merge(&mut self, other: Config) {
        self.server.listen_addr = other.server.listen_addr;
        self.server.db_path = other.server.db_path;
        if other.server.api_key.is_some() {
            self.server.api_key = other.server.api_key;
        }

        self.scheduler = other.scheduler;

        self.logging.level = other.logging.level;
        if other.logging.output.is_some() {
            self.logging.output = other.logging.output;
        }
        if other.logging.jobs_output.is_some() {
            self.logging.jobs_output = other.logging.jobs_output;
        }

        // Inventory and jobs - append
        self.inventory.targets.extend(other.inventory.targets);
        self.inventory.groups.extend(other.inventory.groups);
        self.jobs.extend(other.jobs);
    }
}
