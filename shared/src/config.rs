//! Configuration types and validation for the task scheduling system
//!
//! This module defines the configuration structures used by the beat and
//! worker components. Both are loaded from an optional TOML file and then
//! overridden by environment variables, so a container deployment can run
//! entirely off the environment while a bare-metal one keeps a config file.

use crate::defaults::*;
use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::env;
use std::path::Path;

/// Environment variable names recognized at startup
pub mod env_vars {
    pub const BROKER_URL: &str = "SCHEDULER_BROKER_URL";
    pub const RESULT_BACKEND_URL: &str = "SCHEDULER_RESULT_BACKEND_URL";
    pub const DATABASE_URL: &str = "SCHEDULER_DATABASE_URL";
    pub const PLUGINS_DIR: &str = "SCHEDULER_PLUGINS_DIR";
    pub const PLUGIN_ENVS_DIR: &str = "SCHEDULER_PLUGIN_ENVS_DIR";
    pub const CDC_HOST: &str = "SCHEDULER_CDC_HOST";
    pub const CDC_PORT: &str = "SCHEDULER_CDC_PORT";
    pub const CDC_DESTINATION: &str = "SCHEDULER_CDC_DESTINATION";
    pub const CDC_BATCH_SIZE: &str = "SCHEDULER_CDC_BATCH_SIZE";
    pub const MAX_LOOP_INTERVAL: &str = "SCHEDULER_MAX_LOOP_INTERVAL";
    pub const TIMEZONE: &str = "SCHEDULER_TIMEZONE";
}

/// Main beat configuration loaded from beat.toml and the environment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BeatConfig {
    /// Task store database URL (bare path or sqlite://)
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Broker queue database URL
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Result backend URL; the queue database doubles as the result store,
    /// so a differing value is accepted but not honored
    #[serde(default)]
    pub result_backend_url: Option<String>,
    /// Reconcile interval for the scheduling loop (default: 5)
    #[serde(default = "default_max_loop_interval")]
    pub max_loop_interval_seconds: u64,
    /// Timezone cron schedules are evaluated in (default: UTC)
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// SQLite busy timeout in seconds (default: 5)
    #[serde(default = "default_database_busy_timeout")]
    pub database_busy_timeout_seconds: u64,
    /// How many reconcile intervals a store snapshot may age before dispatch
    /// is suspended (default: 3)
    #[serde(default = "default_stale_snapshot_intervals")]
    pub stale_snapshot_intervals: u32,
}

impl BeatConfig {
    /// Load configuration from an optional TOML file plus the environment.
    ///
    /// Environment variables win over file values. A missing file is not an
    /// error; all fields have defaults.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config: BeatConfig = match config_path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("Failed to parse {}", path.display()))?
            }
            None => toml::from_str("").expect("empty config must deserialize via defaults"),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay recognized environment variables onto the loaded values
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = env::var(env_vars::DATABASE_URL) {
            self.database_url = value;
        }
        if let Ok(value) = env::var(env_vars::BROKER_URL) {
            self.broker_url = value;
        }
        if let Ok(value) = env::var(env_vars::RESULT_BACKEND_URL) {
            self.result_backend_url = Some(value);
        }
        if let Ok(value) = env::var(env_vars::MAX_LOOP_INTERVAL) {
            self.max_loop_interval_seconds = value
                .parse()
                .with_context(|| format!("{} must be an integer", env_vars::MAX_LOOP_INTERVAL))?;
        }
        if let Ok(value) = env::var(env_vars::TIMEZONE) {
            self.timezone = value;
        }
        Ok(())
    }

    /// Semantic validation after all sources are merged
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(crate::SchedulerError::Config(
                "database_url cannot be empty".to_string(),
            )
            .into());
        }
        if self.broker_url.trim().is_empty() {
            return Err(
                crate::SchedulerError::Config("broker_url cannot be empty".to_string()).into(),
            );
        }
        if self.max_loop_interval_seconds == 0 {
            return Err(crate::SchedulerError::Config(
                "max_loop_interval_seconds must be positive".to_string(),
            )
            .into());
        }
        self.timezone()?;
        Ok(())
    }

    /// The configured timezone, parsed
    pub fn timezone(&self) -> Result<Tz> {
        self.timezone.parse::<Tz>().map_err(|_| {
            crate::SchedulerError::Config(format!("Unknown timezone: {}", self.timezone)).into()
        })
    }
}

/// Main worker configuration loaded from worker.toml and the environment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Broker queue database URL
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Result backend URL; see `BeatConfig::result_backend_url`
    #[serde(default)]
    pub result_backend_url: Option<String>,
    /// Root directory containing one subdirectory per plugin
    #[serde(default = "default_plugins_dir")]
    pub plugins_dir: String,
    /// Directory holding the global plugin env file; defaults to the plugins
    /// root when unset
    #[serde(default)]
    pub plugin_envs_dir: Option<String>,
    /// Queues this worker consumes from
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,
    /// Maximum concurrent plugin executions
    #[serde(default = "default_worker_concurrency")]
    pub concurrency: usize,
    /// Poll interval when the queue is empty, in milliseconds
    #[serde(default = "default_claim_poll_interval_millis")]
    pub claim_poll_interval_millis: u64,
    /// Wait time for in-flight executions during shutdown in seconds
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout_seconds: u64,
    /// SQLite busy timeout in seconds
    #[serde(default = "default_database_busy_timeout")]
    pub database_busy_timeout_seconds: u64,
    /// Cleanup interval for finished queue rows in seconds
    #[serde(default = "default_queue_cleanup_interval")]
    pub queue_cleanup_interval_seconds: u64,
    /// Binlog stream endpoint; CDC consumption is disabled when absent
    #[serde(default)]
    pub cdc: Option<CdcConfig>,
    /// Declarative CDC consumers
    #[serde(default)]
    pub consumers: Vec<ConsumerConfig>,
}

impl WorkerConfig {
    /// Load configuration from an optional TOML file plus the environment
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config: WorkerConfig = match config_path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("Failed to parse {}", path.display()))?
            }
            None => toml::from_str("").expect("empty config must deserialize via defaults"),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = env::var(env_vars::BROKER_URL) {
            self.broker_url = value;
        }
        if let Ok(value) = env::var(env_vars::RESULT_BACKEND_URL) {
            self.result_backend_url = Some(value);
        }
        if let Ok(value) = env::var(env_vars::PLUGINS_DIR) {
            self.plugins_dir = value;
        }
        if let Ok(value) = env::var(env_vars::PLUGIN_ENVS_DIR) {
            self.plugin_envs_dir = Some(value);
        }

        // Setting the CDC host through the environment enables consumption
        // even without a [cdc] section in the file.
        if let Ok(host) = env::var(env_vars::CDC_HOST) {
            let cdc = self.cdc.get_or_insert_with(CdcConfig::default);
            cdc.host = host;
        }
        if let Some(cdc) = self.cdc.as_mut() {
            if let Ok(value) = env::var(env_vars::CDC_PORT) {
                cdc.port = value
                    .parse()
                    .with_context(|| format!("{} must be a port number", env_vars::CDC_PORT))?;
            }
            if let Ok(value) = env::var(env_vars::CDC_DESTINATION) {
                cdc.destination = value;
            }
            if let Ok(value) = env::var(env_vars::CDC_BATCH_SIZE) {
                cdc.batch_size = value
                    .parse()
                    .with_context(|| format!("{} must be an integer", env_vars::CDC_BATCH_SIZE))?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker_url.trim().is_empty() {
            return Err(
                crate::SchedulerError::Config("broker_url cannot be empty".to_string()).into(),
            );
        }
        if self.plugins_dir.trim().is_empty() {
            return Err(
                crate::SchedulerError::Config("plugins_dir cannot be empty".to_string()).into(),
            );
        }
        if self.concurrency == 0 {
            return Err(crate::SchedulerError::Config(
                "concurrency must be positive".to_string(),
            )
            .into());
        }
        if self.queues.is_empty() {
            return Err(crate::SchedulerError::Config(
                "at least one queue must be configured".to_string(),
            )
            .into());
        }
        if self.queue_cleanup_interval_seconds == 0 {
            return Err(crate::SchedulerError::Config(
                "queue_cleanup_interval_seconds must be positive".to_string(),
            )
            .into());
        }
        if let Some(cdc) = &self.cdc {
            cdc.validate()?;
        }
        for consumer in &self.consumers {
            consumer.validate()?;
        }
        Ok(())
    }

    /// Directory holding the global plugin env file
    pub fn plugin_envs_dir(&self) -> &str {
        self.plugin_envs_dir.as_deref().unwrap_or(&self.plugins_dir)
    }
}

/// Binlog stream endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CdcConfig {
    /// Binlog stream host
    pub host: String,
    /// Binlog stream port (default: 11111)
    #[serde(default = "default_cdc_port")]
    pub port: u16,
    /// Subscription destination name
    #[serde(default = "default_cdc_destination")]
    pub destination: String,
    /// Events requested per upstream batch
    #[serde(default = "default_cdc_batch_size")]
    pub batch_size: u32,
}

impl Default for CdcConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: default_cdc_port(),
            destination: default_cdc_destination(),
            batch_size: default_cdc_batch_size(),
        }
    }
}

impl CdcConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(
                crate::SchedulerError::Config("cdc.host cannot be empty".to_string()).into(),
            );
        }
        if self.destination.trim().is_empty() {
            return Err(crate::SchedulerError::Config(
                "cdc.destination cannot be empty".to_string(),
            )
            .into());
        }
        if self.batch_size == 0 {
            return Err(crate::SchedulerError::Config(
                "cdc.batch_size must be positive".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

/// A declarative CDC consumer: filters plus the plugin it triggers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerConfig {
    /// Consumer name, unique within the worker
    pub name: String,
    /// Plugin submitted when a filter matches
    pub plugin_name: String,
    /// Static parameters merged into every triggered submission
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Priority of triggered submissions
    #[serde(default = "default_consumer_priority")]
    pub priority: u8,
    /// Whether the matched row event is forwarded under the "event" parameter
    #[serde(default = "default_enabled")]
    pub forward_event: bool,
    /// Disabled consumers stay registered but receive nothing
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Row-event filters; a consumer with no filters matches nothing
    pub filters: Vec<FilterConfig>,
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        crate::utils::validate_identifier(&self.name)
            .with_context(|| format!("Invalid consumer name '{}'", self.name))?;
        crate::utils::validate_identifier(&self.plugin_name)
            .with_context(|| format!("Invalid plugin name in consumer '{}'", self.name))?;
        if !(1..=10).contains(&self.priority) {
            return Err(crate::SchedulerError::Config(format!(
                "Consumer '{}' priority must be within 1..10",
                self.name
            ))
            .into());
        }
        if self.filters.is_empty() {
            return Err(crate::SchedulerError::Config(format!(
                "Consumer '{}' declares no filters",
                self.name
            ))
            .into());
        }
        for filter in &self.filters {
            filter.validate()?;
        }
        Ok(())
    }
}

/// A `(database, table, event types)` row-event filter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterConfig {
    /// Source database name
    pub database: String,
    /// Source table name
    pub table: String,
    /// Allowed event types; empty means all of INSERT/UPDATE/DELETE
    #[serde(default)]
    pub event_types: Vec<String>,
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.database.trim().is_empty() || self.table.trim().is_empty() {
            return Err(crate::SchedulerError::Config(
                "Filter database and table cannot be empty".to_string(),
            )
            .into());
        }
        for event_type in &self.event_types {
            match event_type.to_ascii_uppercase().as_str() {
                "INSERT" | "UPDATE" | "DELETE" => {}
                other => {
                    return Err(crate::SchedulerError::Config(format!(
                        "Unknown event type in filter: {}",
                        other
                    ))
                    .into())
                }
            }
        }
        Ok(())
    }
}
