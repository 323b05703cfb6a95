//! Shared data structures and utilities for the task scheduling system
//!
//! This crate contains common types, configuration structures, the broker
//! gateway, and utilities used by both the beat and worker components.

pub mod broker;
pub mod config;
pub mod defaults;
pub mod schedule;
pub mod task;
pub mod utils;

// Re-export commonly used types for convenience
pub use broker::{BrokerGateway, SubmissionStatus, SubmitOptions};
pub use config::{BeatConfig, WorkerConfig};
pub use schedule::{CompiledSchedule, ScheduleConfig, ScheduleType};
pub use task::ScheduledTask;
pub use utils::{calculate_string_checksum, validate_identifier};

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the scheduling system
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Task store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Plugin not available: {0}")]
    PluginNotAvailable(String),

    #[error("Invalid parameters: {0}")]
    ParameterInvalid(String),

    #[error("Plugin execution error: {0}")]
    PluginRuntimeError(String),

    #[error("Invalid plugin manifest: {0}")]
    ManifestInvalid(String),

    #[error("CDC stream disconnected: {0}")]
    CdcDisconnected(String),

    #[error("Consumer error: {0}")]
    ConsumerError(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests;
