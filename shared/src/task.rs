//! Task definitions persisted in the task store
//!
//! This module defines the scheduled task model shared between the beat
//! process (which reconciles and dispatches) and the operational CLI (which
//! creates and mutates tasks). The store itself lives in the beat crate; this
//! is the schema-independent shape plus its validation rules.

use crate::schedule::{ScheduleConfig, ScheduleType};
use crate::utils::validate_identifier;
use serde::Serialize;
use serde_json::{Map, Value};

/// A persisted task definition together with its execution bookkeeping.
///
/// Timestamps are Unix seconds. `last_run`/`next_run` are advisory run state
/// owned by beat; `updated_at` is the audit column bumped by every
/// user-facing mutation and deliberately left untouched by beat's run-state
/// writes.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScheduledTask {
    /// Opaque stable identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Free-form description
    pub description: String,
    /// Descriptive tags
    pub tags: Vec<String>,
    /// Name of the plugin the task invokes
    pub plugin_name: String,
    /// Structured parameter map passed to the plugin entrypoint
    pub parameters: Map<String, Value>,
    /// Schedule configuration (interval or cron)
    pub schedule: ScheduleConfig,
    /// Whether the task participates in scheduling
    pub enabled: bool,
    /// Broker priority hint, 1..10 with 10 highest
    pub priority: u8,
    /// Broker retry hint
    pub max_retries: u32,
    /// Broker time-limit hint in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Last fire time recorded by beat (Unix seconds)
    pub last_run: Option<i64>,
    /// Advisory next fire time recorded by beat (Unix seconds)
    pub next_run: Option<i64>,
    /// Creation time (Unix seconds)
    pub created_at: i64,
    /// Last user-facing mutation time (Unix seconds)
    pub updated_at: i64,
}

impl ScheduledTask {
    /// Validate the definition before it is persisted.
    pub fn validate(&self) -> crate::Result<()> {
        validate_identifier(&self.id)?;
        validate_identifier(&self.plugin_name)?;

        if self.name.trim().is_empty() {
            return Err(
                crate::SchedulerError::Validation("Task name cannot be empty".to_string()).into(),
            );
        }

        if !(1..=10).contains(&self.priority) {
            return Err(crate::SchedulerError::Validation(format!(
                "Task priority must be within 1..10, got {}",
                self.priority
            ))
            .into());
        }

        self.schedule.validate()?;

        Ok(())
    }

    pub fn schedule_type(&self) -> ScheduleType {
        self.schedule.schedule_type()
    }

    /// The parameter map serialized to its JSON column form
    pub fn parameters_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(&Value::Object(self.parameters.clone()))?)
    }

    /// The tags list serialized to its JSON column form
    pub fn tags_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(&self.tags)?)
    }
}
