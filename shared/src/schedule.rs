//! Schedule configuration and due-time evaluation
//!
//! Tasks carry one of two schedule kinds: a fixed interval in seconds, or a
//! five-field cron expression evaluated in a configured timezone. This module
//! owns the serialized configuration formats, their compilation into an
//! evaluable form, and the due-time arithmetic the beat dispatcher relies on.
// The evaluator treats a missing `last_run_at` as "immediately eligible".
// That is what makes the re-enable reset work: clearing the in-memory run
// state is enough to get a task fired on the next dispatch pass.

use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// The two supported schedule kinds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Interval,
    Cron,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Interval => "interval",
            ScheduleType::Cron => "cron",
        }
    }
}

impl FromStr for ScheduleType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interval" => Ok(ScheduleType::Interval),
            "cron" => Ok(ScheduleType::Cron),
            other => Err(crate::SchedulerError::Validation(format!(
                "Unknown schedule type: {}",
                other
            ))
            .into()),
        }
    }
}

/// Configuration for an interval schedule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntervalConfig {
    /// Seconds between consecutive fires; must be positive
    pub interval_seconds: u64,
}

/// Configuration for a cron schedule, using the five standard fields
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CronConfig {
    #[serde(default = "default_cron_field")]
    pub minute: String,
    #[serde(default = "default_cron_field")]
    pub hour: String,
    #[serde(default = "default_cron_field")]
    pub day_of_month: String,
    #[serde(default = "default_cron_field")]
    pub month_of_year: String,
    #[serde(default = "default_cron_field")]
    pub day_of_week: String,
}

fn default_cron_field() -> String {
    "*".to_string()
}

/// A task's schedule configuration, dispatched on the task's schedule type
///
/// The persisted form is two columns: the schedule type string and the JSON
/// body of the matching variant. Parsing is driven by the type column rather
/// than by shape guessing, so an interval body can never be mistaken for a
/// sparse cron body.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ScheduleConfig {
    Interval(IntervalConfig),
    Cron(CronConfig),
}

impl ScheduleConfig {
    /// Parse a schedule configuration from its persisted parts.
    ///
    /// # Parameters
    /// * `schedule_type` - The schedule kind column
    /// * `config_json` - The JSON body of the configuration column
    pub fn from_parts(schedule_type: ScheduleType, config_json: &str) -> crate::Result<Self> {
        match schedule_type {
            ScheduleType::Interval => {
                let config: IntervalConfig = serde_json::from_str(config_json)
                    .context("Failed to parse interval schedule configuration")?;
                Ok(ScheduleConfig::Interval(config))
            }
            ScheduleType::Cron => {
                let config: CronConfig = serde_json::from_str(config_json)
                    .context("Failed to parse cron schedule configuration")?;
                Ok(ScheduleConfig::Cron(config))
            }
        }
    }

    /// Serialize the configuration body back to its JSON column form
    pub fn to_json(&self) -> crate::Result<String> {
        let json = match self {
            ScheduleConfig::Interval(c) => serde_json::to_string(c)?,
            ScheduleConfig::Cron(c) => serde_json::to_string(c)?,
        };
        Ok(json)
    }

    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            ScheduleConfig::Interval(_) => ScheduleType::Interval,
            ScheduleConfig::Cron(_) => ScheduleType::Cron,
        }
    }

    /// Validate the configuration without compiling it against a timezone
    pub fn validate(&self) -> crate::Result<()> {
        match self {
            ScheduleConfig::Interval(c) => {
                if c.interval_seconds == 0 {
                    return Err(crate::SchedulerError::Validation(
                        "interval_seconds must be positive".to_string(),
                    )
                    .into());
                }
            }
            ScheduleConfig::Cron(c) => {
                // Compile against a throwaway expression to validate field syntax
                cron_expression(c)
                    .parse::<Schedule>()
                    .map_err(|e| {
                        crate::SchedulerError::Validation(format!("Invalid cron fields: {}", e))
                    })?;
            }
        }
        Ok(())
    }
}

/// One interval past `from`, or None when the arithmetic overflows the
/// calendar range (a task that far out is effectively never due)
fn interval_due(from: DateTime<Utc>, period: Duration) -> Option<DateTime<Utc>> {
    let period = ChronoDuration::from_std(period).ok()?;
    from.checked_add_signed(period)
}

/// Build a six-field expression for the `cron` crate from the five standard
/// fields (a fixed `0` seconds field is prepended).
fn cron_expression(config: &CronConfig) -> String {
    format!(
        "0 {} {} {} {} {}",
        config.minute, config.hour, config.day_of_month, config.month_of_year, config.day_of_week
    )
}

/// A schedule compiled into an evaluable form
#[derive(Debug, Clone)]
pub enum CompiledSchedule {
    Interval(Duration),
    Cron { schedule: Box<Schedule>, tz: Tz },
}

impl CompiledSchedule {
    /// Compile a schedule configuration for evaluation in the given timezone.
    ///
    /// Interval schedules ignore the timezone; cron schedules evaluate their
    /// calendar arithmetic in it.
    pub fn compile(config: &ScheduleConfig, tz: Tz) -> crate::Result<Self> {
        match config {
            ScheduleConfig::Interval(c) => {
                if c.interval_seconds == 0 {
                    return Err(crate::SchedulerError::Validation(
                        "interval_seconds must be positive".to_string(),
                    )
                    .into());
                }
                Ok(CompiledSchedule::Interval(Duration::from_secs(
                    c.interval_seconds,
                )))
            }
            ScheduleConfig::Cron(c) => {
                let schedule = cron_expression(c).parse::<Schedule>().map_err(|e| {
                    crate::SchedulerError::Validation(format!("Invalid cron fields: {}", e))
                })?;
                Ok(CompiledSchedule::Cron {
                    schedule: Box::new(schedule),
                    tz,
                })
            }
        }
    }

    /// Whether the schedule is due at `now` given the last fire time.
    ///
    /// A task with no recorded last fire is immediately eligible. For cron
    /// schedules the comparison uses the first calendar occurrence strictly
    /// after the last fire.
    pub fn is_due(&self, last_run_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let last = match last_run_at {
            Some(last) => last,
            None => return true,
        };

        match self {
            CompiledSchedule::Interval(period) => match interval_due(last, *period) {
                Some(due) => due <= now,
                None => false,
            },
            CompiledSchedule::Cron { schedule, tz } => {
                match schedule.after(&last.with_timezone(tz)).next() {
                    Some(next) => next.with_timezone(&Utc) <= now,
                    None => false,
                }
            }
        }
    }

    /// The due time to place an entry at in the dispatch queue.
    ///
    /// With no last fire the entry is due immediately. When the computed due
    /// time has fallen behind `now` by more than one period, the entry is
    /// placed at `now`: the dispatcher fires once for the whole missed span
    /// and subsequent due times align to future boundaries.
    pub fn next_due(&self, last_run_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        let last = match last_run_at {
            Some(last) => last,
            None => return now,
        };

        match self {
            CompiledSchedule::Interval(period) => {
                let Some(due) = interval_due(last, *period) else {
                    return DateTime::<Utc>::MAX_UTC;
                };
                match interval_due(due, *period) {
                    // More than one full period behind: single-fire catch-up
                    Some(next) if next < now => now,
                    _ => due,
                }
            }
            CompiledSchedule::Cron { schedule, tz } => {
                let mut occurrences = schedule.after(&last.with_timezone(tz));
                match occurrences.next() {
                    Some(first) => {
                        let first = first.with_timezone(&Utc);
                        if first >= now {
                            return first;
                        }
                        // At least one boundary was missed. Fire once now;
                        // alignment to the next future boundary happens when
                        // the dispatcher recomputes from the new last_run_at.
                        now
                    }
                    None => now,
                }
            }
        }
    }

    /// A rough period used for staleness heuristics and logging
    pub fn period_hint(&self) -> Duration {
        match self {
            CompiledSchedule::Interval(period) => *period,
            // Cron granularity is one minute
            CompiledSchedule::Cron { .. } => Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn interval_due_after_period() {
        let config = ScheduleConfig::Interval(IntervalConfig {
            interval_seconds: 10,
        });
        let compiled = CompiledSchedule::compile(&config, chrono_tz::UTC).unwrap();

        let last = utc(2024, 6, 1, 12, 0, 0);
        assert!(!compiled.is_due(Some(last), utc(2024, 6, 1, 12, 0, 5)));
        assert!(compiled.is_due(Some(last), utc(2024, 6, 1, 12, 0, 10)));
        assert!(compiled.is_due(None, last));
    }

    #[test]
    fn interval_catch_up_fires_once_and_aligns() {
        let config = ScheduleConfig::Interval(IntervalConfig {
            interval_seconds: 10,
        });
        let compiled = CompiledSchedule::compile(&config, chrono_tz::UTC).unwrap();

        // Five periods behind: the due time collapses to now rather than
        // replaying each missed slot.
        let last = utc(2024, 6, 1, 12, 0, 0);
        let now = utc(2024, 6, 1, 12, 0, 50);
        assert_eq!(compiled.next_due(Some(last), now), now);

        // After firing at `now` the next due time is a clean period ahead.
        assert_eq!(
            compiled.next_due(Some(now), now),
            utc(2024, 6, 1, 12, 1, 0)
        );
    }

    #[test]
    fn cron_minute_boundary_fires_once() {
        let config = ScheduleConfig::Cron(CronConfig {
            minute: "*".to_string(),
            hour: "*".to_string(),
            day_of_month: "*".to_string(),
            month_of_year: "*".to_string(),
            day_of_week: "*".to_string(),
        });
        let compiled = CompiledSchedule::compile(&config, chrono_tz::UTC).unwrap();

        // Fired exactly on a boundary: not due again within the same minute.
        let fired = utc(2024, 6, 1, 12, 5, 0);
        assert!(!compiled.is_due(Some(fired), utc(2024, 6, 1, 12, 5, 30)));
        assert!(compiled.is_due(Some(fired), utc(2024, 6, 1, 12, 6, 0)));
    }

    #[test]
    fn cron_specific_minute() {
        let config = ScheduleConfig::Cron(CronConfig {
            minute: "30".to_string(),
            hour: "4".to_string(),
            day_of_month: "*".to_string(),
            month_of_year: "*".to_string(),
            day_of_week: "*".to_string(),
        });
        let compiled = CompiledSchedule::compile(&config, chrono_tz::UTC).unwrap();

        let last = utc(2024, 6, 1, 4, 30, 0);
        let next = compiled.next_due(Some(last), utc(2024, 6, 1, 5, 0, 0));
        assert_eq!(next, utc(2024, 6, 2, 4, 30, 0));
    }

    #[test]
    fn invalid_configs_rejected() {
        let config = ScheduleConfig::Interval(IntervalConfig {
            interval_seconds: 0,
        });
        assert!(config.validate().is_err());

        let config = ScheduleConfig::Cron(CronConfig {
            minute: "61".to_string(),
            hour: "*".to_string(),
            day_of_month: "*".to_string(),
            month_of_year: "*".to_string(),
            day_of_week: "*".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn schedule_config_round_trips_through_json() {
        let config = ScheduleConfig::Interval(IntervalConfig {
            interval_seconds: 30,
        });
        let json = config.to_json().unwrap();
        let parsed = ScheduleConfig::from_parts(ScheduleType::Interval, &json).unwrap();
        assert_eq!(config, parsed);
    }
}
