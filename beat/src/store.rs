//! Task store access for the beat process
//!
//! This module owns the `scheduled_tasks` table: the persistent source of
//! truth the scheduler reconciles against. Two classes of writes exist and
//! must not be mixed up:
//!
//! - User-facing mutations (`upsert`, `set_enabled`, `delete`) bump the
//!   `updated_at` audit column so the reconciler notices them.
//! - Run-state writes (`touch_last_run`, `reset_run_state`) are performed by
//!   the scheduler itself on every dispatch and MUST NOT touch `updated_at`,
//!   otherwise each fire would masquerade as a user edit and retrigger a
//!   rebuild on the following tick, forever.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use shared::schedule::ScheduleConfig;
use shared::task::ScheduledTask;
use shared::utils::{current_timestamp, database_path_from_url};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// A single task's change-detection signal row.
///
/// One of these per task (enabled or not) is read on every reconcile tick;
/// the fingerprint concatenates every column whose edit must be honored, so
/// hashing the sorted enabled fingerprints yields the content-hash signal.
#[derive(Debug, Clone)]
pub struct TaskSignal {
    pub id: String,
    pub enabled: bool,
    pub updated_at: i64,
    pub fingerprint: String,
}

/// SQLite-backed store of scheduled task definitions.
pub struct TaskStore {
    /// Path to the database file
    db_path: PathBuf,
    /// The active SQLite connection, opened lazily
    connection: Option<Connection>,
    /// Database busy timeout in seconds
    busy_timeout_seconds: u64,
}

impl TaskStore {
    /// Create a store manager for the task database at the given URL.
    ///
    /// Accepts a bare path or a `sqlite://` URL. The parent directory is
    /// created if necessary.
    pub fn new(database_url: &str, busy_timeout_seconds: u64) -> Result<Self> {
        let db_path = PathBuf::from(database_path_from_url(database_url));
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create data directory: {}", parent.display())
                })?;
            }
        }

        Ok(Self {
            db_path,
            connection: None,
            busy_timeout_seconds,
        })
    }

    /// Create the task table and indexes. Idempotent; safe on every startup.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing task store at {}", self.db_path.display());
        let conn = self.get_connection()?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                tags TEXT NOT NULL DEFAULT '[]',
                plugin_name TEXT NOT NULL,
                parameters TEXT NOT NULL DEFAULT '{}',
                schedule_type TEXT NOT NULL,
                schedule_config TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                priority INTEGER NOT NULL DEFAULT 5,
                max_retries INTEGER NOT NULL DEFAULT 0,
                timeout_seconds INTEGER,

                -- Run state owned by the scheduler (no-touch writes)
                last_run INTEGER,
                next_run INTEGER,

                -- Audit columns
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create scheduled_tasks table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_enabled ON scheduled_tasks(enabled)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_updated ON scheduled_tasks(updated_at)",
            [],
        )?;

        Ok(())
    }

    /// Get or lazily open the database connection with WAL and busy timeout
    fn get_connection(&mut self) -> Result<&Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path).map_err(|e| {
                shared::SchedulerError::StoreUnavailable(format!(
                    "{}: {}",
                    self.db_path.display(),
                    e
                ))
            })?;
            conn.busy_timeout(Duration::from_secs(self.busy_timeout_seconds))?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            self.connection = Some(conn);
        }
        Ok(self.connection.as_ref().expect("connection just opened"))
    }

    /// Read all enabled tasks in one consistent snapshot
    pub async fn list_enabled(&mut self) -> Result<Vec<ScheduledTask>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM scheduled_tasks WHERE enabled = 1 ORDER BY id",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_task)?;
        collect_tasks(rows)
    }

    /// Read every task definition, for operational listing
    pub async fn list_all(&mut self) -> Result<Vec<ScheduledTask>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM scheduled_tasks ORDER BY id",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_task)?;
        collect_tasks(rows)
    }

    /// The single lightweight read performed on every reconcile tick.
    ///
    /// Returns one signal row per task, enabled or not, so the detector can
    /// see enabled transitions in both directions as well as content edits.
    pub async fn change_signals(&mut self) -> Result<Vec<TaskSignal>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, enabled, updated_at, parameters, schedule_type, schedule_config,
                    priority, max_retries, timeout_seconds
             FROM scheduled_tasks ORDER BY id",
        )?;

        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let enabled: i64 = row.get(1)?;
            let updated_at: i64 = row.get(2)?;
            let parameters: String = row.get(3)?;
            let schedule_type: String = row.get(4)?;
            let schedule_config: String = row.get(5)?;
            let priority: i64 = row.get(6)?;
            let max_retries: i64 = row.get(7)?;
            let timeout_seconds: Option<i64> = row.get(8)?;

            let fingerprint = format!(
                "{}|{}|{}|{}|{}|{}|{}|{}|{}",
                id,
                parameters,
                schedule_type,
                schedule_config,
                priority,
                max_retries,
                timeout_seconds.map(|t| t.to_string()).unwrap_or_default(),
                enabled,
                updated_at
            );

            Ok(TaskSignal {
                id,
                enabled: enabled != 0,
                updated_at,
                fingerprint,
            })
        })?;

        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Fetch a single task by id
    pub async fn get(&mut self, id: &str) -> Result<Option<ScheduledTask>> {
        let conn = self.get_connection()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM scheduled_tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                row_to_task,
            )
            .optional()?;

        match row {
            Some(parsed) => Ok(Some(parsed?)),
            None => Ok(None),
        }
    }

    /// Insert or update a task definition.
    ///
    /// This is a user-facing mutation: `updated_at` is set to now. On update,
    /// `created_at` and the run-state columns are preserved.
    pub async fn upsert(&mut self, task: &ScheduledTask) -> Result<()> {
        task.validate()?;
        let now = current_timestamp() as i64;
        let parameters = task.parameters_json()?;
        let tags = task.tags_json()?;
        let schedule_config = task.schedule.to_json()?;

        let conn = self.get_connection()?;
        conn.execute(
            r#"
            INSERT INTO scheduled_tasks (
                id, name, description, tags, plugin_name, parameters,
                schedule_type, schedule_config, enabled, priority,
                max_retries, timeout_seconds, last_run, next_run,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL, NULL, ?13, ?13)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                tags = excluded.tags,
                plugin_name = excluded.plugin_name,
                parameters = excluded.parameters,
                schedule_type = excluded.schedule_type,
                schedule_config = excluded.schedule_config,
                enabled = excluded.enabled,
                priority = excluded.priority,
                max_retries = excluded.max_retries,
                timeout_seconds = excluded.timeout_seconds,
                updated_at = excluded.updated_at
            "#,
            params![
                task.id,
                task.name,
                task.description,
                tags,
                task.plugin_name,
                parameters,
                task.schedule_type().as_str(),
                schedule_config,
                task.enabled as i64,
                task.priority as i64,
                task.max_retries as i64,
                task.timeout_seconds.map(|t| t as i64),
                now,
            ],
        )?;

        debug!(task_id = %task.id, "Upserted task definition");
        Ok(())
    }

    /// Delete a task outright.
    ///
    /// # Returns
    /// `true` if a row was removed
    pub async fn delete(&mut self, id: &str) -> Result<bool> {
        let conn = self.get_connection()?;
        let changed = conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id])?;
        if changed > 0 {
            info!(task_id = %id, "Deleted task");
        }
        Ok(changed > 0)
    }

    /// Toggle a task. User-facing mutation: bumps `updated_at`.
    pub async fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<bool> {
        let now = current_timestamp() as i64;
        let conn = self.get_connection()?;
        let changed = conn.execute(
            "UPDATE scheduled_tasks SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
            params![enabled as i64, now, id],
        )?;
        if changed > 0 {
            info!(task_id = %id, enabled, "Toggled task");
        }
        Ok(changed > 0)
    }

    /// Record a dispatch. Run-state write: `updated_at` stays untouched.
    pub async fn touch_last_run(
        &mut self,
        id: &str,
        last_run: i64,
        next_run: Option<i64>,
    ) -> Result<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "UPDATE scheduled_tasks SET last_run = ?1, next_run = ?2 WHERE id = ?3",
            params![last_run, next_run, id],
        )?;
        Ok(())
    }

    /// Clear a task's run state so the schedule evaluator treats it as
    /// immediately eligible. Run-state write: `updated_at` stays untouched.
    pub async fn reset_run_state(&mut self, id: &str) -> Result<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "UPDATE scheduled_tasks SET last_run = NULL, next_run = NULL WHERE id = ?1",
            params![id],
        )?;
        debug!(task_id = %id, "Reset task run state");
        Ok(())
    }

    /// Total number of task definitions, for health reporting
    pub async fn count(&mut self) -> Result<i64> {
        let conn = self.get_connection()?;
        let count = conn.query_row("SELECT COUNT(*) FROM scheduled_tasks", [], |row| row.get(0))?;
        Ok(count)
    }
}

/// Column list shared by every task read
const TASK_COLUMNS: &str = "id, name, description, tags, plugin_name, parameters, schedule_type, \
     schedule_config, enabled, priority, max_retries, timeout_seconds, \
     last_run, next_run, created_at, updated_at";

/// Map a store row to a task, deferring JSON/schedule parse errors so a
/// single corrupt row surfaces as an error instead of a panic
fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<anyhow::Result<ScheduledTask>> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let description: String = row.get(2)?;
    let tags_text: String = row.get(3)?;
    let plugin_name: String = row.get(4)?;
    let parameters_text: String = row.get(5)?;
    let schedule_type_text: String = row.get(6)?;
    let schedule_config_text: String = row.get(7)?;
    let enabled: i64 = row.get(8)?;
    let priority: i64 = row.get(9)?;
    let max_retries: i64 = row.get(10)?;
    let timeout_seconds: Option<i64> = row.get(11)?;
    let last_run: Option<i64> = row.get(12)?;
    let next_run: Option<i64> = row.get(13)?;
    let created_at: i64 = row.get(14)?;
    let updated_at: i64 = row.get(15)?;

    Ok((|| {
        let tags: Vec<String> = serde_json::from_str(&tags_text)
            .with_context(|| format!("Corrupt tags column for task '{}'", id))?;
        let parameters = serde_json::from_str::<serde_json::Value>(&parameters_text)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .with_context(|| format!("Corrupt parameters column for task '{}'", id))?;
        let schedule_type = shared::schedule::ScheduleType::from_str(&schedule_type_text)?;
        let schedule = ScheduleConfig::from_parts(schedule_type, &schedule_config_text)
            .with_context(|| format!("Corrupt schedule_config column for task '{}'", id))?;

        Ok(ScheduledTask {
            id: id.clone(),
            name,
            description,
            tags,
            plugin_name,
            parameters,
            schedule,
            enabled: enabled != 0,
            priority: priority as u8,
            max_retries: max_retries as u32,
            timeout_seconds: timeout_seconds.map(|t| t as u64),
            last_run,
            next_run,
            created_at,
            updated_at,
        })
    })())
}

/// Collect mapped task rows, propagating both SQLite and parse errors
fn collect_tasks(
    rows: impl Iterator<Item = rusqlite::Result<anyhow::Result<ScheduledTask>>>,
) -> Result<Vec<ScheduledTask>> {
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row??);
    }
    Ok(tasks)
}
