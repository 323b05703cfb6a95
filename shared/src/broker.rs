//! Broker gateway for plugin invocation submissions
//!
//! This module owns the queue database the beat process submits into and the
//! worker pool claims from. Submissions are fire-and-forget from the
//! scheduler's perspective; the gateway is responsible for serializing the
//! broker write and retrying it on contention. Ordering across submissions is
//! not guaranteed.
// The queue is an SQLite database in WAL mode shared between processes. All
// state transitions are conditional UPDATEs keyed on the current status, so a
// claim can never race another worker into double execution and a revoked
// submission can never be reported as successful.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::utils::{current_timestamp, database_path_from_url, generate_submission_id};

/// Logical task name carried by every plugin submission
pub const PLUGIN_TASK_NAME: &str = "execute_plugin_task";

/// Queue plugin work is submitted onto
pub const PLUGIN_QUEUE: &str = "plugin_tasks";

/// Attempts the gateway makes for a single broker write before giving up
const SUBMIT_WRITE_ATTEMPTS: u32 = 3;

/// Delay between broker write attempts
const SUBMIT_WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Status of a submission in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Pending, // Waiting to be claimed
    Active,  // Claimed by a worker, executing
    Success, // Finished, result recorded
    Error,   // Permanently failed after exhausting retries
    Revoked, // Administratively cancelled
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Active => "active",
            SubmissionStatus::Success => "success",
            SubmissionStatus::Error => "error",
            SubmissionStatus::Revoked => "revoked",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(SubmissionStatus::Pending),
            "active" => Ok(SubmissionStatus::Active),
            "success" => Ok(SubmissionStatus::Success),
            "error" => Ok(SubmissionStatus::Error),
            "revoked" => Ok(SubmissionStatus::Revoked),
            _ => Err(anyhow::anyhow!("Invalid submission status: {}", s)),
        }
    }
}

/// Options carried by a submission
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// Queue name the submission lands on
    pub queue: String,
    /// Priority hint, 1..10 with 10 highest
    pub priority: u8,
    /// Hard execution time limit in seconds, if any
    pub time_limit: Option<u64>,
    /// Number of re-execution attempts granted on failure
    pub retries: u32,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            queue: PLUGIN_QUEUE.to_string(),
            priority: crate::defaults::default_task_priority(),
            time_limit: None,
            retries: 0,
        }
    }
}

/// A submission row as read back from the queue
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: String,
    pub queue: String,
    pub task_name: String,
    pub plugin_name: String,
    pub kwargs: Map<String, Value>,
    pub priority: u8,
    pub time_limit: Option<u64>,
    pub retries: u32,
    pub attempt: u32,
    pub status: SubmissionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub terminate: bool,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

/// Queue statistics for monitoring
#[derive(Debug, Default, Clone)]
pub struct QueueStats {
    pub pending: i64,
    pub active: i64,
    pub success: i64,
    pub error: i64,
    pub revoked: i64,
}

/// Gateway over the broker queue database.
///
/// Both beat (submit side) and workers (claim side) hold one of these; the
/// connection is opened lazily and kept for the lifetime of the process.
pub struct BrokerGateway {
    /// Path to the queue database file
    db_path: PathBuf,
    /// The active SQLite connection, opened on first use
    connection: Option<Connection>,
    /// Database busy timeout in seconds
    busy_timeout_seconds: u64,
}

impl BrokerGateway {
    /// Create a gateway for the queue database at the given broker URL.
    ///
    /// Accepts a bare path or a `sqlite://` URL. The parent directory is
    /// created if necessary; the database itself is created by
    /// `initialize()`.
    pub fn new(broker_url: &str, busy_timeout_seconds: u64) -> Result<Self> {
        let db_path = PathBuf::from(database_path_from_url(broker_url));
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create broker data directory: {}", parent.display())
                })?;
            }
        }

        Ok(Self {
            db_path,
            connection: None,
            busy_timeout_seconds,
        })
    }

    /// The queue database location
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Create the queue table and indexes. Idempotent; safe on every startup.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing broker queue at {}", self.db_path.display());
        let conn = self.get_connection()?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS broker_queue (
                id TEXT PRIMARY KEY,

                -- Wire format
                queue TEXT NOT NULL,
                task_name TEXT NOT NULL,
                plugin_name TEXT NOT NULL,
                kwargs TEXT NOT NULL DEFAULT '{}',
                priority INTEGER NOT NULL DEFAULT 5,
                time_limit INTEGER,
                retries INTEGER NOT NULL DEFAULT 0,

                -- Execution tracking
                attempt INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                result TEXT,
                error TEXT,
                terminate INTEGER NOT NULL DEFAULT 0,

                created_at INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER,
                next_attempt_at INTEGER NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create broker_queue table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_broker_claim
             ON broker_queue(status, queue, next_attempt_at)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_broker_plugin
             ON broker_queue(plugin_name, status)",
            [],
        )?;

        Ok(())
    }

    /// Get or lazily open the database connection with WAL and busy timeout
    fn get_connection(&mut self) -> Result<&Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path).with_context(|| {
                format!("Failed to open broker queue: {}", self.db_path.display())
            })?;
            conn.busy_timeout(Duration::from_secs(self.busy_timeout_seconds))?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            self.connection = Some(conn);
        }
        Ok(self.connection.as_ref().expect("connection just opened"))
    }

    /// Submit a plugin invocation onto the queue.
    ///
    /// The write itself is retried a bounded number of times on lock
    /// contention; past that the submission is reported as a broker failure
    /// and the caller decides whether to re-attempt on its next tick.
    ///
    /// # Returns
    /// The opaque submission id
    pub async fn submit(
        &mut self,
        plugin_name: &str,
        parameters: &Map<String, Value>,
        options: &SubmitOptions,
    ) -> Result<String> {
        let id = generate_submission_id();
        let kwargs = serde_json::to_string(&Value::Object(parameters.clone()))?;
        let now = current_timestamp() as i64;

        let mut last_error = None;
        for attempt in 1..=SUBMIT_WRITE_ATTEMPTS {
            let insert = {
                let queue = options.queue.clone();
                let conn = self.get_connection()?;
                conn.execute(
                    r#"
                    INSERT INTO broker_queue (
                        id, queue, task_name, plugin_name, kwargs,
                        priority, time_limit, retries,
                        status, created_at, next_attempt_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                    "#,
                    params![
                        id,
                        queue,
                        PLUGIN_TASK_NAME,
                        plugin_name,
                        kwargs,
                        options.priority as i64,
                        options.time_limit.map(|t| t as i64),
                        options.retries as i64,
                        SubmissionStatus::Pending.as_str(),
                        now,
                    ],
                )
            };

            match insert {
                Ok(_) => {
                    debug!(
                        submission_id = %id,
                        plugin = plugin_name,
                        queue = %options.queue,
                        "Submitted plugin invocation"
                    );
                    return Ok(id);
                }
                Err(e) => {
                    warn!(
                        "Broker write attempt {}/{} failed: {}",
                        attempt, SUBMIT_WRITE_ATTEMPTS, e
                    );
                    last_error = Some(e);
                    tokio::time::sleep(SUBMIT_WRITE_RETRY_DELAY).await;
                }
            }
        }

        Err(crate::SchedulerError::BrokerUnavailable(format!(
            "submission write failed after {} attempts: {}",
            SUBMIT_WRITE_ATTEMPTS,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ))
        .into())
    }

    /// Look up a submission by id
    pub async fn status(&mut self, id: &str) -> Result<Option<Submission>> {
        let conn = self.get_connection()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM broker_queue WHERE id = ?1", SUBMISSION_COLUMNS),
                params![id],
                row_to_submission,
            )
            .optional()?;
        Ok(row)
    }

    /// Revoke a submission. Pending and active submissions can be revoked;
    /// finished ones are left untouched.
    ///
    /// # Parameters
    /// * `terminate` - Ask the executing worker to kill the plugin process
    ///
    /// # Returns
    /// `true` if a submission was transitioned to revoked
    pub async fn revoke(&mut self, id: &str, terminate: bool) -> Result<bool> {
        let now = current_timestamp() as i64;
        let conn = self.get_connection()?;
        let changed = conn.execute(
            "UPDATE broker_queue
             SET status = 'revoked', terminate = ?1, finished_at = ?2
             WHERE id = ?3 AND status IN ('pending', 'active')",
            params![terminate as i64, now, id],
        )?;

        if changed > 0 {
            info!(submission_id = %id, terminate, "Revoked submission");
        }
        Ok(changed > 0)
    }

    /// Revoke every pending or active submission for a plugin.
    ///
    /// # Returns
    /// Number of submissions revoked
    pub async fn revoke_by_plugin(&mut self, plugin_name: &str, terminate: bool) -> Result<usize> {
        let now = current_timestamp() as i64;
        let conn = self.get_connection()?;
        let changed = conn.execute(
            "UPDATE broker_queue
             SET status = 'revoked', terminate = ?1, finished_at = ?2
             WHERE plugin_name = ?3 AND status IN ('pending', 'active')",
            params![terminate as i64, now, plugin_name],
        )?;

        if changed > 0 {
            info!(plugin = plugin_name, count = changed, "Revoked submissions by plugin");
        }
        Ok(changed)
    }

    /// List all currently executing submissions
    pub async fn inspect_active(&mut self) -> Result<Vec<Submission>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM broker_queue WHERE status = 'active' ORDER BY started_at ASC",
            SUBMISSION_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_submission)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Claim the next due submission from any of the given queues.
    ///
    /// Selection is priority-descending then FIFO. The claim is a conditional
    /// UPDATE so concurrent workers cannot claim the same row; on a lost race
    /// the next candidate is tried.
    pub async fn claim_next(&mut self, queues: &[String]) -> Result<Option<Submission>> {
        if queues.is_empty() {
            return Ok(None);
        }
        let now = current_timestamp() as i64;

        // Bounded retry over lost claim races
        for _ in 0..8 {
            let candidate: Option<String> = {
                let conn = self.get_connection()?;
                let placeholders = queues.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                // rowid breaks created_at ties so same-second submissions
                // still claim in insertion order
                let sql = format!(
                    "SELECT id FROM broker_queue
                     WHERE status = 'pending' AND next_attempt_at <= ? AND queue IN ({})
                     ORDER BY priority DESC, created_at ASC, rowid ASC
                     LIMIT 1",
                    placeholders
                );
                let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now)];
                for queue in queues {
                    params_vec.push(Box::new(queue.clone()));
                }
                conn.query_row(&sql, rusqlite::params_from_iter(params_vec), |row| {
                    row.get(0)
                })
                .optional()?
            };

            let id = match candidate {
                Some(id) => id,
                None => return Ok(None),
            };

            let claimed = {
                let conn = self.get_connection()?;
                conn.execute(
                    "UPDATE broker_queue
                     SET status = 'active', attempt = attempt + 1, started_at = ?1
                     WHERE id = ?2 AND status = 'pending'",
                    params![now, id],
                )?
            };

            if claimed == 1 {
                return self.status(&id).await;
            }
            // Lost the race; try the next candidate.
        }

        Ok(None)
    }

    /// Record a successful execution.
    ///
    /// Conditional on the submission still being active: a submission revoked
    /// mid-flight stays revoked and never reports success.
    pub async fn mark_success(&mut self, id: &str, result: &Value) -> Result<bool> {
        let now = current_timestamp() as i64;
        let result_json = serde_json::to_string(result)?;
        let conn = self.get_connection()?;
        let changed = conn.execute(
            "UPDATE broker_queue
             SET status = 'success', result = ?1, finished_at = ?2
             WHERE id = ?3 AND status = 'active'",
            params![result_json, now, id],
        )?;
        Ok(changed == 1)
    }

    /// Record a failed execution attempt.
    ///
    /// While attempts remain the submission is requeued with exponential
    /// backoff; otherwise it is marked permanently failed. Both transitions
    /// are conditional on the submission still being active.
    pub async fn mark_error(&mut self, id: &str, error_msg: &str) -> Result<()> {
        let now = current_timestamp() as i64;

        let row: Option<(u32, u32)> = {
            let conn = self.get_connection()?;
            conn.query_row(
                "SELECT attempt, retries FROM broker_queue WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, i64>(0)? as u32, row.get::<_, i64>(1)? as u32)),
            )
            .optional()?
        };

        let (attempt, retries) = match row {
            Some(pair) => pair,
            None => return Ok(()),
        };

        let conn = self.get_connection()?;
        if attempt <= retries {
            // Exponential backoff: 2^attempt seconds, capped at 5 minutes
            let backoff_seconds = 2_u64.pow(attempt.min(16)).min(300);
            let next_attempt_at = now + backoff_seconds as i64;

            let changed = conn.execute(
                "UPDATE broker_queue
                 SET status = 'pending', error = ?1, next_attempt_at = ?2
                 WHERE id = ?3 AND status = 'active'",
                params![error_msg, next_attempt_at, id],
            )?;
            if changed == 1 {
                debug!(
                    submission_id = %id,
                    "Execution failed, retry in {}s (attempt {}/{})",
                    backoff_seconds,
                    attempt,
                    retries + 1
                );
            }
        } else {
            let changed = conn.execute(
                "UPDATE broker_queue
                 SET status = 'error', error = ?1, finished_at = ?2
                 WHERE id = ?3 AND status = 'active'",
                params![error_msg, now, id],
            )?;
            if changed == 1 {
                warn!(
                    submission_id = %id,
                    "Execution permanently failed after {} attempts: {}",
                    attempt,
                    error_msg
                );
            }
        }

        Ok(())
    }

    /// Whether the submission has been revoked
    pub async fn is_revoked(&mut self, id: &str) -> Result<bool> {
        let conn = self.get_connection()?;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM broker_queue WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.as_deref() == Some("revoked"))
    }

    /// Whether a revoked submission also requested process termination
    pub async fn should_terminate(&mut self, id: &str) -> Result<bool> {
        let conn = self.get_connection()?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT status, terminate FROM broker_queue WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(matches!(row, Some((status, terminate)) if status == "revoked" && terminate != 0))
    }

    /// Clean up finished submissions older than the given age
    pub async fn cleanup_finished(&mut self, older_than_hours: i64) -> Result<usize> {
        let cutoff = current_timestamp() as i64 - older_than_hours * 3600;
        let conn = self.get_connection()?;
        let count = conn.execute(
            "DELETE FROM broker_queue
             WHERE status IN ('success', 'error', 'revoked') AND finished_at < ?1",
            params![cutoff],
        )?;

        if count > 0 {
            debug!("Cleaned up {} finished submissions", count);
        }
        Ok(count)
    }

    /// Per-status queue counts for monitoring
    pub async fn stats(&mut self) -> Result<QueueStats> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM broker_queue GROUP BY status")?;

        let mut stats = QueueStats::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        for row in rows {
            let (status, count) = row?;
            match status.as_str() {
                "pending" => stats.pending = count,
                "active" => stats.active = count,
                "success" => stats.success = count,
                "error" => stats.error = count,
                "revoked" => stats.revoked = count,
                _ => {}
            }
        }

        Ok(stats)
    }
}

/// Column list shared by every submission read
const SUBMISSION_COLUMNS: &str = "id, queue, task_name, plugin_name, kwargs, priority, \
     time_limit, retries, attempt, status, result, error, terminate, \
     created_at, started_at, finished_at";

/// Map a queue row to a `Submission`
fn row_to_submission(row: &rusqlite::Row<'_>) -> rusqlite::Result<Submission> {
    let kwargs_text: String = row.get(4)?;
    let kwargs = serde_json::from_str::<Value>(&kwargs_text)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();

    let status_text: String = row.get(9)?;
    let status = SubmissionStatus::from_str(&status_text)
        .unwrap_or(SubmissionStatus::Error);

    let result_text: Option<String> = row.get(10)?;
    let result = result_text.and_then(|t| serde_json::from_str(&t).ok());

    Ok(Submission {
        id: row.get(0)?,
        queue: row.get(1)?,
        task_name: row.get(2)?,
        plugin_name: row.get(3)?,
        kwargs,
        priority: row.get::<_, i64>(5)? as u8,
        time_limit: row.get::<_, Option<i64>>(6)?.map(|t| t as u64),
        retries: row.get::<_, i64>(7)? as u32,
        attempt: row.get::<_, i64>(8)? as u32,
        status,
        result,
        error: row.get(11)?,
        terminate: row.get::<_, i64>(12)? != 0,
        created_at: row.get(13)?,
        started_at: row.get(14)?,
        finished_at: row.get(15)?,
    })
}
