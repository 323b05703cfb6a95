//! Worker pool
//!
//! Claims submissions from the broker queue and executes them through the
//! plugin invoker, bounded by a semaphore. Every execution runs under the
//! submission's time limit and a revocation watcher; completion goes through
//! the gateway's conditional paths, so a submission revoked mid-flight can
//! never be recorded as successful.

use anyhow::Result;
use serde_json::json;
use shared::broker::{BrokerGateway, Submission};
use shared::config::WorkerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::invoker::{ExecutionOutcome, PluginInvoker};

/// Cadence of the revocation check during an execution
const REVOCATION_POLL: Duration = Duration::from_secs(1);

/// Age at which finished queue rows are purged
const FINISHED_ROW_RETENTION_HOURS: i64 = 24;

/// Pool of concurrent plugin executions over the broker queue
pub struct WorkerPool {
    gateway: Arc<Mutex<BrokerGateway>>,
    invoker: Arc<PluginInvoker>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        gateway: Arc<Mutex<BrokerGateway>>,
        invoker: Arc<PluginInvoker>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            gateway,
            invoker,
            config,
        }
    }

    /// Run the claim loop until a shutdown signal arrives, then drain
    /// in-flight executions within the configured grace period.
    pub async fn run(
        &self,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<()> {
        info!(
            queues = ?self.config.queues,
            concurrency = self.config.concurrency,
            "Worker pool starting"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let poll_interval = Duration::from_millis(self.config.claim_poll_interval_millis);
        let mut cleanup_interval = tokio::time::interval(Duration::from_secs(
            self.config.queue_cleanup_interval_seconds,
        ));
        cleanup_interval.tick().await;

        loop {
            // A permit is held before claiming so the queue row is only taken
            // when a slot can actually execute it.
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.expect("semaphore never closed")
                }
                _ = shutdown_rx.recv() => break,
            };

            tokio::select! {
                _ = cleanup_interval.tick() => {
                    let mut gateway = self.gateway.lock().await;
                    if let Err(e) = gateway.cleanup_finished(FINISHED_ROW_RETENTION_HOURS).await {
                        warn!("Queue cleanup failed: {:#}", e);
                    }
                    drop(permit);
                    continue;
                }
                _ = shutdown_rx.recv() => {
                    drop(permit);
                    break;
                }
                claimed = async {
                    let mut gateway = self.gateway.lock().await;
                    gateway.claim_next(&self.config.queues).await
                } => {
                    match claimed {
                        Ok(Some(submission)) => {
                            let gateway = Arc::clone(&self.gateway);
                            let invoker = Arc::clone(&self.invoker);
                            tokio::spawn(async move {
                                execute_submission(gateway, invoker, submission).await;
                                drop(permit);
                            });
                        }
                        Ok(None) => {
                            drop(permit);
                            tokio::time::sleep(poll_interval).await;
                        }
                        Err(e) => {
                            warn!("Failed to claim from broker: {:#}", e);
                            drop(permit);
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                }
            }
        }

        self.drain(&semaphore).await;
        info!("Worker pool stopped");
        Ok(())
    }

    /// Wait for in-flight executions to finish, bounded by the configured
    /// grace period.
    async fn drain(&self, semaphore: &Arc<Semaphore>) {
        let in_flight = self.config.concurrency - semaphore.available_permits();
        if in_flight == 0 {
            return;
        }
        info!(
            "Waiting for {} in-flight executions (timeout: {}s)",
            in_flight, self.config.graceful_shutdown_timeout_seconds
        );

        let deadline = Duration::from_secs(self.config.graceful_shutdown_timeout_seconds);
        let all = semaphore.acquire_many(self.config.concurrency as u32);
        match tokio::time::timeout(deadline, all).await {
            Ok(_) => info!("All in-flight executions completed"),
            Err(_) => warn!(
                "Graceful shutdown timeout reached, {} executions still running",
                self.config.concurrency - semaphore.available_permits()
            ),
        }
    }
}

/// Execute one claimed submission end to end.
///
/// The execution future races against the submission's time limit and a
/// once-a-second revocation poll. Dropping the execution future kills the
/// plugin subprocess (`kill_on_drop`), which is exactly what both the
/// timeout and a terminate-revoke want.
async fn execute_submission(
    gateway: Arc<Mutex<BrokerGateway>>,
    invoker: Arc<PluginInvoker>,
    submission: Submission,
) {
    debug!(
        submission_id = %submission.id,
        plugin = %submission.plugin_name,
        attempt = submission.attempt,
        "Executing submission"
    );

    let execution = invoker.execute(&submission.plugin_name, &submission.kwargs);
    tokio::pin!(execution);

    let time_limit = submission
        .time_limit
        .map(Duration::from_secs)
        .unwrap_or(Duration::MAX);
    let deadline = tokio::time::sleep(time_limit);
    tokio::pin!(deadline);

    let mut revocation_poll = tokio::time::interval(REVOCATION_POLL);
    revocation_poll.tick().await;

    let outcome: Option<Result<ExecutionOutcome>> = loop {
        tokio::select! {
            outcome = &mut execution => break Some(outcome),
            _ = &mut deadline => {
                warn!(
                    submission_id = %submission.id,
                    "Execution exceeded its {}s time limit, killing plugin",
                    submission.time_limit.unwrap_or_default()
                );
                break None;
            }
            _ = revocation_poll.tick() => {
                let revoked = {
                    let mut gateway = gateway.lock().await;
                    gateway.should_terminate(&submission.id).await.unwrap_or(false)
                };
                if revoked {
                    info!(
                        submission_id = %submission.id,
                        "Submission revoked with terminate, killing plugin"
                    );
                    // No completion write: the row is already revoked.
                    return;
                }
            }
        }
    };

    let mut gateway = gateway.lock().await;
    match outcome {
        Some(Ok(outcome)) if outcome.is_success() => {
            let result = outcome.result.unwrap_or(json!(null));
            match gateway.mark_success(&submission.id, &result).await {
                Ok(true) => {}
                Ok(false) => debug!(
                    submission_id = %submission.id,
                    "Completion skipped; submission no longer active"
                ),
                Err(e) => warn!(
                    submission_id = %submission.id,
                    "Failed to record success: {:#}", e
                ),
            }
        }
        Some(Ok(outcome)) => {
            let message = outcome.error.unwrap_or_else(|| "unknown plugin error".to_string());
            if let Err(e) = gateway.mark_error(&submission.id, &message).await {
                warn!(submission_id = %submission.id, "Failed to record error: {:#}", e);
            }
        }
        Some(Err(e)) => {
            // Typed invoker errors: plugin missing, parameters invalid,
            // reload failure. These are execution failures from the queue's
            // point of view.
            if let Err(record_err) = gateway.mark_error(&submission.id, &format!("{:#}", e)).await {
                warn!(
                    submission_id = %submission.id,
                    "Failed to record error: {:#}", record_err
                );
            }
        }
        None => {
            let message = format!(
                "execution exceeded time limit of {}s",
                submission.time_limit.unwrap_or_default()
            );
            if let Err(e) = gateway.mark_error(&submission.id, &message).await {
                warn!(submission_id = %submission.id, "Failed to record timeout: {:#}", e);
            }
        }
    }
}
