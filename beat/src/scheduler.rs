//! Beat scheduling core
//!
//! This module keeps an in-memory schedule synchronized with the persisted
//! task table and fires tasks whose due time has passed. The loop has two
//! cadences: a reconcile wake every `max_loop_interval` that runs change
//! detection (and a rebuild when anything moved), and a one-second dispatch
//! pass that consults the head of the due-time queue in between.
//!
//! Change detection is a disjunction of five independent signals; any one of
//! them triggers a full rebuild, and none of them firing means the tick cost
//! is a single lightweight query plus hash comparisons. Signal four (the
//! per-task enabled transition map) exists specifically because a plain
//! content hash over enabled rows cannot distinguish "task re-enabled with a
//! stale last_run" from "task that was always enabled", which is how
//! re-enabled tasks historically got dropped on the floor.
// Exactly one beat process may run per deployment. The loop owns all of its
// state mutably; admin mutations land in the store from other processes and
// are honored within two reconcile intervals.

use anyhow::Result;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use shared::broker::{BrokerGateway, SubmitOptions, PLUGIN_QUEUE};
use shared::config::BeatConfig;
use shared::schedule::CompiledSchedule;
use shared::task::ScheduledTask;
use shared::utils::calculate_string_checksum;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::store::{TaskSignal, TaskStore};

/// Gap beyond which a task's persisted run state is cleared outright
const HARD_RESET_THRESHOLD_SECS: i64 = 1800;

/// Gap beyond which a task is treated as eligible without clearing the store
const SOFT_RESET_THRESHOLD_SECS: i64 = 60;

/// Dispatch pass cadence between reconcile wakes
const DISPATCH_TICK: Duration = Duration::from_secs(1);

/// Delay before re-attempting a submission that the broker refused
const SUBMIT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Represents the possible states of the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// Dispatch state of a single schedule entry
#[derive(Debug, Clone, Copy, PartialEq)]
enum EntryState {
    /// In the queue, not due
    Pending,
    /// At the head of the queue with its due time passed
    Due,
    /// Submission acknowledged by the broker, about to be re-enqueued
    Submitted,
}

/// In-memory schedule entry: the task snapshot plus compiled schedule and
/// run state. `last_run_at` is the authoritative fire time between rebuilds;
/// the persisted `last_run` column is only its second-granularity shadow.
struct ScheduleEntry {
    task: ScheduledTask,
    compiled: CompiledSchedule,
    last_run_at: Option<DateTime<Utc>>,
    /// Wall-clock due time of the slot currently in the queue; used to drop
    /// stale heap slots after a rebuild or re-enqueue
    queued_due_at: Option<DateTime<Utc>>,
    state: EntryState,
}

/// A slot in the due-time priority queue.
///
/// Ordering is monotonic (`Instant`), derived from the wall-clock due time at
/// enqueue, so a wall-clock jump cannot reorder the queue. The wall time
/// rides along for staleness checks and persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueSlot {
    due_at: Instant,
    seq: u64,
    task_id: String,
    due_wall: DateTime<Utc>,
}

impl Ord for QueueSlot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due_at
            .cmp(&other.due_at)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for QueueSlot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Cached change-detection state, swapped atomically on every rebuild
#[derive(Debug, Default)]
struct DetectionCache {
    /// Whether a snapshot has been taken at all
    initialized: bool,
    /// Signal 1: size of the enabled set
    enabled_count: usize,
    /// Signal 2: sorted enabled task ids
    enabled_ids: Vec<String>,
    /// Signal 3: content hash over the sorted enabled task fingerprints
    content_hash: String,
    /// Signal 4: per-task enabled flag, for every task in the store
    enabled_map: HashMap<String, bool>,
    /// Signal 5: max updated_at over enabled tasks
    max_updated_at: i64,
}

/// Counters exposed for tests and the health command
#[derive(Debug, Default, Clone)]
pub struct SchedulerStats {
    pub reconcile_count: u64,
    pub rebuild_count: u64,
    pub dispatch_count: u64,
    pub submit_failure_count: u64,
}

/// The beat scheduler: reconciles the in-memory schedule with the task store
/// and fires due tasks through the broker gateway.
pub struct BeatScheduler {
    store: TaskStore,
    gateway: BrokerGateway,
    tz: Tz,
    max_loop_interval: Duration,
    stale_snapshot_intervals: u32,
    /// Schedule map keyed by task id
    entries: HashMap<String, ScheduleEntry>,
    /// Due-time priority queue (min-heap over QueueSlot)
    queue: BinaryHeap<Reverse<QueueSlot>>,
    /// Monotonic sequence for FIFO tie-breaking in the queue
    seq: u64,
    cache: DetectionCache,
    /// When the last successful store snapshot was taken (monotonic)
    last_snapshot_at: Option<Instant>,
    pub state: SchedulerState,
    pub stats: SchedulerStats,
}

impl BeatScheduler {
    /// Create a scheduler over an initialized store and gateway.
    pub fn new(store: TaskStore, gateway: BrokerGateway, config: &BeatConfig) -> Result<Self> {
        let tz = config.timezone()?;
        Ok(Self {
            store,
            gateway,
            tz,
            max_loop_interval: Duration::from_secs(config.max_loop_interval_seconds),
            stale_snapshot_intervals: config.stale_snapshot_intervals,
            entries: HashMap::new(),
            queue: BinaryHeap::new(),
            seq: 0,
            cache: DetectionCache::default(),
            last_snapshot_at: None,
            state: SchedulerState::Stopped,
            stats: SchedulerStats::default(),
        })
    }

    /// Take the initial snapshot and transition to Running.
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting beat scheduler");
        self.reconcile().await?;
        self.state = SchedulerState::Running;
        info!("Beat scheduler started with {} entries", self.entries.len());
        Ok(())
    }

    /// Run the scheduling loop until a shutdown signal arrives.
    pub async fn run(
        &mut self,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut reconcile_interval = tokio::time::interval(self.max_loop_interval);
        let mut dispatch_interval = tokio::time::interval(DISPATCH_TICK);
        // The first tick of a tokio interval fires immediately; start() has
        // already reconciled, so consume both.
        reconcile_interval.tick().await;
        dispatch_interval.tick().await;

        while self.state == SchedulerState::Running {
            tokio::select! {
                _ = reconcile_interval.tick() => {
                    if let Err(e) = self.reconcile().await {
                        // Keep serving from the last good snapshot; the
                        // staleness guard suspends dispatch if this persists.
                        warn!("Reconcile failed, serving last snapshot: {:#}", e);
                    }
                    self.dispatch_due().await;
                    debug!(
                        reconciles = self.stats.reconcile_count,
                        rebuilds = self.stats.rebuild_count,
                        dispatches = self.stats.dispatch_count,
                        submit_failures = self.stats.submit_failure_count,
                        "Reconcile pass complete"
                    );
                }
                _ = dispatch_interval.tick() => {
                    self.dispatch_due().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Beat scheduler received shutdown signal");
                    self.state = SchedulerState::Stopped;
                }
            }
        }

        info!("Beat scheduler stopped");
        Ok(())
    }

    /// One reconcile pass: change detection, then a rebuild if anything moved.
    pub async fn reconcile(&mut self) -> Result<()> {
        let signals = self.store.change_signals().await?;
        self.stats.reconcile_count += 1;

        if self.cache.initialized && !self.detect_changes(&signals) {
            // Nothing moved; the snapshot is still current.
            self.last_snapshot_at = Some(Instant::now());
            return Ok(());
        }

        self.rebuild(&signals).await
    }

    /// Evaluate the five detection signals against the cache.
    ///
    /// Returns true if any signal fired. Detection must not rebuild when no
    /// signal fires; the steady-state cost budget depends on it.
    fn detect_changes(&self, signals: &[TaskSignal]) -> bool {
        let enabled: Vec<&TaskSignal> = signals.iter().filter(|s| s.enabled).collect();

        // Signal 1: enabled-set count
        if enabled.len() != self.cache.enabled_count {
            debug!(
                old = self.cache.enabled_count,
                new = enabled.len(),
                "Change detected: enabled task count"
            );
            return true;
        }

        // Signal 2: enabled-set identity (signals arrive sorted by id)
        let ids_match = enabled
            .iter()
            .map(|s| s.id.as_str())
            .eq(self.cache.enabled_ids.iter().map(|s| s.as_str()));
        if !ids_match {
            debug!("Change detected: enabled task identity");
            return true;
        }

        // Signal 3: content hash over the sorted enabled tasks
        if content_hash(&enabled) != self.cache.content_hash {
            debug!("Change detected: task content hash");
            return true;
        }

        // Signal 4: per-task enabled transitions, both directions. This is
        // the signal that catches the enabled 0→1 class even when counts and
        // identity coincidentally match.
        for signal in signals {
            match self.cache.enabled_map.get(&signal.id) {
                Some(cached) if *cached != signal.enabled => {
                    debug!(
                        task_id = %signal.id,
                        from = *cached,
                        to = signal.enabled,
                        "Change detected: enabled transition"
                    );
                    return true;
                }
                None => {
                    debug!(task_id = %signal.id, "Change detected: unknown task");
                    return true;
                }
                _ => {}
            }
        }
        if signals.len() != self.cache.enabled_map.len() {
            debug!("Change detected: task set size");
            return true;
        }

        // Signal 5: forward motion of max(updated_at) over enabled tasks
        let max_updated_at = enabled.iter().map(|s| s.updated_at).max().unwrap_or(0);
        if max_updated_at > self.cache.max_updated_at {
            debug!(
                old = self.cache.max_updated_at,
                new = max_updated_at,
                "Change detected: updated_at moved forward"
            );
            return true;
        }

        false
    }

    /// Rebuild the schedule map and due-time queue from a fresh snapshot.
    ///
    /// Atomic from the dispatcher's point of view: the map, the queue, and
    /// every detection cache slot are replaced before dispatch runs again.
    async fn rebuild(&mut self, signals: &[TaskSignal]) -> Result<()> {
        let now = Utc::now();
        let tasks = self.store.list_enabled().await?;
        self.stats.rebuild_count += 1;

        let mut entries: HashMap<String, ScheduleEntry> = HashMap::with_capacity(tasks.len());
        let mut reset_ids: Vec<String> = Vec::new();

        for task in tasks {
            let compiled = match CompiledSchedule::compile(&task.schedule, self.tz) {
                Ok(compiled) => compiled,
                Err(e) => {
                    // A broken schedule must not take beat down or block the
                    // other tasks; the row stays untouched for the operator.
                    error!(task_id = %task.id, "Skipping task with invalid schedule: {:#}", e);
                    continue;
                }
            };

            let was_known = self.entries.contains_key(&task.id);
            let was_enabled = self.cache.enabled_map.get(&task.id).copied();
            let flipped_on = was_enabled == Some(false);
            let time_gap = task.last_run.map(|last| task.updated_at - last);

            // Re-enable reset rule. New-to-cache entries and fresh 0→1 flips
            // get the hard reset: in-memory run state cleared AND the stale
            // last_run nulled out in the store (through the no-touch path) so
            // a later beat restart cannot resurrect it. Edits that left a
            // moderate gap get the soft reset: eligible now, store untouched.
            //
            // The new/flipped branch only applies once a previous snapshot
            // exists. On the first rebuild after a restart every id is
            // new-to-cache, and resetting there would re-fire the whole
            // table; restarts are governed by the persisted last_run and the
            // gap tiers instead.
            let last_run_at = if self.cache.initialized && (!was_known || flipped_on) {
                if task.last_run.is_some() {
                    reset_ids.push(task.id.clone());
                }
                None
            } else {
                match time_gap {
                    Some(gap) if gap > HARD_RESET_THRESHOLD_SECS => {
                        reset_ids.push(task.id.clone());
                        None
                    }
                    Some(gap) if gap > SOFT_RESET_THRESHOLD_SECS => None,
                    _ => {
                        // Unchanged schedule-wise: keep the in-memory fire
                        // time (sub-second precision) over the persisted one
                        // so a parameter edit cannot cause an extra fire.
                        self.entries
                            .get(&task.id)
                            .map(|e| e.last_run_at)
                            .unwrap_or_else(|| {
                                task.last_run.and_then(|s| DateTime::from_timestamp(s, 0))
                            })
                    }
                }
            };

            entries.insert(
                task.id.clone(),
                ScheduleEntry {
                    compiled,
                    last_run_at,
                    queued_due_at: None,
                    state: EntryState::Pending,
                    task,
                },
            );
        }

        // Persist the hard resets through the no-touch path
        for id in &reset_ids {
            if let Err(e) = self.store.reset_run_state(id).await {
                warn!(task_id = %id, "Failed to persist run-state reset: {:#}", e);
            }
        }

        // Discard the old queue and repopulate from the new map
        self.queue.clear();
        let ids: Vec<String> = entries.keys().cloned().collect();
        self.entries = entries;
        for id in ids {
            self.enqueue_entry(&id, now);
        }

        // Swap every detection cache slot to match the snapshot
        let enabled: Vec<&TaskSignal> = signals.iter().filter(|s| s.enabled).collect();
        self.cache = DetectionCache {
            initialized: true,
            enabled_count: enabled.len(),
            enabled_ids: enabled.iter().map(|s| s.id.clone()).collect(),
            content_hash: content_hash(&enabled),
            enabled_map: signals.iter().map(|s| (s.id.clone(), s.enabled)).collect(),
            max_updated_at: enabled.iter().map(|s| s.updated_at).max().unwrap_or(0),
        };
        self.last_snapshot_at = Some(Instant::now());

        info!(
            entries = self.entries.len(),
            resets = reset_ids.len(),
            "Rebuilt schedule"
        );
        Ok(())
    }

    /// Push an entry's next due slot onto the queue.
    fn enqueue_entry(&mut self, id: &str, now: DateTime<Utc>) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        let due_wall = entry.compiled.next_due(entry.last_run_at, now);
        entry.queued_due_at = Some(due_wall);
        entry.state = EntryState::Pending;

        let delay = (due_wall - now).to_std().unwrap_or(Duration::ZERO);
        let now_inst = Instant::now();
        self.seq += 1;
        self.queue.push(Reverse(QueueSlot {
            // A due time past the representable range parks the slot a year
            // out; the next rebuild re-derives it anyway.
            due_at: now_inst
                .checked_add(delay)
                .unwrap_or_else(|| now_inst + Duration::from_secs(86400 * 365)),
            seq: self.seq,
            task_id: id.to_string(),
            due_wall,
        }));
    }

    /// Dispatch every entry whose due time has passed, in due-time order.
    pub async fn dispatch_due(&mut self) {
        // Refuse to fire on data older than the staleness budget.
        let snapshot_age = match self.last_snapshot_at {
            Some(at) => at.elapsed(),
            None => return,
        };
        let budget = self.max_loop_interval * self.stale_snapshot_intervals;
        if snapshot_age > budget {
            warn!(
                "Store snapshot is {:?} old (budget {:?}); suspending dispatch",
                snapshot_age, budget
            );
            return;
        }

        let now_inst = Instant::now();
        loop {
            // Peek: stop at the first slot that is not due yet.
            match self.queue.peek() {
                Some(Reverse(slot)) if slot.due_at <= now_inst => {}
                _ => break,
            }
            let Reverse(slot) = self.queue.pop().expect("peeked slot present");

            let now = Utc::now();
            let Some(entry) = self.entries.get_mut(&slot.task_id) else {
                // Deleted or disabled since the slot was queued.
                continue;
            };
            if entry.queued_due_at != Some(slot.due_wall) {
                // Stale slot left over from before a re-enqueue.
                continue;
            }
            if entry.state != EntryState::Pending {
                // An entry mid-dispatch has no live slot; this one is stale.
                continue;
            }

            // Re-verify under the schedule evaluator; the queue is a hint,
            // the evaluator is the authority.
            if !entry.compiled.is_due(entry.last_run_at, now) {
                self.enqueue_entry(&slot.task_id, now);
                continue;
            }

            entry.state = EntryState::Due;
            let task = entry.task.clone();
            let options = SubmitOptions {
                queue: PLUGIN_QUEUE.to_string(),
                priority: task.priority,
                time_limit: task.timeout_seconds,
                retries: task.max_retries,
            };

            match self
                .gateway
                .submit(&task.plugin_name, &task.parameters, &options)
                .await
            {
                Ok(submission_id) => {
                    self.stats.dispatch_count += 1;
                    debug!(
                        task_id = %task.id,
                        submission_id = %submission_id,
                        plugin = %task.plugin_name,
                        "Dispatched task"
                    );

                    let entry = self
                        .entries
                        .get_mut(&slot.task_id)
                        .expect("entry checked above");
                    entry.state = EntryState::Submitted;
                    entry.last_run_at = Some(now);

                    let next_wall = entry.compiled.next_due(Some(now), now);
                    if let Err(e) = self
                        .store
                        .touch_last_run(&task.id, now.timestamp(), Some(next_wall.timestamp()))
                        .await
                    {
                        // Advisory columns; the in-memory state is authoritative.
                        warn!(task_id = %task.id, "Failed to persist last_run: {:#}", e);
                    }

                    self.enqueue_entry(&slot.task_id, now);
                }
                Err(e) => {
                    // Do not advance last_run_at: the task stays due and the
                    // submission is re-attempted on the next tick.
                    self.stats.submit_failure_count += 1;
                    warn!(task_id = %task.id, "Submission failed, will retry: {:#}", e);

                    let entry = self
                        .entries
                        .get_mut(&slot.task_id)
                        .expect("entry checked above");
                    entry.state = EntryState::Pending;
                    let retry_wall = now
                        + chrono::Duration::from_std(SUBMIT_RETRY_DELAY)
                            .unwrap_or(chrono::Duration::seconds(1));
                    entry.queued_due_at = Some(retry_wall);
                    self.seq += 1;
                    self.queue.push(Reverse(QueueSlot {
                        due_at: Instant::now() + SUBMIT_RETRY_DELAY,
                        seq: self.seq,
                        task_id: slot.task_id.clone(),
                        due_wall: retry_wall,
                    }));
                }
            }
        }
    }

    /// Number of live schedule entries
    #[allow(dead_code)]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// The in-memory last fire time of an entry, for tests and diagnostics
    #[allow(dead_code)]
    pub fn last_run_at(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(task_id).and_then(|e| e.last_run_at)
    }
}

/// Signal 3: a stable BLAKE3 hash over the sorted enabled task fingerprints
fn content_hash(enabled_sorted: &[&TaskSignal]) -> String {
    let mut joined = String::new();
    for signal in enabled_sorted {
        joined.push_str(&signal.fingerprint);
        joined.push('\n');
    }
    calculate_string_checksum(&joined)
}
