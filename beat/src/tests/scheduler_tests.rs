//! Tests for the beat scheduling core
//!
//! These tests drive `reconcile()` and `dispatch_due()` directly instead of
//! running the loop, so every assertion is deterministic. A second store and
//! gateway handle on the same database files plays the role of the external
//! admin CLI and of the worker inspecting the queue.

use crate::scheduler::{BeatScheduler, SchedulerState};
use crate::store::TaskStore;
use serde_json::json;
use shared::broker::{BrokerGateway, SubmissionStatus, PLUGIN_QUEUE};
use shared::config::BeatConfig;
use shared::schedule::{IntervalConfig, ScheduleConfig};
use shared::task::ScheduledTask;
use tempfile::TempDir;

struct Fixture {
    scheduler: BeatScheduler,
    /// Admin-side handle to the task store
    admin_store: TaskStore,
    /// Worker-side handle to the broker queue
    broker: BrokerGateway,
    _dir: TempDir,
}

async fn fixture() -> Fixture {
    fixture_with_config(|_| {}).await
}

async fn fixture_with_config(tweak: impl FnOnce(&mut BeatConfig)) -> Fixture {
    let dir = TempDir::new().unwrap();
    let tasks_db = dir.path().join("tasks.db");
    let broker_db = dir.path().join("broker.db");

    let mut config = BeatConfig::load(None).unwrap();
    config.database_url = tasks_db.to_str().unwrap().to_string();
    config.broker_url = broker_db.to_str().unwrap().to_string();
    tweak(&mut config);

    let mut store = TaskStore::new(&config.database_url, 5).unwrap();
    store.initialize().await.unwrap();
    let mut gateway = BrokerGateway::new(&config.broker_url, 5).unwrap();
    gateway.initialize().await.unwrap();

    let mut admin_store = TaskStore::new(&config.database_url, 5).unwrap();
    admin_store.initialize().await.unwrap();
    let mut broker = BrokerGateway::new(&config.broker_url, 5).unwrap();
    broker.initialize().await.unwrap();

    Fixture {
        scheduler: BeatScheduler::new(store, gateway, &config).unwrap(),
        admin_store,
        broker,
        _dir: dir,
    }
}

fn interval_task(id: &str, seconds: u64) -> ScheduledTask {
    let mut parameters = serde_json::Map::new();
    parameters.insert("x".to_string(), json!(1));

    ScheduledTask {
        id: id.to_string(),
        name: format!("Task {}", id),
        description: String::new(),
        tags: vec![],
        plugin_name: "echo_plugin".to_string(),
        parameters,
        schedule: ScheduleConfig::Interval(IntervalConfig {
            interval_seconds: seconds,
        }),
        enabled: true,
        priority: 5,
        max_retries: 1,
        timeout_seconds: Some(30),
        last_run: None,
        next_run: None,
        created_at: 0,
        updated_at: 0,
    }
}

#[tokio::test]
async fn test_scheduler_start_transitions_state() {
    let mut fx = fixture().await;
    assert_eq!(fx.scheduler.state, SchedulerState::Stopped);

    fx.scheduler.start().await.unwrap();
    assert_eq!(fx.scheduler.state, SchedulerState::Running);
}

#[tokio::test]
async fn test_new_task_fires_immediately() {
    let mut fx = fixture().await;
    fx.admin_store.upsert(&interval_task("t1", 3600)).await.unwrap();

    fx.scheduler.start().await.unwrap();
    assert_eq!(fx.scheduler.entry_count(), 1);

    fx.scheduler.dispatch_due().await;
    assert_eq!(fx.scheduler.stats.dispatch_count, 1);

    let queues = vec![PLUGIN_QUEUE.to_string()];
    let submission = fx.broker.claim_next(&queues).await.unwrap().unwrap();
    assert_eq!(submission.plugin_name, "echo_plugin");
    assert_eq!(submission.kwargs.get("x"), Some(&json!(1)));
    assert_eq!(submission.time_limit, Some(30));
    assert_eq!(submission.retries, 1);

    // Fired once, aligned an hour out: no second submission this tick
    fx.scheduler.dispatch_due().await;
    assert_eq!(fx.scheduler.stats.dispatch_count, 1);
    assert!(fx.broker.claim_next(&queues).await.unwrap().is_none());

    // last_run persisted through the no-touch path
    let task = fx.admin_store.get("t1").await.unwrap().unwrap();
    assert!(task.last_run.is_some());
    assert!(task.next_run.is_some());
}

#[tokio::test]
async fn test_no_rebuild_without_mutations() {
    let mut fx = fixture().await;
    fx.admin_store.upsert(&interval_task("t1", 3600)).await.unwrap();

    fx.scheduler.start().await.unwrap();
    assert_eq!(fx.scheduler.stats.rebuild_count, 1);

    for _ in 0..5 {
        fx.scheduler.reconcile().await.unwrap();
    }
    assert_eq!(fx.scheduler.stats.reconcile_count, 6);
    // Zero additional rebuilds while nothing changed
    assert_eq!(fx.scheduler.stats.rebuild_count, 1);

    // Dispatching (which persists last_run through the no-touch path) must
    // not register as a mutation either
    fx.scheduler.dispatch_due().await;
    fx.scheduler.reconcile().await.unwrap();
    assert_eq!(fx.scheduler.stats.rebuild_count, 1);
}

#[tokio::test]
async fn test_edit_triggers_rebuild_and_preserves_last_run() {
    let mut fx = fixture().await;
    fx.admin_store.upsert(&interval_task("t1", 3600)).await.unwrap();

    fx.scheduler.start().await.unwrap();
    fx.scheduler.dispatch_due().await;
    assert_eq!(fx.scheduler.stats.dispatch_count, 1);
    let fired_at = fx.scheduler.last_run_at("t1").unwrap();

    // Parameter edit from the admin side
    let mut edited = interval_task("t1", 3600);
    edited.parameters.insert("x".to_string(), json!(2));
    fx.admin_store.upsert(&edited).await.unwrap();

    fx.scheduler.reconcile().await.unwrap();
    assert_eq!(fx.scheduler.stats.rebuild_count, 2);

    // The edit alone must not cause an extra fire: the in-memory fire time
    // survives the rebuild and the schedule is unchanged.
    assert_eq!(fx.scheduler.last_run_at("t1"), Some(fired_at));
    fx.scheduler.dispatch_due().await;
    assert_eq!(fx.scheduler.stats.dispatch_count, 1);
}

#[tokio::test]
async fn test_edit_propagates_to_next_submission() {
    let mut fx = fixture().await;
    fx.admin_store.upsert(&interval_task("t1", 1)).await.unwrap();

    fx.scheduler.start().await.unwrap();
    fx.scheduler.dispatch_due().await;
    assert_eq!(fx.scheduler.stats.dispatch_count, 1);

    let mut edited = interval_task("t1", 1);
    edited.parameters.insert("x".to_string(), json!(2));
    fx.admin_store.upsert(&edited).await.unwrap();
    fx.scheduler.reconcile().await.unwrap();

    // Past the one-second interval, the next fire carries the new parameters
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    fx.scheduler.dispatch_due().await;
    assert_eq!(fx.scheduler.stats.dispatch_count, 2);

    let queues = vec![PLUGIN_QUEUE.to_string()];
    let first = fx.broker.claim_next(&queues).await.unwrap().unwrap();
    let second = fx.broker.claim_next(&queues).await.unwrap().unwrap();
    assert_eq!(first.kwargs.get("x"), Some(&json!(1)));
    assert_eq!(second.kwargs.get("x"), Some(&json!(2)));
}

#[tokio::test]
async fn test_reenable_resets_run_state_and_fires() {
    let mut fx = fixture().await;
    fx.admin_store.upsert(&interval_task("t1", 3600)).await.unwrap();

    fx.scheduler.start().await.unwrap();
    fx.scheduler.dispatch_due().await;
    assert_eq!(fx.scheduler.stats.dispatch_count, 1);
    assert!(fx.admin_store.get("t1").await.unwrap().unwrap().last_run.is_some());

    // Disable: the entry disappears on the next reconcile
    fx.admin_store.set_enabled("t1", false).await.unwrap();
    fx.scheduler.reconcile().await.unwrap();
    assert_eq!(fx.scheduler.entry_count(), 0);
    fx.scheduler.dispatch_due().await;
    assert_eq!(fx.scheduler.stats.dispatch_count, 1);

    // Re-enable: the 0→1 flip hard-resets the run state through the
    // no-touch path and the task fires again well before its hour is up.
    fx.admin_store.set_enabled("t1", true).await.unwrap();
    fx.scheduler.reconcile().await.unwrap();
    assert_eq!(fx.scheduler.entry_count(), 1);
    assert!(fx.scheduler.last_run_at("t1").is_none());

    let task = fx.admin_store.get("t1").await.unwrap().unwrap();
    assert!(task.last_run.is_none(), "hard reset must null out last_run");

    fx.scheduler.dispatch_due().await;
    assert_eq!(fx.scheduler.stats.dispatch_count, 2);
}

#[tokio::test]
async fn test_delete_while_queued() {
    let mut fx = fixture().await;
    fx.admin_store.upsert(&interval_task("t1", 3600)).await.unwrap();

    fx.scheduler.start().await.unwrap();
    fx.scheduler.dispatch_due().await;
    assert_eq!(fx.scheduler.stats.dispatch_count, 1);

    // Deleted while its next slot sits in the queue
    fx.admin_store.delete("t1").await.unwrap();
    fx.scheduler.reconcile().await.unwrap();
    assert_eq!(fx.scheduler.entry_count(), 0);

    fx.scheduler.dispatch_due().await;
    assert_eq!(fx.scheduler.stats.dispatch_count, 1);
}

#[tokio::test]
async fn test_insert_detected_between_ticks() {
    let mut fx = fixture().await;
    fx.scheduler.start().await.unwrap();
    assert_eq!(fx.scheduler.entry_count(), 0);

    fx.admin_store.upsert(&interval_task("t1", 3600)).await.unwrap();
    fx.scheduler.reconcile().await.unwrap();
    assert_eq!(fx.scheduler.entry_count(), 1);
    assert_eq!(fx.scheduler.stats.rebuild_count, 2);
}

#[tokio::test]
async fn test_stale_snapshot_suspends_dispatch() {
    let mut fx = fixture_with_config(|config| {
        config.max_loop_interval_seconds = 1;
        config.stale_snapshot_intervals = 1;
    })
    .await;
    fx.admin_store.upsert(&interval_task("t1", 1)).await.unwrap();

    fx.scheduler.start().await.unwrap();
    fx.scheduler.dispatch_due().await;
    assert_eq!(fx.scheduler.stats.dispatch_count, 1);

    // Let the snapshot age past the one-interval budget: even though the
    // task is due again, dispatch must refuse to act on stale data.
    tokio::time::sleep(std::time::Duration::from_millis(1300)).await;
    fx.scheduler.dispatch_due().await;
    assert_eq!(fx.scheduler.stats.dispatch_count, 1);

    // A successful reconcile refreshes the snapshot and dispatch resumes
    fx.scheduler.reconcile().await.unwrap();
    fx.scheduler.dispatch_due().await;
    assert_eq!(fx.scheduler.stats.dispatch_count, 2);
}

#[tokio::test]
async fn test_restart_does_not_refire_fresh_tasks() {
    let dir = TempDir::new().unwrap();
    let tasks_db = dir.path().join("tasks.db");
    let broker_db = dir.path().join("broker.db");

    let mut config = BeatConfig::load(None).unwrap();
    config.database_url = tasks_db.to_str().unwrap().to_string();
    config.broker_url = broker_db.to_str().unwrap().to_string();

    let mut admin_store = TaskStore::new(&config.database_url, 5).unwrap();
    admin_store.initialize().await.unwrap();

    // A task that fired moments before the previous beat went down
    admin_store.upsert(&interval_task("fresh", 3600)).await.unwrap();
    let now = shared::utils::current_timestamp() as i64;
    admin_store.touch_last_run("fresh", now, Some(now + 3600)).await.unwrap();

    // A task whose enable happened while beat was down: updated_at is far
    // ahead of its stale last_run
    admin_store.upsert(&interval_task("stale", 3600)).await.unwrap();
    admin_store.touch_last_run("stale", now - 7200, None).await.unwrap();
    admin_store.set_enabled("stale", true).await.unwrap();

    // "Restart": a brand-new scheduler over the same databases
    let mut store = TaskStore::new(&config.database_url, 5).unwrap();
    store.initialize().await.unwrap();
    let mut gateway = BrokerGateway::new(&config.broker_url, 5).unwrap();
    gateway.initialize().await.unwrap();
    let mut scheduler = BeatScheduler::new(store, gateway, &config).unwrap();
    scheduler.start().await.unwrap();
    scheduler.dispatch_due().await;

    // Only the stale task fires; the fresh one keeps its persisted last_run
    assert_eq!(scheduler.stats.dispatch_count, 1);
    assert!(scheduler.last_run_at("stale").is_some());
    assert_eq!(
        scheduler.last_run_at("fresh").map(|t| t.timestamp()),
        Some(now)
    );
}

#[tokio::test]
async fn test_last_run_monotonic_per_task() {
    let mut fx = fixture().await;
    fx.admin_store.upsert(&interval_task("t1", 1)).await.unwrap();

    fx.scheduler.start().await.unwrap();
    let mut previous: Option<i64> = None;
    for _ in 0..3 {
        fx.scheduler.dispatch_due().await;
        let task = fx.admin_store.get("t1").await.unwrap().unwrap();
        if let (Some(prev), Some(current)) = (previous, task.last_run) {
            assert!(current >= prev, "last_run must never regress");
        }
        previous = task.last_run;
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    }
    assert_eq!(fx.scheduler.stats.dispatch_count, 3);
}

#[tokio::test]
async fn test_submissions_resolve_via_queue() {
    let mut fx = fixture().await;
    fx.admin_store.upsert(&interval_task("t1", 3600)).await.unwrap();

    fx.scheduler.start().await.unwrap();
    fx.scheduler.dispatch_due().await;

    let queues = vec![PLUGIN_QUEUE.to_string()];
    let submission = fx.broker.claim_next(&queues).await.unwrap().unwrap();
    assert_eq!(submission.status, SubmissionStatus::Active);

    fx.broker.mark_success(&submission.id, &json!({"ok": true})).await.unwrap();
    let done = fx.broker.status(&submission.id).await.unwrap().unwrap();
    assert_eq!(done.status, SubmissionStatus::Success);
}
