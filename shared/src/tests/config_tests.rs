//! Tests for configuration loading and validation

use crate::config::{BeatConfig, ConsumerConfig, FilterConfig, WorkerConfig};
use std::io::Write;
use tempfile::TempDir;

fn write_config(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

#[test]
fn test_beat_defaults() {
    let config = BeatConfig::load(None).unwrap();
    assert_eq!(config.max_loop_interval_seconds, 5);
    assert_eq!(config.timezone, "UTC");
    assert_eq!(config.stale_snapshot_intervals, 3);
    assert!(config.timezone().is_ok());
}

#[test]
fn test_beat_file_values() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "beat.toml",
        r#"
database_url = "sqlite:///var/lib/scheduler/tasks.db"
broker_url = "/var/lib/scheduler/broker.db"
max_loop_interval_seconds = 2
timezone = "Europe/Warsaw"
"#,
    );

    let config = BeatConfig::load(Some(&path)).unwrap();
    assert_eq!(config.database_url, "sqlite:///var/lib/scheduler/tasks.db");
    assert_eq!(config.max_loop_interval_seconds, 2);
    assert_eq!(config.timezone().unwrap(), chrono_tz::Europe::Warsaw);
}

#[test]
fn test_beat_rejects_bad_values() {
    let dir = TempDir::new().unwrap();

    let path = write_config(&dir, "zero.toml", "max_loop_interval_seconds = 0\n");
    assert!(BeatConfig::load(Some(&path)).is_err());

    let path = write_config(&dir, "tz.toml", "timezone = \"Mars/Olympus\"\n");
    assert!(BeatConfig::load(Some(&path)).is_err());
}

#[test]
fn test_worker_defaults() {
    let config = WorkerConfig::load(None).unwrap();
    assert_eq!(config.queues, vec!["plugin_tasks".to_string()]);
    assert_eq!(config.concurrency, 4);
    assert!(config.cdc.is_none());
    assert!(config.consumers.is_empty());
    assert_eq!(config.plugin_envs_dir(), config.plugins_dir);
}

#[test]
fn test_worker_with_cdc_and_consumers() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "worker.toml",
        r#"
plugins_dir = "/opt/plugins"
concurrency = 8

[cdc]
host = "db-binlog.internal"
port = 11111
destination = "scheduler"
batch_size = 64

[[consumers]]
name = "user_sync"
plugin_name = "sync_users"
priority = 8

[[consumers.filters]]
database = "app"
table = "users"
event_types = ["INSERT", "UPDATE"]
"#,
    );

    let config = WorkerConfig::load(Some(&path)).unwrap();
    assert_eq!(config.concurrency, 8);

    let cdc = config.cdc.as_ref().unwrap();
    assert_eq!(cdc.host, "db-binlog.internal");
    assert_eq!(cdc.batch_size, 64);

    assert_eq!(config.consumers.len(), 1);
    let consumer = &config.consumers[0];
    assert_eq!(consumer.name, "user_sync");
    assert!(consumer.enabled);
    assert!(consumer.forward_event);
    assert_eq!(consumer.filters[0].event_types, vec!["INSERT", "UPDATE"]);
}

#[test]
fn test_consumer_validation() {
    let consumer = ConsumerConfig {
        name: "c1".to_string(),
        plugin_name: "p1".to_string(),
        parameters: serde_json::Map::new(),
        priority: 5,
        forward_event: true,
        enabled: true,
        filters: vec![],
    };
    // No filters: the consumer could never match anything
    assert!(consumer.validate().is_err());

    let consumer = ConsumerConfig {
        filters: vec![FilterConfig {
            database: "app".to_string(),
            table: "users".to_string(),
            event_types: vec!["TRUNCATE".to_string()],
        }],
        ..consumer
    };
    assert!(consumer.validate().is_err());
}
