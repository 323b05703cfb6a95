//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the
//! configuration structures. These functions are used by serde when
//! deserializing configuration files that don't specify certain optional
//! fields.

// Beat configuration defaults

/// Default reconcile interval for the beat loop (5 seconds)
pub fn default_max_loop_interval() -> u64 {
    5
}

/// Default timezone for cron schedule evaluation
pub fn default_timezone() -> String {
    "UTC".to_string()
}

/// Default task store database URL
pub fn default_database_url() -> String {
    "./data/scheduler.db".to_string()
}

/// Default broker queue database URL
pub fn default_broker_url() -> String {
    "./data/broker.db".to_string()
}

/// Default number of reconcile intervals a store snapshot may age before
/// dispatch is suspended (3 intervals)
pub fn default_stale_snapshot_intervals() -> u32 {
    3
}

// Worker configuration defaults

/// Default plugins root directory
pub fn default_plugins_dir() -> String {
    "./plugins".to_string()
}

/// Default queues a worker consumes from
pub fn default_queues() -> Vec<String> {
    vec![crate::broker::PLUGIN_QUEUE.to_string()]
}

/// Default number of concurrent plugin executions per worker
pub fn default_worker_concurrency() -> usize {
    4
}

/// Default poll interval when the queue is empty (500 ms)
pub fn default_claim_poll_interval_millis() -> u64 {
    500
}

/// Default wait time for in-flight executions during shutdown (30 seconds)
pub fn default_graceful_shutdown_timeout() -> u64 {
    30
}

/// Default cleanup interval for finished queue rows (1 hour)
pub fn default_queue_cleanup_interval() -> u64 {
    3600
}

// CDC defaults

/// Default binlog stream port
pub fn default_cdc_port() -> u16 {
    11111
}

/// Default binlog subscription destination
pub fn default_cdc_destination() -> String {
    "scheduler".to_string()
}

/// Default binlog event batch size
pub fn default_cdc_batch_size() -> u32 {
    32
}

// Task defaults

/// Default task priority (middle of the 1..10 range)
pub fn default_task_priority() -> u8 {
    5
}

/// Default retry count passed to the broker
pub fn default_task_max_retries() -> u32 {
    3
}

/// Tasks are enabled unless stated otherwise
pub fn default_enabled() -> bool {
    true
}

// Shared infrastructure defaults

/// Default SQLite busy timeout (5 seconds)
pub fn default_database_busy_timeout() -> u64 {
    5
}

/// Default consumer priority for CDC-triggered submissions
pub fn default_consumer_priority() -> u8 {
    5
}
