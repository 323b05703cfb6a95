//! Beat scheduling process
//!
//! Beat is the singleton scheduler of the deployment: it reconciles the
//! in-memory schedule with the persisted task table and submits due plugin
//! invocations onto the broker queue. This binary also carries the task
//! administration commands (add/enable/disable/remove/list) that mutate the
//! store; the running scheduler picks their effects up on its next reconcile.
// Exactly one `beat run` may be live per deployment; singletonship is
// enforced operationally, not by this process.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use shared::broker::BrokerGateway;
use shared::config::BeatConfig;
use shared::defaults::{default_task_max_retries, default_task_priority};
use shared::schedule::{CronConfig, IntervalConfig, ScheduleConfig};
use shared::task::ScheduledTask;
use shared::utils::current_timestamp;
use std::path::PathBuf;
use tracing::{error, info};

mod scheduler;
mod store;
#[cfg(test)]
mod tests;

use scheduler::BeatScheduler;
use store::TaskStore;

/// Command-line interface for the beat process
#[derive(Parser, Debug)]
#[command(name = "beat")]
#[command(about = "Scheduling loop and task administration for the plugin task system", long_about = None)]
struct CliArgs {
    /// Path to the beat configuration file (beat.toml); environment
    /// variables override file values
    #[arg(long = "config", value_name = "FILE", global = true)]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the scheduling loop
    Run,
    /// Create or replace a task definition
    AddTask(AddTaskArgs),
    /// Enable a task
    EnableTask { id: String },
    /// Disable a task
    DisableTask { id: String },
    /// Delete a task outright
    RemoveTask { id: String },
    /// List all task definitions
    ListTasks,
    /// Check store and broker reachability
    Health,
}

#[derive(Args, Debug)]
struct AddTaskArgs {
    /// Task identifier; generated when omitted
    #[arg(long)]
    id: Option<String>,

    /// Human-readable task name
    #[arg(long)]
    name: String,

    /// Free-form description
    #[arg(long, default_value = "")]
    description: String,

    /// Descriptive tag; may be repeated
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Plugin the task invokes
    #[arg(long)]
    plugin: String,

    /// Plugin parameter as key=value; values parse as JSON with a plain
    /// string fallback; may be repeated
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// Schedule kind
    #[arg(long = "schedule-type", value_enum)]
    schedule_type: ScheduleKindArg,

    /// Interval in seconds (interval schedules)
    #[arg(long = "interval-seconds")]
    interval_seconds: Option<u64>,

    /// Cron minute field (cron schedules)
    #[arg(long, default_value = "*")]
    minute: String,
    /// Cron hour field
    #[arg(long, default_value = "*")]
    hour: String,
    /// Cron day-of-month field
    #[arg(long = "day-of-month", default_value = "*")]
    day_of_month: String,
    /// Cron month field
    #[arg(long = "month-of-year", default_value = "*")]
    month_of_year: String,
    /// Cron day-of-week field
    #[arg(long = "day-of-week", default_value = "*")]
    day_of_week: String,

    /// Broker priority hint, 1..10 with 10 highest
    #[arg(long, default_value_t = default_task_priority())]
    priority: u8,

    /// Broker retry hint
    #[arg(long = "max-retries", default_value_t = default_task_max_retries())]
    max_retries: u32,

    /// Execution time limit in seconds
    #[arg(long = "timeout-seconds")]
    timeout_seconds: Option<u64>,

    /// Create the task disabled
    #[arg(long)]
    disabled: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ScheduleKindArg {
    Interval,
    Cron,
}

#[tokio::main]
async fn main() {
    let cli_args = match CliArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // Usage problems (including --help/--version) exit with 1 unless
            // clap classifies them as a successful display.
            let is_display = matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            );
            let _ = e.print();
            std::process::exit(if is_display { 0 } else { 1 });
        }
    };

    // The long-running loop logs JSON to a daily rolling file; one-shot admin
    // commands log human-readable lines to stderr.
    let _guard = match cli_args.command {
        Command::Run => init_daemon_logging(),
        _ => {
            init_cli_logging();
            None
        }
    };

    let result = dispatch(cli_args).await;
    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(2);
    }
}

/// Route a parsed invocation to its implementation
async fn dispatch(cli_args: CliArgs) -> Result<()> {
    let config = BeatConfig::load(cli_args.config_file.as_deref())?;

    match cli_args.command {
        Command::Run => run_scheduler(config).await,
        Command::AddTask(args) => add_task(config, args).await,
        Command::EnableTask { id } => set_enabled(config, &id, true).await,
        Command::DisableTask { id } => set_enabled(config, &id, false).await,
        Command::RemoveTask { id } => remove_task(config, &id).await,
        Command::ListTasks => list_tasks(config).await,
        Command::Health => health(config).await,
    }
}

/// Start the scheduling loop and run until ctrl-c
async fn run_scheduler(config: BeatConfig) -> Result<()> {
    info!("Starting beat process");
    info!(
        database_url = %config.database_url,
        broker_url = %config.broker_url,
        max_loop_interval = config.max_loop_interval_seconds,
        timezone = %config.timezone,
        "Beat configuration loaded"
    );
    if let Some(result_backend) = &config.result_backend_url {
        if result_backend != &config.broker_url {
            tracing::warn!(
                "A separate result backend is not supported; results are stored on the broker queue"
            );
        }
    }

    let mut store = TaskStore::new(&config.database_url, config.database_busy_timeout_seconds)?;
    store.initialize().await?;

    let mut gateway = BrokerGateway::new(&config.broker_url, config.database_busy_timeout_seconds)?;
    gateway.initialize().await?;

    let mut scheduler = BeatScheduler::new(store, gateway, &config)?;
    scheduler.start().await?;

    // Create shutdown channel and wire it to ctrl-c
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received ctrl-c, shutting down");
            let _ = shutdown_tx.send(());
        }
    });

    scheduler.run(shutdown_rx).await?;
    info!("Beat shutdown complete");
    Ok(())
}

/// Create or replace a task from CLI arguments
async fn add_task(config: BeatConfig, args: AddTaskArgs) -> Result<()> {
    let schedule = match args.schedule_type {
        ScheduleKindArg::Interval => {
            let interval_seconds = args
                .interval_seconds
                .context("--interval-seconds is required for interval schedules")?;
            ScheduleConfig::Interval(IntervalConfig { interval_seconds })
        }
        ScheduleKindArg::Cron => ScheduleConfig::Cron(CronConfig {
            minute: args.minute,
            hour: args.hour,
            day_of_month: args.day_of_month,
            month_of_year: args.month_of_year,
            day_of_week: args.day_of_week,
        }),
    };

    let mut parameters = serde_json::Map::new();
    for raw in &args.params {
        let (key, value) = parse_key_value(raw)?;
        parameters.insert(key, value);
    }

    let id = args
        .id
        .unwrap_or_else(|| format!("task-{}", &shared::utils::generate_submission_id()[..12]));
    let now = current_timestamp() as i64;

    let task = ScheduledTask {
        id: id.clone(),
        name: args.name,
        description: args.description,
        tags: args.tags,
        plugin_name: args.plugin,
        parameters,
        schedule,
        enabled: !args.disabled,
        priority: args.priority,
        max_retries: args.max_retries,
        timeout_seconds: args.timeout_seconds,
        last_run: None,
        next_run: None,
        created_at: now,
        updated_at: now,
    };

    let mut store = TaskStore::new(&config.database_url, config.database_busy_timeout_seconds)?;
    store.initialize().await?;
    store.upsert(&task).await?;

    println!("{}", id);
    Ok(())
}

/// Parse a `key=value` parameter, treating the value as JSON when possible
fn parse_key_value(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("Parameter '{}' is not in key=value form", raw))?;
    if key.is_empty() {
        anyhow::bail!("Parameter '{}' has an empty key", raw);
    }
    let parsed = serde_json::from_str::<Value>(value)
        .unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), parsed))
}

async fn set_enabled(config: BeatConfig, id: &str, enabled: bool) -> Result<()> {
    let mut store = TaskStore::new(&config.database_url, config.database_busy_timeout_seconds)?;
    store.initialize().await?;

    let task = store
        .get(id)
        .await?
        .with_context(|| format!("No task with id '{}'", id))?;
    store.set_enabled(id, enabled).await?;
    println!(
        "{} {} (plugin {})",
        if enabled { "enabled" } else { "disabled" },
        id,
        task.plugin_name
    );
    Ok(())
}

async fn remove_task(config: BeatConfig, id: &str) -> Result<()> {
    let mut store = TaskStore::new(&config.database_url, config.database_busy_timeout_seconds)?;
    store.initialize().await?;

    if !store.delete(id).await? {
        anyhow::bail!("No task with id '{}'", id);
    }
    println!("removed {}", id);
    Ok(())
}

async fn list_tasks(config: BeatConfig) -> Result<()> {
    let mut store = TaskStore::new(&config.database_url, config.database_busy_timeout_seconds)?;
    store.initialize().await?;

    let tasks = store.list_all().await?;
    if tasks.is_empty() {
        println!("no tasks defined");
        return Ok(());
    }

    println!(
        "{:<24} {:<10} {:<20} {:<10} {:>8}",
        "ID", "ENABLED", "PLUGIN", "SCHEDULE", "PRIORITY"
    );
    for task in tasks {
        println!(
            "{:<24} {:<10} {:<20} {:<10} {:>8}",
            task.id,
            task.enabled,
            task.plugin_name,
            task.schedule_type().as_str(),
            task.priority
        );
    }
    Ok(())
}

/// Verify the store and broker are reachable; exit non-zero otherwise
async fn health(config: BeatConfig) -> Result<()> {
    let mut store = TaskStore::new(&config.database_url, config.database_busy_timeout_seconds)?;
    store.initialize().await?;
    let task_count = store.count().await?;

    let mut gateway = BrokerGateway::new(&config.broker_url, config.database_busy_timeout_seconds)?;
    gateway.initialize().await?;
    let stats = gateway.stats().await?;

    println!("store: ok ({} tasks)", task_count);
    println!(
        "broker: ok (pending={} active={} success={} error={} revoked={})",
        stats.pending, stats.active, stats.success, stats.error, stats.revoked
    );
    Ok(())
}

/// JSON logs to a daily rolling file for the long-running loop
fn init_daemon_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let file_appender = tracing_appender::rolling::daily("./logs", "beat.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Default directives are only used if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("beat=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    Some(guard)
}

/// Compact stderr logging for one-shot admin commands
fn init_cli_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("beat=warn,shared=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .compact()
        .with_writer(std::io::stderr)
        .init();
}
