//! Worker process
//!
//! Workers claim plugin submissions from the broker queue, resolve the
//! referenced plugin through the hot-reloading registry, and execute it as an
//! isolated subprocess. The same binary carries the operational commands for
//! the plugin and broker side: plugin listing/testing/reload, ad-hoc
//! triggering, and submission inspection/cancellation. When a CDC endpoint is
//! configured, `worker run` also streams binlog row events into the
//! registered consumers.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use shared::broker::{BrokerGateway, SubmitOptions, PLUGIN_QUEUE};
use shared::config::WorkerConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

mod cdc;
mod invoker;
mod loader;
mod pool;
mod registry;
#[cfg(test)]
mod tests;

use cdc::client::CdcClient;
use cdc::consumers::ConsumerManager;
use invoker::PluginInvoker;
use loader::HotLoader;
use pool::WorkerPool;
use registry::PluginRegistry;

/// Command-line interface for the worker process
#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Worker pool and plugin administration for the plugin task system", long_about = None)]
struct CliArgs {
    /// Path to the worker configuration file (worker.toml); environment
    /// variables override file values
    #[arg(long = "config", value_name = "FILE", global = true)]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the worker pool (and CDC consumers when configured)
    Run {
        /// Queues to consume, comma separated
        #[arg(long, value_delimiter = ',')]
        queues: Option<Vec<String>>,
        /// Maximum concurrent plugin executions
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// List registered plugins
    ListPlugins,
    /// Execute a plugin locally and print its result
    TestPlugin {
        name: String,
        /// Plugin parameter as key=value; may be repeated
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Re-read a plugin's manifest and file hashes from disk
    Reload { name: String },
    /// Submit a plugin invocation onto the broker
    Trigger {
        name: String,
        /// Plugin parameter as key=value; may be repeated
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
        /// Submission priority, 1..10
        #[arg(long, default_value_t = shared::defaults::default_task_priority())]
        priority: u8,
    },
    /// List currently executing submissions
    ListActive,
    /// Show a submission's status and result
    Status { id: String },
    /// Revoke a submission
    Cancel {
        id: String,
        /// Kill the plugin process if it is already executing
        #[arg(long)]
        terminate: bool,
    },
    /// Revoke every pending or active submission for a plugin
    CancelPlugin {
        name: String,
        /// Kill executing plugin processes
        #[arg(long)]
        terminate: bool,
    },
    /// Check broker and plugins-directory reachability
    Health,
}

#[tokio::main]
async fn main() {
    let cli_args = match CliArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let is_display = matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            );
            let _ = e.print();
            std::process::exit(if is_display { 0 } else { 1 });
        }
    };

    let _guard = match cli_args.command {
        Command::Run { .. } => init_daemon_logging(),
        _ => {
            init_cli_logging();
            None
        }
    };

    if let Err(e) = dispatch(cli_args).await {
        error!("Command failed: {:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(2);
    }
}

async fn dispatch(cli_args: CliArgs) -> Result<()> {
    let config = WorkerConfig::load(cli_args.config_file.as_deref())?;

    match cli_args.command {
        Command::Run {
            queues,
            concurrency,
        } => run_worker(config, queues, concurrency).await,
        Command::ListPlugins => list_plugins(config),
        Command::TestPlugin { name, params } => test_plugin(config, &name, &params).await,
        Command::Reload { name } => reload_plugin(config, &name),
        Command::Trigger {
            name,
            params,
            priority,
        } => trigger_plugin(config, &name, &params, priority).await,
        Command::ListActive => list_active(config).await,
        Command::Status { id } => submission_status(config, &id).await,
        Command::Cancel { id, terminate } => cancel(config, &id, terminate).await,
        Command::CancelPlugin { name, terminate } => {
            cancel_plugin(config, &name, terminate).await
        }
        Command::Health => health(config).await,
    }
}

/// Start the worker pool, hot loader, and (when configured) the CDC pipeline
async fn run_worker(
    mut config: WorkerConfig,
    queues: Option<Vec<String>>,
    concurrency: Option<usize>,
) -> Result<()> {
    if let Some(queues) = queues {
        config.queues = queues;
    }
    if let Some(concurrency) = concurrency {
        config.concurrency = concurrency;
    }
    config.validate()?;

    info!("Starting worker process");
    info!(
        broker_url = %config.broker_url,
        plugins_dir = %config.plugins_dir,
        queues = ?config.queues,
        concurrency = config.concurrency,
        cdc_enabled = config.cdc.is_some(),
        "Worker configuration loaded"
    );
    if let Some(result_backend) = &config.result_backend_url {
        if result_backend != &config.broker_url {
            warn!("A separate result backend is not supported; results are stored on the broker queue");
        }
    }

    let mut gateway = BrokerGateway::new(&config.broker_url, config.database_busy_timeout_seconds)?;
    gateway.initialize().await?;
    let gateway = Arc::new(Mutex::new(gateway));

    let mut registry = PluginRegistry::new(&config.plugins_dir, config.plugin_envs_dir())?;
    registry.scan()?;
    let registry = Arc::new(RwLock::new(registry));

    let (loader, mut loader_events, raw_rx) =
        HotLoader::new(std::path::Path::new(&config.plugins_dir), Arc::clone(&registry));
    loader.spawn(raw_rx)?;

    let invoker = Arc::new(PluginInvoker::new(Arc::clone(&registry), Arc::clone(&loader)));

    // Create shutdown channel and wire it to ctrl-c
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received ctrl-c, shutting down");
                let _ = shutdown_tx.send(());
            }
        });
    }

    // Surface loader events in the worker log without ever blocking the loader
    tokio::spawn(async move {
        while let Some(event) = loader_events.recv().await {
            match event {
                loader::LoaderEvent::Loaded { plugin } => {
                    info!(plugin = %plugin, "Plugin hot-reloaded");
                }
                loader::LoaderEvent::Error { plugin, message } => {
                    warn!(plugin = %plugin, "Plugin reload error: {}", message);
                }
            }
        }
    });

    // CDC pipeline: client task feeding the consumer manager
    let mut cdc_handle = None;
    if let Some(cdc_config) = config.cdc.clone() {
        let manager = ConsumerManager::from_config(&config.consumers, Arc::clone(&gateway));
        let (events_tx, events_rx) = tokio::sync::mpsc::channel(cdc_config.batch_size as usize * 4);
        let client = CdcClient::new(cdc_config);

        let client_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = client.run(events_tx, client_shutdown).await {
                error!("CDC client terminated: {:#}", e);
            }
        });

        let manager_shutdown = shutdown_tx.subscribe();
        cdc_handle = Some(tokio::spawn(async move {
            if let Err(e) = manager.run(events_rx, manager_shutdown).await {
                error!("Consumer manager terminated: {:#}", e);
            }
        }));
    }

    let worker_pool = WorkerPool::new(gateway, invoker, config);
    worker_pool.run(shutdown_tx.subscribe()).await?;

    if let Some(handle) = cdc_handle {
        let _ = handle.await;
    }
    info!("Worker shutdown complete");
    Ok(())
}

fn open_registry(config: &WorkerConfig) -> Result<PluginRegistry> {
    let mut registry = PluginRegistry::new(&config.plugins_dir, config.plugin_envs_dir())?;
    registry.scan()?;
    Ok(registry)
}

async fn open_gateway(config: &WorkerConfig) -> Result<BrokerGateway> {
    let mut gateway = BrokerGateway::new(&config.broker_url, config.database_busy_timeout_seconds)?;
    gateway.initialize().await?;
    Ok(gateway)
}

fn list_plugins(config: WorkerConfig) -> Result<()> {
    let registry = open_registry(&config)?;
    let plugins = registry.list();
    if plugins.is_empty() {
        println!("no plugins registered");
        return Ok(());
    }

    println!(
        "{:<24} {:<10} {:<10} {:<24} {}",
        "NAME", "VERSION", "ENABLED", "ENTRY_POINT", "TAGS"
    );
    for record in plugins {
        println!(
            "{:<24} {:<10} {:<10} {:<24} {}",
            record.name,
            record.manifest.version,
            record.manifest.enabled,
            record.manifest.entry_point,
            record.manifest.tags.join(",")
        );
    }
    Ok(())
}

/// Execute a plugin locally, outside the broker, and print its outcome
async fn test_plugin(config: WorkerConfig, name: &str, params: &[String]) -> Result<()> {
    let mut registry = PluginRegistry::new(&config.plugins_dir, config.plugin_envs_dir())?;
    registry.scan()?;
    let registry = Arc::new(RwLock::new(registry));
    let (loader, _events, _raw) =
        HotLoader::new(std::path::Path::new(&config.plugins_dir), Arc::clone(&registry));
    let invoker = PluginInvoker::new(registry, loader);

    let parameters = parse_params(params)?;
    let outcome = invoker.execute(name, &parameters).await?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.is_success() {
        anyhow::bail!("plugin execution failed");
    }
    Ok(())
}

fn reload_plugin(config: WorkerConfig, name: &str) -> Result<()> {
    let mut registry = open_registry(&config)?;
    registry.reload(name)?;
    let record = registry
        .get(name)
        .context("Plugin disappeared during reload")?;
    println!(
        "reloaded {} v{} ({} files)",
        record.name,
        record.manifest.version,
        record.file_hashes.len()
    );
    Ok(())
}

async fn trigger_plugin(
    config: WorkerConfig,
    name: &str,
    params: &[String],
    priority: u8,
) -> Result<()> {
    let parameters = parse_params(params)?;
    let options = SubmitOptions {
        queue: PLUGIN_QUEUE.to_string(),
        priority,
        time_limit: None,
        retries: 0,
    };

    let mut gateway = open_gateway(&config).await?;
    let id = gateway.submit(name, &parameters, &options).await?;
    println!("{}", id);
    Ok(())
}

async fn list_active(config: WorkerConfig) -> Result<()> {
    let mut gateway = open_gateway(&config).await?;
    let active = gateway.inspect_active().await?;
    if active.is_empty() {
        println!("no active submissions");
        return Ok(());
    }

    println!(
        "{:<34} {:<20} {:<8} {:>8}",
        "ID", "PLUGIN", "ATTEMPT", "STARTED"
    );
    for submission in active {
        println!(
            "{:<34} {:<20} {:<8} {:>8}",
            submission.id,
            submission.plugin_name,
            submission.attempt,
            submission.started_at.unwrap_or_default()
        );
    }
    Ok(())
}

async fn submission_status(config: WorkerConfig, id: &str) -> Result<()> {
    let mut gateway = open_gateway(&config).await?;
    let submission = gateway
        .status(id)
        .await?
        .with_context(|| format!("No submission with id '{}'", id))?;

    println!("id:      {}", submission.id);
    println!("plugin:  {}", submission.plugin_name);
    println!("status:  {}", submission.status.as_str());
    println!("attempt: {}/{}", submission.attempt, submission.retries + 1);
    if let Some(result) = &submission.result {
        println!("result:  {}", result);
    }
    if let Some(error) = &submission.error {
        println!("error:   {}", error);
    }
    Ok(())
}

async fn cancel(config: WorkerConfig, id: &str, terminate: bool) -> Result<()> {
    let mut gateway = open_gateway(&config).await?;
    if !gateway.revoke(id, terminate).await? {
        anyhow::bail!("No pending or active submission with id '{}'", id);
    }
    println!("revoked {}", id);
    Ok(())
}

async fn cancel_plugin(config: WorkerConfig, name: &str, terminate: bool) -> Result<()> {
    let mut gateway = open_gateway(&config).await?;
    let count = gateway.revoke_by_plugin(name, terminate).await?;
    println!("revoked {} submissions for {}", count, name);
    Ok(())
}

async fn health(config: WorkerConfig) -> Result<()> {
    let registry = open_registry(&config)?;
    println!("plugins: ok ({} registered)", registry.list().len());

    let mut gateway = open_gateway(&config).await?;
    let stats = gateway.stats().await?;
    println!(
        "broker: ok (pending={} active={} success={} error={} revoked={})",
        stats.pending, stats.active, stats.success, stats.error, stats.revoked
    );
    Ok(())
}

/// Parse repeated `key=value` parameters, treating values as JSON when possible
fn parse_params(params: &[String]) -> Result<serde_json::Map<String, Value>> {
    let mut map = serde_json::Map::new();
    for raw in params {
        let (key, value) = raw
            .split_once('=')
            .with_context(|| format!("Parameter '{}' is not in key=value form", raw))?;
        if key.is_empty() {
            anyhow::bail!("Parameter '{}' has an empty key", raw);
        }
        let parsed = serde_json::from_str::<Value>(value)
            .unwrap_or_else(|_| Value::String(value.to_string()));
        map.insert(key.to_string(), parsed);
    }
    Ok(map)
}

/// JSON logs to a daily rolling file for the long-running pool
fn init_daemon_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let file_appender = tracing_appender::rolling::daily("./logs", "worker.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Default directives are only used if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("worker=info,shared=info"));

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
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("worker=warn,shared=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .compact()
        .with_writer(std::io::stderr)
        .init();
}
