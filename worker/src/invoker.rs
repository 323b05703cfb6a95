//! Plugin invoker
//!
//! Executes a plugin as an isolated subprocess: the entrypoint executable
//! receives `{"function": .., "parameters": ..}` as JSON on stdin and replies
//! with JSON on stdout. The child gets a private environment (a snapshot of
//! the worker's environment overlaid with the plugin's env files and the
//! dependency-root export) via `env_clear().envs(..)`, so the worker's own
//! process environment is never mutated and concurrent invocations cannot see
//! each other's variables.
//!
//! Failures inside the plugin body are captured and returned as a structured
//! error outcome; they never propagate as crashes. Unknown plugins, disabled
//! plugins, and invalid parameters are surfaced to the caller as typed
//! errors before any side effect happens.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Map, Value};
use shared::utils::current_timestamp;
use shared::SchedulerError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::loader::HotLoader;
use crate::registry::{PluginRegistry, MANIFEST_FILE};

/// Environment variable pointing the plugin at its dependency root
pub const DEPS_PATH_VAR: &str = "PLUGIN_DEPS_PATH";

/// Environment variables identifying the invocation to the plugin
pub const PLUGIN_NAME_VAR: &str = "PLUGIN_NAME";
pub const PLUGIN_DIR_VAR: &str = "PLUGIN_DIR";

/// How much captured stderr is kept in an error message
const STDERR_SNIPPET_LIMIT: usize = 500;

/// Structured result of one plugin execution
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionOutcome {
    /// "success" or "error"
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix seconds at completion
    pub timestamp: i64,
}

impl ExecutionOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            status: "success".to_string(),
            result: Some(result),
            error: None,
            timestamp: current_timestamp() as i64,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            result: None,
            error: Some(message.into()),
            timestamp: current_timestamp() as i64,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Executes plugins resolved through the registry, honoring the hot loader
pub struct PluginInvoker {
    registry: Arc<RwLock<PluginRegistry>>,
    loader: Arc<HotLoader>,
}

impl PluginInvoker {
    pub fn new(registry: Arc<RwLock<PluginRegistry>>, loader: Arc<HotLoader>) -> Self {
        Self { registry, loader }
    }

    /// Execute a plugin with the given parameters.
    ///
    /// Typed errors (`PluginNotAvailable`, `ParameterInvalid`) come back as
    /// `Err`; anything that goes wrong inside the plugin body comes back as
    /// an `Ok` outcome with `status: "error"`.
    pub async fn execute(
        &self,
        plugin_name: &str,
        parameters: &Map<String, Value>,
    ) -> Result<ExecutionOutcome> {
        // Resolve first so an unknown name fails before any reload work
        if !self.registry.read().await.contains(plugin_name) {
            return Err(
                SchedulerError::PluginNotAvailable(format!("Unknown plugin: {}", plugin_name))
                    .into(),
            );
        }

        // A dirty plugin is reloaded before every execution touches it
        self.loader.reload_if_dirty(plugin_name).await?;

        let (dir, manifest) = {
            let registry = self.registry.read().await;
            let record = registry.get(plugin_name).ok_or_else(|| {
                SchedulerError::PluginNotAvailable(format!("Unknown plugin: {}", plugin_name))
            })?;
            (record.dir.clone(), record.manifest.clone())
        };

        if !manifest.enabled {
            return Err(SchedulerError::PluginNotAvailable(format!(
                "Plugin '{}' is disabled",
                plugin_name
            ))
            .into());
        }

        // Validation happens before entrypoint resolution and has no side
        // effects on failure
        let validated = PluginRegistry::validate_parameters(&manifest, parameters)?;

        let deps_root = self
            .registry
            .write()
            .await
            .ensure_deps_root(plugin_name)?;

        // Private environment: parent snapshot + env-file overlay + exports.
        // Handed to the child wholesale; the worker environment stays
        // untouched on every exit path because it is never modified at all.
        let mut child_env: HashMap<String, String> = std::env::vars().collect();
        let overlay = self.registry.read().await.env_overlay(plugin_name)?;
        for (key, value) in overlay {
            child_env.insert(key, value);
        }
        child_env.insert(DEPS_PATH_VAR.to_string(), deps_root.display().to_string());
        child_env.insert(PLUGIN_NAME_VAR.to_string(), plugin_name.to_string());
        child_env.insert(PLUGIN_DIR_VAR.to_string(), dir.display().to_string());

        let (module, function) = manifest.entry_parts();
        let entry_path = resolve_entry_executable(&dir, module)?;

        debug!(
            plugin = plugin_name,
            entry = %entry_path.display(),
            function,
            "Executing plugin"
        );

        let payload = serde_json::to_vec(&json!({
            "function": function,
            "parameters": Value::Object(validated),
        }))?;

        let mut child = tokio::process::Command::new(&entry_path)
            .current_dir(&dir)
            .env_clear()
            .envs(&child_env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SchedulerError::PluginRuntimeError(format!(
                    "failed to spawn entrypoint {}: {}",
                    entry_path.display(),
                    e
                ))
            })?;

        {
            let mut stdin = child.stdin.take().context("Plugin stdin unavailable")?;
            if let Err(e) = stdin.write_all(&payload).await {
                // A plugin that exits before reading its input still gets its
                // exit status inspected below
                warn!(plugin = plugin_name, "Failed to write plugin input: {}", e);
            }
        }

        let output = child.wait_with_output().await.map_err(|e| {
            SchedulerError::PluginRuntimeError(format!("failed to collect plugin output: {}", e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let snippet: String = stderr
                .chars()
                .rev()
                .take(STDERR_SNIPPET_LIMIT)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            return Ok(ExecutionOutcome::failure(format!(
                "Plugin exited with {}: {}",
                output.status,
                snippet.trim()
            )));
        }

        match serde_json::from_slice::<Value>(&output.stdout) {
            Ok(result) => Ok(ExecutionOutcome::success(result)),
            Err(e) => Ok(ExecutionOutcome::failure(format!(
                "Plugin produced invalid JSON output: {}",
                e
            ))),
        }
    }
}

/// Resolve the entrypoint module to exactly one file in the plugin directory.
///
/// Dots in the module path map to subdirectories. The match is on file stem,
/// so `main` resolves `main`, `main.py`, or `main.sh` alike, but refuses an
/// ambiguous directory offering several of them.
fn resolve_entry_executable(dir: &std::path::Path, module: &str) -> Result<PathBuf> {
    let module_path = module.replace('.', "/");
    let exact = dir.join(&module_path);
    if exact.is_file() {
        return Ok(exact);
    }

    let search_dir = exact.parent().unwrap_or(dir);
    let stem = exact
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(module);

    let mut candidates = Vec::new();
    if let Ok(entries) = std::fs::read_dir(search_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()) == Some(MANIFEST_FILE) {
                continue;
            }
            if path.file_stem().and_then(|s| s.to_str()) == Some(stem) {
                candidates.push(path);
            }
        }
    }

    match candidates.len() {
        0 => Err(SchedulerError::PluginNotAvailable(format!(
            "Entrypoint module '{}' not found in {}",
            module,
            dir.display()
        ))
        .into()),
        1 => Ok(candidates.remove(0)),
        _ => Err(SchedulerError::ManifestInvalid(format!(
            "Entrypoint module '{}' is ambiguous in {}",
            module,
            dir.display()
        ))
        .into()),
    }
}
