//! Plugin registry
//!
//! The registry scans the plugins root at startup and on demand. Each
//! subdirectory carrying a `manifest.json` becomes a plugin record: absolute
//! path, parsed manifest, a content hash per regular file, and a lazily
//! materialized per-plugin dependency root. A manifest that fails to parse or
//! validate excludes only that plugin; the rest of the registry is unaffected.
//!
//! Env-file loading is layered: the global `plugins.env` at the plugin-envs
//! root is applied first, then the plugin's own `plugin.env` overrides it.
//! Neither is ever written into the worker's process environment; the
//! overlay is handed to the plugin subprocess as its private environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared::utils::{calculate_file_checksum, validate_identifier};
use shared::SchedulerError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Manifest file name, one per plugin directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Per-plugin env file, inside the plugin directory
pub const PLUGIN_ENV_FILE: &str = "plugin.env";

/// Global env file at the plugin-envs root
pub const GLOBAL_ENV_FILE: &str = "plugins.env";

/// Per-plugin dependency root directory name
const DEPS_DIR: &str = ".deps";

/// Lock file pinning the manifest's requirement strings
const DEPS_LOCK_FILE: &str = "dependencies.lock";

/// Recognized parameter types in manifest schemas
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParameterType {
    /// Whether a JSON value conforms to this type
    fn matches(&self, value: &Value) -> bool {
        match self {
            ParameterType::String => value.is_string(),
            // Integers are acceptable numbers; the reverse is not true
            ParameterType::Integer => value.is_i64() || value.is_u64(),
            ParameterType::Number => value.is_number(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::Object => value.is_object(),
            ParameterType::Array => value.is_array(),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Integer => "integer",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::Object => "object",
            ParameterType::Array => "array",
        }
    }
}

/// Declared schema for one plugin parameter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterSpec {
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A plugin's on-disk manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    /// `module.function`: the executable inside the plugin directory and the
    /// function name passed to it
    pub entry_point: String,
    #[serde(default)]
    pub parameters: HashMap<String, ParameterSpec>,
    /// Requirement strings pinned into the dependency root
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Advisory runtime version hint; not enforced
    #[serde(default)]
    pub runtime_version: Option<String>,
    #[serde(default = "shared::defaults::default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl PluginManifest {
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.name)
            .with_context(|| format!("Invalid plugin name '{}'", self.name))?;

        let (module, function) = self.entry_point.rsplit_once('.').ok_or_else(|| {
            SchedulerError::ManifestInvalid(format!(
                "entry_point '{}' is not in module.function form",
                self.entry_point
            ))
        })?;
        if module.is_empty() || function.is_empty() {
            return Err(SchedulerError::ManifestInvalid(format!(
                "entry_point '{}' has an empty module or function",
                self.entry_point
            ))
            .into());
        }

        Ok(())
    }

    /// The entrypoint split into its module path and function name
    pub fn entry_parts(&self) -> (&str, &str) {
        // validate() guarantees the dot is present
        self.entry_point.rsplit_once('.').unwrap_or((&self.entry_point, "main"))
    }
}

/// A discovered plugin: manifest plus filesystem state
#[derive(Debug, Clone)]
pub struct PluginRecord {
    pub name: String,
    pub dir: PathBuf,
    pub manifest: PluginManifest,
    /// Content hash per regular file, relative path → BLAKE3 hex
    pub file_hashes: HashMap<PathBuf, String>,
    /// Materialized dependency root, once built
    pub deps_root: Option<PathBuf>,
}

/// Registry of all plugins under the plugins root
pub struct PluginRegistry {
    plugins_root: PathBuf,
    plugin_envs_dir: PathBuf,
    plugins: HashMap<String, PluginRecord>,
}

impl PluginRegistry {
    /// Create a registry over the given roots.
    ///
    /// The plugins root must exist; a missing directory is a configuration
    /// error worth failing fast on.
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(plugins_root: P, plugin_envs_dir: Q) -> Result<Self> {
        let plugins_root = plugins_root.as_ref().to_path_buf();
        if !plugins_root.is_dir() {
            return Err(SchedulerError::Config(format!(
                "Plugins directory does not exist: {}",
                plugins_root.display()
            ))
            .into());
        }

        Ok(Self {
            plugins_root,
            plugin_envs_dir: plugin_envs_dir.as_ref().to_path_buf(),
            plugins: HashMap::new(),
        })
    }

    /// Discover all plugins under the root.
    ///
    /// A broken manifest logs an error and skips that plugin only.
    pub fn scan(&mut self) -> Result<()> {
        let mut discovered = HashMap::new();

        for entry in std::fs::read_dir(&self.plugins_root).with_context(|| {
            format!("Failed to read plugins root: {}", self.plugins_root.display())
        })? {
            let entry = entry?;
            let dir = entry.path();
            if !dir.is_dir() || !dir.join(MANIFEST_FILE).is_file() {
                continue;
            }

            match self.load_plugin(&dir) {
                Ok(mut record) => {
                    // Keep an already-materialized dependency root
                    if let Some(existing) = self.plugins.get(&record.name) {
                        record.deps_root = existing.deps_root.clone();
                    }
                    debug!(plugin = %record.name, dir = %dir.display(), "Discovered plugin");
                    discovered.insert(record.name.clone(), record);
                }
                Err(e) => {
                    error!(dir = %dir.display(), "Excluding plugin with invalid manifest: {:#}", e);
                }
            }
        }

        info!("Plugin scan complete: {} plugins registered", discovered.len());
        self.plugins = discovered;
        Ok(())
    }

    /// Parse one plugin directory into a record
    fn load_plugin(&self, dir: &Path) -> Result<PluginRecord> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&manifest_path)
            .with_context(|| format!("Failed to read {}", manifest_path.display()))?;
        let manifest: PluginManifest = serde_json::from_str(&content)
            .map_err(|e| SchedulerError::ManifestInvalid(e.to_string()))
            .with_context(|| format!("Failed to parse {}", manifest_path.display()))?;
        manifest.validate()?;

        let file_hashes = hash_plugin_files(dir)?;

        Ok(PluginRecord {
            name: manifest.name.clone(),
            dir: dir.to_path_buf(),
            manifest,
            file_hashes,
            deps_root: None,
        })
    }

    /// Drop cached state for a plugin and re-read it from disk.
    ///
    /// Used by the hot-reload path before executing a dirty plugin and by the
    /// `reload` CLI command.
    pub fn reload(&mut self, name: &str) -> Result<()> {
        let record = self.plugins.get(name).ok_or_else(|| {
            SchedulerError::PluginNotAvailable(format!("Unknown plugin: {}", name))
        })?;
        let dir = record.dir.clone();
        let deps_root = record.deps_root.clone();

        let mut fresh = self.load_plugin(&dir)?;
        if fresh.name != name {
            // A rename in the manifest retires the old key
            warn!(
                old = name,
                new = %fresh.name,
                "Plugin renamed in manifest during reload"
            );
            self.plugins.remove(name);
        }
        fresh.deps_root = deps_root;
        info!(plugin = %fresh.name, "Reloaded plugin from disk");
        self.plugins.insert(fresh.name.clone(), fresh);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PluginRecord> {
        self.plugins.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// All registered plugins, sorted by name
    pub fn list(&self) -> Vec<&PluginRecord> {
        let mut records: Vec<&PluginRecord> = self.plugins.values().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Materialize (or reuse) the plugin's isolated dependency root.
    ///
    /// First execution builds `<plugin>/.deps/` with a lock file pinning the
    /// manifest's requirement strings; subsequent executions reuse it. The
    /// path is exported to the plugin process as `PLUGIN_DEPS_PATH`.
    pub fn ensure_deps_root(&mut self, name: &str) -> Result<PathBuf> {
        let record = self.plugins.get_mut(name).ok_or_else(|| {
            SchedulerError::PluginNotAvailable(format!("Unknown plugin: {}", name))
        })?;

        if let Some(root) = &record.deps_root {
            return Ok(root.clone());
        }

        let root = record.dir.join(DEPS_DIR);
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create dependency root: {}", root.display()))?;

        let lock_path = root.join(DEPS_LOCK_FILE);
        let mut lock = String::new();
        for requirement in &record.manifest.dependencies {
            lock.push_str(requirement);
            lock.push('\n');
        }
        std::fs::write(&lock_path, lock)
            .with_context(|| format!("Failed to write {}", lock_path.display()))?;

        info!(
            plugin = name,
            deps = record.manifest.dependencies.len(),
            "Materialized plugin dependency root"
        );
        record.deps_root = Some(root.clone());
        Ok(root)
    }

    /// The layered env-file overlay for a plugin: global first, then the
    /// plugin's own file overriding it.
    pub fn env_overlay(&self, name: &str) -> Result<Vec<(String, String)>> {
        let record = self.plugins.get(name).ok_or_else(|| {
            SchedulerError::PluginNotAvailable(format!("Unknown plugin: {}", name))
        })?;

        let mut overlay = Vec::new();
        let global = self.plugin_envs_dir.join(GLOBAL_ENV_FILE);
        if global.is_file() {
            overlay.extend(parse_env_file(&global)?);
        }
        let local = record.dir.join(PLUGIN_ENV_FILE);
        if local.is_file() {
            overlay.extend(parse_env_file(&local)?);
        }
        Ok(overlay)
    }

    /// Validate an invocation's parameters against the manifest schema.
    ///
    /// Missing required parameters fail; declared defaults are substituted;
    /// type mismatches fail; unknown parameters pass through unchanged.
    pub fn validate_parameters(
        manifest: &PluginManifest,
        parameters: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let mut validated = parameters.clone();

        for (param_name, spec) in &manifest.parameters {
            match validated.get(param_name) {
                Some(value) => {
                    if !spec.param_type.matches(value) {
                        return Err(SchedulerError::ParameterInvalid(format!(
                            "Parameter '{}' must be of type {}",
                            param_name,
                            spec.param_type.as_str()
                        ))
                        .into());
                    }
                }
                None => {
                    if let Some(default) = &spec.default {
                        validated.insert(param_name.clone(), default.clone());
                    } else if spec.required {
                        return Err(SchedulerError::ParameterInvalid(format!(
                            "Required parameter '{}' is missing",
                            param_name
                        ))
                        .into());
                    }
                }
            }
        }

        Ok(validated)
    }
}

/// Hash every regular file under a plugin directory, excluding the
/// materialized dependency root.
pub fn hash_plugin_files(dir: &Path) -> Result<HashMap<PathBuf, String>> {
    let mut hashes = HashMap::new();
    hash_dir_recursive(dir, dir, &mut hashes)?;
    Ok(hashes)
}

fn hash_dir_recursive(
    root: &Path,
    dir: &Path,
    hashes: &mut HashMap<PathBuf, String>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();

        if path.is_dir() {
            if name == DEPS_DIR {
                continue;
            }
            hash_dir_recursive(root, &path, hashes)?;
        } else if path.is_file() {
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            hashes.insert(relative, calculate_file_checksum(&path)?);
        }
    }
    Ok(())
}

/// Parse a `KEY=VALUE` env file.
///
/// `#`-comments and blank lines are ignored. A single pair of wrapping double
/// quotes is stripped from the value; no further quoting interpretation.
pub fn parse_env_file(path: &Path) -> Result<Vec<(String, String)>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read env file: {}", path.display()))?;

    let mut pairs = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!(file = %path.display(), line, "Skipping malformed env line");
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim();
        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value = &value[1..value.len() - 1];
        }
        pairs.push((key.to_string(), value.to_string()));
    }
    Ok(pairs)
}
