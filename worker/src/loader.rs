//! Hot loader for plugin directories
//!
//! Watches the plugins root and marks a plugin dirty when any regular file in
//! its directory actually changes content: the watcher only supplies
//! candidate paths, the BLAKE3 hash comparison against the registry's
//! recorded state decides. A 500ms debounce window coalesces editor-save
//! bursts. The global `plugins.env` at the plugins root is intentionally not
//! a trigger; its scope is too broad to invalidate every plugin.
//!
//! Reloading is pulled, not pushed: the invoker asks `reload_if_dirty` right
//! before executing, which drops the cached manifest, re-reads it, and
//! recomputes the hashes. `loaded`/`error` events are published on an
//! unbounded channel so observers can never block the loader.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use shared::utils::calculate_file_checksum;
use shared::Result;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::registry::PluginRegistry;

/// Quiet time a path must accumulate before it is evaluated
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// How often the debounce buffer is flushed
const DEBOUNCE_FLUSH_TICK: Duration = Duration::from_millis(100);

/// Observability events published by the loader
#[derive(Debug, Clone, PartialEq)]
pub enum LoaderEvent {
    /// A dirty plugin was successfully reloaded from disk
    Loaded { plugin: String },
    /// A reload attempt failed; the stale record stays registered
    Error { plugin: String, message: String },
}

/// Watches plugin directories and tracks which plugins need a reload
pub struct HotLoader {
    plugins_root: PathBuf,
    registry: Arc<RwLock<PluginRegistry>>,
    dirty: StdMutex<HashSet<String>>,
    events_tx: mpsc::UnboundedSender<LoaderEvent>,
    /// Raw change candidates from the filesystem watcher
    raw_tx: mpsc::UnboundedSender<PathBuf>,
    /// Keeps the OS watcher alive for the loader's lifetime
    watcher: StdMutex<Option<RecommendedWatcher>>,
}

impl HotLoader {
    /// Create a loader over the registry's plugins root.
    ///
    /// Returns the loader, the observability event stream, and the raw path
    /// receiver that `spawn` wires into the debounce task.
    pub fn new(
        plugins_root: &Path,
        registry: Arc<RwLock<PluginRegistry>>,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<LoaderEvent>,
        mpsc::UnboundedReceiver<PathBuf>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        let loader = Arc::new(Self {
            plugins_root: plugins_root.to_path_buf(),
            registry,
            dirty: StdMutex::new(HashSet::new()),
            events_tx,
            raw_tx,
            watcher: StdMutex::new(None),
        });

        (loader, events_rx, raw_rx)
    }

    /// Start the filesystem watcher and the debounce task.
    pub fn spawn(self: &Arc<Self>, raw_rx: mpsc::UnboundedReceiver<PathBuf>) -> Result<()> {
        let tx = self.raw_tx.clone();
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                if let Ok(event) = result {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            })?;
        watcher.watch(&self.plugins_root, RecursiveMode::Recursive)?;
        *self.watcher.lock().expect("watcher lock") = Some(watcher);

        let loader = Arc::clone(self);
        tokio::spawn(async move {
            loader.debounce_loop(raw_rx).await;
        });
        Ok(())
    }

    /// Coalesce change candidates and evaluate them once quiet.
    async fn debounce_loop(self: Arc<Self>, mut raw_rx: mpsc::UnboundedReceiver<PathBuf>) {
        let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
        let mut flush = tokio::time::interval(DEBOUNCE_FLUSH_TICK);

        loop {
            tokio::select! {
                candidate = raw_rx.recv() => {
                    match candidate {
                        Some(path) => {
                            pending.insert(path, Instant::now());
                        }
                        None => break,
                    }
                }
                _ = flush.tick() => {
                    let now = Instant::now();
                    let quiet: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, seen)| now.duration_since(**seen) >= DEBOUNCE_WINDOW)
                        .map(|(path, _)| path.clone())
                        .collect();
                    for path in quiet {
                        pending.remove(&path);
                        self.evaluate_path(&path).await;
                    }
                }
            }
        }
    }

    /// Decide whether a changed path dirties a plugin.
    ///
    /// Only content changes count: the file's hash is compared against the
    /// registry's recorded state. Files directly at the plugins root (such as
    /// the global env file) never trigger.
    pub(crate) async fn evaluate_path(&self, path: &Path) {
        let Ok(relative) = path.strip_prefix(&self.plugins_root) else {
            return;
        };
        let mut components = relative.components();
        let Some(plugin_dir) = components.next() else {
            return;
        };
        // A path with no second component sits at the root itself
        if components.clone().next().is_none() {
            return;
        }
        let within_plugin: PathBuf = components.collect();
        // The dependency root is machine-managed, not plugin content
        if within_plugin.starts_with(".deps") {
            return;
        }

        let plugin_dir = self.plugins_root.join(plugin_dir.as_os_str());
        let registry = self.registry.read().await;
        let Some(record) = registry.list().into_iter().find(|r| r.dir == plugin_dir) else {
            return;
        };

        let recorded = record.file_hashes.get(&within_plugin);
        let current = calculate_file_checksum(path).ok();
        let changed = match (recorded, &current) {
            (Some(old), Some(new)) => old != new,
            (None, Some(_)) => true, // new file
            (Some(_), None) => true, // deleted file
            (None, None) => false,
        };

        if changed {
            debug!(
                plugin = %record.name,
                file = %within_plugin.display(),
                "Plugin content changed on disk"
            );
            let name = record.name.clone();
            drop(registry);
            self.mark_dirty(&name);
        }
    }

    /// Force a plugin to reload before its next execution
    pub fn mark_dirty(&self, name: &str) {
        self.dirty.lock().expect("dirty lock").insert(name.to_string());
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.dirty.lock().expect("dirty lock").contains(name)
    }

    fn clear_dirty(&self, name: &str) {
        self.dirty.lock().expect("dirty lock").remove(name);
    }

    /// Reload a plugin from disk if it has been marked dirty.
    ///
    /// On success the dirty flag is cleared and a `Loaded` event published.
    /// On failure the stale record stays in place, an `Error` event is
    /// published, and the error propagates to the caller; executing a
    /// half-reloaded plugin is worse than failing the invocation.
    ///
    /// # Returns
    /// `true` if a reload happened
    pub async fn reload_if_dirty(&self, name: &str) -> Result<bool> {
        if !self.is_dirty(name) {
            return Ok(false);
        }

        let mut registry = self.registry.write().await;
        match registry.reload(name) {
            Ok(()) => {
                drop(registry);
                self.clear_dirty(name);
                let _ = self.events_tx.send(LoaderEvent::Loaded {
                    plugin: name.to_string(),
                });
                Ok(true)
            }
            Err(e) => {
                warn!(plugin = name, "Hot reload failed: {:#}", e);
                let _ = self.events_tx.send(LoaderEvent::Error {
                    plugin: name.to_string(),
                    message: format!("{:#}", e),
                });
                Err(e)
            }
        }
    }
}
