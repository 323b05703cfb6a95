//! Tests for the hot loader's dirty tracking and reload path

use crate::loader::{HotLoader, LoaderEvent};
use crate::registry::PluginRegistry;
use crate::tests::{basic_manifest, write_plugin};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::RwLock;

async fn loader_fixture(
    root: &TempDir,
) -> (
    Arc<HotLoader>,
    tokio::sync::mpsc::UnboundedReceiver<LoaderEvent>,
    Arc<RwLock<PluginRegistry>>,
) {
    let mut registry = PluginRegistry::new(root.path(), root.path()).unwrap();
    registry.scan().unwrap();
    let registry = Arc::new(RwLock::new(registry));

    let (loader, events_rx, _raw_rx) = HotLoader::new(root.path(), Arc::clone(&registry));
    (loader, events_rx, registry)
}

#[tokio::test]
async fn test_unchanged_content_does_not_dirty() {
    let root = TempDir::new().unwrap();
    let dir = write_plugin(root.path(), "stable", &basic_manifest("stable"), "echo '{}'");
    let (loader, _events, _registry) = loader_fixture(&root).await;

    // The watcher reported the path but the bytes are identical
    loader.evaluate_path(&dir.join("main.sh")).await;
    assert!(!loader.is_dirty("stable"));
}

#[tokio::test]
async fn test_content_change_marks_dirty() {
    let root = TempDir::new().unwrap();
    let dir = write_plugin(root.path(), "hot", &basic_manifest("hot"), "echo '{\"v\":1}'");
    let (loader, _events, _registry) = loader_fixture(&root).await;

    std::fs::write(dir.join("main.sh"), "#!/bin/sh\necho '{\"v\":2}'\n").unwrap();
    loader.evaluate_path(&dir.join("main.sh")).await;
    assert!(loader.is_dirty("hot"));

    // A brand-new file in the plugin directory also counts
    let (loader2, _events2, _registry2) = loader_fixture(&root).await;
    std::fs::write(dir.join("helper.py"), "print('x')\n").unwrap();
    loader2.evaluate_path(&dir.join("helper.py")).await;
    assert!(loader2.is_dirty("hot"));
}

#[tokio::test]
async fn test_root_level_and_deps_paths_ignored() {
    let root = TempDir::new().unwrap();
    let dir = write_plugin(root.path(), "quiet", &basic_manifest("quiet"), "echo '{}'");
    let (loader, _events, _registry) = loader_fixture(&root).await;

    // The global env file sits at the plugins root and must not trigger
    std::fs::write(root.path().join("plugins.env"), "K=V\n").unwrap();
    loader.evaluate_path(&root.path().join("plugins.env")).await;
    assert!(!loader.is_dirty("quiet"));

    // Machine-managed dependency root is not plugin content
    std::fs::create_dir_all(dir.join(".deps")).unwrap();
    std::fs::write(dir.join(".deps/dependencies.lock"), "x\n").unwrap();
    loader.evaluate_path(&dir.join(".deps/dependencies.lock")).await;
    assert!(!loader.is_dirty("quiet"));
}

#[tokio::test]
async fn test_reload_if_dirty_reloads_and_emits_event() {
    let root = TempDir::new().unwrap();
    let dir = write_plugin(root.path(), "cycling", &basic_manifest("cycling"), "echo '{}'");
    let (loader, mut events, registry) = loader_fixture(&root).await;

    // Clean plugin: nothing to do
    assert!(!loader.reload_if_dirty("cycling").await.unwrap());

    let updated = basic_manifest("cycling").replace("1.0.0", "3.1.4");
    std::fs::write(dir.join("manifest.json"), updated).unwrap();
    loader.mark_dirty("cycling");

    assert!(loader.reload_if_dirty("cycling").await.unwrap());
    assert!(!loader.is_dirty("cycling"));
    assert_eq!(
        registry.read().await.get("cycling").unwrap().manifest.version,
        "3.1.4"
    );
    assert_eq!(
        events.try_recv().unwrap(),
        LoaderEvent::Loaded {
            plugin: "cycling".to_string()
        }
    );
}

#[tokio::test]
async fn test_failed_reload_keeps_stale_record_and_emits_error() {
    let root = TempDir::new().unwrap();
    let dir = write_plugin(root.path(), "fragile", &basic_manifest("fragile"), "echo '{}'");
    let (loader, mut events, registry) = loader_fixture(&root).await;

    std::fs::write(dir.join("manifest.json"), "{broken").unwrap();
    loader.mark_dirty("fragile");

    assert!(loader.reload_if_dirty("fragile").await.is_err());
    // Stale-but-valid record survives; the plugin stays dirty for retry
    assert!(registry.read().await.get("fragile").is_some());
    assert!(loader.is_dirty("fragile"));
    assert!(matches!(
        events.try_recv().unwrap(),
        LoaderEvent::Error { plugin, .. } if plugin == "fragile"
    ));
}
