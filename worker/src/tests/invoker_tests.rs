//! Tests for the plugin invoker: subprocess contract, env scoping, hot reload

#![cfg(unix)]

use crate::invoker::PluginInvoker;
use crate::loader::HotLoader;
use crate::registry::PluginRegistry;
use crate::tests::{basic_manifest, make_executable, write_plugin};
use serde_json::{json, Map};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::RwLock;

async fn invoker_fixture(root: &TempDir) -> (PluginInvoker, Arc<HotLoader>) {
    let mut registry = PluginRegistry::new(root.path(), root.path()).unwrap();
    registry.scan().unwrap();
    let registry = Arc::new(RwLock::new(registry));
    let (loader, _events, _raw) = HotLoader::new(root.path(), Arc::clone(&registry));
    (PluginInvoker::new(registry, Arc::clone(&loader)), loader)
}

#[tokio::test]
async fn test_successful_execution_returns_stdout_json() {
    let root = TempDir::new().unwrap();
    write_plugin(
        root.path(),
        "greeter",
        &basic_manifest("greeter"),
        "cat > /dev/null\necho '{\"greeting\": \"hello\"}'",
    );
    let (invoker, _loader) = invoker_fixture(&root).await;

    let outcome = invoker.execute("greeter", &Map::new()).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.result, Some(json!({"greeting": "hello"})));
    assert!(outcome.timestamp > 0);
}

#[tokio::test]
async fn test_plugin_receives_function_and_parameters_on_stdin() {
    let root = TempDir::new().unwrap();
    // The plugin echoes its stdin back, so the result is the exact payload
    write_plugin(
        root.path(),
        "echoer",
        &basic_manifest("echoer"),
        "exec cat",
    );
    let (invoker, _loader) = invoker_fixture(&root).await;

    let mut params = Map::new();
    params.insert("x".to_string(), json!(1));
    let outcome = invoker.execute("echoer", &params).await.unwrap();
    assert!(outcome.is_success());

    let payload = outcome.result.unwrap();
    assert_eq!(payload["function"], json!("run"));
    assert_eq!(payload["parameters"]["x"], json!(1));
}

#[tokio::test]
async fn test_declared_defaults_reach_the_plugin() {
    let root = TempDir::new().unwrap();
    let manifest = r#"{
  "name": "defaulted",
  "version": "1.0.0",
  "entry_point": "main.run",
  "parameters": {
    "depth": {"type": "integer", "required": false, "default": 7}
  }
}"#;
    write_plugin(root.path(), "defaulted", manifest, "exec cat");
    let (invoker, _loader) = invoker_fixture(&root).await;

    let outcome = invoker.execute("defaulted", &Map::new()).await.unwrap();
    let payload = outcome.result.unwrap();
    assert_eq!(payload["parameters"]["depth"], json!(7));
}

#[tokio::test]
async fn test_unknown_and_disabled_plugins_fail_before_execution() {
    let root = TempDir::new().unwrap();
    let disabled = basic_manifest("sleeper").replace("\"enabled\": true", "\"enabled\": false");
    write_plugin(root.path(), "sleeper", &disabled, "echo '{}'");
    let (invoker, _loader) = invoker_fixture(&root).await;

    let err = invoker.execute("missing", &Map::new()).await.unwrap_err();
    assert!(err.to_string().contains("Unknown plugin"));

    let err = invoker.execute("sleeper", &Map::new()).await.unwrap_err();
    assert!(err.to_string().contains("disabled"));
}

#[tokio::test]
async fn test_invalid_parameters_fail_without_side_effects() {
    let root = TempDir::new().unwrap();
    let manifest = r#"{
  "name": "strict",
  "version": "1.0.0",
  "entry_point": "main.run",
  "parameters": {
    "target": {"type": "string", "required": true}
  }
}"#;
    let dir = write_plugin(
        root.path(),
        "strict",
        manifest,
        "cat > /dev/null\ntouch executed_marker\necho '{}'",
    );
    let (invoker, _loader) = invoker_fixture(&root).await;

    let err = invoker.execute("strict", &Map::new()).await.unwrap_err();
    assert!(err.to_string().contains("Required parameter"));
    // Validation failed before entrypoint resolution: nothing ran
    assert!(!dir.join("executed_marker").exists());
}

#[tokio::test]
async fn test_plugin_failure_is_captured_as_error_outcome() {
    let root = TempDir::new().unwrap();
    write_plugin(
        root.path(),
        "crasher",
        &basic_manifest("crasher"),
        "cat > /dev/null\necho 'stack trace here' >&2\nexit 3",
    );
    let (invoker, _loader) = invoker_fixture(&root).await;

    let outcome = invoker.execute("crasher", &Map::new()).await.unwrap();
    assert!(!outcome.is_success());
    let message = outcome.error.unwrap();
    assert!(message.contains("stack trace here"));
}

#[tokio::test]
async fn test_invalid_stdout_json_is_an_error_outcome() {
    let root = TempDir::new().unwrap();
    write_plugin(
        root.path(),
        "garbled",
        &basic_manifest("garbled"),
        "cat > /dev/null\necho 'not json at all'",
    );
    let (invoker, _loader) = invoker_fixture(&root).await;

    let outcome = invoker.execute("garbled", &Map::new()).await.unwrap();
    assert!(!outcome.is_success());
    assert!(outcome.error.unwrap().contains("invalid JSON"));
}

#[tokio::test]
async fn test_env_overlay_is_scoped_to_the_plugin_process() {
    let root = TempDir::new().unwrap();
    let dir = write_plugin(
        root.path(),
        "env_reader",
        &basic_manifest("env_reader"),
        "cat > /dev/null\nprintf '{\"seen\": \"%s\"}' \"$SCOPED_ENV_PROBE\"",
    );
    std::fs::write(dir.join("plugin.env"), "SCOPED_ENV_PROBE=overlay\n").unwrap();
    let (invoker, _loader) = invoker_fixture(&root).await;

    // The worker process carries a different value for the same key
    std::env::set_var("SCOPED_ENV_PROBE", "process");

    let outcome = invoker.execute("env_reader", &Map::new()).await.unwrap();
    assert_eq!(outcome.result, Some(json!({"seen": "overlay"})));

    // The worker's environment is exactly what it was before the invocation
    assert_eq!(
        std::env::var("SCOPED_ENV_PROBE").as_deref(),
        Ok("process")
    );
    std::env::remove_var("SCOPED_ENV_PROBE");
}

#[tokio::test]
async fn test_deps_root_and_identity_exported() {
    let root = TempDir::new().unwrap();
    write_plugin(
        root.path(),
        "introspect",
        &basic_manifest("introspect"),
        "cat > /dev/null\nprintf '{\"deps\": \"%s\", \"name\": \"%s\"}' \"$PLUGIN_DEPS_PATH\" \"$PLUGIN_NAME\"",
    );
    let (invoker, _loader) = invoker_fixture(&root).await;

    let outcome = invoker.execute("introspect", &Map::new()).await.unwrap();
    let payload = outcome.result.unwrap();
    assert!(payload["deps"].as_str().unwrap().ends_with(".deps"));
    assert_eq!(payload["name"], json!("introspect"));
}

#[tokio::test]
async fn test_dirty_plugin_is_reloaded_before_execution() {
    let root = TempDir::new().unwrap();
    let dir = write_plugin(
        root.path(),
        "versioned",
        &basic_manifest("versioned"),
        "cat > /dev/null\necho '{\"value\": \"v1\"}'",
    );
    let (invoker, loader) = invoker_fixture(&root).await;

    let outcome = invoker.execute("versioned", &Map::new()).await.unwrap();
    assert_eq!(outcome.result, Some(json!({"value": "v1"})));

    // Source changes on disk; the loader notices the content change
    let entry = dir.join("main.sh");
    std::fs::write(&entry, "#!/bin/sh\ncat > /dev/null\necho '{\"value\": \"v2\"}'\n").unwrap();
    make_executable(&entry);
    loader.evaluate_path(&entry).await;
    assert!(loader.is_dirty("versioned"));

    // Next execution observes the new content without any restart
    let outcome = invoker.execute("versioned", &Map::new()).await.unwrap();
    assert_eq!(outcome.result, Some(json!({"value": "v2"})));
    assert!(!loader.is_dirty("versioned"));
}

#[tokio::test]
async fn test_ambiguous_entrypoint_is_rejected() {
    let root = TempDir::new().unwrap();
    let dir = write_plugin(root.path(), "twins", &basic_manifest("twins"), "echo '{}'");
    // A second file with the same stem makes `main` ambiguous
    std::fs::write(dir.join("main.py"), "print('{}')\n").unwrap();
    let (invoker, _loader) = invoker_fixture(&root).await;

    let err = invoker.execute("twins", &Map::new()).await.unwrap_err();
    assert!(err.to_string().contains("ambiguous"));
}
