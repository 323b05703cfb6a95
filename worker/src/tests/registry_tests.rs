//! Tests for plugin discovery, manifests, env files, and parameter validation

use crate::registry::{parse_env_file, PluginRegistry};
use crate::tests::{basic_manifest, write_plugin};
use serde_json::{json, Map};
use tempfile::TempDir;

#[test]
fn test_scan_discovers_plugins_and_skips_broken_manifests() {
    let root = TempDir::new().unwrap();
    write_plugin(root.path(), "alpha", &basic_manifest("alpha"), "echo '{}'");
    write_plugin(root.path(), "beta", &basic_manifest("beta"), "echo '{}'");
    // Broken manifest: excluded without affecting the others
    write_plugin(root.path(), "broken", "{not json", "echo '{}'");
    // Directory without a manifest: ignored entirely
    std::fs::create_dir(root.path().join("scratch")).unwrap();

    let mut registry = PluginRegistry::new(root.path(), root.path()).unwrap();
    registry.scan().unwrap();

    let names: Vec<&str> = registry.list().iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);

    let alpha = registry.get("alpha").unwrap();
    assert_eq!(alpha.manifest.entry_point, "main.run");
    // manifest.json and main.sh both hashed
    assert_eq!(alpha.file_hashes.len(), 2);
}

#[test]
fn test_manifest_entry_point_validation() {
    let root = TempDir::new().unwrap();
    let manifest = r#"{
  "name": "bad_entry",
  "version": "1.0.0",
  "entry_point": "no_function_part"
}"#;
    write_plugin(root.path(), "bad_entry", manifest, "echo '{}'");

    let mut registry = PluginRegistry::new(root.path(), root.path()).unwrap();
    registry.scan().unwrap();
    assert!(registry.get("bad_entry").is_none());
}

#[test]
fn test_validate_parameters() {
    let root = TempDir::new().unwrap();
    let manifest = r#"{
  "name": "shapes",
  "version": "1.0.0",
  "entry_point": "main.run",
  "parameters": {
    "target": {"type": "string", "required": true},
    "depth": {"type": "integer", "required": false, "default": 3},
    "flags": {"type": "array", "required": false}
  }
}"#;
    write_plugin(root.path(), "shapes", manifest, "echo '{}'");

    let mut registry = PluginRegistry::new(root.path(), root.path()).unwrap();
    registry.scan().unwrap();
    let manifest = registry.get("shapes").unwrap().manifest.clone();

    // Required missing
    let empty = Map::new();
    assert!(PluginRegistry::validate_parameters(&manifest, &empty).is_err());

    // Defaults substituted, unknown keys pass through
    let mut params = Map::new();
    params.insert("target".to_string(), json!("db1"));
    params.insert("extra".to_string(), json!({"anything": true}));
    let validated = PluginRegistry::validate_parameters(&manifest, &params).unwrap();
    assert_eq!(validated.get("depth"), Some(&json!(3)));
    assert_eq!(validated.get("extra"), Some(&json!({"anything": true})));

    // Type mismatch
    let mut params = Map::new();
    params.insert("target".to_string(), json!(42));
    assert!(PluginRegistry::validate_parameters(&manifest, &params).is_err());

    // Integer accepted where number declared, not the other way around
    let mut params = Map::new();
    params.insert("target".to_string(), json!("db1"));
    params.insert("depth".to_string(), json!(2.5));
    assert!(PluginRegistry::validate_parameters(&manifest, &params).is_err());
}

#[test]
fn test_env_file_parsing() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("plugin.env");
    std::fs::write(
        &path,
        r#"
# exported to the plugin process
API_URL=https://api.internal
QUOTED="spaced value"
EMPTY=

malformed line without equals
"#,
    )
    .unwrap();

    let pairs = parse_env_file(&path).unwrap();
    assert_eq!(
        pairs,
        vec![
            ("API_URL".to_string(), "https://api.internal".to_string()),
            ("QUOTED".to_string(), "spaced value".to_string()),
            ("EMPTY".to_string(), String::new()),
        ]
    );
}

#[test]
fn test_env_overlay_layering() {
    let root = TempDir::new().unwrap();
    let dir = write_plugin(root.path(), "layered", &basic_manifest("layered"), "echo '{}'");

    // Global file at the envs root, per-plugin file overriding one key
    std::fs::write(root.path().join("plugins.env"), "SHARED=global\nBASE=1\n").unwrap();
    std::fs::write(dir.join("plugin.env"), "SHARED=local\n").unwrap();

    let mut registry = PluginRegistry::new(root.path(), root.path()).unwrap();
    registry.scan().unwrap();

    let overlay = registry.env_overlay("layered").unwrap();
    let resolve = |key: &str| {
        overlay
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };
    assert_eq!(resolve("SHARED"), Some("local".to_string()));
    assert_eq!(resolve("BASE"), Some("1".to_string()));
}

#[test]
fn test_deps_root_materialization() {
    let root = TempDir::new().unwrap();
    let manifest = r#"{
  "name": "with_deps",
  "version": "1.0.0",
  "entry_point": "main.run",
  "dependencies": ["requests>=2.0", "lxml==4.9.1"]
}"#;
    let dir = write_plugin(root.path(), "with_deps", manifest, "echo '{}'");

    let mut registry = PluginRegistry::new(root.path(), root.path()).unwrap();
    registry.scan().unwrap();

    let deps_root = registry.ensure_deps_root("with_deps").unwrap();
    assert_eq!(deps_root, dir.join(".deps"));

    let lock = std::fs::read_to_string(deps_root.join("dependencies.lock")).unwrap();
    assert_eq!(lock, "requests>=2.0\nlxml==4.9.1\n");

    // Second call reuses the materialized root
    assert_eq!(registry.ensure_deps_root("with_deps").unwrap(), deps_root);

    // The dependency root is not plugin content: a rescan must not hash it
    registry.scan().unwrap();
    let record = registry.get("with_deps").unwrap();
    assert!(record
        .file_hashes
        .keys()
        .all(|p| !p.starts_with(".deps")));
}

#[test]
fn test_reload_picks_up_manifest_changes() {
    let root = TempDir::new().unwrap();
    let dir = write_plugin(root.path(), "evolving", &basic_manifest("evolving"), "echo '{}'");

    let mut registry = PluginRegistry::new(root.path(), root.path()).unwrap();
    registry.scan().unwrap();
    assert_eq!(registry.get("evolving").unwrap().manifest.version, "1.0.0");

    let updated = basic_manifest("evolving").replace("1.0.0", "2.0.0");
    std::fs::write(dir.join("manifest.json"), updated).unwrap();

    registry.reload("evolving").unwrap();
    assert_eq!(registry.get("evolving").unwrap().manifest.version, "2.0.0");
}
