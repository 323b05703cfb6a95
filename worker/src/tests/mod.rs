//! Test modules for the worker crate

mod invoker_tests;
mod loader_tests;
mod registry_tests;

use std::path::{Path, PathBuf};

/// Write a plugin directory with a manifest and a shell entrypoint.
///
/// The script body is wrapped with a line that swallows stdin so plugins
/// that ignore their input do not die on a closed pipe.
pub(crate) fn write_plugin(root: &Path, name: &str, manifest: &str, script: &str) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("manifest.json"), manifest).unwrap();

    let entry = dir.join("main.sh");
    let body = format!("#!/bin/sh\n{}\n", script);
    std::fs::write(&entry, body).unwrap();
    make_executable(&entry);
    dir
}

/// Minimal valid manifest body for a plugin
pub(crate) fn basic_manifest(name: &str) -> String {
    format!(
        r#"{{
  "name": "{}",
  "version": "1.0.0",
  "entry_point": "main.run",
  "parameters": {{}},
  "dependencies": [],
  "enabled": true,
  "tags": []
}}"#,
        name
    )
}

#[cfg(unix)]
pub(crate) fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}

#[cfg(not(unix))]
pub(crate) fn make_executable(_path: &Path) {}
