//! Utility functions for the task scheduling system
//!
//! This module provides common utility functions used across the beat and
//! worker components, including hashing, validation, and identifier
//! generation.

use blake3::Hasher;
use rand::Rng;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Calculate BLAKE3 checksum of a string
///
/// Returns the hash as a hex-encoded string (64 characters).
pub fn calculate_string_checksum(content: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(content.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Calculate BLAKE3 checksum of raw bytes
pub fn calculate_bytes_checksum(content: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(content);
    hasher.finalize().to_hex().to_string()
}

/// Calculate BLAKE3 checksum of file contents
///
/// Reads the file as raw bytes (plugin entrypoints may be binaries) and
/// returns its BLAKE3 hash as a hex-encoded string.
pub fn calculate_file_checksum<P: AsRef<Path>>(file_path: P) -> crate::Result<String> {
    let content = fs::read(file_path)?;
    Ok(calculate_bytes_checksum(&content))
}

/// Validate an identifier (task id, plugin name, consumer name)
///
/// Identifiers must contain only alphanumeric characters, hyphens, and
/// underscores. They must not be empty and should be reasonable in length.
pub fn validate_identifier(id: &str) -> crate::Result<()> {
    if id.is_empty() {
        return Err(crate::SchedulerError::Validation("Identifier cannot be empty".to_string()).into());
    }

    if id.len() > 128 {
        return Err(crate::SchedulerError::Validation(
            "Identifier cannot be longer than 128 characters".to_string(),
        )
        .into());
    }

    if !id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(crate::SchedulerError::Validation(
            "Identifier can only contain alphanumeric characters, hyphens, and underscores"
                .to_string(),
        )
        .into());
    }

    Ok(())
}

/// Get current Unix timestamp in seconds
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get current Unix timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate an opaque submission identifier
///
/// 16 random bytes, hex encoded. Collision probability is negligible for the
/// lifetime of a queue database.
pub fn generate_submission_id() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    let mut out = String::with_capacity(32);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Strip an optional `sqlite://` scheme from a database URL
///
/// Both bare paths and `sqlite://`-prefixed URLs are accepted wherever a
/// database location is configured.
pub fn database_path_from_url(url: &str) -> &str {
    url.strip_prefix("sqlite://").unwrap_or(url)
}
