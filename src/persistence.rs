//! Atomic, checksummed state persistence.
//!
//! Writes go to a temporary file in the target directory which is synced and
//! then renamed over the destination, so readers only ever observe a complete
//! previous or complete new file. Nothing in this module returns an error to
//! its caller: failures are logged and reported as `false` / `None`.

use crate::error::{Result, StateError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Field that carries the self-describing checksum in persisted objects
pub const CHECKSUM_FIELD: &str = "checksum";

/// Compute the SHA-256 checksum of a JSON value's canonical form.
///
/// A top-level `checksum` field is excluded. Object keys are emitted in sorted
/// order, so the digest does not depend on struct field order.
pub fn compute_checksum(value: &Value) -> String {
    let mut canonical = value.clone();
    if let Value::Object(map) = &mut canonical {
        map.remove(CHECKSUM_FIELD);
    }
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

/// Path of the backup copy kept by [`StatePersistence::save_state_atomic`]
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".backup");
    PathBuf::from(name)
}

/// Durable JSON state I/O
#[derive(Debug, Clone, Copy, Default)]
pub struct StatePersistence;

impl StatePersistence {
    /// Create a new persistence helper
    pub fn new() -> Self {
        Self
    }

    /// Serialize `data` to `path` atomically.
    ///
    /// With `backup_previous`, an existing file at `path` is first copied to
    /// `<path>.backup`. Returns `false` on any failure.
    pub fn save_state_atomic<T: Serialize>(&self, path: &Path, data: &T, backup_previous: bool) -> bool {
        match write_atomic(path, data, backup_previous) {
            Ok(bytes) => {
                debug!(path = %path.display(), bytes, "State saved atomically");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Atomic state save failed");
                false
            }
        }
    }

    /// Load state from `path`.
    ///
    /// When `validate_integrity` is set and the stored object carries a
    /// `checksum` field, the checksum is recomputed and must match. Returns
    /// `None` if the file is missing, unreadable, corrupted or of another type.
    pub fn load_state<T: DeserializeOwned>(&self, path: &Path, validate_integrity: bool) -> Option<T> {
        if !path.exists() {
            debug!(path = %path.display(), "State file not found");
            return None;
        }

        match read_checked(path, validate_integrity) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load state");
                None
            }
        }
    }
}

fn write_atomic<T: Serialize>(path: &Path, data: &T, backup_previous: bool) -> Result<usize> {
    let json = serde_json::to_string_pretty(data)?;

    let parent_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir)?;

    if backup_previous && path.exists() {
        let backup = backup_path(path);
        std::fs::copy(path, &backup)?;
        debug!(backup = %backup.display(), "Backed up previous state");
    }

    let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)?;
    temp_file.write_all(json.as_bytes())?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;

    temp_file
        .persist(path)
        .map_err(|e| StateError::Persistence(format!("Failed to persist temp file: {}", e)))?;

    // Make the rename itself durable
    if let Ok(dir) = std::fs::File::open(parent_dir) {
        let _ = dir.sync_all();
    }

    Ok(json.len())
}

fn read_checked<T: DeserializeOwned>(path: &Path, validate_integrity: bool) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&content)?;

    if validate_integrity {
        if let Some(stored) = value.get(CHECKSUM_FIELD).and_then(Value::as_str) {
            let computed = compute_checksum(&value);
            if computed != stored {
                return Err(StateError::Integrity(format!(
                    "checksum mismatch: stored {}, computed {}",
                    stored, computed
                )));
            }
        }
    }

    let state = serde_json::from_value(value)?;
    debug!(path = %path.display(), "State loaded");
    Ok(state)
}
