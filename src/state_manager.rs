// =============================================================================
// State Manager — atomic JSON snapshot store for session-scoped state
// =============================================================================
//
// Single-file persistence with the tmp + rename pattern: a crash leaves either
// the previous complete file or the old file plus a stray tmp, never a torn
// write. The loader ignores tmp files; a corrupt file is moved aside to
// `<file>.corrupt` and the store starts empty.
//
// All mutations are in-memory. Durability happens only at `save()`, which the
// checkpoint task and the shutdown sequence call.
// =============================================================================

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

/// Write `value` as pretty JSON to `path` atomically (tmp + fsync + rename).
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize state for {}", path.display()))?;

    let tmp_path = tmp_sibling(path);
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create tmp file {}", tmp_path.display()))?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("failed to write tmp file {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to fsync tmp file {}", tmp_path.display()))?;
    }

    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename tmp file over {}", path.display()))?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Move a corrupt file aside so the next load starts clean but the bad bytes
/// remain available for inspection.
pub fn quarantine_corrupt_file(path: &Path) {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".corrupt");
    let corrupt_path = path.with_file_name(name);
    if let Err(e) = fs::rename(path, &corrupt_path) {
        error!(
            path = %path.display(),
            error = %e,
            "failed to quarantine corrupt state file"
        );
    } else {
        warn!(
            path = %path.display(),
            moved_to = %corrupt_path.display(),
            "corrupt state file moved aside; starting empty"
        );
    }
}

/// Atomic key-value snapshot store backing `unified_state.json`.
pub struct StateManager {
    state_file: PathBuf,
    state: Mutex<Map<String, Value>>,
}

impl StateManager {
    /// Open (or create) the store under `state_dir`. Never fails on corrupt
    /// content: the bad file is quarantined and the store starts empty.
    pub fn new(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;
        let state_file = state_dir.join("unified_state.json");
        let state = Self::load(&state_file);
        Ok(Self {
            state_file,
            state: Mutex::new(state),
        })
    }

    fn load(state_file: &Path) -> Map<String, Value> {
        if !state_file.exists() {
            return Map::new();
        }
        match fs::read_to_string(state_file) {
            Ok(content) => match serde_json::from_str::<Map<String, Value>>(&content) {
                Ok(map) => {
                    info!(path = %state_file.display(), keys = map.len(), "unified state loaded");
                    map
                }
                Err(e) => {
                    error!(path = %state_file.display(), error = %e, "unified state is corrupt");
                    quarantine_corrupt_file(state_file);
                    Map::new()
                }
            },
            Err(e) => {
                error!(path = %state_file.display(), error = %e, "failed to read unified state");
                Map::new()
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().get(key).cloned()
    }

    /// Typed read; returns `None` when the key is absent or the shape doesn't
    /// match.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn set<T: Serialize>(&self, key: &str, value: T) {
        if let Ok(v) = serde_json::to_value(value) {
            self.state.lock().insert(key.to_string(), v);
        }
    }

    /// Persist the in-memory map atomically.
    pub fn save(&self) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock();
            state.insert(
                "last_saved".to_string(),
                Value::from(chrono::Utc::now().timestamp_millis() as f64 / 1000.0),
            );
            state.clone()
        };
        atomic_write_json(&self.state_file, &snapshot)
    }

    pub fn clear(&self) {
        self.state.lock().clear();
        if self.state_file.exists() {
            let _ = fs::remove_file(&self.state_file);
        }
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn set_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        {
            let sm = StateManager::new(dir.path()).unwrap();
            sm.set("starting_equity", 10000.0);
            sm.set("note", "hello");
            sm.save().unwrap();
        }
        let sm2 = StateManager::new(dir.path()).unwrap();
        assert_eq!(sm2.get_as::<f64>("starting_equity"), Some(10000.0));
        assert_eq!(sm2.get_as::<String>("note"), Some("hello".to_string()));
        assert!(sm2.get("last_saved").is_some());
    }

    #[test]
    fn corrupt_file_is_quarantined_and_store_starts_empty() {
        let dir = tempdir().unwrap();
        let state_file = dir.path().join("unified_state.json");
        fs::write(&state_file, "{ not json ...").unwrap();

        let sm = StateManager::new(dir.path()).unwrap();
        assert!(sm.get("anything").is_none());
        assert!(dir.path().join("unified_state.json.corrupt").exists());
        assert!(!state_file.exists());
    }

    #[test]
    fn save_is_atomic_over_existing_content() {
        let dir = tempdir().unwrap();
        let sm = StateManager::new(dir.path()).unwrap();
        sm.set("k", 1);
        sm.save().unwrap();

        // A stray tmp file from a simulated crash must not break loading the
        // previous complete state.
        let tmp = dir.path().join("unified_state.json.tmp");
        fs::write(&tmp, "partial garbage").unwrap();

        let sm2 = StateManager::new(dir.path()).unwrap();
        assert_eq!(sm2.get_as::<i64>("k"), Some(1));
    }

    #[test]
    fn clear_removes_file_and_memory() {
        let dir = tempdir().unwrap();
        let sm = StateManager::new(dir.path()).unwrap();
        sm.set("k", 1);
        sm.save().unwrap();
        sm.clear();
        assert!(sm.get("k").is_none());
        assert!(!dir.path().join("unified_state.json").exists());
    }
}
