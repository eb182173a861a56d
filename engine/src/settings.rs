//! Key-value persistence for operator preferences.
//!
//! The engine only needs an opaque string store: `EngineConfig` reads and
//! writes its fields through it, and front ends remember the last sources and
//! destinations. `MemorySettings` is the in-process store used by tests;
//! `JsonFileSettings` keeps a flat JSON object on disk.

use crate::error::EngineError;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Key holding the remembered source roots.
pub const SOURCES_KEY: &str = "sources";
/// Key holding the remembered destination roots.
pub const DESTINATIONS_KEY: &str = "destinations";

/// Opaque string key-value store.
pub trait SettingsStore {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&mut self, key: &str, value: &str);

    fn remove(&mut self, key: &str);

    fn keys(&self) -> Vec<String>;

    /// Persist pending changes.
    fn flush(&mut self) -> Result<(), EngineError>;

    /// Read a list of paths stored as a JSON array. Malformed values read as
    /// an empty list.
    fn get_paths(&self, key: &str) -> Vec<PathBuf> {
        let Some(raw) = self.get(key) else {
            return Vec::new();
        };
        match serde_json::from_str::<Vec<PathBuf>>(&raw) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(key, error = %e, "Ignoring malformed path list");
                Vec::new()
            }
        }
    }

    fn set_paths(&mut self, key: &str, paths: &[PathBuf]) {
        match serde_json::to_string(paths) {
            Ok(raw) => self.set(key, &raw),
            Err(e) => warn!(key, error = %e, "Can't encode path list"),
        }
    }
}

/// Settings kept in memory only.
#[derive(Debug, Default, Clone)]
pub struct MemorySettings {
    values: BTreeMap<String, String>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    fn flush(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Settings persisted as a flat JSON object of strings.
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    values: BTreeMap<String, String>,
    dirty: bool,
}

impl JsonFileSettings {
    /// Load the store at `path`. A missing file gives an empty store.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let values = match fs::read_to_string(path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| EngineError::SettingsFormat {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No settings file yet");
                BTreeMap::new()
            }
            Err(e) => {
                return Err(EngineError::Settings {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Ok(JsonFileSettings {
            path: path.to_path_buf(),
            values,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        if self.values.get(key).map(String::as_str) != Some(value) {
            self.values.insert(key.to_string(), value.to_string());
            self.dirty = true;
        }
    }

    fn remove(&mut self, key: &str) {
        if self.values.remove(key).is_some() {
            self.dirty = true;
        }
    }

    fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    /// Write to a sibling temporary file, then rename over the store.
    fn flush(&mut self) -> Result<(), EngineError> {
        if !self.dirty {
            return Ok(());
        }
        let io_err = |source: io::Error| EngineError::Settings {
            path: self.path.clone(),
            source,
        };
        let raw = serde_json::to_string_pretty(&self.values).map_err(|e| EngineError::SettingsFormat {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        fs::write(&temp, raw).map_err(io_err)?;
        fs::rename(&temp, &self.path).map_err(io_err)?;
        self.dirty = false;
        debug!(path = %self.path.display(), "Settings saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_settings_basic_ops() {
        let mut store = MemorySettings::new();
        assert!(store.get("a").is_none());
        store.set("a", "1");
        store.set("b", "2");
        assert_eq!(store.get("a").as_deref(), Some("1"));
        assert_eq!(store.keys(), vec!["a".to_string(), "b".to_string()]);
        store.remove("a");
        assert!(store.get("a").is_none());
        store.flush().expect("Memory flush never fails");
    }

    #[test]
    fn test_path_lists() {
        let mut store = MemorySettings::new();
        let paths = vec![PathBuf::from("/media/card"), PathBuf::from("/mnt/backup a")];
        store.set_paths(SOURCES_KEY, &paths);
        assert_eq!(store.get_paths(SOURCES_KEY), paths);

        store.set(DESTINATIONS_KEY, "not json");
        assert!(store.get_paths(DESTINATIONS_KEY).is_empty());
    }

    #[test]
    fn test_json_settings_round_trip_on_disk() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("conf").join("offload.json");

        let mut store = JsonFileSettings::open(&path).expect("Missing file is an empty store");
        assert!(store.keys().is_empty());
        store.set("digest.algorithm", "md5");
        store.flush().expect("Failed to flush");
        assert!(path.exists());

        let reopened = JsonFileSettings::open(&path).expect("Failed to reopen");
        assert_eq!(reopened.get("digest.algorithm").as_deref(), Some("md5"));
    }

    #[test]
    fn test_json_settings_rejects_garbage() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("offload.json");
        fs::write(&path, "[1, 2").expect("Failed to write file");
        let err = JsonFileSettings::open(&path).expect_err("Must fail");
        assert!(matches!(err, EngineError::SettingsFormat { .. }));
    }
}
