//! Engine configuration.

use crate::checksums::ChecksumAlgorithm;
use crate::error::EngineError;
use crate::settings::SettingsStore;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Size of each of the two copy buffers (64 MiB).
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 256 * 256 * 256 * 4;
/// Read size used when verifying copies.
pub const DEFAULT_INTEGRITY_CHUNK_SIZE: usize = 4096;
/// Files below this size are matched by CRC32 as well as by length.
pub const DEFAULT_SMALL_FILE_THRESHOLD: u64 = 30_000;
/// Appended to a copy's final name while it is being written.
pub const DEFAULT_TEMP_SUFFIX: &str = "-oncopy";

const KEY_ALGORITHM: &str = "digest.algorithm";
const KEY_COPY_BUFFER: &str = "copy.buffer_size";
const KEY_INTEGRITY_CHUNK: &str = "integrity.chunk_size";
const KEY_PROGRESS_INTERVAL: &str = "progress.interval_ms";
const KEY_SMALL_FILE: &str = "copy.small_file_threshold";
const KEY_TEMP_SUFFIX: &str = "copy.temp_suffix";
const KEY_SYNC: &str = "copy.sync_on_close";
const KEY_SLOT_PREFIX: &str = "slot.prefix";

/// Tunables shared by the copy engine and the integrity checker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Digest computed while copying and checked during verification
    pub algorithm: ChecksumAlgorithm,
    pub copy_buffer_size: usize,
    pub integrity_chunk_size: usize,
    pub progress_interval_ms: u64,
    pub small_file_threshold: u64,
    pub temp_suffix: String,
    /// fsync every copy before renaming it into place
    pub sync_on_close: bool,
    /// Prefix of the session slot directory names
    pub slot_prefix: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            algorithm: ChecksumAlgorithm::default(),
            copy_buffer_size: DEFAULT_COPY_BUFFER_SIZE,
            integrity_chunk_size: DEFAULT_INTEGRITY_CHUNK_SIZE,
            progress_interval_ms: 300,
            small_file_threshold: DEFAULT_SMALL_FILE_THRESHOLD,
            temp_suffix: DEFAULT_TEMP_SUFFIX.to_string(),
            sync_on_close: true,
            slot_prefix: None,
        }
    }
}

impl EngineConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Reject values the engines cannot work with.
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |message: &str| {
            Err(EngineError::InvalidConfig {
                message: message.to_string(),
            })
        };
        if self.copy_buffer_size == 0 {
            return invalid("copy buffer size must be positive");
        }
        if self.integrity_chunk_size == 0 {
            return invalid("integrity chunk size must be positive");
        }
        if self.progress_interval_ms == 0 {
            return invalid("progress interval must be positive");
        }
        if self.temp_suffix.is_empty() || self.temp_suffix.contains(['/', '\\']) {
            return invalid("temporary suffix must be a non-empty file name suffix");
        }
        Ok(())
    }

    /// Build a configuration from a settings store. Missing or unparsable
    /// keys keep their default value.
    pub fn from_settings(store: &dyn SettingsStore) -> Self {
        let mut config = EngineConfig::default();
        read_into(store, KEY_ALGORITHM, &mut config.algorithm);
        read_into(store, KEY_COPY_BUFFER, &mut config.copy_buffer_size);
        read_into(store, KEY_INTEGRITY_CHUNK, &mut config.integrity_chunk_size);
        read_into(store, KEY_PROGRESS_INTERVAL, &mut config.progress_interval_ms);
        read_into(store, KEY_SMALL_FILE, &mut config.small_file_threshold);
        read_into(store, KEY_SYNC, &mut config.sync_on_close);
        if let Some(suffix) = store.get(KEY_TEMP_SUFFIX) {
            config.temp_suffix = suffix;
        }
        config.slot_prefix = store.get(KEY_SLOT_PREFIX).filter(|p| !p.is_empty());
        config
    }

    /// Write every field to `store`. Does not flush.
    pub fn store_into(&self, store: &mut dyn SettingsStore) {
        store.set(KEY_ALGORITHM, &self.algorithm.to_string());
        store.set(KEY_COPY_BUFFER, &self.copy_buffer_size.to_string());
        store.set(KEY_INTEGRITY_CHUNK, &self.integrity_chunk_size.to_string());
        store.set(KEY_PROGRESS_INTERVAL, &self.progress_interval_ms.to_string());
        store.set(KEY_SMALL_FILE, &self.small_file_threshold.to_string());
        store.set(KEY_TEMP_SUFFIX, &self.temp_suffix);
        store.set(KEY_SYNC, &self.sync_on_close.to_string());
        match &self.slot_prefix {
            Some(prefix) => store.set(KEY_SLOT_PREFIX, prefix),
            None => store.remove(KEY_SLOT_PREFIX),
        }
    }
}

fn read_into<T>(store: &dyn SettingsStore, key: &str, target: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = store.get(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(e) => warn!(key, value = %raw, error = %e, "Ignoring invalid setting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettings;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.algorithm, ChecksumAlgorithm::Sha256);
        assert_eq!(config.copy_buffer_size, 64 * 1024 * 1024);
        assert_eq!(config.integrity_chunk_size, 4096);
        assert_eq!(config.progress_interval(), Duration::from_millis(300));
        assert_eq!(config.temp_suffix, "-oncopy");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        let config = EngineConfig {
            copy_buffer_size: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig { .. })));
    }

    #[test]
    fn test_settings_round_trip() {
        let config = EngineConfig {
            algorithm: ChecksumAlgorithm::Blake3,
            copy_buffer_size: 1 << 20,
            slot_prefix: Some("wedding".to_string()),
            sync_on_close: false,
            ..EngineConfig::default()
        };
        let mut store = MemorySettings::new();
        config.store_into(&mut store);
        assert_eq!(EngineConfig::from_settings(&store), config);
    }

    #[test]
    fn test_bad_setting_keeps_default() {
        let mut store = MemorySettings::new();
        store.set("copy.buffer_size", "lots");
        store.set("digest.algorithm", "MD5");
        let config = EngineConfig::from_settings(&store);
        assert_eq!(config.copy_buffer_size, DEFAULT_COPY_BUFFER_SIZE);
        assert_eq!(config.algorithm, ChecksumAlgorithm::Md5);
    }

    #[test]
    fn test_serde_fills_missing_fields() {
        let config: EngineConfig = serde_json::from_str(r#"{"algorithm":"crc32"}"#).unwrap();
        assert_eq!(config.algorithm, ChecksumAlgorithm::Crc32);
        assert_eq!(config.temp_suffix, "-oncopy");
    }
}
