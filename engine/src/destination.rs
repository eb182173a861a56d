//! Destinations and session slots.
//!
//! A `DestinationRoot` is a backup location chosen by the operator. Every run
//! writes into a fresh session slot directory below it, laid out as
//! `<root>/<slot>/<volume-id>/<relative-path>`. The slot also receives a plain
//! text history log and one checksum list per digest algorithm.

use crate::checksums::{format_sum_line, ChecksumValue};
use crate::error::EngineError;
use crate::fs_ops;
use crate::stats::{bytes_per_second, format_bytes, format_clock};
use chrono::Local;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Name of the history log written in each slot.
pub const HISTORY_FILE_NAME: &str = "history.log";

/// Bytes and time spent writing to one destination, shared by all its slots.
#[derive(Debug, Default)]
pub struct WriteCounters {
    bytes: AtomicU64,
    nanos: AtomicU64,
    speed: AtomicU64,
}

impl WriteCounters {
    pub(crate) fn record(&self, bytes: u64, elapsed: Duration) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn copied_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn write_time(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Relaxed))
    }

    /// Recompute the write speed from the counters and return it.
    pub fn refresh_speed(&self) -> u64 {
        let speed = bytes_per_second(self.copied_bytes(), self.write_time());
        self.speed.store(speed, Ordering::Relaxed);
        speed
    }

    /// Write speed as of the last refresh, in bytes per second.
    pub fn speed(&self) -> u64 {
        self.speed.load(Ordering::Relaxed)
    }
}

/// A backup root directory.
#[derive(Debug)]
pub struct DestinationRoot {
    id: Uuid,
    root: PathBuf,
    counters: Arc<WriteCounters>,
    current_slot: Mutex<Option<Arc<DestinationSlot>>>,
}

impl DestinationRoot {
    pub fn new(root: &Path) -> Self {
        DestinationRoot {
            id: Uuid::new_v4(),
            root: root.to_path_buf(),
            counters: Arc::new(WriteCounters::default()),
            current_slot: Mutex::new(None),
        }
    }

    fn slot_guard(&self) -> MutexGuard<'_, Option<Arc<DestinationSlot>>> {
        self.current_slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn counters(&self) -> &Arc<WriteCounters> {
        &self.counters
    }

    /// Slot receiving this run's copies, if one was prepared.
    pub fn current_slot(&self) -> Option<Arc<DestinationSlot>> {
        self.slot_guard().clone()
    }

    /// Use an existing directory as the current slot.
    pub fn use_slot(&self, dir: &Path) -> Result<Arc<DestinationSlot>, EngineError> {
        fs::create_dir_all(dir).map_err(|e| EngineError::SlotCreationFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let slot = Arc::new(DestinationSlot::new(self, dir.to_path_buf()));
        *self.slot_guard() = Some(Arc::clone(&slot));
        Ok(slot)
    }

    /// Create a new timestamped slot directory and make it current.
    ///
    /// The name is `<prefix>-YYYYMMDD-HHMMSS`, or just the timestamp when the
    /// prefix is empty. A `-2`, `-3`... suffix is appended on collision.
    pub fn prepare_session_slot(&self, prefix: Option<&str>) -> Result<Arc<DestinationSlot>, EngineError> {
        fs::create_dir_all(&self.root).map_err(|e| EngineError::SlotCreationFailed {
            path: self.root.clone(),
            source: e,
        })?;

        let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
        let base = match prefix.map(sanitize_slot_prefix) {
            Some(p) if !p.is_empty() => format!("{}-{}", p, stamp),
            _ => stamp,
        };

        let mut attempt = 1;
        loop {
            let name = if attempt == 1 {
                base.clone()
            } else {
                format!("{}-{}", base, attempt)
            };
            let dir = self.root.join(&name);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    info!(slot = %dir.display(), "Prepared session slot");
                    let slot = Arc::new(DestinationSlot::new(self, dir));
                    *self.slot_guard() = Some(Arc::clone(&slot));
                    return Ok(slot);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => {
                    return Err(EngineError::SlotCreationFailed { path: dir, source: e });
                }
            }
        }
    }

    /// Space available on the filesystem holding this root.
    pub fn available_space(&self) -> Result<u64, EngineError> {
        fs_ops::available_space(&self.root).map_err(|e| EngineError::DestinationAccessDenied {
            path: self.root.clone(),
            source: e,
        })
    }

    /// Every `<root>/<slot>/<volume_id>/<relative>` that exists as a file.
    pub fn search_copy_presence(&self, volume_id: &str, relative: &Path) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(root = %self.root.display(), error = %e, "Can't list destination");
                return Vec::new();
            }
        };
        let mut found: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|entry| entry.path().join(volume_id).join(relative))
            .filter(|candidate| candidate.is_file())
            .collect();
        found.sort();
        found
    }
}

fn sanitize_slot_prefix(prefix: &str) -> String {
    prefix
        .trim()
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
        .collect()
}

/// A session directory under a destination root.
#[derive(Debug)]
pub struct DestinationSlot {
    id: Uuid,
    dir: PathBuf,
    destination_id: Uuid,
    destination_root: PathBuf,
    counters: Arc<WriteCounters>,
    log_lock: Mutex<()>,
}

impl DestinationSlot {
    fn new(destination: &DestinationRoot, dir: PathBuf) -> Self {
        DestinationSlot {
            id: Uuid::new_v4(),
            dir,
            destination_id: destination.id,
            destination_root: destination.root.clone(),
            counters: Arc::clone(&destination.counters),
            log_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn destination_id(&self) -> Uuid {
        self.destination_id
    }

    pub fn destination_root(&self) -> &Path {
        &self.destination_root
    }

    pub fn counters(&self) -> &Arc<WriteCounters> {
        &self.counters
    }

    /// Directory holding the copies of one source volume.
    pub fn volume_dir(&self, volume_id: &str) -> PathBuf {
        self.dir.join(volume_id)
    }

    /// Final path of a copy.
    pub fn make_path(&self, volume_id: &str, relative: &Path) -> PathBuf {
        self.volume_dir(volume_id).join(relative)
    }

    /// Path of `path` relative to the slot, with forward slashes.
    pub fn relative_to_slot(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.dir).ok()?;
        Some(
            relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/"),
        )
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE_NAME)
    }

    fn append(&self, file: &Path, text: &str) -> io::Result<()> {
        let _guard = self.log_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut out = OpenOptions::new().create(true).append(true).open(file)?;
        out.write_all(text.as_bytes())
    }

    /// Append one timestamped line to the history log. Failures are logged
    /// and otherwise ignored.
    pub(crate) fn log_history(&self, text: &str) {
        let stamp = Local::now().format("%Y/%m/%d %H:%M:%S,%3f");
        let line = format!("{}\t{}\n", stamp, text);
        if let Err(e) = self.append(&self.history_path(), &line) {
            warn!(slot = %self.dir.display(), error = %e, "Can't write history log");
        }
    }

    pub(crate) fn log_copy_start(&self, source: &Path, size: u64, target: &Path) {
        self.log_history(&format!(
            "Start copy \"{}\" ({} bytes) to \"{}\"",
            source.display(),
            size,
            target.display()
        ));
    }

    pub(crate) fn log_copy_done(&self, target: &Path) {
        self.log_history(&format!("Copy done \"{}\"", target.display()));
    }

    pub(crate) fn log_copy_failed(&self, target: &Path, reason: &str) {
        self.log_history(&format!("Copy failed \"{}\": {}", target.display(), reason));
    }

    /// Summary line for a whole run. Skipped for empty or instant runs.
    pub(crate) fn log_run_summary(&self, bytes: u64, elapsed: Duration) {
        if bytes < 1 || elapsed.as_millis() < 1 {
            return;
        }
        self.log_history(&format!(
            "Total copy {} bytes ({}) in {} ({}/sec)",
            bytes,
            format_bytes(bytes),
            format_clock(elapsed),
            format_bytes(bytes_per_second(bytes, elapsed))
        ));
    }

    /// Append `digest  relative/path` to this slot's checksum list.
    pub(crate) fn append_checksum(&self, copied: &Path, digest: &ChecksumValue) -> io::Result<()> {
        let relative = self.relative_to_slot(copied).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is outside of slot {}", copied.display(), self.dir.display()),
            )
        })?;
        let list = self.dir.join(digest.algorithm().sum_file_name());
        self.append(&list, &format_sum_line(digest.hex(), &relative))
    }
}

impl PartialEq for DestinationSlot {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DestinationSlot {}
