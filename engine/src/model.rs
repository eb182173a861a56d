//! Core data model for copy sessions.
//!
//! This module defines the per-source-file bookkeeping shared by the copy and
//! verification passes:
//! - SourceFile: one scanned source file and what is known about its copies
//! - FileStatus / StatusReport: the aggregate state shown to the operator
//! - IntegrityVerdict: the published outcome of the verification pass
//! - StatusSummary: counts and sizes per status at the end of a run

use crate::checksums::{ChecksumAlgorithm, ChecksumValue};
use crate::destination::{DestinationRoot, DestinationSlot};
use crate::error::CopyError;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::{debug, warn};
use uuid::Uuid;

/// The aggregate state of a source file across all destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FileStatus {
    /// No destination holds a copy yet
    NotStarted,
    /// Some destinations hold a valid copy, others don't
    PartialDone,
    /// Every destination holds a same-size copy
    AllCopiesDone,
    /// A copy error was recorded, or a known copy has the wrong size
    ErrorOrIncomplete,
    /// Every copy was re-read and matched the source digest
    IntegrityValid,
    /// At least one copy failed verification
    IntegrityInvalid,
}

impl FileStatus {
    pub const ALL: [FileStatus; 6] = [
        FileStatus::AllCopiesDone,
        FileStatus::IntegrityValid,
        FileStatus::PartialDone,
        FileStatus::ErrorOrIncomplete,
        FileStatus::IntegrityInvalid,
        FileStatus::NotStarted,
    ];

    /// Returns true when the file can be considered safely offloaded.
    pub fn is_complete(&self) -> bool {
        matches!(self, FileStatus::AllCopiesDone | FileStatus::IntegrityValid)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileStatus::NotStarted => write!(f, "not started"),
            FileStatus::PartialDone => write!(f, "partial"),
            FileStatus::AllCopiesDone => write!(f, "all copies done"),
            FileStatus::ErrorOrIncomplete => write!(f, "error/incomplete"),
            FileStatus::IntegrityValid => write!(f, "integrity valid"),
            FileStatus::IntegrityInvalid => write!(f, "integrity invalid"),
        }
    }
}

/// Published result of the verification pass for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IntegrityVerdict {
    NotChecked,
    AllValid,
    HasInvalid,
}

/// A copy found on a destination for this source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedFileRef {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug)]
struct FileState {
    last_copy_error: Option<CopyError>,
    digest: Option<ChecksumValue>,
    copies: HashMap<Uuid, CopiedFileRef>,
    destination_count: usize,
    integrity: IntegrityVerdict,
}

/// One file discovered under a source root.
///
/// Identity fields are fixed at scan time. The copy and verification passes
/// record the digest, the last copy error, the known copies and the integrity
/// verdict through interior mutability, since a file is shared between the
/// engine's worker threads and the caller.
#[derive(Debug)]
pub struct SourceFile {
    id: Uuid,
    path: PathBuf,
    source_root: PathBuf,
    relative_path: PathBuf,
    size: u64,
    modified: Option<SystemTime>,
    volume_id: String,
    state: Mutex<FileState>,
}

impl SourceFile {
    /// Build a file record. `path` must live under `source_root`; otherwise the
    /// file name alone is used as the relative path.
    pub fn new(
        source_root: &Path,
        path: &Path,
        size: u64,
        modified: Option<SystemTime>,
        volume_id: &str,
    ) -> Self {
        let relative_path = path
            .strip_prefix(source_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.file_name().map(PathBuf::from).unwrap_or_default());

        SourceFile {
            id: Uuid::new_v4(),
            path: path.to_path_buf(),
            source_root: source_root.to_path_buf(),
            relative_path,
            size,
            modified,
            volume_id: volume_id.to_string(),
            state: Mutex::new(FileState {
                last_copy_error: None,
                digest: None,
                copies: HashMap::new(),
                destination_count: 0,
                integrity: IntegrityVerdict::NotChecked,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn relative_path(&self) -> &Path {
        &self.relative_path
    }

    /// Relative path with forward slashes, as written in checksum lists.
    pub fn relative_posix(&self) -> String {
        self.relative_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    pub fn digest(&self) -> Option<ChecksumValue> {
        self.state().digest.clone()
    }

    pub(crate) fn set_digest(&self, digest: ChecksumValue) {
        debug!(path = %self.path.display(), algorithm = %digest.algorithm(), digest = %digest, "Computed source digest");
        self.state().digest = Some(digest);
    }

    pub fn last_copy_error(&self) -> Option<CopyError> {
        self.state().last_copy_error.clone()
    }

    pub(crate) fn set_copy_error(&self, error: CopyError) {
        self.state().last_copy_error = Some(error);
    }

    /// Reset the per-session fields before a new copy attempt.
    pub(crate) fn begin_copy_session(&self) {
        let mut state = self.state();
        state.last_copy_error = None;
        state.integrity = IntegrityVerdict::NotChecked;
    }

    pub fn integrity(&self) -> IntegrityVerdict {
        self.state().integrity
    }

    /// Publish the aggregate verification verdict.
    ///
    /// Returns `true` when the verdict was newly set. Setting the same verdict
    /// twice is a no-op.
    ///
    /// # Panics
    /// Publishing a different verdict over an already published one breaks the
    /// aggregation invariant and is treated as a programming error.
    pub(crate) fn publish_integrity(&self, verdict: IntegrityVerdict) -> bool {
        let mut state = self.state();
        if state.integrity != IntegrityVerdict::NotChecked {
            assert!(
                state.integrity == verdict,
                "Can't update twice integrity status for {} ({:?} is not {:?})",
                self.path.display(),
                state.integrity,
                verdict
            );
            return false;
        }
        state.integrity = verdict;
        true
    }

    /// Copies currently known, keyed by destination id.
    pub fn copies(&self) -> HashMap<Uuid, CopiedFileRef> {
        self.state().copies.clone()
    }

    /// Re-discover the copies of this file on every destination.
    ///
    /// A candidate counts as a copy when its length matches the source and,
    /// for files smaller than `small_file_threshold`, its CRC32 matches too.
    /// Returns `false` when the source file no longer exists (the caller should
    /// drop it from the working set).
    pub fn refresh_copies(&self, destinations: &[Arc<DestinationRoot>], small_file_threshold: u64) -> bool {
        if !self.path.is_file() {
            return false;
        }

        let mut source_crc: Option<Option<ChecksumValue>> = None;
        let mut found = HashMap::new();

        for destination in destinations {
            let candidates = destination.search_copy_presence(&self.volume_id, &self.relative_path);
            let copy = candidates.into_iter().find_map(|candidate| {
                let len = std::fs::metadata(&candidate).ok()?.len();
                if len != self.size {
                    return None;
                }
                if self.size < small_file_threshold {
                    let expected = source_crc
                        .get_or_insert_with(|| small_file_crc(&self.path))
                        .clone()?;
                    let actual = small_file_crc(&candidate)?;
                    if actual != expected {
                        debug!(candidate = %candidate.display(), "Same size but different CRC32, ignoring");
                        return None;
                    }
                }
                Some(CopiedFileRef { path: candidate, size: len })
            });
            if let Some(copy) = copy {
                found.insert(destination.id(), copy);
            }
        }

        let mut state = self.state();
        state.copies = found;
        state.destination_count = destinations.len();
        true
    }

    /// True while at least one destination lacks a copy.
    pub fn needs_copy(&self) -> bool {
        let state = self.state();
        state.copies.is_empty() || state.copies.len() != state.destination_count
    }

    /// Session slots of the destinations that do not hold a copy yet.
    pub fn pending_slots(&self, destinations: &[Arc<DestinationRoot>]) -> Vec<Arc<DestinationSlot>> {
        let state = self.state();
        destinations
            .iter()
            .filter(|destination| !state.copies.contains_key(&destination.id()))
            .filter_map(|destination| destination.current_slot())
            .collect()
    }

    /// Aggregate status derived from the current state.
    pub fn status(&self) -> FileStatus {
        self.report().status
    }

    /// Status plus the numbers needed to render it.
    pub fn report(&self) -> StatusReport {
        let state = self.state();
        let copies_done = state.copies.len();
        let destinations = state.destination_count;
        let wrong_size = state.copies.values().filter(|c| c.size != self.size).count();

        let status = if state.last_copy_error.is_some() {
            FileStatus::ErrorOrIncomplete
        } else if state.copies.is_empty() {
            FileStatus::NotStarted
        } else if state.integrity != IntegrityVerdict::NotChecked {
            if state.integrity == IntegrityVerdict::AllValid {
                FileStatus::IntegrityValid
            } else {
                FileStatus::IntegrityInvalid
            }
        } else if wrong_size > 0 {
            FileStatus::ErrorOrIncomplete
        } else if copies_done == destinations {
            FileStatus::AllCopiesDone
        } else {
            FileStatus::PartialDone
        };

        StatusReport {
            status,
            copies_done,
            destinations,
            copies_with_wrong_size: wrong_size,
            error: state.last_copy_error.as_ref().map(|e| e.to_string()),
        }
    }
}

impl fmt::Display for SourceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

fn small_file_crc(path: &Path) -> Option<ChecksumValue> {
    match crate::checksums::compute_file_checksum(path, ChecksumAlgorithm::Crc32) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Can't compute CRC32");
            None
        }
    }
}

/// What the status-changed notification carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub status: FileStatus,
    pub copies_done: usize,
    pub destinations: usize,
    pub copies_with_wrong_size: usize,
    pub error: Option<String>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            FileStatus::NotStarted => write!(f, "New"),
            FileStatus::PartialDone => write!(
                f,
                "Partial: {}/{} destinations done",
                self.copies_done, self.destinations
            ),
            FileStatus::AllCopiesDone => write!(f, "Done ({} copies)", self.copies_done),
            FileStatus::IntegrityValid => write!(f, "Done and checked ({} copies)", self.copies_done),
            FileStatus::IntegrityInvalid => write!(f, "corrupted ({} copies)", self.copies_done),
            FileStatus::ErrorOrIncomplete => match &self.error {
                Some(message) => write!(f, "error: {}", message),
                None => write!(
                    f,
                    "{} copies with errors, {}/{} destinations done",
                    self.copies_with_wrong_size, self.copies_done, self.destinations
                ),
            },
        }
    }
}

/// Files and bytes per status, presented at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    counts: HashMap<FileStatus, (usize, u64)>,
}

impl StatusSummary {
    pub fn from_files<'a>(files: impl IntoIterator<Item = &'a Arc<SourceFile>>) -> Self {
        let mut counts: HashMap<FileStatus, (usize, u64)> = HashMap::new();
        for file in files {
            let entry = counts.entry(file.status()).or_default();
            entry.0 += 1;
            entry.1 += file.size();
        }
        StatusSummary { counts }
    }

    pub fn count(&self, status: FileStatus) -> usize {
        self.counts.get(&status).map(|c| c.0).unwrap_or(0)
    }

    pub fn bytes(&self, status: FileStatus) -> u64 {
        self.counts.get(&status).map(|c| c.1).unwrap_or(0)
    }

    pub fn total_files(&self) -> usize {
        self.counts.values().map(|c| c.0).sum()
    }

    /// True when every file is safely offloaded.
    pub fn all_complete(&self) -> bool {
        FileStatus::ALL
            .iter()
            .filter(|s| !s.is_complete())
            .all(|s| self.count(*s) == 0)
    }
}

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for status in FileStatus::ALL {
            let count = self.count(status);
            if count == 0 {
                continue;
            }
            writeln!(
                f,
                "{}: {} file(s), {}",
                status,
                count,
                crate::stats::format_bytes(self.bytes(status))
            )?;
        }
        Ok(())
    }
}
