//! Copy statistics.
//!
//! `CopyStat` tracks one file being copied; `GlobalCopyStat` folds every
//! `CopyStat` of a batch into a `ProgressSnapshot` for progress callbacks.
//! Speeds are expressed in bytes per second.

use crate::destination::DestinationRoot;
use crate::error::CopyError;
use crate::model::SourceFile;
use crate::progress::ProgressCallback;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Format bytes as human-readable string (e.g., "1.23 MB")
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Format duration as human-readable string (e.g., "1h 2m 3s")
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Format duration as `HH:MM:SS`.
pub fn format_clock(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Bytes per second, 0 when no time elapsed.
pub fn bytes_per_second(bytes: u64, elapsed: Duration) -> u64 {
    let nanos = elapsed.as_nanos();
    if nanos == 0 {
        return 0;
    }
    (bytes as u128 * 1_000_000_000 / nanos).min(u64::MAX as u128) as u64
}

fn eta_for(remaining: u64, mean_speed: u64) -> Option<Duration> {
    if mean_speed == 0 {
        return None;
    }
    Some(Duration::from_millis(remaining.saturating_mul(1000) / mean_speed) + Duration::from_secs(1))
}

/// Point-in-time view of one file's copy.
#[derive(Debug, Clone, PartialEq)]
pub struct FileProgress {
    pub source_size: u64,
    pub read_bytes: u64,
    pub started: bool,
    pub done: bool,
    pub mean_speed: u64,
    pub instant_speed: u64,
    pub eta: Option<Duration>,
    pub last_error: Option<CopyError>,
}

impl FileProgress {
    pub fn ratio(&self) -> f64 {
        if self.source_size == 0 {
            return if self.done { 1.0 } else { 0.0 };
        }
        self.read_bytes as f64 / self.source_size as f64
    }
}

#[derive(Debug, Default)]
struct StatState {
    started: Option<Instant>,
    last_update: Option<Instant>,
    ended: Option<Instant>,
    total_read: u64,
    last_loop_bytes: u64,
    last_loop_duration: Duration,
    last_error: Option<CopyError>,
}

/// Progress of a single file copy.
///
/// Written by the reading thread, read by the progress timer.
#[derive(Debug)]
pub struct CopyStat {
    source_size: u64,
    state: Mutex<StatState>,
}

impl CopyStat {
    pub fn new(source_size: u64) -> Self {
        CopyStat {
            source_size,
            state: Mutex::new(StatState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, StatState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn source_size(&self) -> u64 {
        self.source_size
    }

    pub(crate) fn on_start(&self) {
        let now = Instant::now();
        let mut state = self.state();
        state.started = Some(now);
        state.last_update = Some(now);
    }

    /// Record one read loop of `bytes` that took `elapsed`.
    pub(crate) fn on_read_loop(&self, bytes: u64, elapsed: Duration) {
        let mut state = self.state();
        state.total_read += bytes;
        state.last_loop_bytes = bytes;
        state.last_loop_duration = elapsed;
        state.last_update = Some(Instant::now());
    }

    pub(crate) fn on_end(&self) {
        let now = Instant::now();
        let mut state = self.state();
        state.ended = Some(now);
        state.last_update = Some(now);
    }

    pub(crate) fn set_last_error(&self, error: CopyError) {
        self.state().last_error = Some(error);
    }

    pub fn last_error(&self) -> Option<CopyError> {
        self.state().last_error.clone()
    }

    pub fn total_read(&self) -> u64 {
        self.state().total_read
    }

    pub fn is_started(&self) -> bool {
        self.state().started.is_some()
    }

    pub fn is_waiting(&self) -> bool {
        !self.is_started()
    }

    /// Done once every byte has been read or an error was recorded.
    pub fn is_done(&self) -> bool {
        let state = self.state();
        state.total_read == self.source_size || state.last_error.is_some()
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.state().started
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.state().last_update
    }

    pub fn ended_at(&self) -> Option<Instant> {
        self.state().ended
    }

    /// Speed over the last read loop.
    pub fn instant_speed(&self) -> u64 {
        let state = self.state();
        bytes_per_second(state.last_loop_bytes, state.last_loop_duration)
    }

    /// Speed since the copy started.
    pub fn mean_speed(&self) -> u64 {
        let state = self.state();
        Self::mean_speed_of(&state)
    }

    fn mean_speed_of(state: &StatState) -> u64 {
        match (state.started, state.last_update) {
            (Some(start), Some(last)) => bytes_per_second(state.total_read, last.duration_since(start)),
            _ => 0,
        }
    }

    /// Remaining time from the mean speed, plus one second.
    pub fn eta(&self) -> Option<Duration> {
        let state = self.state();
        eta_for(
            self.source_size.saturating_sub(state.total_read),
            Self::mean_speed_of(&state),
        )
    }

    pub fn snapshot(&self) -> FileProgress {
        let state = self.state();
        let mean_speed = Self::mean_speed_of(&state);
        FileProgress {
            source_size: self.source_size,
            read_bytes: state.total_read,
            started: state.started.is_some(),
            done: state.total_read == self.source_size || state.last_error.is_some(),
            mean_speed,
            instant_speed: bytes_per_second(state.last_loop_bytes, state.last_loop_duration),
            eta: eta_for(self.source_size.saturating_sub(state.total_read), mean_speed),
            last_error: state.last_error.clone(),
        }
    }
}

/// Write speed observed on one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationSpeed {
    pub root: PathBuf,
    pub bytes_per_second: u64,
}

/// Aggregate progress of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Ratio of bytes read over the batch total, in `[0, 1]`
    pub progress: f64,
    pub files_done: usize,
    pub files_total: usize,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
    pub mean_speed: u64,
    /// Instant speed of the file being copied
    pub instant_speed: u64,
    pub current_file: Option<PathBuf>,
    pub destination_speeds: Vec<DestinationSpeed>,
}

/// Roll-up of every `CopyStat` in a batch.
#[derive(Debug)]
pub struct GlobalCopyStat {
    entries: Vec<(Arc<SourceFile>, Arc<CopyStat>)>,
    destinations: Vec<Arc<DestinationRoot>>,
    total_bytes: u64,
}

impl GlobalCopyStat {
    pub fn new(entries: Vec<(Arc<SourceFile>, Arc<CopyStat>)>, destinations: Vec<Arc<DestinationRoot>>) -> Self {
        let total_bytes = entries.iter().map(|(_, stat)| stat.source_size()).sum();
        GlobalCopyStat {
            entries,
            destinations,
            total_bytes,
        }
    }

    pub fn entries(&self) -> &[(Arc<SourceFile>, Arc<CopyStat>)] {
        &self.entries
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// The first started file that is neither done nor ended. A file
    /// abandoned on stop is ended without being done.
    pub fn current(&self) -> Option<&(Arc<SourceFile>, Arc<CopyStat>)> {
        self.entries
            .iter()
            .find(|(_, stat)| stat.is_started() && !stat.is_done() && stat.ended_at().is_none())
    }

    /// Latest update minus earliest start over all started files.
    pub fn elapsed(&self) -> Duration {
        let start = self.entries.iter().filter_map(|(_, s)| s.started_at()).min();
        let last = self.entries.iter().filter_map(|(_, s)| s.last_update()).max();
        match (start, last) {
            (Some(start), Some(last)) => last.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let bytes_done: u64 = self.entries.iter().map(|(_, s)| s.total_read()).sum();
        let files_done = self.entries.iter().filter(|(_, s)| s.is_done()).count();
        let elapsed = self.elapsed();
        let mean_speed = bytes_per_second(bytes_done, elapsed);

        let progress = if self.total_bytes == 0 {
            if files_done == self.entries.len() { 1.0 } else { 0.0 }
        } else {
            (bytes_done as f64 / self.total_bytes as f64).min(1.0)
        };

        let current = self.current();

        ProgressSnapshot {
            progress,
            files_done,
            files_total: self.entries.len(),
            bytes_done,
            bytes_total: self.total_bytes,
            elapsed,
            eta: eta_for(self.total_bytes.saturating_sub(bytes_done), mean_speed),
            mean_speed,
            instant_speed: current.map(|(_, s)| s.instant_speed()).unwrap_or(0),
            current_file: current.map(|(f, _)| f.path().to_path_buf()),
            destination_speeds: self
                .destinations
                .iter()
                .map(|d| DestinationSpeed {
                    root: d.root().to_path_buf(),
                    bytes_per_second: d.counters().speed(),
                })
                .collect(),
        }
    }

    /// Refresh destination speeds and push a snapshot to `callback`.
    pub fn publish(&self, callback: &dyn ProgressCallback) {
        for destination in &self.destinations {
            destination.counters().refresh_speed();
        }
        callback.on_progress(&self.snapshot());
        if let Some((file, stat)) = self.current() {
            callback.on_file_progress(file, &stat.snapshot());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn entry(name: &str, size: u64) -> (Arc<SourceFile>, Arc<CopyStat>) {
        let root = Path::new("/card");
        let file = Arc::new(SourceFile::new(root, &root.join(name), size, None, "CARD"));
        (file, Arc::new(CopyStat::new(size)))
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 2m 3s");
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_clock(Duration::from_secs(3723)), "01:02:03");
    }

    #[test]
    fn test_bytes_per_second() {
        assert_eq!(bytes_per_second(1000, Duration::from_millis(500)), 2000);
        assert_eq!(bytes_per_second(1000, Duration::ZERO), 0);
    }

    #[test]
    fn test_copy_stat_lifecycle() {
        let stat = CopyStat::new(10_000);
        assert!(stat.is_waiting());
        assert!(!stat.is_done());

        stat.on_start();
        stat.on_read_loop(4_000, Duration::from_millis(100));
        assert!(stat.is_started());
        assert!(!stat.is_done());
        assert_eq!(stat.instant_speed(), 40_000);

        stat.on_read_loop(6_000, Duration::from_millis(100));
        stat.on_end();
        assert!(stat.is_done());
        assert_eq!(stat.total_read(), 10_000);
        assert!(stat.ended_at().is_some());
    }

    #[test]
    fn test_error_marks_stat_done() {
        let stat = CopyStat::new(10_000);
        stat.on_start();
        stat.set_last_error(CopyError::MissingCopy {
            path: "/x".into(),
        });
        assert!(stat.is_done());
        assert!(stat.snapshot().last_error.is_some());
    }

    #[test]
    fn test_eta_adds_one_second() {
        assert_eq!(eta_for(2_000, 1_000), Some(Duration::from_secs(3)));
        assert_eq!(eta_for(2_000, 0), None);
    }

    #[test]
    fn test_global_stat_rollup() {
        let a = entry("a.mov", 100);
        let b = entry("b.mov", 300);
        let global = GlobalCopyStat::new(vec![a.clone(), b.clone()], Vec::new());
        assert_eq!(global.total_bytes(), 400);
        assert_eq!(global.snapshot().progress, 0.0);
        assert!(global.current().is_none());

        a.1.on_start();
        a.1.on_read_loop(100, Duration::from_millis(10));
        a.1.on_end();
        b.1.on_start();
        b.1.on_read_loop(100, Duration::from_millis(10));

        let snapshot = global.snapshot();
        assert_eq!(snapshot.files_done, 1);
        assert_eq!(snapshot.bytes_done, 200);
        assert_eq!(snapshot.progress, 0.5);
        assert_eq!(snapshot.current_file.as_deref(), Some(Path::new("/card/b.mov")));
    }

    #[test]
    fn test_abandoned_file_is_not_current() {
        let a = entry("a.mov", 10_000);
        let b = entry("b.mov", 10_000);
        let global = GlobalCopyStat::new(vec![a.clone(), b], Vec::new());

        a.1.on_start();
        a.1.on_read_loop(4_000, Duration::from_millis(10));
        assert_eq!(global.snapshot().current_file.as_deref(), Some(Path::new("/card/a.mov")));

        // Stop request: the reader gives up after a short read
        a.1.on_end();
        assert!(!a.1.is_done());
        assert!(global.current().is_none());
        let snapshot = global.snapshot();
        assert_eq!(snapshot.current_file, None);
        assert_eq!(snapshot.instant_speed, 0);
        assert_eq!(snapshot.files_done, 0);
    }

    #[test]
    fn test_empty_batch_is_complete() {
        let global = GlobalCopyStat::new(Vec::new(), Vec::new());
        let snapshot = global.snapshot();
        assert_eq!(snapshot.progress, 1.0);
        assert_eq!(snapshot.elapsed, Duration::ZERO);
    }
}
