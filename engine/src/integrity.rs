//! Verification pass.
//!
//! Every copy listed in a batch's `CopyResult`s is re-read from disk and its
//! digest compared with the source digest recorded during the copy. One task
//! runs per session slot so that each destination device is read
//! sequentially, and slots are checked in parallel.
//!
//! Once every copy of a file has a verdict, the aggregate verdict is published
//! on the `SourceFile` exactly once.

use crate::checksums::compute_file_checksum_until;
use crate::config::EngineConfig;
use crate::copy_op::CopyResult;
use crate::destination::DestinationSlot;
use crate::error::EngineError;
use crate::model::{IntegrityVerdict, SourceFile};
use crate::progress::ProgressCallback;
use crate::stop::{RunControl, StopCallback, Stoppable};
use crossbeam_channel::Receiver;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tracing::{debug, error, info};

/// Verdict on one copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CopyCheckState {
    NotChecked,
    Valid,
    Invalid,
}

struct FileChecks {
    file: Arc<SourceFile>,
    states: Mutex<Vec<CopyCheckState>>,
}

impl FileChecks {
    fn states(&self) -> MutexGuard<'_, Vec<CopyCheckState>> {
        self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct CheckItem {
    checks: Arc<FileChecks>,
    index: usize,
    path: PathBuf,
}

type SlotQueue = (Arc<DestinationSlot>, Vec<CheckItem>);

/// Outcome of a verification pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub valid_files: usize,
    pub invalid_files: usize,
    pub unchecked_files: usize,
    /// Copies that failed verification
    pub invalid_copies: Vec<PathBuf>,
    pub stopped: bool,
}

impl IntegrityReport {
    /// True when every file was checked and found valid.
    pub fn is_clean(&self) -> bool {
        self.invalid_files == 0 && self.unchecked_files == 0
    }
}

struct CheckerInner {
    queues: Mutex<Option<Vec<SlotQueue>>>,
    files: Vec<Arc<FileChecks>>,
    invalid_copies: Mutex<Vec<PathBuf>>,
    pool: ThreadPool,
    control: RunControl,
    stop: Arc<AtomicBool>,
    chunk_size: usize,
    callback: Arc<dyn ProgressCallback>,
}

/// Re-reads copies and compares digests.
#[derive(Clone)]
pub struct IntegrityChecker {
    inner: Arc<CheckerInner>,
}

/// Handle on a running verification pass.
pub struct IntegrityHandle {
    done: Receiver<()>,
    expected: usize,
    inner: Arc<CheckerInner>,
}

impl IntegrityHandle {
    /// Block until every slot task has returned.
    pub fn wait(self) -> IntegrityReport {
        for _ in 0..self.expected {
            if self.done.recv().is_err() {
                break;
            }
        }
        self.inner.report()
    }
}

impl IntegrityChecker {
    /// Group the copies of `results` by slot. Results without copies are
    /// ignored.
    pub fn new(
        results: &[CopyResult],
        config: &EngineConfig,
        callback: Arc<dyn ProgressCallback>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let mut queues: Vec<SlotQueue> = Vec::new();
        let mut files = Vec::new();
        for result in results.iter().filter(|r| !r.is_empty()) {
            let checks = Arc::new(FileChecks {
                file: Arc::clone(result.file()),
                states: Mutex::new(vec![CopyCheckState::NotChecked; result.copies().len()]),
            });
            for (index, (slot, path)) in result.copies().iter().enumerate() {
                let item = CheckItem {
                    checks: Arc::clone(&checks),
                    index,
                    path: path.clone(),
                };
                match queues.iter_mut().find(|(s, _)| s.id() == slot.id()) {
                    Some((_, items)) => items.push(item),
                    None => queues.push((Arc::clone(slot), vec![item])),
                }
            }
            files.push(checks);
        }

        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let threads = queues.len().min(cpus).max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("integrity-{}", i))
            .build()
            .map_err(|e| EngineError::WorkerPool { message: e.to_string() })?;

        let control = RunControl::new();
        let stop = control.stop_flag();
        Ok(IntegrityChecker {
            inner: Arc::new(CheckerInner {
                queues: Mutex::new(Some(queues)),
                files,
                invalid_copies: Mutex::new(Vec::new()),
                pool,
                control,
                stop,
                chunk_size: config.integrity_chunk_size,
                callback,
            }),
        })
    }

    /// Number of copies to verify.
    pub fn copy_count(&self) -> usize {
        self.inner
            .files
            .iter()
            .map(|checks| checks.states().len())
            .sum()
    }

    pub fn is_running(&self) -> bool {
        self.inner.control.is_running()
    }

    /// Start one task per slot in the background.
    pub fn start(&self) -> Result<IntegrityHandle, EngineError> {
        let queues = self
            .inner
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(EngineError::AlreadyStarted)?;

        info!(slots = queues.len(), copies = self.copy_count(), "Integrity check started");
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let expected = queues.len();
        self.inner.control.enter(expected);

        for (slot, items) in queues {
            let inner = Arc::clone(&self.inner);
            let done_tx = done_tx.clone();
            self.inner.pool.spawn(move || {
                inner.check_slot(&slot, &items);
                let _ = done_tx.send(());
                inner.control.leave();
            });
        }

        Ok(IntegrityHandle {
            done: done_rx,
            expected,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Start and block until done.
    pub fn run(&self) -> Result<IntegrityReport, EngineError> {
        Ok(self.start()?.wait())
    }
}

impl Stoppable for IntegrityChecker {
    fn stop(&self, on_done: StopCallback) {
        info!("Integrity check stop requested");
        self.inner.control.request_stop(on_done);
    }
}

impl CheckerInner {
    fn check_slot(&self, slot: &DestinationSlot, items: &[CheckItem]) {
        debug!(slot = %slot.dir().display(), copies = items.len(), "Checking slot");
        for item in items {
            if self.control.is_stop_requested() {
                break;
            }
            match self.check_copy(item) {
                Some(state) => self.record(item, state),
                None => break,
            }
        }
    }

    /// `None` when interrupted by a stop request.
    fn check_copy(&self, item: &CheckItem) -> Option<CopyCheckState> {
        let file = &item.checks.file;
        debug!(copy = %item.path.display(), "Start to check integrity");

        let Some(expected) = file.digest() else {
            error!(source = %file.path().display(), "No source digest to compare with");
            return Some(CopyCheckState::Invalid);
        };

        match compute_file_checksum_until(&item.path, expected.algorithm(), self.chunk_size, &self.stop) {
            Ok(Some(actual)) if actual.matches_hex(expected.hex()) => {
                debug!(copy = %item.path.display(), "Copy is valid");
                Some(CopyCheckState::Valid)
            }
            Ok(Some(actual)) => {
                error!(
                    copy = %item.path.display(),
                    expected = %expected.hex(),
                    actual = %actual.hex(),
                    "Integrity error"
                );
                Some(CopyCheckState::Invalid)
            }
            Ok(None) => None,
            Err(e) => {
                error!(copy = %item.path.display(), error = %e, "Can't read copy");
                Some(CopyCheckState::Invalid)
            }
        }
    }

    fn record(&self, item: &CheckItem, state: CopyCheckState) {
        if state == CopyCheckState::Invalid {
            self.invalid_copies
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(item.path.clone());
        }

        let verdict = {
            let mut states = item.checks.states();
            states[item.index] = state;
            if states.contains(&CopyCheckState::NotChecked) {
                None
            } else if states.iter().all(|s| *s == CopyCheckState::Valid) {
                Some(IntegrityVerdict::AllValid)
            } else {
                Some(IntegrityVerdict::HasInvalid)
            }
        };

        if let Some(verdict) = verdict {
            let file = &item.checks.file;
            if file.publish_integrity(verdict) {
                info!(source = %file.path().display(), ?verdict, "Integrity verdict");
                self.callback.on_file_status(file, &file.report());
            }
        }
    }

    fn report(&self) -> IntegrityReport {
        let mut report = IntegrityReport {
            stopped: self.control.is_stop_requested(),
            invalid_copies: self
                .invalid_copies
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            ..IntegrityReport::default()
        };
        for checks in &self.files {
            match checks.file.integrity() {
                IntegrityVerdict::AllValid => report.valid_files += 1,
                IntegrityVerdict::HasInvalid => report.invalid_files += 1,
                IntegrityVerdict::NotChecked => report.unchecked_files += 1,
            }
        }
        report.invalid_copies.sort();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copy_engine::CopyEngine;
    use crate::destination::DestinationRoot;
    use crate::model::FileStatus;
    use crate::progress::NoProgress;
    use crate::scan::scan_source;
    use std::fs;
    use std::path::Path;

    fn test_config() -> EngineConfig {
        EngineConfig {
            copy_buffer_size: 4096,
            sync_on_close: false,
            ..EngineConfig::default()
        }
    }

    /// Copy two files to two destinations and return what the engine produced.
    fn copied_batch(base: &Path) -> (Vec<Arc<SourceFile>>, Vec<CopyResult>) {
        let card = base.join("card");
        fs::create_dir_all(&card).expect("Failed to create card");
        fs::write(card.join("one.bin"), vec![1u8; 12_000]).expect("Failed to write source");
        fs::write(card.join("two.bin"), vec![2u8; 9_000]).expect("Failed to write source");
        let files = scan_source(&card, "CARD").expect("Failed to scan");

        let dests: Vec<Arc<DestinationRoot>> = ["a", "b"]
            .iter()
            .map(|name| {
                let dest = Arc::new(DestinationRoot::new(&base.join(name)));
                dest.prepare_session_slot(None).expect("Failed to prepare slot");
                dest
            })
            .collect();
        let outcome = CopyEngine::new(&files, dests, test_config(), Arc::new(NoProgress))
            .expect("Failed to build engine")
            .run()
            .expect("Batch failed");
        (files, outcome.results)
    }

    #[test]
    fn test_all_copies_valid() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (files, results) = copied_batch(temp_dir.path());

        let checker = IntegrityChecker::new(&results, &test_config(), Arc::new(NoProgress))
            .expect("Failed to build checker");
        assert_eq!(checker.copy_count(), 4);
        let report = checker.run().expect("Check failed");

        assert!(report.is_clean());
        assert_eq!(report.valid_files, 2);
        for file in &files {
            assert_eq!(file.status(), FileStatus::IntegrityValid);
        }
    }

    #[test]
    fn test_corrupted_copy_is_reported() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (files, results) = copied_batch(temp_dir.path());

        let (_, corrupted) = results[0].copies()[1].clone();
        let mut data = fs::read(&corrupted).unwrap();
        data[100] ^= 0xff;
        fs::write(&corrupted, data).unwrap();

        let report = IntegrityChecker::new(&results, &test_config(), Arc::new(NoProgress))
            .expect("Failed to build checker")
            .run()
            .expect("Check failed");

        assert_eq!(report.invalid_files, 1);
        assert_eq!(report.valid_files, 1);
        assert_eq!(report.invalid_copies, vec![corrupted]);
        assert_eq!(files[0].status(), FileStatus::IntegrityInvalid);
        assert_eq!(files[1].status(), FileStatus::IntegrityValid);
    }

    #[test]
    fn test_missing_copy_is_invalid() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (files, results) = copied_batch(temp_dir.path());
        fs::remove_file(&results[1].copies()[0].1).unwrap();

        let report = IntegrityChecker::new(&results, &test_config(), Arc::new(NoProgress))
            .expect("Failed to build checker")
            .run()
            .expect("Check failed");

        assert_eq!(report.invalid_files, 1);
        assert_eq!(files[1].status(), FileStatus::IntegrityInvalid);
    }

    #[test]
    fn test_stop_before_start_checks_nothing() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (files, results) = copied_batch(temp_dir.path());

        let checker = IntegrityChecker::new(&results, &test_config(), Arc::new(NoProgress))
            .expect("Failed to build checker");
        let (tx, rx) = crossbeam_channel::bounded(1);
        checker.stop(Box::new(move || {
            let _ = tx.send(());
        }));
        assert!(rx.try_recv().is_ok());

        let report = checker.run().expect("Check failed");
        assert!(report.stopped);
        assert_eq!(report.unchecked_files, 2);
        assert_eq!(files[0].status(), FileStatus::AllCopiesDone);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let checker = IntegrityChecker::new(&[], &test_config(), Arc::new(NoProgress))
            .expect("Failed to build checker");
        let report = checker.run().expect("Empty check");
        assert_eq!(report, IntegrityReport::default());
        assert!(matches!(checker.start(), Err(EngineError::AlreadyStarted)));
    }
}
