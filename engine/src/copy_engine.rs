//! Batch orchestration.
//!
//! `CopyEngine` runs one `CopyOperation` per pending source file, strictly one
//! after the other on a single-thread pool, while a bounded write pool carries
//! the per-destination writes and the digest. A timer thread pushes progress
//! snapshots to the callback every `progress_interval_ms`.
//!
//! An engine is one-shot: `start` can be called once, and a new engine is
//! built for the next batch.

use crate::config::EngineConfig;
use crate::copy_op::{BufferPool, CopyOperation, CopyResult};
use crate::destination::DestinationRoot;
use crate::error::EngineError;
use crate::model::SourceFile;
use crate::progress::ProgressCallback;
use crate::stats::{format_bytes, GlobalCopyStat};
use crate::stop::{RunControl, StopCallback, Stoppable};
use crossbeam_channel::{select, Receiver, Sender};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a finished (or stopped) batch produced.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// One entry per operation that ran, in batch order
    pub results: Vec<CopyResult>,
    /// True when the batch ended on a stop request
    pub stopped: bool,
}

/// Handle on a running batch.
pub struct CopyHandle {
    done: Receiver<BatchOutcome>,
}

impl CopyHandle {
    /// Block until the batch ends.
    pub fn wait(self) -> Result<BatchOutcome, EngineError> {
        self.done.recv().map_err(|_| EngineError::WorkerPool {
            message: "copy worker exited without reporting".to_string(),
        })
    }

    /// The outcome if the batch already ended.
    pub fn try_wait(&self) -> Option<BatchOutcome> {
        self.done.try_recv().ok()
    }
}

struct EngineInner {
    operations: Vec<CopyOperation>,
    destinations: Vec<Arc<DestinationRoot>>,
    global: Arc<GlobalCopyStat>,
    main_pool: ThreadPool,
    write_pool: ThreadPool,
    control: RunControl,
    started: AtomicBool,
    callback: Arc<dyn ProgressCallback>,
    config: EngineConfig,
}

/// Copies a batch of source files to every destination's current slot.
#[derive(Clone)]
pub struct CopyEngine {
    inner: Arc<EngineInner>,
}

impl CopyEngine {
    /// Plan the batch: one operation per file that still lacks a copy on some
    /// destination.
    ///
    /// # Errors
    /// Fails when the configuration is invalid, a destination has no session
    /// slot, a destination lacks the space for the whole batch, or the pools
    /// can't be built.
    pub fn new(
        files: &[Arc<SourceFile>],
        destinations: Vec<Arc<DestinationRoot>>,
        config: EngineConfig,
        callback: Arc<dyn ProgressCallback>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if let Some(missing) = destinations.iter().find(|d| d.current_slot().is_none()) {
            return Err(EngineError::NoSessionSlot {
                path: missing.root().to_path_buf(),
            });
        }

        let control = RunControl::new();
        let operations: Vec<CopyOperation> = files
            .iter()
            .filter_map(|file| {
                let slots = file.pending_slots(&destinations);
                if slots.is_empty() {
                    debug!(source = %file.path().display(), "Already copied everywhere");
                    return None;
                }
                Some(CopyOperation::new(Arc::clone(file), slots, &config, control.stop_flag()))
            })
            .collect();

        let total_bytes: u64 = operations.iter().map(|op| op.file().size()).sum();
        check_free_space(&destinations, total_bytes)?;

        let global = Arc::new(GlobalCopyStat::new(
            operations
                .iter()
                .map(|op| (Arc::clone(op.file()), Arc::clone(op.stat())))
                .collect(),
            destinations.clone(),
        ));

        let main_pool = ThreadPoolBuilder::new()
            .num_threads(1)
            .thread_name(|_| "copy-main".to_string())
            .build()
            .map_err(|e| EngineError::WorkerPool { message: e.to_string() })?;

        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let writers = (destinations.len() + 1).min(cpus).max(1);
        let write_pool = ThreadPoolBuilder::new()
            .num_threads(writers)
            .thread_name(|i| format!("copy-write-{}", i))
            .build()
            .map_err(|e| EngineError::WorkerPool { message: e.to_string() })?;

        info!(
            files = operations.len(),
            bytes = total_bytes,
            destinations = destinations.len(),
            writers,
            "Copy batch planned"
        );

        Ok(CopyEngine {
            inner: Arc::new(EngineInner {
                operations,
                destinations,
                global,
                main_pool,
                write_pool,
                control,
                started: AtomicBool::new(false),
                callback,
                config,
            }),
        })
    }

    /// Number of files the batch will copy.
    pub fn file_count(&self) -> usize {
        self.inner.operations.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.global.total_bytes()
    }

    pub fn operations(&self) -> &[CopyOperation] {
        &self.inner.operations
    }

    pub fn global_stat(&self) -> &Arc<GlobalCopyStat> {
        &self.inner.global
    }

    pub fn is_running(&self) -> bool {
        self.inner.control.is_running()
    }

    /// Start the batch in the background.
    ///
    /// # Errors
    /// `AlreadyStarted` on a second call; `WorkerPool` if the progress timer
    /// thread can't be spawned.
    pub fn start(&self) -> Result<CopyHandle, EngineError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }

        let ticker = ProgressTicker::spawn(
            self.inner.config.progress_interval(),
            Arc::clone(&self.inner.global),
            Arc::clone(&self.inner.callback),
        )
        .map_err(|e| EngineError::WorkerPool { message: e.to_string() })?;

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        self.inner.control.enter(1);
        let inner = Arc::clone(&self.inner);
        self.inner.main_pool.spawn(move || {
            let outcome = inner.run_batch();
            ticker.finish();
            inner.global.publish(inner.callback.as_ref());
            let _ = done_tx.send(outcome);
            inner.control.leave();
        });

        Ok(CopyHandle { done: done_rx })
    }

    /// Start and block until the batch ends.
    pub fn run(&self) -> Result<BatchOutcome, EngineError> {
        self.start()?.wait()
    }
}

impl Stoppable for CopyEngine {
    /// Queued files are skipped, the current file is abandoned between chunks
    /// (its temporary copies stay on disk).
    fn stop(&self, on_done: StopCallback) {
        info!("Copy stop requested");
        self.inner.control.request_stop(on_done);
    }
}

impl EngineInner {
    fn run_batch(&self) -> BatchOutcome {
        let mut buffers = BufferPool::new(self.config.copy_buffer_size);
        let mut results = Vec::with_capacity(self.operations.len());

        for op in &self.operations {
            if self.control.is_stop_requested() {
                break;
            }
            let result = op.run(&mut buffers, &self.write_pool);

            let file = op.file();
            if !file.refresh_copies(&self.destinations, self.config.small_file_threshold) {
                warn!(source = %file.path().display(), "Source file vanished after copy");
            }
            self.callback.on_file_status(file, &file.report());
            results.push(result);
        }

        let stopped = self.control.is_stop_requested();
        let elapsed = self.global.elapsed();
        if !stopped {
            for destination in &self.destinations {
                if let Some(slot) = destination.current_slot() {
                    slot.log_run_summary(destination.counters().copied_bytes(), elapsed);
                }
            }
        }

        info!(
            copied = results.len(),
            planned = self.operations.len(),
            stopped,
            elapsed_ms = elapsed.as_millis() as u64,
            "Copy batch finished"
        );
        BatchOutcome { results, stopped }
    }
}

fn check_free_space(destinations: &[Arc<DestinationRoot>], required: u64) -> Result<(), EngineError> {
    if required == 0 {
        return Ok(());
    }
    for destination in destinations {
        let available = destination.available_space()?;
        debug!(
            root = %destination.root().display(),
            available = %format_bytes(available),
            required = %format_bytes(required),
            "Free space check"
        );
        if available < required {
            return Err(EngineError::InsufficientSpace {
                path: destination.root().to_path_buf(),
                required,
                available,
            });
        }
    }
    Ok(())
}

/// Timer thread publishing progress until told to stop.
struct ProgressTicker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl ProgressTicker {
    fn spawn(
        interval: Duration,
        global: Arc<GlobalCopyStat>,
        callback: Arc<dyn ProgressCallback>,
    ) -> io::Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("copy-progress".to_string())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => global.publish(callback.as_ref()),
                        recv(stop_rx) -> _ => break,
                    }
                }
            })?;
        Ok(ProgressTicker { stop_tx, handle })
    }

    fn finish(self) {
        drop(self.stop_tx);
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::{compute_file_checksum, ChecksumAlgorithm};
    use crate::model::{FileStatus, StatusReport};
    use crate::progress::NoProgress;
    use crate::scan::scan_source;
    use crate::stats::ProgressSnapshot;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        statuses: Mutex<Vec<(PathBuf, FileStatus)>>,
        snapshots: Mutex<Vec<ProgressSnapshot>>,
        stop_on_first_status: Mutex<Option<(CopyEngine, Sender<()>)>>,
    }

    impl ProgressCallback for Recorder {
        fn on_progress(&self, snapshot: &ProgressSnapshot) {
            self.snapshots.lock().unwrap().push(snapshot.clone());
        }

        fn on_file_status(&self, file: &SourceFile, report: &StatusReport) {
            self.statuses
                .lock()
                .unwrap()
                .push((file.relative_path().to_path_buf(), report.status));
            if let Some((engine, tx)) = self.stop_on_first_status.lock().unwrap().take() {
                engine.stop(Box::new(move || {
                    let _ = tx.send(());
                }));
            }
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            copy_buffer_size: 4096,
            sync_on_close: false,
            progress_interval_ms: 10,
            ..EngineConfig::default()
        }
    }

    fn write_source(root: &Path, rel: &str, size: usize) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).expect("Failed to create source dir");
        let data: Vec<u8> = (0..size).map(|i| (i * 7 % 256) as u8).collect();
        fs::write(path, data).expect("Failed to write source file");
    }

    fn destinations(base: &Path, names: &[&str]) -> Vec<Arc<DestinationRoot>> {
        names
            .iter()
            .map(|name| {
                let dest = Arc::new(DestinationRoot::new(&base.join(name)));
                dest.prepare_session_slot(Some("test")).expect("Failed to prepare slot");
                dest
            })
            .collect()
    }

    #[test]
    fn test_copy_one_file_to_two_destinations() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let card = temp_dir.path().join("card");
        write_source(&card, "DCIM/clip.mov", 10_000);
        let files = scan_source(&card, "CARD").expect("Failed to scan");
        let dests = destinations(temp_dir.path(), &["a", "b"]);
        let recorder = Arc::new(Recorder::default());

        let engine = CopyEngine::new(&files, dests.clone(), test_config(), recorder.clone())
            .expect("Failed to build engine");
        assert_eq!(engine.file_count(), 1);
        assert_eq!(engine.total_bytes(), 10_000);

        let outcome = engine.run().expect("Batch failed");
        assert!(!outcome.stopped);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].copies().len(), 2);

        let source_bytes = fs::read(files[0].path()).unwrap();
        let digest = compute_file_checksum(files[0].path(), ChecksumAlgorithm::Sha256).unwrap();
        for dest in &dests {
            let slot = dest.current_slot().unwrap();
            let copy = slot.dir().join("CARD").join("DCIM").join("clip.mov");
            assert_eq!(fs::read(&copy).unwrap(), source_bytes);
            let list = fs::read_to_string(slot.dir().join("SHA256SUM")).unwrap();
            assert_eq!(list, format!("{}  CARD/DCIM/clip.mov\n", digest.hex()));
        }

        assert_eq!(files[0].status(), FileStatus::AllCopiesDone);
        assert_eq!(
            recorder.statuses.lock().unwrap().as_slice(),
            &[(PathBuf::from("DCIM/clip.mov"), FileStatus::AllCopiesDone)]
        );
        let snapshots = recorder.snapshots.lock().unwrap();
        let last = snapshots.last().expect("Final snapshot expected");
        assert_eq!(last.progress, 1.0);
        assert_eq!(last.files_done, 1);
        assert_eq!(last.destination_speeds.len(), 2);
    }

    #[test]
    fn test_completed_run_writes_summary_to_every_slot() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let card = temp_dir.path().join("card");
        write_source(&card, "DCIM/clip.mov", 4 * 1024 * 1024);
        let files = scan_source(&card, "CARD").expect("Failed to scan");
        let dests = destinations(temp_dir.path(), &["a", "b"]);

        let engine = CopyEngine::new(&files, dests.clone(), test_config(), Arc::new(NoProgress))
            .expect("Failed to build engine");
        let outcome = engine.run().expect("Batch failed");
        assert!(!outcome.stopped);

        for dest in &dests {
            let slot = dest.current_slot().unwrap();
            let history = fs::read_to_string(slot.history_path()).expect("Failed to read history");
            let last = history.lines().last().expect("History must not be empty");
            assert!(
                last.contains("\tTotal copy 4194304 bytes (4.00 MB) in "),
                "unexpected last line: {last}"
            );
        }
    }

    #[test]
    fn test_failing_destination_is_isolated() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let card = temp_dir.path().join("card");
        write_source(&card, "clip.mov", 10_000);
        let files = scan_source(&card, "CARD").expect("Failed to scan");
        let dests = destinations(temp_dir.path(), &["a", "b"]);

        // Leftover temporary on B: its open fails, A goes on
        let b_slot = dests[1].current_slot().unwrap();
        let b_temp = b_slot.dir().join("CARD").join("clip.mov-oncopy");
        fs::create_dir_all(b_temp.parent().unwrap()).unwrap();
        fs::write(&b_temp, b"stale").unwrap();

        let engine = CopyEngine::new(&files, dests.clone(), test_config(), Arc::new(Recorder::default()))
            .expect("Failed to build engine");
        let outcome = engine.run().expect("Batch failed");

        let result = &outcome.results[0];
        assert_eq!(result.copies().len(), 1);
        let a_slot = dests[0].current_slot().unwrap();
        assert!(result.path_in(&a_slot).is_some());
        assert!(a_slot.dir().join("CARD/clip.mov").is_file());
        assert!(!b_slot.dir().join("CARD/clip.mov").exists());

        let report = files[0].report();
        assert_eq!(report.status, FileStatus::ErrorOrIncomplete);
        assert_eq!(report.copies_done, 1);
        assert!(report.error.is_some());
    }

    #[test]
    fn test_stop_mid_batch() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let card = temp_dir.path().join("card");
        for name in ["a.bin", "b.bin", "c.bin"] {
            write_source(&card, name, 20_000);
        }
        let files = scan_source(&card, "CARD").expect("Failed to scan");
        let dests = destinations(temp_dir.path(), &["a"]);
        let recorder = Arc::new(Recorder::default());

        let engine = CopyEngine::new(&files, dests.clone(), test_config(), recorder.clone())
            .expect("Failed to build engine");
        let (stopped_tx, stopped_rx) = crossbeam_channel::bounded(1);
        *recorder.stop_on_first_status.lock().unwrap() = Some((engine.clone(), stopped_tx));

        let outcome = engine.run().expect("Batch failed");
        assert!(outcome.stopped);
        assert_eq!(outcome.results.len(), 1);
        stopped_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("Stop callback must fire");

        assert_eq!(files[0].status(), FileStatus::AllCopiesDone);
        assert_eq!(files[1].status(), FileStatus::NotStarted);
        assert_eq!(files[2].status(), FileStatus::NotStarted);
        let slot = dests[0].current_slot().unwrap();
        assert!(!slot.dir().join("CARD/b.bin").exists());
        assert!(!slot.dir().join("CARD/b.bin-oncopy").exists());
        assert!(engine.operations()[1].stat().is_waiting());
        assert!(!engine.is_running());
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dests = destinations(temp_dir.path(), &["a"]);
        let engine = CopyEngine::new(&[], dests, test_config(), Arc::new(Recorder::default()))
            .expect("Failed to build engine");
        let handle = engine.start().expect("First start");
        assert!(matches!(engine.start(), Err(EngineError::AlreadyStarted)));
        let outcome = handle.wait().expect("Batch failed");
        assert!(outcome.results.is_empty());
    }

    #[test]
    fn test_destination_without_slot_is_rejected() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dest = Arc::new(DestinationRoot::new(temp_dir.path()));
        let err = CopyEngine::new(&[], vec![dest], test_config(), Arc::new(Recorder::default()))
            .err()
            .expect("Must fail");
        assert!(matches!(err, EngineError::NoSessionSlot { .. }));
    }

    #[test]
    fn test_already_copied_files_are_not_planned() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let card = temp_dir.path().join("card");
        write_source(&card, "clip.mov", 5_000);
        let files = scan_source(&card, "CARD").expect("Failed to scan");
        let dests = destinations(temp_dir.path(), &["a"]);

        CopyEngine::new(&files, dests.clone(), test_config(), Arc::new(Recorder::default()))
            .expect("Failed to build engine")
            .run()
            .expect("Batch failed");

        files[0].refresh_copies(&dests, 30_000);
        let again = CopyEngine::new(&files, dests, test_config(), Arc::new(Recorder::default()))
            .expect("Failed to build engine");
        assert_eq!(again.file_count(), 0);
    }

    #[test]
    fn test_stop_when_idle_fires_immediately() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dests = destinations(temp_dir.path(), &["a"]);
        let engine = CopyEngine::new(&[], dests, test_config(), Arc::new(Recorder::default()))
            .expect("Failed to build engine");
        let (tx, rx) = crossbeam_channel::bounded(1);
        engine.stop(Box::new(move || {
            let _ = tx.send(());
        }));
        assert!(rx.try_recv().is_ok());
    }
}
