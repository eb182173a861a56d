//! Copying one source file to several session slots at once.
//!
//! The source is read exactly once. While chunk `k + 1` is being read into one
//! buffer, chunk `k` sits in the other buffer and is handed to one write task
//! per destination plus one digest task, all on the shared write pool. The
//! reader waits for every task of chunk `k` before dispatching chunk `k + 1`,
//! so at most two chunks are ever in memory.
//!
//! Each destination writes to `<final-name><temp-suffix>` and is renamed into
//! place only after the whole source was read and the digest computed. A
//! failing destination is dropped from the rest of the copy; the others carry
//! on.

use crate::checksums::{create_hasher, ChecksumAlgorithm, ChecksumHasher, ChecksumValue};
use crate::config::EngineConfig;
use crate::destination::DestinationSlot;
use crate::error::CopyError;
use crate::fs_ops;
use crate::model::SourceFile;
use crate::stats::CopyStat;
use crossbeam_channel::{Receiver, Sender};
use rayon::ThreadPool;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// The two copy buffers, reused from one file to the next.
#[derive(Debug)]
pub struct BufferPool {
    buffers: [Arc<Vec<u8>>; 2],
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        BufferPool {
            buffers: [Arc::new(vec![0u8; buffer_size]), Arc::new(vec![0u8; buffer_size])],
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffers[0].len()
    }
}

/// Validated copies produced by one operation.
#[derive(Debug, Clone)]
pub struct CopyResult {
    file: Arc<SourceFile>,
    copies: Vec<(Arc<DestinationSlot>, PathBuf)>,
}

impl CopyResult {
    pub(crate) fn empty(file: Arc<SourceFile>) -> Self {
        CopyResult {
            file,
            copies: Vec::new(),
        }
    }

    pub fn file(&self) -> &Arc<SourceFile> {
        &self.file
    }

    /// Slot and final path of every validated copy.
    pub fn copies(&self) -> &[(Arc<DestinationSlot>, PathBuf)] {
        &self.copies
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    pub fn path_in(&self, slot: &DestinationSlot) -> Option<&Path> {
        self.copies
            .iter()
            .find(|(s, _)| s.id() == slot.id())
            .map(|(_, p)| p.as_path())
    }
}

/// One destination's write state. Moves into a write task and back.
struct Target {
    index: usize,
    slot: Arc<DestinationSlot>,
    final_path: PathBuf,
    temp_path: PathBuf,
    file: Option<File>,
    error: Option<CopyError>,
}

enum StageDone {
    Written(Target, Option<CopyError>),
    Digested(Box<dyn ChecksumHasher>),
}

enum StreamOutcome {
    Completed(ChecksumValue),
    Stopped,
    NoLiveTarget,
}

/// Tasks in flight for the chunk being written.
struct Pipeline<'a> {
    writers: &'a ThreadPool,
    done_tx: Sender<StageDone>,
    done_rx: Receiver<StageDone>,
    pending: usize,
    idle: Vec<Target>,
    hasher: Option<Box<dyn ChecksumHasher>>,
}

impl<'a> Pipeline<'a> {
    fn new(writers: &'a ThreadPool, targets: Vec<Target>, algorithm: ChecksumAlgorithm) -> Self {
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        Pipeline {
            writers,
            done_tx,
            done_rx,
            pending: 0,
            idle: targets,
            hasher: Some(create_hasher(algorithm)),
        }
    }

    fn live(&self) -> usize {
        self.idle.iter().filter(|t| t.error.is_none()).count()
    }

    /// Hand `chunk[..len]` to every live target and to the digest.
    fn dispatch(&mut self, chunk: &Arc<Vec<u8>>, len: usize, stop: &Arc<AtomicBool>) {
        let (live, failed): (Vec<Target>, Vec<Target>) =
            self.idle.drain(..).partition(|t| t.error.is_none());
        self.idle = failed;

        for target in live {
            let chunk = Arc::clone(chunk);
            let stop = Arc::clone(stop);
            let tx = self.done_tx.clone();
            self.pending += 1;
            self.writers.spawn(move || {
                let done = write_chunk(target, &chunk[..len], &stop);
                // Release the buffer before the reader hears about it
                drop(chunk);
                let _ = tx.send(done);
            });
        }

        if let Some(mut hasher) = self.hasher.take() {
            let chunk = Arc::clone(chunk);
            let stop = Arc::clone(stop);
            let tx = self.done_tx.clone();
            self.pending += 1;
            self.writers.spawn(move || {
                if !stop.load(Ordering::Relaxed) {
                    hasher.update(&chunk[..len]);
                }
                drop(chunk);
                let _ = tx.send(StageDone::Digested(hasher));
            });
        }
    }

    /// Wait for every in-flight task. Returns destinations that failed on
    /// this chunk.
    fn drain(&mut self) -> Vec<(Arc<DestinationSlot>, CopyError)> {
        let mut failures = Vec::new();
        while self.pending > 0 {
            // We hold a sender, so this only returns once a task reports
            let Ok(done) = self.done_rx.recv() else { break };
            self.pending -= 1;
            match done {
                StageDone::Written(target, newly_failed) => {
                    if let Some(err) = newly_failed {
                        failures.push((Arc::clone(&target.slot), err));
                    }
                    self.idle.push(target);
                }
                StageDone::Digested(hasher) => self.hasher = Some(hasher),
            }
        }
        failures
    }

    fn into_parts(mut self) -> (Vec<Target>, Option<Box<dyn ChecksumHasher>>) {
        self.idle.sort_by_key(|t| t.index);
        (self.idle, self.hasher)
    }
}

fn write_chunk(mut target: Target, data: &[u8], stop: &AtomicBool) -> StageDone {
    if stop.load(Ordering::Relaxed) {
        return StageDone::Written(target, None);
    }
    let Some(file) = target.file.as_mut() else {
        return StageDone::Written(target, None);
    };
    let started = Instant::now();
    match file.write_all(data) {
        Ok(()) => {
            target.slot.counters().record(data.len() as u64, started.elapsed());
            trace!(target = %target.temp_path.display(), bytes = data.len(), "Wrote chunk");
            StageDone::Written(target, None)
        }
        Err(e) => {
            let err = CopyError::write(&target.temp_path, &e);
            target.file = None;
            target.error = Some(err.clone());
            StageDone::Written(target, Some(err))
        }
    }
}

/// Fill `buffer` unless the end of the source comes first.
fn read_full(source: &mut File, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match source.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn temp_path_for(final_path: &Path, suffix: &str) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Copy of one source file to one or more slots.
#[derive(Debug)]
pub struct CopyOperation {
    file: Arc<SourceFile>,
    slots: Vec<Arc<DestinationSlot>>,
    stat: Arc<CopyStat>,
    algorithm: ChecksumAlgorithm,
    temp_suffix: String,
    sync_on_close: bool,
    stop: Arc<AtomicBool>,
}

impl CopyOperation {
    pub fn new(
        file: Arc<SourceFile>,
        slots: Vec<Arc<DestinationSlot>>,
        config: &EngineConfig,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let stat = Arc::new(CopyStat::new(file.size()));
        CopyOperation {
            file,
            slots,
            stat,
            algorithm: config.algorithm,
            temp_suffix: config.temp_suffix.clone(),
            sync_on_close: config.sync_on_close,
            stop,
        }
    }

    pub fn file(&self) -> &Arc<SourceFile> {
        &self.file
    }

    pub fn slots(&self) -> &[Arc<DestinationSlot>] {
        &self.slots
    }

    pub fn stat(&self) -> &Arc<CopyStat> {
        &self.stat
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Copy the file. Per-destination failures are recorded on the stat and
    /// on the file; only validated copies are returned.
    pub fn run(&self, buffers: &mut BufferPool, writers: &ThreadPool) -> CopyResult {
        let mut result = CopyResult::empty(Arc::clone(&self.file));
        if self.slots.is_empty() {
            warn!(source = %self.file.path().display(), "No destination to copy to");
            return result;
        }
        if self.is_stopped() {
            return result;
        }

        self.file.begin_copy_session();
        self.stat.on_start();
        info!(
            source = %self.file.path().display(),
            size = self.file.size(),
            destinations = self.slots.len(),
            "Start copy"
        );

        let mut source = match File::open(self.file.path()) {
            Ok(source) => source,
            Err(e) => {
                let err = CopyError::read(self.file.path(), &e);
                error!(error = %err, "Can't open source");
                self.stat.set_last_error(err.clone());
                self.file.set_copy_error(err);
                self.stat.on_end();
                return result;
            }
        };

        let mut targets = Vec::with_capacity(self.slots.len());
        for (index, slot) in self.slots.iter().enumerate() {
            match self.prepare_target(index, slot) {
                Ok(target) => targets.push(target),
                Err(err) => self.record_failure(slot, err),
            }
        }
        if !targets.is_empty() {
            self.transfer(&mut source, targets, buffers, writers, &mut result);
        }

        self.stat.on_end();
        info!(
            source = %self.file.path().display(),
            copies = result.copies.len(),
            "Copy finished"
        );
        result
    }

    /// Stream the source into opened targets, then publish the survivors.
    fn transfer(
        &self,
        source: &mut File,
        targets: Vec<Target>,
        buffers: &mut BufferPool,
        writers: &ThreadPool,
        result: &mut CopyResult,
    ) {
        let mut pipeline = Pipeline::new(writers, targets, self.algorithm);
        let outcome = self.stream(source, &mut pipeline, buffers);
        let (targets, _) = pipeline.into_parts();

        match outcome {
            Ok(StreamOutcome::Completed(digest)) => {
                self.file.set_digest(digest.clone());
                for target in targets {
                    if target.error.is_some() {
                        continue;
                    }
                    let slot = Arc::clone(&target.slot);
                    match self.finish_target(target, &digest) {
                        Ok(path) => result.copies.push((slot, path)),
                        Err(err) => self.record_failure(&slot, err),
                    }
                }
            }
            Ok(StreamOutcome::Stopped) => {
                info!(source = %self.file.path().display(), "Copy abandoned on stop request");
            }
            Ok(StreamOutcome::NoLiveTarget) => {
                warn!(source = %self.file.path().display(), "Every destination failed");
            }
            Err(err) => {
                error!(error = %err, "Source read failed");
                for target in targets.iter().filter(|t| t.error.is_none()) {
                    target.slot.log_copy_failed(&target.final_path, &err.to_string());
                }
                self.stat.set_last_error(err.clone());
                self.file.set_copy_error(err);
            }
        }
    }

    fn prepare_target(&self, index: usize, slot: &Arc<DestinationSlot>) -> Result<Target, CopyError> {
        let volume = self.file.volume_id();
        let final_path = slot.make_path(volume, self.file.relative_path());
        let temp_path = temp_path_for(&final_path, &self.temp_suffix);

        fs_ops::mirror_directories(self.file.source_root(), self.file.relative_path(), &slot.volume_dir(volume))?;
        slot.log_copy_start(self.file.path(), self.file.size(), &final_path);
        let file = fs_ops::open_temp(&temp_path)?;
        debug!(target = %temp_path.display(), "Opened temporary copy");

        Ok(Target {
            index,
            slot: Arc::clone(slot),
            final_path,
            temp_path,
            file: Some(file),
            error: None,
        })
    }

    fn record_failure(&self, slot: &DestinationSlot, err: CopyError) {
        warn!(
            slot = %slot.dir().display(),
            error = %err,
            "Copy to destination failed"
        );
        slot.log_copy_failed(err.path(), &err.to_string());
        self.stat.set_last_error(err.clone());
        self.file.set_copy_error(err);
    }

    fn settle(&self, pipeline: &mut Pipeline<'_>) {
        for (slot, err) in pipeline.drain() {
            self.record_failure(&slot, err);
        }
    }

    fn stream(
        &self,
        source: &mut File,
        pipeline: &mut Pipeline<'_>,
        buffers: &mut BufferPool,
    ) -> Result<StreamOutcome, CopyError> {
        let mut current = 0;
        let mut loop_started = Instant::now();

        loop {
            if self.is_stopped() {
                self.settle(pipeline);
                return Ok(StreamOutcome::Stopped);
            }

            // Tasks holding this buffer were drained one round ago
            let Some(buffer) = Arc::get_mut(&mut buffers.buffers[current]) else {
                self.settle(pipeline);
                return Err(CopyError::Unexpected {
                    path: self.file.path().to_path_buf(),
                    message: "copy buffer still shared with a write task".to_string(),
                });
            };
            let read = match read_full(source, buffer) {
                Ok(read) => read,
                Err(e) => {
                    self.settle(pipeline);
                    return Err(CopyError::read(self.file.path(), &e));
                }
            };
            if read == 0 {
                break;
            }
            self.stat.on_read_loop(read as u64, loop_started.elapsed());

            self.settle(pipeline);
            if pipeline.live() == 0 {
                return Ok(StreamOutcome::NoLiveTarget);
            }
            pipeline.dispatch(&buffers.buffers[current], read, &self.stop);

            current ^= 1;
            loop_started = Instant::now();
        }

        self.settle(pipeline);
        if self.is_stopped() {
            return Ok(StreamOutcome::Stopped);
        }
        if pipeline.live() == 0 {
            return Ok(StreamOutcome::NoLiveTarget);
        }
        match pipeline.hasher.take() {
            Some(hasher) => Ok(StreamOutcome::Completed(hasher.finalize())),
            None => Err(CopyError::Unexpected {
                path: self.file.path().to_path_buf(),
                message: "digest lost in flight".to_string(),
            }),
        }
    }

    /// Close, publish and validate one completed copy.
    fn finish_target(&self, mut target: Target, digest: &ChecksumValue) -> Result<PathBuf, CopyError> {
        if let Some(mut file) = target.file.take() {
            file.flush().map_err(|e| CopyError::write(&target.temp_path, &e))?;
            if self.sync_on_close {
                file.sync_all().map_err(|e| CopyError::write(&target.temp_path, &e))?;
            }
        }

        fs_ops::publish_file(&target.temp_path, &target.final_path)?;
        if let Some(modified) = self.file.modified() {
            fs_ops::set_modified(&target.final_path, modified);
        }

        let actual = match fs::metadata(&target.final_path) {
            Ok(meta) => meta.len(),
            Err(_) => {
                return Err(CopyError::MissingCopy {
                    path: target.final_path,
                })
            }
        };
        if actual != self.file.size() {
            return Err(CopyError::SizeMismatch {
                path: target.final_path,
                expected: self.file.size(),
                actual,
            });
        }

        target.slot.log_copy_done(&target.final_path);
        if let Err(e) = target.slot.append_checksum(&target.final_path, digest) {
            warn!(slot = %target.slot.dir().display(), error = %e, "Can't append to checksum list");
        }
        Ok(target.final_path)
    }
}
