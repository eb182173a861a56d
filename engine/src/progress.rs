//! Progress reporting trait.
//!
//! This module defines the ProgressCallback trait, which decouples the copy
//! and verification engines from whatever front end shows their progress.
//!
//! Callbacks are invoked from engine threads (the progress timer, the copy
//! thread, the verification workers), so implementations must be thread-safe
//! and should return quickly.

use crate::model::{SourceFile, StatusReport};
use crate::stats::{FileProgress, ProgressSnapshot};
use crossbeam_channel::Sender;
use std::path::PathBuf;
use uuid::Uuid;

/// Trait for receiving progress updates from the engines.
pub trait ProgressCallback: Send + Sync {
    /// Called by the progress timer with the aggregate batch progress.
    fn on_progress(&self, snapshot: &ProgressSnapshot);

    /// Called by the progress timer for the file being copied.
    fn on_file_progress(&self, _file: &SourceFile, _progress: &FileProgress) {}

    /// Called whenever a file's status may have changed (copy finished,
    /// verification verdict published).
    fn on_file_status(&self, file: &SourceFile, report: &StatusReport);
}

/// Callback that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_progress(&self, _snapshot: &ProgressSnapshot) {}

    fn on_file_status(&self, _file: &SourceFile, _report: &StatusReport) {}
}

/// Updates forwarded by `ChannelProgress`.
#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    Batch(ProgressSnapshot),
    File {
        file_id: Uuid,
        path: PathBuf,
        progress: FileProgress,
    },
    Status {
        file_id: Uuid,
        path: PathBuf,
        report: StatusReport,
    },
}

/// A ProgressCallback implementation that forwards updates over a channel,
/// for front ends that consume them on their own thread.
pub struct ChannelProgress {
    sender: Sender<ProgressUpdate>,
}

impl ChannelProgress {
    pub fn new(sender: Sender<ProgressUpdate>) -> Self {
        ChannelProgress { sender }
    }
}

impl ProgressCallback for ChannelProgress {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        let _ = self.sender.send(ProgressUpdate::Batch(snapshot.clone()));
    }

    fn on_file_progress(&self, file: &SourceFile, progress: &FileProgress) {
        let _ = self.sender.send(ProgressUpdate::File {
            file_id: file.id(),
            path: file.path().to_path_buf(),
            progress: progress.clone(),
        });
    }

    fn on_file_status(&self, file: &SourceFile, report: &StatusReport) {
        let _ = self.sender.send(ProgressUpdate::Status {
            file_id: file.id(),
            path: file.path().to_path_buf(),
            report: report.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{CopyStat, GlobalCopyStat};
    use std::path::Path;
    use std::sync::Arc;

    #[test]
    fn test_channel_progress_forwards_updates() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let callback = ChannelProgress::new(tx);

        let root = Path::new("/card");
        let file = Arc::new(SourceFile::new(root, &root.join("a.mov"), 10, None, "CARD"));
        let stat = Arc::new(CopyStat::new(10));
        stat.on_start();
        let global = GlobalCopyStat::new(vec![(Arc::clone(&file), stat)], Vec::new());

        global.publish(&callback);
        callback.on_file_status(&file, &file.report());

        match rx.try_recv().expect("Batch update expected") {
            ProgressUpdate::Batch(snapshot) => assert_eq!(snapshot.files_total, 1),
            other => panic!("unexpected update {other:?}"),
        }
        match rx.try_recv().expect("File update expected") {
            ProgressUpdate::File { file_id, .. } => assert_eq!(file_id, file.id()),
            other => panic!("unexpected update {other:?}"),
        }
        assert!(matches!(rx.try_recv(), Ok(ProgressUpdate::Status { .. })));
    }

    #[test]
    fn test_channel_progress_survives_closed_receiver() {
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(rx);
        let callback = ChannelProgress::new(tx);
        let global = GlobalCopyStat::new(Vec::new(), Vec::new());
        global.publish(&callback);
    }
}
