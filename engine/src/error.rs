//! Error types for the copy engine.
//!
//! Two families live here:
//! - `EngineError` for setup/job-level failures that abort a run before any
//!   byte is copied (missing source, slot creation, not enough space...).
//! - `CopyError` for per-file failures. These are never returned out of the
//!   batch orchestration; they are recorded on the file's `CopyStat` and on the
//!   `SourceFile` itself so the caller can observe them through status events.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur at the job level (preventing a run from starting).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Source directory does not exist
    #[error("Source directory not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// Source root exists but is not a directory
    #[error("Invalid path: {} ({reason})", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    /// Failed to enumerate a source directory
    #[error("Failed to enumerate directory: {}", path.display())]
    EnumerationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to create a session slot directory under a destination
    #[error("Failed to create session slot: {}", path.display())]
    SlotCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A destination was handed to the engine without a session slot
    #[error("No session slot prepared for destination: {}", path.display())]
    NoSessionSlot { path: PathBuf },

    /// Destination filesystem cannot hold the whole batch
    #[error(
        "Insufficient disk space for destination {}: need {required} bytes, have {available} bytes",
        path.display()
    )]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    /// Could not query a destination filesystem
    #[error("Destination directory access denied: {}", path.display())]
    DestinationAccessDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Worker pool could not be built
    #[error("Failed to start worker pool: {message}")]
    WorkerPool { message: String },

    /// `start` was called twice on a one-shot engine
    #[error("Engine already started; create a new one for the next run")]
    AlreadyStarted,

    /// A configuration value is out of range
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Settings store I/O failure
    #[error("Settings store error at {}", path.display())]
    Settings {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Settings store content could not be parsed
    #[error("Invalid settings at {}: {message}", path.display())]
    SettingsFormat { path: PathBuf, message: String },
}

impl EngineError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::EnumerationFailed { source, .. }
            | Self::SlotCreationFailed { source, .. }
            | Self::DestinationAccessDenied { source, .. }
            | Self::Settings { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// A per-file failure.
///
/// `io::Error` is not `Clone`, so the kind and message are captured instead.
/// That keeps the error shareable between the stat snapshot handed to progress
/// callbacks and the `SourceFile` status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CopyError {
    /// Failed to read from the source file
    #[error("Failed to read file {}: {message}", path.display())]
    Read {
        path: PathBuf,
        kind: io::ErrorKind,
        message: String,
        os_code: Option<i32>,
    },

    /// Failed to open or write a destination file
    #[error("Failed to write file {}: {message}", path.display())]
    Write {
        path: PathBuf,
        kind: io::ErrorKind,
        message: String,
        os_code: Option<i32>,
    },

    /// Failed to mirror the source directory structure
    #[error("Failed to create directory {}: {message}", path.display())]
    DirectoryCreation {
        path: PathBuf,
        kind: io::ErrorKind,
        message: String,
        os_code: Option<i32>,
    },

    /// Failed to publish the temporary file under its final name
    #[error("Failed to rename {} into place: {message}", path.display())]
    Rename {
        path: PathBuf,
        kind: io::ErrorKind,
        message: String,
        os_code: Option<i32>,
    },

    /// A published copy is missing after the rename
    #[error("Expected copied file: {}", path.display())]
    MissingCopy { path: PathBuf },

    /// A published copy does not have the source length
    #[error("Invalid size for copied file: {} ({actual} instead of {expected})", path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// Anything that is neither an I/O nor a validation failure
    #[error("Unexpected copy failure for {}: {message}", path.display())]
    Unexpected { path: PathBuf, message: String },
}

impl CopyError {
    pub fn read(path: &Path, err: &io::Error) -> Self {
        Self::Read {
            path: path.to_path_buf(),
            kind: err.kind(),
            message: err.to_string(),
            os_code: err.raw_os_error(),
        }
    }

    pub fn write(path: &Path, err: &io::Error) -> Self {
        Self::Write {
            path: path.to_path_buf(),
            kind: err.kind(),
            message: err.to_string(),
            os_code: err.raw_os_error(),
        }
    }

    pub fn directory(path: &Path, err: &io::Error) -> Self {
        Self::DirectoryCreation {
            path: path.to_path_buf(),
            kind: err.kind(),
            message: err.to_string(),
            os_code: err.raw_os_error(),
        }
    }

    pub fn rename(path: &Path, err: &io::Error) -> Self {
        Self::Rename {
            path: path.to_path_buf(),
            kind: err.kind(),
            message: err.to_string(),
            os_code: err.raw_os_error(),
        }
    }

    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Read { os_code, .. }
            | Self::Write { os_code, .. }
            | Self::DirectoryCreation { os_code, .. }
            | Self::Rename { os_code, .. } => *os_code,
            _ => None,
        }
    }

    /// Path the failure is about.
    pub fn path(&self) -> &Path {
        match self {
            Self::Read { path, .. }
            | Self::Write { path, .. }
            | Self::DirectoryCreation { path, .. }
            | Self::Rename { path, .. }
            | Self::MissingCopy { path }
            | Self::SizeMismatch { path, .. }
            | Self::Unexpected { path, .. } => path,
        }
    }
}
