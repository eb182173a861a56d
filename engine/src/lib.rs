//! # Offload Engine - Multi-destination Copy and Verify Library
//!
//! A headless engine that copies source files (typically camera cards) to
//! several backup destinations at once, then proves the copies are intact.
//! Designed as the foundation for multiple front ends (CLI, GUI, automation).
//!
//! ## Overview
//!
//! It features:
//! - A single read of each source file, fanned out to every destination in parallel
//! - Digest computed during the copy and written to a per-slot checksum list
//! - Temporary names while writing, renamed into place once complete
//! - Per-destination error isolation
//! - A verification pass that re-reads every copy
//! - Progress reporting via callbacks (decoupled from UI technology)
//! - Cooperative stop
//!
//! ## Basic Usage
//!
//! ```no_run
//! use engine::{
//!     scan_source, plan_copy, CopyEngine, DestinationRoot, EngineConfig, IntegrityChecker,
//!     NoProgress,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::default();
//! let files = scan_source(Path::new("/media/EOS_DIGITAL"), "EOS_DIGITAL")?;
//!
//! let backup = Arc::new(DestinationRoot::new(Path::new("/mnt/backup")));
//! backup.prepare_session_slot(Some("shoot"))?;
//! let destinations = vec![backup];
//!
//! let pending = plan_copy(&files, &destinations, config.small_file_threshold);
//! let engine = CopyEngine::new(&pending, destinations, config.clone(), Arc::new(NoProgress))?;
//! let outcome = engine.run()?;
//!
//! let report = IntegrityChecker::new(&outcome.results, &config, Arc::new(NoProgress))?.run()?;
//! println!("{} valid, {} invalid", report.valid_files, report.invalid_files);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: SourceFile, FileStatus and status reporting
//! - **error**: Error types and handling
//! - **checksums**: Digest algorithms and checksum list lines
//! - **config** / **settings**: Tunables and their persistence
//! - **destination**: Destination roots, session slots, history log
//! - **fs_ops**: Low-level filesystem operations
//! - **scan**: Source enumeration and copy planning
//! - **volume**: Volume identifiers
//! - **stats**: Per-file and batch statistics
//! - **progress**: Progress callback trait
//! - **stop**: Cooperative stop
//! - **copy_op** / **copy_engine**: The copy pipeline and batch orchestration
//! - **integrity**: The verification pass

pub mod checksums;
pub mod config;
pub mod copy_engine;
pub mod copy_op;
pub mod destination;
pub mod error;
pub mod fs_ops;
pub mod integrity;
pub mod model;
pub mod progress;
pub mod scan;
pub mod settings;
pub mod stats;
pub mod stop;
pub mod volume;

// Re-export main types and functions
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue};
pub use config::EngineConfig;
pub use copy_engine::{BatchOutcome, CopyEngine, CopyHandle};
pub use copy_op::{CopyOperation, CopyResult};
pub use destination::{DestinationRoot, DestinationSlot};
pub use error::{CopyError, EngineError};
pub use integrity::{CopyCheckState, IntegrityChecker, IntegrityHandle, IntegrityReport};
pub use model::{FileStatus, IntegrityVerdict, SourceFile, StatusReport, StatusSummary};
pub use progress::{ChannelProgress, NoProgress, ProgressCallback, ProgressUpdate};
pub use scan::{plan_copy, scan_source};
pub use settings::{JsonFileSettings, MemorySettings, SettingsStore};
pub use stats::{CopyStat, FileProgress, GlobalCopyStat, ProgressSnapshot};
pub use stop::{StopCallback, Stoppable};
pub use volume::{DisplayNameVolumeId, FixedVolumeId, VolumeIdProvider};
