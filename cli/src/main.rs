//! Offload - Command-line interface for the copy engine.
//!
//! Copies one or more source directories (camera cards, recorder media...) to
//! several backup destinations at once, optionally verifies every copy, and
//! prints a per-status summary. Ctrl-C stops cleanly between chunks.

mod logging;

use clap::Parser;
use engine::settings::{DESTINATIONS_KEY, SOURCES_KEY};
use engine::stats::{format_bytes, format_duration};
use engine::{
    plan_copy, scan_source, ChecksumAlgorithm, CopyEngine, CopyResult, DestinationRoot,
    DisplayNameVolumeId, EngineConfig, FileStatus, IntegrityChecker, JsonFileSettings,
    MemorySettings, ProgressCallback, ProgressSnapshot, SettingsStore, SourceFile, StatusReport,
    StatusSummary, Stoppable, VolumeIdProvider,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{info, warn};

/// Offload - copy media to several backups at once and verify them
#[derive(Parser, Debug)]
#[command(name = "offload")]
#[command(version = "0.1.0")]
#[command(about = "Copy source directories to several destinations and verify the copies")]
struct Args {
    /// Source directory (repeat for several sources)
    #[arg(long, value_name = "PATH", required = true)]
    src: Vec<PathBuf>,

    /// Destination root (repeat for several destinations)
    #[arg(long, value_name = "PATH", required = true)]
    dst: Vec<PathBuf>,

    /// Prefix of the session directory created under each destination
    #[arg(long, value_name = "NAME")]
    prefix: Option<String>,

    /// Re-read every copy after the batch and compare digests
    #[arg(long)]
    verify: bool,

    /// Digest algorithm: crc32, md5, sha256, blake3
    #[arg(long, value_name = "ALGORITHM")]
    hash: Option<String>,

    /// JSON settings file (remembers sources, destinations and tunables)
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Size of each of the two copy buffers, in bytes
    #[arg(long, value_name = "BYTES")]
    buffer_size: Option<usize>,

    /// Don't fsync copies before renaming them into place
    #[arg(long)]
    no_sync: bool,

    /// Print one line per file and debug logs
    #[arg(long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace); RUST_LOG overrides it
    #[arg(long, value_name = "LEVEL", default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

/// The engine currently running, so Ctrl-C can reach it.
type StopTarget = Arc<Mutex<Option<Box<dyn Stoppable + Send>>>>;

/// What a run produced, used for the exit code.
#[derive(Debug)]
struct RunOutcome {
    summary: StatusSummary,
    stopped: bool,
    copied_files: usize,
    verified: bool,
}

/// CLI implementation of ProgressCallback for displaying copy progress
struct CliProgress {
    verbose: bool,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        CliProgress { verbose }
    }

    fn print_progress_bar(percent: u32) -> String {
        let filled = (percent.min(100) / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent)
    }
}

impl ProgressCallback for CliProgress {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        let percent = (snapshot.progress * 100.0) as u32;
        let eta = snapshot
            .eta
            .map(format_duration)
            .unwrap_or_else(|| "--".to_string());
        eprint!(
            "\rProgress: {} | {}/{} files | {}/{} | {}/s | ETA {}   ",
            Self::print_progress_bar(percent),
            snapshot.files_done,
            snapshot.files_total,
            format_bytes(snapshot.bytes_done),
            format_bytes(snapshot.bytes_total),
            format_bytes(snapshot.mean_speed),
            eta
        );
        let _ = std::io::Write::flush(&mut std::io::stderr());
    }

    fn on_file_status(&self, file: &SourceFile, report: &StatusReport) {
        if self.verbose || report.status == FileStatus::ErrorOrIncomplete || report.status == FileStatus::IntegrityInvalid {
            eprintln!("\r{}: {}", file.relative_path().display(), report);
        }
    }
}

/// Parse and validate command-line arguments, then run the batch
fn main() {
    let args = Args::parse();

    if let Err(msg) = logging::init(&args.log_level, args.verbose, args.json_logs) {
        eprintln!("Error: {}", msg);
        std::process::exit(2);
    }

    let stop_target: StopTarget = Arc::new(Mutex::new(None));
    let handler_target = Arc::clone(&stop_target);
    let handler = ctrlc::set_handler(move || {
        eprintln!("\nStopping...");
        match handler_target.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            Some(target) => target.stop(Box::new(|| eprintln!("Stopped."))),
            // Nothing is copying yet
            None => std::process::exit(130),
        }
    });
    if let Err(e) = handler {
        warn!(error = %e, "Can't install Ctrl-C handler");
    }

    let result = run_cli(&args, &stop_target);
    if let Err(msg) = &result {
        eprintln!("Error: {}", msg);
    }
    std::process::exit(exit_code(&result));
}

/// 0 when every file is safely offloaded, 1 on per-file problems or stop,
/// 2 when the run could not start.
fn exit_code(result: &Result<RunOutcome, String>) -> i32 {
    match result {
        Ok(outcome) if !outcome.stopped && outcome.summary.all_complete() => 0,
        Ok(_) => 1,
        Err(_) => 2,
    }
}

fn set_stop_target(target: &StopTarget, value: Option<Box<dyn Stoppable + Send>>) {
    *target.lock().unwrap_or_else(|p| p.into_inner()) = value;
}

fn open_settings(args: &Args) -> Result<Box<dyn SettingsStore>, String> {
    match &args.settings {
        Some(path) => JsonFileSettings::open(path)
            .map(|s| Box::new(s) as Box<dyn SettingsStore>)
            .map_err(|e| format!("Settings could not be loaded: {}", e)),
        None => Ok(Box::new(MemorySettings::new())),
    }
}

/// Settings first, command-line flags on top.
fn build_config(args: &Args, settings: &dyn SettingsStore) -> Result<EngineConfig, String> {
    let mut config = EngineConfig::from_settings(settings);
    if let Some(hash) = &args.hash {
        config.algorithm = hash.parse::<ChecksumAlgorithm>()?;
    }
    if let Some(size) = args.buffer_size {
        config.copy_buffer_size = size;
    }
    if args.no_sync {
        config.sync_on_close = false;
    }
    if args.prefix.is_some() {
        config.slot_prefix = args.prefix.clone();
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

/// Main CLI logic - separated for testability
/// Results of files that reached every destination. A file with a failed
/// destination keeps its error status and is not verified.
fn verifiable_results(results: &[CopyResult]) -> Vec<CopyResult> {
    results
        .iter()
        .filter(|r| r.file().status() == FileStatus::AllCopiesDone)
        .cloned()
        .collect()
}

fn run_cli(args: &Args, stop_target: &StopTarget) -> Result<RunOutcome, String> {
    let started = Instant::now();
    let mut settings = open_settings(args)?;
    let config = build_config(args, settings.as_ref())?;

    for src in &args.src {
        if args.dst.iter().any(|dst| dst.starts_with(src) || src.starts_with(dst)) {
            return Err(format!(
                "Source and destination overlap: {}",
                src.display()
            ));
        }
    }

    // Scan every source
    let volume_ids = DisplayNameVolumeId;
    let mut files: Vec<Arc<SourceFile>> = Vec::new();
    for src in &args.src {
        let volume = volume_ids.volume_id(src);
        let scanned = scan_source(src, &volume).map_err(|e| format!("Scan failed: {}", e))?;
        eprintln!(
            "Source {} ({}): {} files",
            src.display(),
            volume,
            scanned.len()
        );
        files.extend(scanned);
    }

    let destinations: Vec<Arc<DestinationRoot>> = args
        .dst
        .iter()
        .map(|dst| Arc::new(DestinationRoot::new(dst)))
        .collect();

    let pending = plan_copy(&files, &destinations, config.small_file_threshold);
    let pending_bytes: u64 = pending.iter().map(|f| f.size()).sum();
    eprintln!(
        "Plan: {} of {} files to copy ({}) to {} destinations",
        pending.len(),
        files.len(),
        format_bytes(pending_bytes),
        destinations.len()
    );

    let mut outcome = RunOutcome {
        summary: StatusSummary::default(),
        stopped: false,
        copied_files: 0,
        verified: false,
    };

    if !pending.is_empty() {
        for destination in &destinations {
            let slot = destination
                .prepare_session_slot(config.slot_prefix.as_deref())
                .map_err(|e| e.to_string())?;
            eprintln!("Writing to {}", slot.dir().display());
        }

        let progress = Arc::new(CliProgress::new(args.verbose));
        let engine = CopyEngine::new(&pending, destinations.clone(), config.clone(), progress.clone())
            .map_err(|e| format!("Copy could not start: {}", e))?;
        set_stop_target(stop_target, Some(Box::new(engine.clone())));
        let batch = engine.start().and_then(|handle| handle.wait());
        set_stop_target(stop_target, None);
        let batch = batch.map_err(|e| format!("Copy failed: {}", e))?;
        eprintln!();

        outcome.stopped = batch.stopped;
        outcome.copied_files = batch.results.iter().filter(|r| !r.is_empty()).count();

        if args.verify && !batch.stopped {
            let verifiable = verifiable_results(&batch.results);
            let skipped = outcome.copied_files.saturating_sub(verifiable.len());
            if skipped > 0 {
                warn!(skipped, "Partly copied files are not verified");
            }
            eprintln!("Verifying {} files...", verifiable.len());
            let checker = IntegrityChecker::new(&verifiable, &config, progress)
                .map_err(|e| format!("Verification could not start: {}", e))?;
            set_stop_target(stop_target, Some(Box::new(checker.clone())));
            let report = checker.run();
            set_stop_target(stop_target, None);
            let report = report.map_err(|e| format!("Verification failed: {}", e))?;
            eprintln!(
                "Verification: {} valid, {} invalid, {} unchecked",
                report.valid_files, report.invalid_files, report.unchecked_files
            );
            for copy in &report.invalid_copies {
                eprintln!("  corrupted: {}", copy.display());
            }
            outcome.stopped |= report.stopped;
            outcome.verified = true;
        }
    }

    settings.set_paths(SOURCES_KEY, &args.src);
    settings.set_paths(DESTINATIONS_KEY, &args.dst);
    config.store_into(settings.as_mut());
    if let Err(e) = settings.flush() {
        warn!(error = %e, "Settings not saved");
    }

    outcome.summary = StatusSummary::from_files(&files);
    eprintln!();
    eprint!("{}", outcome.summary);
    eprintln!("Elapsed: {}", format_duration(started.elapsed()));
    if outcome.stopped {
        eprintln!("Stopped before completion");
    }
    info!(
        files = files.len(),
        copied = outcome.copied_files,
        stopped = outcome.stopped,
        verified = outcome.verified,
        "Run finished"
    );
    Ok(outcome)
}
