//! Filesystem operations module.
//!
//! This module provides the low-level operations used by a copy:
//! - Mirroring the source directory chain under a destination
//! - Opening the temporary target without clobbering anything
//! - Publishing a finished temporary file under its final name
//! - Preserving modification times
//! - Querying free space

use crate::error::CopyError;
use filetime::FileTime;
use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;

/// Recreate the directory chain of `relative_file` (a path relative to
/// `source_root`) under `dest_base`.
///
/// `dest_base` itself is created if needed. Each path segment is mirrored only
/// while the source side is a directory; segments that already exist on the
/// destination are left untouched, new ones receive the source directory's
/// modification time.
///
/// # Errors
/// Returns `CopyError::DirectoryCreation` if a directory cannot be created.
pub fn mirror_directories(
    source_root: &Path,
    relative_file: &Path,
    dest_base: &Path,
) -> Result<(), CopyError> {
    fs::create_dir_all(dest_base).map_err(|e| CopyError::directory(dest_base, &e))?;

    let Some(parent) = relative_file.parent() else {
        return Ok(());
    };

    let mut source_dir = source_root.to_path_buf();
    let mut dest_dir = dest_base.to_path_buf();
    let mut created = Vec::new();

    for segment in parent.components() {
        source_dir.push(segment);
        if !source_dir.is_dir() {
            break;
        }
        dest_dir.push(segment);
        if dest_dir.is_dir() {
            continue;
        }
        match fs::create_dir(&dest_dir) {
            Ok(()) => {
                debug!(dir = %dest_dir.display(), "Created directory");
                created.push((source_dir.clone(), dest_dir.clone()));
            }
            // Another copy thread may have won the race
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(CopyError::directory(&dest_dir, &e)),
        }
    }

    // Deepest first: creating a child bumps the parent's mtime.
    for (source_dir, dest_dir) in created.iter().rev() {
        if let Ok(modified) = fs::metadata(source_dir).and_then(|m| m.modified()) {
            set_modified(dest_dir, modified);
        }
    }

    Ok(())
}

/// Open a brand new file for writing. Fails if anything already exists at
/// `path`, so a leftover temporary from another run is never overwritten.
pub fn open_temp(path: &Path) -> Result<fs::File, CopyError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            fs::create_dir_all(parent).map_err(|e| CopyError::directory(parent, &e))?;
        }
    }
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| CopyError::write(path, &e))
}

/// Rename a finished temporary file to its final name.
pub fn publish_file(temp: &Path, target: &Path) -> Result<(), CopyError> {
    #[cfg(windows)]
    {
        if target.exists() {
            if let Err(e) = fs::remove_file(target) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(CopyError::rename(target, &e));
                }
            }
        }
    }

    fs::rename(temp, target).map_err(|e| CopyError::rename(target, &e))?;

    #[cfg(unix)]
    if let Some(parent) = target.parent() {
        // A failed directory fsync doesn't undo the rename
        let _ = fsync_dir(parent);
    }

    Ok(())
}

/// Best-effort modification time update.
pub fn set_modified(path: &Path, modified: SystemTime) {
    if let Err(e) = filetime::set_file_mtime(path, FileTime::from_system_time(modified)) {
        debug!(path = %path.display(), error = %e, "Can't set modification time");
    }
}

/// Bytes available to an unprivileged user on the filesystem holding `path`.
pub fn available_space(path: &Path) -> io::Result<u64> {
    fs2::available_space(path)
}

/// Dot-prefixed names are hidden.
pub fn is_hidden_name(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}
