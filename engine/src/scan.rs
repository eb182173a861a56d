//! Source scanning and copy planning.

use crate::destination::DestinationRoot;
use crate::error::EngineError;
use crate::fs_ops::is_hidden_name;
use crate::model::SourceFile;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Walk `root` and return one `SourceFile` per regular, non-empty file.
///
/// Symlinks are not followed. Hidden entries (dot-prefixed) are skipped along
/// with everything below them. Unreadable entries are logged and skipped.
/// Results are sorted by path.
///
/// # Errors
/// Returns EngineError if `root` is missing or not a directory.
pub fn scan_source(root: &Path, volume_id: &str) -> Result<Vec<Arc<SourceFile>>, EngineError> {
    match fs::metadata(root) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(EngineError::InvalidPath {
                path: root.to_path_buf(),
                reason: "source is not a directory".to_string(),
            })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(EngineError::SourceNotFound {
                path: root.to_path_buf(),
            })
        }
        Err(e) => {
            return Err(EngineError::EnumerationFailed {
                path: root.to_path_buf(),
                source: e,
            })
        }
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden_name(entry.file_name()));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Can't stat file");
                continue;
            }
        };
        if meta.len() == 0 {
            debug!(path = %entry.path().display(), "Skipping empty file");
            continue;
        }
        files.push(Arc::new(SourceFile::new(
            root,
            entry.path(),
            meta.len(),
            meta.modified().ok(),
            volume_id,
        )));
    }

    files.sort_by(|a, b| a.path().cmp(b.path()));
    info!(root = %root.display(), volume = volume_id, files = files.len(), "Scanned source");
    Ok(files)
}

/// Refresh every file against `destinations` and keep the ones that still
/// need a copy somewhere. Files whose source vanished are dropped.
pub fn plan_copy(
    files: &[Arc<SourceFile>],
    destinations: &[Arc<DestinationRoot>],
    small_file_threshold: u64,
) -> Vec<Arc<SourceFile>> {
    files
        .iter()
        .filter(|file| {
            if file.refresh_copies(destinations, small_file_threshold) {
                true
            } else {
                warn!(path = %file.path().display(), "Source file vanished");
                false
            }
        })
        .filter(|file| file.needs_copy())
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileStatus;
    use std::path::PathBuf;

    fn write(path: &Path, data: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).expect("Failed to create parent");
        fs::write(path, data).expect("Failed to write file");
    }

    #[test]
    fn test_scan_nested_tree_sorted() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("card");
        write(&root.join("DCIM/100/b.jpg"), b"bb");
        write(&root.join("DCIM/100/a.jpg"), b"a");
        write(&root.join("top.txt"), b"top");

        let files = scan_source(&root, "CARD").expect("Failed to scan");
        let rels: Vec<PathBuf> = files.iter().map(|f| f.relative_path().to_path_buf()).collect();
        assert_eq!(
            rels,
            vec![
                PathBuf::from("DCIM/100/a.jpg"),
                PathBuf::from("DCIM/100/b.jpg"),
                PathBuf::from("top.txt"),
            ]
        );
        assert_eq!(files[1].size(), 2);
        assert_eq!(files[0].volume_id(), "CARD");
    }

    #[test]
    fn test_scan_skips_hidden_and_empty() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("card");
        write(&root.join(".Trashes/x.bin"), b"trash");
        write(&root.join(".DS_Store"), b"junk");
        write(&root.join("empty.bin"), b"");
        write(&root.join("keep.bin"), b"keep");

        let files = scan_source(&root, "CARD").expect("Failed to scan");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path(), Path::new("keep.bin"));
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_skips_symlinks() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("card");
        write(&root.join("real.bin"), b"data");
        std::os::unix::fs::symlink(root.join("real.bin"), root.join("link.bin")).expect("Failed to link");

        let files = scan_source(&root, "CARD").expect("Failed to scan");
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_scan_missing_source() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let err = scan_source(&temp_dir.path().join("nope"), "X").expect_err("Must fail");
        assert!(matches!(err, EngineError::SourceNotFound { .. }));
    }

    #[test]
    fn test_scan_file_as_source() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("file.bin");
        write(&path, b"x");
        let err = scan_source(&path, "X").expect_err("Must fail");
        assert!(matches!(err, EngineError::InvalidPath { .. }));
    }

    #[test]
    fn test_plan_copy_keeps_pending_files() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("card");
        write(&root.join("done.bin"), b"done");
        write(&root.join("todo.bin"), b"todo");
        let dest = Arc::new(DestinationRoot::new(&temp_dir.path().join("backup")));
        write(&dest.root().join("old-slot/CARD/done.bin"), b"done");

        let files = scan_source(&root, "CARD").expect("Failed to scan");
        let planned = plan_copy(&files, &[Arc::clone(&dest)], 30_000);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].relative_path(), Path::new("todo.bin"));
        assert_eq!(files[0].status(), FileStatus::AllCopiesDone);
    }
}
