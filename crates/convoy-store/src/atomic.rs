//! Crash-safe file writes.
//!
//! Every write goes to a sibling temporary file, is fsynced, then renamed
//! over the target. On POSIX the rename is atomic, so readers observe either
//! the old or the new content, never a torn file. The containing directory
//! is fsynced afterwards so the rename itself survives a crash.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{StoreError, StoreResult};

/// Write `bytes` to `path` atomically.
///
/// # Errors
///
/// Returns an error when the temporary file cannot be created, written,
/// synced, or renamed over the target.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let tmp = sibling_temp_path(path);
    {
        let mut file =
            File::create(&tmp).map_err(|source| StoreError::io("atomic.create", &tmp, source))?;
        file.write_all(bytes)
            .map_err(|source| StoreError::io("atomic.write", &tmp, source))?;
        file.sync_all()
            .map_err(|source| StoreError::io("atomic.sync", &tmp, source))?;
    }
    fs::rename(&tmp, path).map_err(|source| {
        let _ = fs::remove_file(&tmp);
        StoreError::io("atomic.rename", path, source)
    })?;
    sync_parent_dir(path);
    Ok(())
}

/// Temporary sibling used for the staged write. Kept in the same directory so
/// the final rename never crosses a filesystem boundary.
fn sibling_temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map_or_else(|| "section".to_string(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!(".{file_name}.tmp.{}", std::process::id()))
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn replaces_previous_content() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("secrets.json");
        write_atomic(&target, b"{\"a\":1}").expect("first write");
        write_atomic(&target, b"{\"a\":2}").expect("second write");
        assert_eq!(fs::read_to_string(&target).unwrap(), "{\"a\":2}");
    }

    #[test]
    fn leaves_no_temp_files_behind() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("runs.json");
        write_atomic(&target, b"{}").expect("write");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "temp files remained: {leftovers:?}");
    }
}
