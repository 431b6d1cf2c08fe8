//! Crash-safe file persistence.
//!
//! The boot counter file, the saved-state file, and the power-on-timer CAL
//! block all share the same durability contract: write to a temporary file
//! in the same directory, `fsync` it, then `rename` it over the target path.
//! A rename within one filesystem is atomic, so a reader never observes a
//! partially written file, and a power loss mid-write leaves the previous
//! contents intact.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::error::DsmeError;

/// Atomically replace the contents of `path` with `contents`.
///
/// # Errors
///
/// Returns [`DsmeError::IoError`] if the temporary file cannot be created,
/// written, synced, or renamed into place.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), DsmeError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let tmp_path = tmp_path_for(path);
    let mut tmp = File::create(&tmp_path)?;
    tmp.write_all(contents)?;
    tmp.sync_all()?;
    drop(tmp);

    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Read the full contents of `path` as a UTF-8 string, if it exists.
///
/// Returns `Ok(None)` rather than an error when the file is simply absent
/// (the common case on first boot), so callers can fall back to defaults.
///
/// # Errors
///
/// Returns [`DsmeError::IoError`] for any failure other than "not found".
pub fn read_to_string_if_exists(path: &Path) -> Result<Option<String>, DsmeError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dsme".to_string());
    path.with_file_name(format!(".{file_name}.tmp.{}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("saved_state");

        write_atomic(&path, b"USER").unwrap();

        let contents = read_to_string_if_exists(&path).unwrap().unwrap();
        assert_eq!(contents, "USER");
    }

    #[test]
    fn missing_file_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nonexistent");

        assert!(read_to_string_if_exists(&path).unwrap().is_none());
    }

    #[test]
    fn overwrite_replaces_contents_atomically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("boot_count");

        write_atomic(&path, b"100 0 0").unwrap();
        write_atomic(&path, b"200 1 0").unwrap();

        let contents = read_to_string_if_exists(&path).unwrap().unwrap();
        assert_eq!(contents, "200 1 0");

        // No leftover temp file.
        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("var/lib/dsme/saved_state");

        write_atomic(&path, b"ACTDEAD").unwrap();
        assert_eq!(
            read_to_string_if_exists(&path).unwrap().unwrap(),
            "ACTDEAD"
        );
    }
}
