//! Atomic file operations
//!
//! Writes go to a sibling `*.tmp` file which is flushed, synced and then
//! renamed over the target, so readers only ever observe the old or the new
//! content in full.

use crate::{Error, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Sibling temp path used while writing `target`
pub fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    target.with_file_name(name)
}

/// Sibling backup path for `target` (`<name>.backup`)
pub fn backup_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".backup");
    target.with_file_name(name)
}

/// Replace `target` with `bytes` atomically (temp + rename)
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = temp_path_for(target);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::Io(e));
    }

    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically
pub fn write_json_atomic<T: Serialize + ?Sized>(target: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomic(target, &bytes)
}

/// Copy `target` to its `.backup` sibling. Returns the backup path.
///
/// An existing backup is only replaced once the new copy is complete.
pub fn write_backup(target: &Path) -> Result<PathBuf> {
    let backup = backup_path_for(target);
    let bytes = fs::read(target)?;
    write_atomic(&backup, &bytes)?;
    tracing::info!(
        original = %target.display(),
        backup = %backup.display(),
        bytes = bytes.len(),
        "Backup written"
    );
    Ok(backup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces_content_and_cleans_temp() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("data.json");

        write_atomic(&target, b"first").unwrap();
        write_atomic(&target, b"second").unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "second");
        assert!(!temp_path_for(&target).exists());
    }

    #[test]
    fn test_write_atomic_creates_parent() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("nested/deeper/data.json");
        write_atomic(&target, b"{}").unwrap();
        assert!(target.exists());
    }

    #[test]
    fn test_backup_copies_original() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("snapshot.json");
        fs::write(&target, "[1,2").unwrap();

        let backup = write_backup(&target).unwrap();

        assert_eq!(backup, dir.path().join("snapshot.json.backup"));
        assert_eq!(fs::read_to_string(&backup).unwrap(), "[1,2");
        assert_eq!(fs::read_to_string(&target).unwrap(), "[1,2");
    }

    #[test]
    fn test_write_json_atomic_is_pretty() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("v.json");
        write_json_atomic(&target, &serde_json::json!({"a": 1})).unwrap();
        let text = fs::read_to_string(&target).unwrap();
        assert!(text.contains("\n  \"a\": 1"));
    }
}
