//! Small filesystem helpers shared by the stores.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use cdbox_core::error::{BoxError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Write `data` atomically (write to `.tmp`, then rename).
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            BoxError::Other(format!("failed to create directory {}: {}", parent.display(), e))
        })?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, data)
        .map_err(|e| BoxError::Other(format!("failed to write {}: {}", path.display(), e)))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        BoxError::Other(format!("failed to rename into {}: {}", path.display(), e))
    })?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &data)
}

/// Read a JSON file, `Ok(None)` if it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data).map_err(|e| {
            BoxError::SerializationError(format!("{}: {}", path.display(), e))
        })?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BoxError::Other(format!("failed to read {}: {}", path.display(), e))),
    }
}

/// Recursively copy a directory, preserving modes, ownership (best-effort) and symlinks.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    let meta = std::fs::symlink_metadata(src)?;
    std::fs::set_permissions(dst, std::fs::Permissions::from_mode(meta.mode()))?;
    chown_best_effort(dst, &meta);

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let ft = entry.file_type()?;
        if ft.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else if ft.is_symlink() {
            let target = std::fs::read_link(&src_path)?;
            let _ = std::fs::remove_file(&dst_path);
            std::os::unix::fs::symlink(target, &dst_path)?;
        } else if ft.is_file() {
            std::fs::copy(&src_path, &dst_path)?;
            if let Ok(meta) = entry.metadata() {
                chown_best_effort(&dst_path, &meta);
            }
        }
    }
    Ok(())
}

fn chown_best_effort(path: &Path, meta: &std::fs::Metadata) {
    let _ = std::os::unix::fs::chown(path, Some(meta.uid()), Some(meta.gid()));
}

/// Calculate total size of a directory recursively (symlinks are not followed).
pub fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let Ok(ft) = entry.file_type() else { continue };
            if ft.is_dir() {
                total += dir_size(&entry.path());
            } else if ft.is_file() {
                if let Ok(meta) = entry.metadata() {
                    total += meta.len();
                }
            }
        }
    }
    total
}

/// Whether a directory is missing or has no entries.
pub fn is_empty_dir(path: &Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

/// Remove a directory tree, treating "already gone" as success.
pub fn remove_dir_all_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BoxError::Other(format!(
            "failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_and_read_json() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/dir/value.json");
        write_json(&path, &vec!["a", "b"]).unwrap();
        let back: Option<Vec<String>> = read_json(&path).unwrap();
        assert_eq!(back.unwrap(), vec!["a", "b"]);
        assert!(!tmp.path().join("nested/dir/value.json.tmp").exists());
    }

    #[test]
    fn test_read_json_missing() {
        let tmp = TempDir::new().unwrap();
        let back: Option<Vec<String>> = read_json(&tmp.path().join("nope.json")).unwrap();
        assert!(back.is_none());
    }

    #[test]
    fn test_copy_dir_recursive_and_size() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("etc")).unwrap();
        std::fs::write(src.join("etc/hostname"), "box\n").unwrap();
        std::os::unix::fs::symlink("hostname", src.join("etc/link")).unwrap();

        let dst = tmp.path().join("dst");
        copy_dir_recursive(&src, &dst).unwrap();
        assert_eq!(std::fs::read_to_string(dst.join("etc/hostname")).unwrap(), "box\n");
        assert_eq!(
            std::fs::read_link(dst.join("etc/link")).unwrap(),
            Path::new("hostname")
        );
        assert_eq!(dir_size(&dst), 4);
        assert!(!is_empty_dir(&dst));
        assert!(is_empty_dir(&tmp.path().join("missing")));
    }

    #[test]
    fn test_remove_dir_all_if_exists() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("x");
        std::fs::create_dir(&dir).unwrap();
        remove_dir_all_if_exists(&dir).unwrap();
        remove_dir_all_if_exists(&dir).unwrap();
        assert!(!dir.exists());
    }
}
