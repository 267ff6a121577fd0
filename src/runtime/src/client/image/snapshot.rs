//! Copy-based snapshotter.
//!
//! A snapshot is a private copy of an unpacked image tree plus a baseline
//! index of every entry at preparation time. `diff` and `usage` compare the
//! live tree against that baseline.

use std::collections::BTreeMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use cdbox_core::error::{BoxError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ChangeKind, FileChange};
use crate::fs::{copy_dir_recursive, read_json, remove_dir_all_if_exists, write_json};

/// Metadata of one filesystem entry at baseline time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub size: u64,
    pub mtime: i64,
    pub mtime_nsec: i64,
    pub mode: u32,
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

/// Every entry of a tree keyed by absolute in-container path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirSnapshot {
    pub entries: BTreeMap<String, FileEntry>,
}

impl DirSnapshot {
    pub fn capture(root: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        walk(root, root, &mut entries)?;
        Ok(Self { entries })
    }

    /// Changes from `self` (before) to `after`.
    ///
    /// Deleted directories are reported once; their children are implied.
    pub fn diff(&self, after: &DirSnapshot) -> Vec<FileChange> {
        let mut changes = Vec::new();
        for (path, entry) in &after.entries {
            match self.entries.get(path) {
                None => changes.push(FileChange {
                    kind: ChangeKind::Added,
                    path: path.clone(),
                }),
                Some(before) if before != entry => {
                    // Directory metadata on its own only changes when content does.
                    let quiet_dir = before.is_dir
                        && entry.is_dir
                        && before.mode == entry.mode
                        && !child_changed(path, self, after);
                    if !quiet_dir {
                        changes.push(FileChange {
                            kind: ChangeKind::Changed,
                            path: path.clone(),
                        });
                    }
                }
                Some(_) => {}
            }
        }

        let mut deleted_dirs: Vec<&str> = Vec::new();
        for (path, entry) in &self.entries {
            if after.entries.contains_key(path) {
                continue;
            }
            if deleted_dirs
                .iter()
                .any(|d| path.starts_with(d) && path.as_bytes().get(d.len()) == Some(&b'/'))
            {
                continue;
            }
            if entry.is_dir {
                deleted_dirs.push(path);
            }
            changes.push(FileChange {
                kind: ChangeKind::Deleted,
                path: path.clone(),
            });
        }

        changes.sort_by(|a, b| a.path.cmp(&b.path));
        changes
    }
}

fn child_changed(dir: &str, before: &DirSnapshot, after: &DirSnapshot) -> bool {
    let prefix = format!("{}/", dir.trim_end_matches('/'));
    let direct = |p: &str| p.starts_with(&prefix) && !p[prefix.len()..].contains('/');
    let added_or_changed = after
        .entries
        .range(prefix.clone()..)
        .take_while(|(p, _)| p.starts_with(&prefix))
        .any(|(p, e)| direct(p.as_str()) && before.entries.get(p) != Some(e));
    let removed = before
        .entries
        .range(prefix.clone()..)
        .take_while(|(p, _)| p.starts_with(&prefix))
        .any(|(p, _)| direct(p.as_str()) && !after.entries.contains_key(p));
    added_or_changed || removed
}

fn walk(root: &Path, current: &Path, entries: &mut BTreeMap<String, FileEntry>) -> Result<()> {
    let read_dir = match std::fs::read_dir(current) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(BoxError::Other(format!(
                "failed to read directory {}: {}",
                current.display(),
                e
            )))
        }
    };

    for entry in read_dir.flatten() {
        let path = entry.path();
        let Ok(relative) = path.strip_prefix(root) else { continue };
        let Ok(meta) = std::fs::symlink_metadata(&path) else { continue };
        let link = if meta.file_type().is_symlink() {
            std::fs::read_link(&path)
                .ok()
                .map(|t| t.to_string_lossy().into_owned())
        } else {
            None
        };
        let key = format!("/{}", relative.to_string_lossy());
        entries.insert(
            key,
            FileEntry {
                size: if meta.is_file() { meta.len() } else { 0 },
                mtime: meta.mtime(),
                mtime_nsec: meta.mtime_nsec(),
                mode: meta.mode(),
                is_dir: meta.is_dir(),
                link,
            },
        );
        if meta.is_dir() {
            walk(root, &path, entries)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotMeta {
    parent: String,
    created_at: DateTime<Utc>,
}

/// Snapshots of one namespace under `snapshots/<ns>/`.
pub struct Snapshotter {
    root: PathBuf,
}

impl Snapshotter {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn dir(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains('/') || key.starts_with('.') {
            return Err(BoxError::invalid(format!("invalid snapshot key {key:?}")));
        }
        Ok(self.root.join(key))
    }

    pub fn rootfs(&self, key: &str) -> Result<PathBuf> {
        Ok(self.dir(key)?.join("rootfs"))
    }

    /// Copy `source` into a new snapshot and record its baseline.
    pub fn prepare(&self, key: &str, parent: &str, source: &Path) -> Result<PathBuf> {
        let dir = self.dir(key)?;
        if dir.exists() {
            return Err(BoxError::AlreadyExists(format!("snapshot {key:?}")));
        }
        let rootfs = dir.join("rootfs");
        let result = (|| -> Result<()> {
            copy_dir_recursive(source, &rootfs).map_err(|e| {
                BoxError::runtime("snapshot prepare", format!("copy {}: {}", source.display(), e))
            })?;
            let baseline = DirSnapshot::capture(&rootfs)?;
            write_json(&dir.join("baseline.json"), &baseline)?;
            write_json(
                &dir.join("meta.json"),
                &SnapshotMeta {
                    parent: parent.to_string(),
                    created_at: Utc::now(),
                },
            )
        })();
        if let Err(e) = result {
            let _ = remove_dir_all_if_exists(&dir);
            return Err(e);
        }
        tracing::debug!(key, parent, "snapshot prepared");
        Ok(rootfs)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        remove_dir_all_if_exists(&self.dir(key)?)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.dir(key).map(|d| d.exists()).unwrap_or(false)
    }

    /// Config digest of the image the snapshot was prepared from.
    pub fn parent(&self, key: &str) -> Result<String> {
        let meta: SnapshotMeta = read_json(&self.dir(key)?.join("meta.json"))?
            .ok_or_else(|| BoxError::not_found("snapshot", key))?;
        Ok(meta.parent)
    }

    pub fn diff(&self, key: &str) -> Result<Vec<FileChange>> {
        let dir = self.dir(key)?;
        let baseline: DirSnapshot = read_json(&dir.join("baseline.json"))?
            .ok_or_else(|| BoxError::not_found("snapshot", key))?;
        let current = DirSnapshot::capture(&dir.join("rootfs"))?;
        Ok(baseline.diff(&current))
    }

    /// Bytes of regular files added or modified since preparation.
    pub fn usage(&self, key: &str) -> Result<u64> {
        let dir = self.dir(key)?;
        let baseline: DirSnapshot = read_json(&dir.join("baseline.json"))?
            .ok_or_else(|| BoxError::not_found("snapshot", key))?;
        let current = DirSnapshot::capture(&dir.join("rootfs"))?;
        Ok(current
            .entries
            .iter()
            .filter(|(p, e)| !e.is_dir && baseline.entries.get(*p) != Some(*e))
            .map(|(_, e)| e.size)
            .sum())
    }
}
