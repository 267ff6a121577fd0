//! Directory-backed named volumes.
//!
//! Each volume is `<root>/<name>/` holding the `_data` mountpoint and a
//! `labels.json` metadata file written atomically. Create and remove take a
//! per-volume lock; `list` takes the store-wide lock exclusively so that it
//! sees a consistent snapshot.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cdbox_core::config::{validate_name, DataStore};
use cdbox_core::error::{BoxError, Result};
use cdbox_core::volume::{VolumeInfo, VolumeMeta};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::filters::{glob_match, Filters};
use crate::fs::{dir_size, read_json, remove_dir_all_if_exists, write_json};

const DATA_DIR: &str = "_data";
const META_FILE: &str = "labels.json";

/// Filter keys accepted by `volume ls` and `volume prune`.
pub const FILTER_KEYS: &[&str] = &["name", "label", "dangling"];

/// Outcome of a multi-name removal.
#[derive(Debug, Default)]
pub struct RemoveOutcome {
    pub removed: Vec<String>,
    pub failed: Vec<(String, BoxError)>,
}

#[derive(Debug)]
pub struct VolumeStore {
    root: PathBuf,
    store_lock: RwLock<()>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl VolumeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            store_lock: RwLock::new(()),
            locks: DashMap::new(),
        }
    }

    /// The store of one namespace.
    pub fn for_namespace(data: &DataStore, namespace: &str) -> Self {
        Self::new(data.volumes_dir(namespace))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn volume_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Host path a volume is mounted from.
    pub fn mountpoint(&self, name: &str) -> PathBuf {
        self.volume_dir(name).join(DATA_DIR)
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn load(&self, name: &str) -> Result<Option<VolumeInfo>> {
        let dir = self.volume_dir(name);
        if !dir.join(DATA_DIR).is_dir() {
            return Ok(None);
        }
        let meta: VolumeMeta = match read_json(&dir.join(META_FILE))? {
            Some(meta) => meta,
            None => VolumeMeta::new(HashMap::new()),
        };
        Ok(Some(VolumeInfo::new(name, self.mountpoint(name), meta)))
    }

    /// Create a volume; repeating a create with identical labels returns the
    /// existing volume.
    pub fn create(&self, name: &str, labels: HashMap<String, String>) -> Result<VolumeInfo> {
        validate_name("volume", name)?;
        let _store = self.store_lock.read();
        let lock = self.lock_for(name);
        let _guard = lock.lock();

        if let Some(existing) = self.load(name)? {
            if existing.labels == labels {
                return Ok(existing);
            }
            return Err(BoxError::AlreadyExists(format!(
                "volume {name:?} with different labels"
            )));
        }

        let dir = self.volume_dir(name);
        std::fs::create_dir_all(dir.join(DATA_DIR)).map_err(|e| {
            BoxError::Other(format!("failed to create volume directory {}: {}", dir.display(), e))
        })?;
        let meta = VolumeMeta::new(labels);
        if let Err(e) = write_json(&dir.join(META_FILE), &meta) {
            let _ = remove_dir_all_if_exists(&dir);
            return Err(e);
        }
        tracing::debug!(volume = name, "volume created");
        Ok(VolumeInfo::new(name, self.mountpoint(name), meta))
    }

    /// Create a volume with a generated 64-hex name.
    pub fn create_anonymous(&self) -> Result<VolumeInfo> {
        self.create(&crate::ids::generate_id(), HashMap::new())
    }

    pub fn get(&self, name: &str) -> Result<VolumeInfo> {
        if validate_name("volume", name).is_err() {
            return Err(BoxError::not_found("volume", name));
        }
        self.load(name)?
            .ok_or_else(|| BoxError::not_found("volume", name))
    }

    pub fn exists(&self, name: &str) -> bool {
        matches!(self.get(name), Ok(_))
    }

    /// Recursive byte count of the volume's `_data`.
    pub fn usage(&self, name: &str) -> Result<u64> {
        let info = self.get(name)?;
        Ok(dir_size(&info.mountpoint))
    }

    /// List volumes matching `filters`. `in_use` holds the names referenced
    /// by any container and drives the `dangling` filter.
    pub fn list(&self, filters: &Filters, in_use: &HashSet<String>) -> Result<Vec<VolumeInfo>> {
        let dangling = filters.bool("dangling")?;
        let _store = self.store_lock.write();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(info) = self.load(&name)? else { continue };
            if !filters.any("name", |p| glob_match(p, &name) || name.contains(p)) {
                continue;
            }
            if !filters.labels_match(&info.labels) {
                continue;
            }
            if let Some(want) = dangling {
                if want == in_use.contains(&name) {
                    continue;
                }
            }
            out.push(info);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Remove volumes. Every name is validated (exists, not referenced)
    /// before anything is deleted; with `force` referenced volumes go too.
    pub fn remove(&self, names: &[String], in_use: &HashSet<String>, force: bool) -> RemoveOutcome {
        let mut outcome = RemoveOutcome::default();
        let mut doomed = Vec::new();
        for name in names {
            match self.get(name) {
                Ok(_) if in_use.contains(name) && !force => outcome.failed.push((
                    name.clone(),
                    BoxError::Precondition(format!("volume {name:?} is in use")),
                )),
                Ok(_) => doomed.push(name.clone()),
                Err(e) => outcome.failed.push((name.clone(), e)),
            }
        }
        for name in doomed {
            match self.delete(&name) {
                Ok(()) => outcome.removed.push(name),
                Err(e) => outcome.failed.push((name, e)),
            }
        }
        outcome
    }

    /// Delete one volume unconditionally.
    pub fn delete(&self, name: &str) -> Result<()> {
        let _store = self.store_lock.read();
        let lock = self.lock_for(name);
        let _guard = lock.lock();
        let dir = self.volume_dir(name);
        if !dir.exists() {
            return Err(BoxError::not_found("volume", name));
        }
        remove_dir_all_if_exists(&dir)?;
        drop(_guard);
        self.locks.remove(name);
        tracing::debug!(volume = name, "volume removed");
        Ok(())
    }

    /// Remove unreferenced volumes matching `filters`; returns names and reclaimed bytes.
    ///
    /// Without `all`, only anonymous (64-hex) volumes are candidates.
    pub fn prune(
        &self,
        filters: &Filters,
        in_use: &HashSet<String>,
        all: bool,
    ) -> Result<Vec<(String, u64)>> {
        let candidates = self.list(filters, in_use)?;
        let mut pruned = Vec::new();
        for info in candidates {
            if in_use.contains(&info.name) {
                continue;
            }
            if !all && !crate::ids::is_full_id(&info.name) {
                continue;
            }
            let size = dir_size(&info.mountpoint);
            match self.delete(&info.name) {
                Ok(()) => pruned.push((info.name, size)),
                Err(e) => tracing::warn!(volume = %info.name, error = %e, "failed to prune volume"),
            }
        }
        Ok(pruned)
    }
}
