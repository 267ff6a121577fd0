//! JSON-file container records.
//!
//! One `<id>.json` per container under `records/<namespace>/`, written
//! atomically. A store-wide mutex serializes writers; readers go straight to
//! disk.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use cdbox_core::error::{BoxError, Result};
use oci_spec::runtime::Spec;
use parking_lot::Mutex;

use super::{ContainerRecord, ContainerService};
use crate::fs::{read_json, write_json};

pub struct LocalContainerService {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalContainerService {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn load(&self, id: &str) -> Result<ContainerRecord> {
        if id.is_empty() || id.contains('/') {
            return Err(BoxError::not_found("container", id));
        }
        read_json(&self.path(id))?.ok_or_else(|| BoxError::not_found("container", id))
    }

    fn mutate(&self, id: &str, f: impl FnOnce(&mut ContainerRecord)) -> Result<ContainerRecord> {
        let _guard = self.write_lock.lock();
        let mut record = self.load(id)?;
        f(&mut record);
        write_json(&self.path(id), &record)?;
        Ok(record)
    }
}

#[async_trait]
impl ContainerService for LocalContainerService {
    async fn create(&self, record: ContainerRecord) -> Result<ContainerRecord> {
        let _guard = self.write_lock.lock();
        let path = self.path(&record.id);
        if path.exists() {
            return Err(BoxError::AlreadyExists(format!("container {}", record.id)));
        }
        write_json(&path, &record)?;
        tracing::debug!(id = %record.id, "container record created");
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<ContainerRecord> {
        self.load(id)
    }

    async fn list(&self) -> Result<Vec<ContainerRecord>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // A record may vanish between readdir and read.
            match read_json::<ContainerRecord>(&path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn update_labels(
        &self,
        id: &str,
        labels: HashMap<String, String>,
    ) -> Result<ContainerRecord> {
        self.mutate(id, |r| r.labels = labels)
    }

    async fn update_spec(&self, id: &str, spec: Spec) -> Result<ContainerRecord> {
        self.mutate(id, |r| r.spec = spec)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        match std::fs::remove_file(self.path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BoxError::not_found("container", id))
            }
            Err(e) => Err(e.into()),
        }
    }
}
