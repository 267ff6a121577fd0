use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use cdbox_core::config::{validate_name, DataStore};
use cdbox_core::error::{BoxError, Result};

use super::{NamespaceInfo, NamespaceService};
use crate::fs::{read_json, remove_dir_all_if_exists, write_json};

/// Namespaces backed by the data-store tree.
///
/// A namespace exists when it was created explicitly (a labels file under
/// `namespaces/`) or when any per-namespace directory holds content for it.
pub struct LocalNamespaceService {
    store: DataStore,
}

impl LocalNamespaceService {
    pub fn new(store: DataStore) -> Self {
        Self { store }
    }

    fn labels_path(&self, name: &str) -> PathBuf {
        self.store.root().join("namespaces").join(format!("{name}.json"))
    }

    fn known(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        if let Ok(entries) = std::fs::read_dir(self.store.root().join("namespaces")) {
            for entry in entries.flatten() {
                let path = entry.path();
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if path.extension().and_then(|e| e.to_str()) == Some("json") {
                        names.insert(stem.to_string());
                    }
                }
            }
        }
        for sub in ["records", "volumes"] {
            if let Ok(entries) = std::fs::read_dir(self.store.root().join(sub)) {
                for entry in entries.flatten() {
                    if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                        names.insert(entry.file_name().to_string_lossy().into_owned());
                    }
                }
            }
        }
        names
    }

    fn count(&self, dir: PathBuf) -> usize {
        std::fs::read_dir(dir).map(|e| e.count()).unwrap_or(0)
    }

    fn info(&self, name: &str) -> Result<NamespaceInfo> {
        let labels: HashMap<String, String> =
            read_json(&self.labels_path(name))?.unwrap_or_default();
        Ok(NamespaceInfo {
            name: name.to_string(),
            labels,
            containers: self.count(self.store.records_dir(name)),
            volumes: self.count(self.store.volumes_dir(name)),
        })
    }
}

#[async_trait]
impl NamespaceService for LocalNamespaceService {
    async fn list(&self) -> Result<Vec<NamespaceInfo>> {
        self.known().iter().map(|n| self.info(n)).collect()
    }

    async fn create(&self, name: &str, labels: HashMap<String, String>) -> Result<()> {
        validate_name("namespace", name)?;
        if self.known().contains(name) {
            return Err(BoxError::AlreadyExists(format!("namespace {name:?}")));
        }
        write_json(&self.labels_path(name), &labels)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        if !self.known().contains(name) {
            return Err(BoxError::not_found("namespace", name));
        }
        let info = self.info(name)?;
        if info.containers > 0 || info.volumes > 0 {
            return Err(BoxError::Precondition(format!(
                "namespace {name:?} must be empty, but has {} containers and {} volumes",
                info.containers, info.volumes
            )));
        }
        let _ = std::fs::remove_file(self.labels_path(name));
        for dir in [
            self.store.records_dir(name),
            self.store.volumes_dir(name),
            self.store.containers_dir(name),
            self.store.names_dir(name),
            self.store.snapshots_dir(name),
            self.store.runtime_root(name),
        ] {
            remove_dir_all_if_exists(&dir)?;
        }
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<NamespaceInfo> {
        if !self.known().contains(name) {
            return Err(BoxError::not_found("namespace", name));
        }
        self.info(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn service(tmp: &Path) -> LocalNamespaceService {
        LocalNamespaceService::new(DataStore::new(tmp, "/run/test.sock"))
    }

    #[tokio::test]
    async fn test_create_list_remove() {
        let tmp = TempDir::new().unwrap();
        let svc = service(tmp.path());
        svc.create("team-a", HashMap::from([("owner".into(), "me".into())]))
            .await
            .unwrap();
        assert!(matches!(
            svc.create("team-a", HashMap::new()).await,
            Err(BoxError::AlreadyExists(_))
        ));

        let all = svc.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].labels.get("owner").unwrap(), "me");

        svc.remove("team-a").await.unwrap();
        assert!(svc.inspect("team-a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_remove_non_empty_fails() {
        let tmp = TempDir::new().unwrap();
        let svc = service(tmp.path());
        let store = DataStore::new(tmp.path(), "/run/test.sock");
        std::fs::create_dir_all(store.records_dir("busy")).unwrap();
        std::fs::write(store.records_dir("busy").join("x.json"), "{}").unwrap();

        let info = svc.inspect("busy").await.unwrap();
        assert_eq!(info.containers, 1);
        assert!(matches!(
            svc.remove("busy").await,
            Err(BoxError::Precondition(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_name() {
        let tmp = TempDir::new().unwrap();
        let svc = service(tmp.path());
        assert!(svc.create("bad/name", HashMap::new()).await.is_err());
    }
}
