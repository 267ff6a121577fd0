//! Registry credentials in the Docker client config format.
//!
//! Stored in `$DOCKER_CONFIG/config.json` (default `~/.docker/config.json`)
//! under `auths.<registry>.auth` as base64 `user:password`. Keys we do not
//! manage are preserved on write.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cdbox_core::error::{BoxError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::fs::atomic_write;

/// Key Docker uses for Docker Hub.
const DOCKER_HUB_KEY: &str = "https://index.docker.io/v1/";

#[derive(Debug, Default, Serialize, Deserialize)]
struct AuthEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store at `$DOCKER_CONFIG/config.json`, falling back to `~/.docker/config.json`.
    pub fn default_path() -> Result<Self> {
        let dir = match std::env::var_os("DOCKER_CONFIG") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .ok_or_else(|| BoxError::Other("cannot determine home directory".to_string()))?
                .join(".docker"),
        };
        Ok(Self::new(dir.join("config.json")))
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut doc = self.load()?;
        doc.auths.insert(
            registry_key(registry),
            AuthEntry {
                auth: Some(STANDARD.encode(format!("{username}:{password}"))),
                ..Default::default()
            },
        );
        self.save(&doc)
    }

    /// `(username, password)` for a registry.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        let doc = self.load()?;
        let Some(entry) = doc.auths.get(&registry_key(registry)) else {
            return Ok(None);
        };
        if let (Some(u), Some(p)) = (&entry.username, &entry.password) {
            return Ok(Some((u.clone(), p.clone())));
        }
        let Some(auth) = &entry.auth else {
            return Ok(None);
        };
        let decoded = STANDARD
            .decode(auth)
            .map_err(|e| BoxError::Other(format!("invalid auth for {registry}: {e}")))?;
        let decoded = String::from_utf8_lossy(&decoded).into_owned();
        match decoded.split_once(':') {
            Some((u, p)) => Ok(Some((u.to_string(), p.to_string()))),
            None => Err(BoxError::Other(format!(
                "invalid auth for {registry}: expected user:password"
            ))),
        }
    }

    /// Returns true if an entry existed.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut doc = self.load()?;
        let removed = doc.auths.remove(&registry_key(registry)).is_some();
        if removed {
            self.save(&doc)?;
        }
        Ok(removed)
    }

    fn load(&self) -> Result<DockerConfig> {
        match std::fs::read(&self.path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|e| {
                BoxError::Other(format!("failed to parse {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DockerConfig::default()),
            Err(e) => Err(BoxError::Other(format!(
                "failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn save(&self, doc: &DockerConfig) -> Result<()> {
        atomic_write(&self.path, &serde_json::to_vec_pretty(doc)?)?;
        let _ = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600));
        Ok(())
    }
}

/// Key under `auths` for a registry host.
pub fn registry_key(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    let r = r
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    match r {
        "docker.io" | "index.docker.io" | "registry-1.docker.io" | "index.docker.io/v1" => {
            DOCKER_HUB_KEY.to_string()
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_get_remove() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("config.json"));

        store.store("ghcr.io", "user1", "pa:ss").unwrap();
        assert_eq!(
            store.get("ghcr.io").unwrap(),
            Some(("user1".to_string(), "pa:ss".to_string()))
        );
        assert!(store.remove("ghcr.io").unwrap());
        assert!(!store.remove("ghcr.io").unwrap());
        assert_eq!(store.get("ghcr.io").unwrap(), None);
    }

    #[test]
    fn test_docker_hub_aliases() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("config.json"));
        store.store("docker.io", "u", "p").unwrap();
        assert!(store.get("index.docker.io").unwrap().is_some());

        let raw: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("config.json")).unwrap())
                .unwrap();
        assert!(raw["auths"][DOCKER_HUB_KEY]["auth"].is_string());
    }

    #[test]
    fn test_preserves_unknown_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"credsStore":"desktop","auths":{}}"#).unwrap();
        let store = CredentialStore::new(path.clone());
        store.store("quay.io", "u", "p").unwrap();
        let raw: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["credsStore"], "desktop");
    }
}
