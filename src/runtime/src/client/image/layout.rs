//! Content store in OCI image-layout form.
//!
//! ```text
//! images/
//!   blobs/sha256/<hex>     content-addressed blobs shared by every image
//!   images.json            name → manifest digest index
//!   rootfs/<config-hex>/   unpacked image trees (cache)
//! ```

use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};

use cdbox_core::error::{BoxError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::fs::{atomic_write, read_json, write_json};

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";

/// Annotation carrying the full image name in an OCI archive.
pub const ANNOTATION_IMAGE_NAME: &str = "io.containerd.image.name";
/// Annotation carrying the tag in an OCI archive.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// An OCI content descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<serde_json::Value>,
}

impl Descriptor {
    pub fn new(media_type: &str, digest: String, size: u64) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest,
            size,
            annotations: None,
            platform: None,
        }
    }
}

/// Image manifest (OCI or Docker schema 2, which share this shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// `index.json` of an OCI layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

/// A named image in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredImage {
    /// Normalized reference (`docker.io/library/alpine:latest`).
    pub reference: String,
    pub manifest_digest: String,
    pub config_digest: String,
    /// Compressed bytes of config and layers.
    pub size_bytes: u64,
    /// Digest reported by the registry, if pulled.
    #[serde(default)]
    pub repo_digest: Option<String>,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    images: Vec<StoredImage>,
}

/// sha256 digest of a byte slice, `sha256:<hex>`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// sha256 digest of a file, streamed.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Hex part of a digest.
pub fn digest_hex(digest: &str) -> &str {
    digest.split_once(':').map(|(_, h)| h).unwrap_or(digest)
}

/// Blob store plus name index.
pub struct ImageStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl ImageStore {
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root.join("blobs").join("sha256")).map_err(|e| {
            BoxError::Other(format!(
                "failed to create image store {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self {
            root: root.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let (algo, hex) = digest.split_once(':').unwrap_or(("sha256", digest));
        self.root.join("blobs").join(algo).join(hex)
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    /// Store bytes, returning their digest.
    pub fn write_blob(&self, data: &[u8]) -> Result<String> {
        let digest = sha256_digest(data);
        let path = self.blob_path(&digest);
        if !path.exists() {
            atomic_write(&path, data)?;
        }
        Ok(digest)
    }

    /// Store bytes that must hash to `expected`.
    pub fn write_blob_checked(&self, expected: &str, data: &[u8]) -> Result<()> {
        let actual = sha256_digest(data);
        if actual != expected {
            return Err(BoxError::runtime(
                "image content",
                format!("digest mismatch: expected {expected}, got {actual}"),
            ));
        }
        self.write_blob(data).map(|_| ())
    }

    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        std::fs::read(self.blob_path(digest)).map_err(|e| {
            BoxError::runtime("image content", format!("missing blob {digest}: {e}"))
        })
    }

    pub fn read_manifest(&self, digest: &str) -> Result<Manifest> {
        Ok(serde_json::from_slice(&self.read_blob(digest)?)?)
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("images.json")
    }

    fn load_index(&self) -> Result<StoreIndex> {
        Ok(read_json(&self.index_path())?.unwrap_or_default())
    }

    fn save_index(&self, index: &StoreIndex) -> Result<()> {
        write_json(&self.index_path(), index)
    }

    /// Point `reference` at a manifest already in the blob store.
    pub fn put(
        &self,
        reference: &str,
        manifest_digest: &str,
        repo_digest: Option<String>,
    ) -> Result<StoredImage> {
        let manifest = self.read_manifest(manifest_digest)?;
        let size_bytes = manifest.config.size + manifest.layers.iter().map(|l| l.size).sum::<u64>();
        let stored = StoredImage {
            reference: reference.to_string(),
            manifest_digest: manifest_digest.to_string(),
            config_digest: manifest.config.digest.clone(),
            size_bytes,
            repo_digest,
            stored_at: Utc::now(),
        };

        let _guard = self.lock.lock();
        let mut index = self.load_index()?;
        index.images.retain(|i| i.reference != reference);
        index.images.push(stored.clone());
        self.save_index(&index)?;
        tracing::debug!(reference, digest = manifest_digest, "image stored");
        Ok(stored)
    }

    pub fn get(&self, reference: &str) -> Result<Option<StoredImage>> {
        Ok(self
            .load_index()?
            .images
            .into_iter()
            .find(|i| i.reference == reference))
    }

    pub fn list(&self) -> Result<Vec<StoredImage>> {
        let mut images = self.load_index()?.images;
        images.sort_by(|a, b| a.reference.cmp(&b.reference));
        Ok(images)
    }

    /// Drop a name. Returns the removed entry.
    pub fn untag(&self, reference: &str) -> Result<Option<StoredImage>> {
        let _guard = self.lock.lock();
        let mut index = self.load_index()?;
        let pos = index.images.iter().position(|i| i.reference == reference);
        let removed = pos.map(|p| index.images.remove(p));
        if removed.is_some() {
            self.save_index(&index)?;
        }
        Ok(removed)
    }

    /// Delete blobs and unpacked trees no longer reachable from any name.
    ///
    /// Returns the config digests whose content was removed.
    pub fn gc(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock();
        let index = self.load_index()?;
        let mut live = HashSet::new();
        let mut live_configs = HashSet::new();
        for image in &index.images {
            live.insert(image.manifest_digest.clone());
            live.insert(image.config_digest.clone());
            live_configs.insert(digest_hex(&image.config_digest).to_string());
            if let Ok(manifest) = self.read_manifest(&image.manifest_digest) {
                for layer in manifest.layers {
                    live.insert(layer.digest);
                }
            }
        }

        let mut removed = Vec::new();
        let blobs = self.root.join("blobs").join("sha256");
        if let Ok(entries) = std::fs::read_dir(&blobs) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let digest = format!("sha256:{name}");
                if !live.contains(&digest) {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
        if let Ok(entries) = std::fs::read_dir(self.root.join("rootfs")) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !live_configs.contains(&name) {
                    let _ = std::fs::remove_dir_all(entry.path());
                    removed.push(format!("sha256:{name}"));
                }
            }
        }
        Ok(removed)
    }

    /// Directory holding the unpacked tree for a config digest.
    pub fn unpacked_dir(&self, config_digest: &str) -> PathBuf {
        self.root.join("rootfs").join(digest_hex(config_digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn put_sample(store: &ImageStore, reference: &str, layer: &[u8]) -> StoredImage {
        let layer_digest = store.write_blob(layer).unwrap();
        let config_digest = store.write_blob(br#"{"architecture":"amd64","os":"linux"}"#).unwrap();
        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            config: Descriptor::new(MEDIA_TYPE_OCI_CONFIG, config_digest, 37),
            layers: vec![Descriptor::new(
                MEDIA_TYPE_OCI_LAYER_GZIP,
                layer_digest,
                layer.len() as u64,
            )],
            annotations: None,
        };
        let manifest_digest = store.write_blob(&serde_json::to_vec(&manifest).unwrap()).unwrap();
        store.put(reference, &manifest_digest, None).unwrap()
    }

    #[test]
    fn test_put_get_untag() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::open(tmp.path()).unwrap();
        let stored = put_sample(&store, "docker.io/library/a:latest", b"layer-a");
        assert_eq!(stored.size_bytes, 37 + 7);

        let got = store.get("docker.io/library/a:latest").unwrap().unwrap();
        assert_eq!(got.manifest_digest, stored.manifest_digest);
        assert_eq!(store.list().unwrap().len(), 1);

        assert!(store.untag("docker.io/library/a:latest").unwrap().is_some());
        assert!(store.untag("docker.io/library/a:latest").unwrap().is_none());
    }

    #[test]
    fn test_gc_keeps_shared_blobs() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::open(tmp.path()).unwrap();
        let a = put_sample(&store, "docker.io/library/a:latest", b"shared");
        let b = put_sample(&store, "docker.io/library/b:latest", b"only-b");
        std::fs::create_dir_all(store.unpacked_dir(&b.config_digest)).unwrap();

        store.untag("docker.io/library/b:latest").unwrap();
        store.gc().unwrap();

        assert!(store.has_blob(&a.manifest_digest));
        assert!(store.has_blob(&sha256_digest(b"shared")));
        assert!(!store.has_blob(&sha256_digest(b"only-b")));
        assert!(!store.has_blob(&b.manifest_digest));
    }

    #[test]
    fn test_write_blob_checked() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::open(tmp.path()).unwrap();
        assert!(store.write_blob_checked(&sha256_digest(b"x"), b"x").is_ok());
        assert!(store.write_blob_checked(&sha256_digest(b"x"), b"y").is_err());
    }

    #[test]
    fn test_sha256_file_matches_digest() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), sha256_digest(b"hello"));
        assert_eq!(digest_hex("sha256:abc"), "abc");
    }
}
