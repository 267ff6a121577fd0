//! Local image service.
//!
//! Images live in an OCI image-layout store under `images/`, unpacked trees
//! are cached per config digest, and every container gets a private copy of
//! its image tree as a snapshot under `snapshots/<ns>/`.

pub mod credentials;
pub mod layers;
pub mod layout;
pub mod reference;
pub mod registry;
pub mod snapshot;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cdbox_core::config::DataStore;
use cdbox_core::error::{BoxError, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use oci_spec::image::ImageConfiguration;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub use credentials::{registry_key, CredentialStore};
pub use reference::{normalize_reference, ImageReference};
pub use registry::Platform;

use super::{CommitRequest, ImageService, PullOptions};
use crate::fs::remove_dir_all_if_exists;
use layout::{
    digest_hex, Descriptor, ImageStore, Index, Manifest, StoredImage, ANNOTATION_IMAGE_NAME,
    ANNOTATION_REF_NAME, MEDIA_TYPE_DOCKER_LAYER, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_LAYER_GZIP, MEDIA_TYPE_OCI_MANIFEST,
};
use registry::RegistryClient;
use snapshot::Snapshotter;

const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
const MEDIA_TYPE_DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

/// The parts of an image config a container is built from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// `VOLUME` destinations.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// `EXPOSE` entries (`80/tcp`).
    #[serde(default)]
    pub exposed_ports: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub stop_signal: Option<String>,
}

impl ImageConfig {
    fn from_oci(config: &ImageConfiguration) -> Self {
        let Some(c) = config.config() else {
            return Self::default();
        };
        let non_empty = |s: &Option<String>| s.clone().filter(|v| !v.is_empty());
        let mut volumes = c.volumes().clone().unwrap_or_default();
        volumes.sort();
        let mut exposed_ports = c.exposed_ports().clone().unwrap_or_default();
        exposed_ports.sort();
        Self {
            entrypoint: c.entrypoint().clone(),
            cmd: c.cmd().clone(),
            env: c.env().clone().unwrap_or_default(),
            user: non_empty(c.user()),
            working_dir: non_empty(c.working_dir()),
            volumes,
            exposed_ports,
            labels: c.labels().clone().unwrap_or_default(),
            stop_signal: non_empty(c.stop_signal()),
        }
    }

    /// Write these fields into the `config` object of a raw image config.
    fn apply_to(&self, target: &mut serde_json::Map<String, Value>) {
        let set_opt = |target: &mut serde_json::Map<String, Value>, key: &str, v: Value| {
            if v.is_null() {
                target.remove(key);
            } else {
                target.insert(key.to_string(), v);
            }
        };
        set_opt(target, "Entrypoint", json!(self.entrypoint));
        set_opt(target, "Cmd", json!(self.cmd));
        set_opt(target, "Env", json!(self.env));
        set_opt(target, "User", json!(self.user.clone().unwrap_or_default()));
        set_opt(
            target,
            "WorkingDir",
            json!(self.working_dir.clone().unwrap_or_default()),
        );
        let as_set = |items: &[String]| -> Value {
            if items.is_empty() {
                Value::Null
            } else {
                Value::Object(items.iter().map(|i| (i.clone(), json!({}))).collect())
            }
        };
        set_opt(target, "Volumes", as_set(&self.volumes));
        set_opt(target, "ExposedPorts", as_set(&self.exposed_ports));
        set_opt(
            target,
            "Labels",
            if self.labels.is_empty() {
                Value::Null
            } else {
                json!(self.labels)
            },
        );
        set_opt(target, "StopSignal", json!(self.stop_signal));
    }
}

/// One `history` entry of an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub created: Option<DateTime<Utc>>,
    pub created_by: String,
    pub comment: String,
    pub empty_layer: bool,
    /// Compressed size of the layer this step produced.
    pub size: u64,
}

/// An image as seen by consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Normalized reference, or the config digest for an unnamed image.
    pub name: String,
    /// Config digest.
    pub id: String,
    /// Manifest digest.
    pub digest: String,
    pub repo_digest: Option<String>,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
    pub author: Option<String>,
    pub config: ImageConfig,
    pub history: Vec<HistoryEntry>,
    /// Uncompressed layer digests, bottom first.
    pub diff_ids: Vec<String>,
}

impl ImageInfo {
    /// Whether the image has no name of its own.
    pub fn is_dangling(&self) -> bool {
        self.name.starts_with("sha256:")
    }

    /// Docker-style short name (`alpine:latest`), `<none>` when dangling.
    pub fn familiar_name(&self) -> String {
        if self.is_dangling() {
            return "<none>:<none>".to_string();
        }
        ImageReference::parse(&self.name)
            .map(|r| r.familiar())
            .unwrap_or_else(|_| self.name.clone())
    }
}

/// Kind of a filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Changed,
    Deleted,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ChangeKind::Added => "A",
            ChangeKind::Changed => "C",
            ChangeKind::Deleted => "D",
        })
    }
}

/// A change in a container filesystem relative to its image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub kind: ChangeKind,
    /// Absolute path inside the container.
    pub path: String,
}

fn parse_time(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn image_info(store: &ImageStore, stored: &StoredImage) -> Result<ImageInfo> {
    let manifest = store.read_manifest(&stored.manifest_digest)?;
    let config_bytes = store.read_blob(&manifest.config.digest)?;
    let oci: ImageConfiguration = serde_json::from_slice(&config_bytes).map_err(|e| {
        BoxError::runtime(
            "image config",
            format!("invalid config {}: {}", manifest.config.digest, e),
        )
    })?;

    let mut layer_sizes = manifest.layers.iter().map(|l| l.size);
    let history = oci
        .history()
        .iter()
        .map(|h| {
            let empty_layer = h.empty_layer().unwrap_or(false);
            HistoryEntry {
                created: parse_time(h.created()),
                created_by: h.created_by().clone().unwrap_or_default(),
                comment: h.comment().clone().unwrap_or_default(),
                empty_layer,
                size: if empty_layer {
                    0
                } else {
                    layer_sizes.next().unwrap_or(0)
                },
            }
        })
        .collect();

    Ok(ImageInfo {
        name: stored.reference.clone(),
        id: manifest.config.digest.clone(),
        digest: stored.manifest_digest.clone(),
        repo_digest: stored.repo_digest.clone(),
        size: stored.size_bytes,
        created: parse_time(oci.created()),
        os: oci.os().to_string(),
        architecture: oci.architecture().to_string(),
        variant: oci.variant().clone(),
        author: oci.author().clone(),
        config: ImageConfig::from_oci(&oci),
        history,
        diff_ids: oci.rootfs().diff_ids().clone(),
    })
}

/// Unpack every layer of `manifest_digest` into the cache, once.
fn ensure_unpacked(store: &ImageStore, manifest_digest: &str) -> Result<PathBuf> {
    let manifest = store.read_manifest(manifest_digest)?;
    let dir = store.unpacked_dir(&manifest.config.digest);
    if dir.exists() {
        return Ok(dir);
    }
    let parent = store.root().join("rootfs");
    std::fs::create_dir_all(&parent)?;
    let staging = parent.join(format!(
        ".{}-{}",
        digest_hex(&manifest.config.digest),
        crate::ids::random_hex(4)
    ));
    let result = (|| -> Result<()> {
        for layer in &manifest.layers {
            layers::extract_layer(&store.blob_path(&layer.digest), &staging)?;
        }
        if manifest.layers.is_empty() {
            std::fs::create_dir_all(&staging)?;
        }
        Ok(())
    })();
    if let Err(e) = result {
        let _ = remove_dir_all_if_exists(&staging);
        return Err(e);
    }
    if let Err(e) = std::fs::rename(&staging, &dir) {
        // Another process finished first.
        let _ = remove_dir_all_if_exists(&staging);
        if !dir.exists() {
            return Err(e.into());
        }
    }
    tracing::debug!(config = %manifest.config.digest, "image unpacked");
    Ok(dir)
}

/// The image service backed by the local store.
pub struct LocalImageService {
    store: Arc<ImageStore>,
    snapshots: Arc<Snapshotter>,
    hosts_dirs: Vec<PathBuf>,
    insecure: bool,
    scratch: PathBuf,
}

impl LocalImageService {
    pub fn new(
        data: &DataStore,
        namespace: &str,
        hosts_dirs: Vec<PathBuf>,
        insecure: bool,
    ) -> Result<Self> {
        Ok(Self {
            store: Arc::new(ImageStore::open(&data.images_dir())?),
            snapshots: Arc::new(Snapshotter::new(data.snapshots_dir(namespace))),
            hosts_dirs,
            insecure,
            scratch: data.root().join("tmp"),
        })
    }

    fn registry(&self, opts: &PullOptions) -> RegistryClient {
        RegistryClient::new(self.insecure || opts.insecure, self.hosts_dirs.clone())
    }

    fn find(&self, reference: &str) -> Result<Option<StoredImage>> {
        if let Some(found) = self.store.get(reference)? {
            return Ok(Some(found));
        }
        if let Ok(normalized) = normalize_reference(reference) {
            if let Some(found) = self.store.get(&normalized)? {
                return Ok(Some(found));
            }
        }
        let by_id = if reference.starts_with("sha256:") {
            reference.to_string()
        } else {
            format!("sha256:{reference}")
        };
        Ok(self
            .store
            .list()?
            .into_iter()
            .find(|i| i.config_digest == by_id))
    }

    fn stored(&self, reference: &str) -> Result<StoredImage> {
        self.find(reference)?
            .ok_or_else(|| BoxError::not_found("image", reference))
    }

    fn scratch_dir(&self, prefix: &str) -> Result<PathBuf> {
        let dir = self
            .scratch
            .join(format!("{prefix}-{}", crate::ids::random_hex(8)));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn commit_blocking(&self, req: &CommitRequest) -> Result<StoredImage> {
        let base = if req.base_image.is_empty() {
            None
        } else {
            Some(self.stored(&req.base_image)?)
        };
        let (mut config, mut manifest) = match &base {
            Some(b) => {
                let manifest = self.store.read_manifest(&b.manifest_digest)?;
                let config: Value =
                    serde_json::from_slice(&self.store.read_blob(&manifest.config.digest)?)?;
                (config, manifest)
            }
            None => {
                let host = Platform::host();
                (
                    json!({
                        "architecture": host.architecture,
                        "os": host.os,
                        "rootfs": {"type": "layers", "diff_ids": []},
                        "config": {},
                    }),
                    Manifest {
                        schema_version: 2,
                        media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
                        config: Descriptor::new(MEDIA_TYPE_OCI_CONFIG, String::new(), 0),
                        layers: Vec::new(),
                        annotations: None,
                    },
                )
            }
        };

        let changes = self.snapshots.diff(&req.snapshot_key)?;
        let rootfs = self.snapshots.rootfs(&req.snapshot_key)?;
        let layer = layers::create_layer(&rootfs, &changes)?;
        self.store.write_blob(&layer.data)?;

        let now = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
        let obj = config
            .as_object_mut()
            .ok_or_else(|| BoxError::runtime("commit", "image config is not an object"))?;
        obj.insert("created".to_string(), json!(now));
        if let Some(author) = &req.author {
            obj.insert("author".to_string(), json!(author));
        }
        let rootfs_obj = obj
            .entry("rootfs")
            .or_insert_with(|| json!({"type": "layers", "diff_ids": []}));
        match rootfs_obj.get_mut("diff_ids").and_then(Value::as_array_mut) {
            Some(ids) => ids.push(json!(layer.diff_id)),
            None => rootfs_obj["diff_ids"] = json!([layer.diff_id]),
        }
        let history_entry = json!({
            "created": now,
            "created_by": "cdbox commit",
            "author": req.author.clone().unwrap_or_default(),
            "comment": req.message.clone().unwrap_or_default(),
        });
        match obj.get_mut("history").and_then(Value::as_array_mut) {
            Some(h) => h.push(history_entry),
            None => {
                obj.insert("history".to_string(), json!([history_entry]));
            }
        }
        let inner = obj.entry("config").or_insert_with(|| json!({}));
        if let Some(inner) = inner.as_object_mut() {
            req.config.apply_to(inner);
        }

        let config_bytes = serde_json::to_vec(&config)?;
        let config_digest = self.store.write_blob(&config_bytes)?;
        manifest.config = Descriptor::new(
            &manifest.config.media_type,
            config_digest,
            config_bytes.len() as u64,
        );
        if manifest.config.media_type == MEDIA_TYPE_DOCKER_CONFIG {
            manifest.layers.push(Descriptor::new(
                "application/vnd.docker.image.rootfs.diff.tar.gzip",
                layer.digest,
                layer.data.len() as u64,
            ));
        } else {
            manifest.layers.push(Descriptor::new(
                MEDIA_TYPE_OCI_LAYER_GZIP,
                layer.digest,
                layer.data.len() as u64,
            ));
        }
        let manifest_digest = self.store.write_blob(&serde_json::to_vec(&manifest)?)?;

        let name = if req.reference.is_empty() {
            manifest.config.digest.clone()
        } else {
            normalize_reference(&req.reference)?
        };
        self.store.put(&name, &manifest_digest, None)
    }

    fn save_blocking(&self, references: &[String], out: &Path) -> Result<()> {
        let mut index = Index {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_INDEX.to_string()),
            manifests: Vec::new(),
        };
        let mut blobs: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for reference in references {
            let stored = self.stored(reference)?;
            let manifest = self.store.read_manifest(&stored.manifest_digest)?;
            let manifest_size = self.store.read_blob(&stored.manifest_digest)?.len() as u64;
            let media_type = manifest
                .media_type
                .clone()
                .unwrap_or_else(|| MEDIA_TYPE_OCI_MANIFEST.to_string());
            let mut desc = Descriptor::new(&media_type, stored.manifest_digest.clone(), manifest_size);
            if !stored.reference.starts_with("sha256:") {
                let mut annotations = BTreeMap::new();
                annotations.insert(ANNOTATION_IMAGE_NAME.to_string(), stored.reference.clone());
                if let Ok(r) = ImageReference::parse(&stored.reference) {
                    if let Some(tag) = r.tag {
                        annotations.insert(ANNOTATION_REF_NAME.to_string(), tag);
                    }
                }
                desc.annotations = Some(annotations);
            }
            index.manifests.push(desc);

            let digests = std::iter::once(stored.manifest_digest.clone())
                .chain(std::iter::once(manifest.config.digest.clone()))
                .chain(manifest.layers.iter().map(|l| l.digest.clone()));
            for digest in digests {
                if seen.insert(digest.clone()) {
                    blobs.push(digest);
                }
            }
        }

        if let Some(parent) = out.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::File::create(out)?;
        let mut builder = tar::Builder::new(file);
        let append_bytes = |builder: &mut tar::Builder<std::fs::File>, name: &str, data: &[u8]| {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data)
        };
        append_bytes(&mut builder, "oci-layout", br#"{"imageLayoutVersion":"1.0.0"}"#)?;
        append_bytes(&mut builder, "index.json", &serde_json::to_vec(&index)?)?;
        for digest in &blobs {
            builder.append_path_with_name(
                self.store.blob_path(digest),
                format!("blobs/sha256/{}", digest_hex(digest)),
            )?;
        }
        builder.into_inner()?;
        tracing::debug!(out = %out.display(), images = references.len(), "images saved");
        Ok(())
    }

    fn load_blocking(&self, input: &Path) -> Result<Vec<String>> {
        let staging = self.scratch_dir("load")?;
        let result = self.load_from_dir(input, &staging);
        let _ = remove_dir_all_if_exists(&staging);
        result
    }

    fn load_from_dir(&self, input: &Path, staging: &Path) -> Result<Vec<String>> {
        let mut file = std::io::BufReader::new(std::fs::File::open(input).map_err(|e| {
            BoxError::invalid(format!("cannot open {}: {}", input.display(), e))
        })?);
        let gzip = std::io::BufRead::fill_buf(&mut file)?.starts_with(&[0x1f, 0x8b]);
        let unpacked = if gzip {
            tar::Archive::new(GzDecoder::new(file)).unpack(staging)
        } else {
            tar::Archive::new(file).unpack(staging)
        };
        unpacked.map_err(|e| BoxError::invalid(format!("{}: not an image archive: {}", input.display(), e)))?;

        if staging.join("index.json").exists() {
            self.load_oci_layout(staging)
        } else if staging.join("manifest.json").exists() {
            self.load_docker_archive(staging)
        } else {
            Err(BoxError::invalid(format!(
                "{}: neither index.json nor manifest.json found",
                input.display()
            )))
        }
    }

    fn import_blob(&self, staging: &Path, digest: &str) -> Result<Vec<u8>> {
        let path = staging.join("blobs").join("sha256").join(digest_hex(digest));
        let data = std::fs::read(&path)
            .map_err(|e| BoxError::invalid(format!("archive is missing blob {digest}: {e}")))?;
        self.store.write_blob_checked(digest, &data)?;
        Ok(data)
    }

    /// Pick the manifest for this host out of a (possibly nested) index entry.
    fn import_manifest(&self, staging: &Path, desc: &Descriptor) -> Result<String> {
        let data = self.import_blob(staging, &desc.digest)?;
        let is_index = desc.media_type == MEDIA_TYPE_OCI_INDEX
            || desc.media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST;
        if is_index {
            let nested: Index = serde_json::from_slice(&data)?;
            let host = Platform::host();
            let chosen = nested
                .manifests
                .iter()
                .find(|m| {
                    m.platform.as_ref().map_or(false, |p| {
                        p["os"] == json!(host.os) && p["architecture"] == json!(host.architecture)
                    })
                })
                .or_else(|| nested.manifests.first())
                .ok_or_else(|| BoxError::invalid("archive index lists no manifests"))?
                .clone();
            return self.import_manifest(staging, &chosen);
        }
        let manifest: Manifest = serde_json::from_slice(&data)?;
        self.import_blob(staging, &manifest.config.digest)?;
        for layer in &manifest.layers {
            self.import_blob(staging, &layer.digest)?;
        }
        Ok(desc.digest.clone())
    }

    fn load_oci_layout(&self, staging: &Path) -> Result<Vec<String>> {
        let index: Index = serde_json::from_slice(&std::fs::read(staging.join("index.json"))?)?;
        let mut loaded = Vec::new();
        for desc in &index.manifests {
            let manifest_digest = self.import_manifest(staging, desc)?;
            let annotations = desc.annotations.clone().unwrap_or_default();
            let name = annotations
                .get(ANNOTATION_IMAGE_NAME)
                .cloned()
                .or_else(|| {
                    annotations
                        .get(ANNOTATION_REF_NAME)
                        .filter(|r| r.contains('/') || r.contains(':'))
                        .cloned()
                });
            let name = match name {
                Some(n) => normalize_reference(&n)?,
                None => self.store.read_manifest(&manifest_digest)?.config.digest,
            };
            self.store.put(&name, &manifest_digest, None)?;
            loaded.push(name);
        }
        Ok(loaded)
    }

    fn load_docker_archive(&self, staging: &Path) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Entry {
            config: String,
            #[serde(default)]
            repo_tags: Option<Vec<String>>,
            layers: Vec<String>,
        }
        let entries: Vec<Entry> =
            serde_json::from_slice(&std::fs::read(staging.join("manifest.json"))?)?;
        let mut loaded = Vec::new();
        for entry in entries {
            let config = std::fs::read(staging.join(&entry.config))?;
            let config_digest = self.store.write_blob(&config)?;
            let mut layer_descs = Vec::with_capacity(entry.layers.len());
            for layer in &entry.layers {
                let mut data = Vec::new();
                std::fs::File::open(staging.join(layer))?.read_to_end(&mut data)?;
                let gzip = data.starts_with(&[0x1f, 0x8b]);
                let digest = self.store.write_blob(&data)?;
                let media_type = if gzip {
                    MEDIA_TYPE_OCI_LAYER_GZIP
                } else {
                    MEDIA_TYPE_DOCKER_LAYER
                };
                layer_descs.push(Descriptor::new(media_type, digest, data.len() as u64));
            }
            let manifest = Manifest {
                schema_version: 2,
                media_type: Some(MEDIA_TYPE_DOCKER_MANIFEST.to_string()),
                config: Descriptor::new(
                    MEDIA_TYPE_DOCKER_CONFIG,
                    config_digest.clone(),
                    config.len() as u64,
                ),
                layers: layer_descs,
                annotations: None,
            };
            let manifest_digest = self.store.write_blob(&serde_json::to_vec(&manifest)?)?;
            let tags = entry.repo_tags.unwrap_or_default();
            if tags.is_empty() {
                self.store.put(&config_digest, &manifest_digest, None)?;
                loaded.push(config_digest);
            }
            for tag in tags {
                let name = normalize_reference(&tag)?;
                self.store.put(&name, &manifest_digest, None)?;
                loaded.push(name);
            }
        }
        Ok(loaded)
    }
}

#[async_trait]
impl ImageService for LocalImageService {
    async fn get(&self, reference: &str) -> Result<ImageInfo> {
        image_info(&self.store, &self.stored(reference)?)
    }

    async fn list(&self) -> Result<Vec<ImageInfo>> {
        let mut images = Vec::new();
        for stored in self.store.list()? {
            match image_info(&self.store, &stored) {
                Ok(info) => images.push(info),
                Err(e) => tracing::warn!(image = %stored.reference, error = %e, "skipping unreadable image"),
            }
        }
        Ok(images)
    }

    async fn pull(&self, reference: &str, opts: &PullOptions) -> Result<ImageInfo> {
        let parsed = ImageReference::parse(reference)?;
        let platform = opts.platform.as_deref().map(Platform::parse).transpose()?;
        let pulled = self
            .registry(opts)
            .pull(&parsed, platform, &self.store)
            .await?;
        let stored = self.store.put(
            &parsed.full_reference(),
            &pulled.manifest_digest,
            Some(format!("{}@{}", parsed.name(), pulled.repo_digest)),
        )?;
        image_info(&self.store, &stored)
    }

    async fn push(&self, reference: &str, opts: &PullOptions) -> Result<()> {
        let stored = self.stored(reference)?;
        let parsed = ImageReference::parse(&stored.reference)?;
        self.registry(opts)
            .push(&parsed, &stored.manifest_digest, &self.store)
            .await?;
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        let stored = self.stored(source)?;
        let target = normalize_reference(target)?;
        self.store
            .put(&target, &stored.manifest_digest, stored.repo_digest.clone())?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let stored = self.stored(name)?;
        let by_name = self.store.get(name)?.is_some()
            || normalize_reference(name)
                .ok()
                .map_or(false, |n| n == stored.reference);
        if by_name {
            self.store.untag(&stored.reference)?;
        } else {
            // Removal by ID drops every name of the image.
            for image in self.store.list()? {
                if image.config_digest == stored.config_digest {
                    self.store.untag(&image.reference)?;
                }
            }
        }
        let removed = self.store.gc()?;
        tracing::debug!(image = name, unpacked_removed = removed.len(), "image removed");
        Ok(())
    }

    async fn prepare_snapshot(&self, key: &str, image: &ImageInfo) -> Result<PathBuf> {
        let store = Arc::clone(&self.store);
        let snapshots = Arc::clone(&self.snapshots);
        let key = key.to_string();
        let manifest_digest = image.digest.clone();
        let parent = image.id.clone();
        tokio::task::spawn_blocking(move || {
            let tree = ensure_unpacked(&store, &manifest_digest)?;
            snapshots.prepare(&key, &parent, &tree)
        })
        .await
        .map_err(|e| BoxError::runtime("snapshot prepare", e))?
    }

    async fn remove_snapshot(&self, key: &str) -> Result<()> {
        self.snapshots.remove(key)
    }

    async fn snapshot_usage(&self, key: &str) -> Result<u64> {
        self.snapshots.usage(key)
    }

    async fn diff(&self, key: &str) -> Result<Vec<FileChange>> {
        self.snapshots.diff(key)
    }

    async fn commit(&self, req: CommitRequest) -> Result<ImageInfo> {
        let stored = self.commit_blocking(&req)?;
        tracing::info!(image = %stored.reference, "container committed");
        image_info(&self.store, &stored)
    }

    async fn save(&self, references: &[String], out: &Path) -> Result<()> {
        self.save_blocking(references, out)
    }

    async fn load(&self, input: &Path) -> Result<Vec<String>> {
        self.load_blocking(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    fn gz_layer(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, content.as_bytes()).unwrap();
        }
        let tar = builder.into_inner().unwrap();
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut enc, &tar).unwrap();
        enc.finish().unwrap()
    }

    /// Store a one-layer image under `reference`.
    fn seed(service: &LocalImageService, reference: &str) -> StoredImage {
        let layer = gz_layer(&[("etc/passwd", "root:x:0:0::/root:/bin/sh\n"), ("data/seed", "s")]);
        let layer_digest = service.store.write_blob(&layer).unwrap();
        let config = json!({
            "architecture": "amd64",
            "os": "linux",
            "created": "2024-01-01T00:00:00Z",
            "config": {
                "Cmd": ["/bin/sh"],
                "Env": ["PATH=/usr/bin:/bin"],
                "Volumes": {"/data": {}},
                "ExposedPorts": {"80/tcp": {}},
                "Labels": {"maintainer": "ops"}
            },
            "rootfs": {"type": "layers", "diff_ids": ["sha256:00"]},
            "history": [
                {"created_by": "ADD rootfs"},
                {"created_by": "CMD [\"/bin/sh\"]", "empty_layer": true}
            ]
        });
        let config = serde_json::to_vec(&config).unwrap();
        let config_digest = service.store.write_blob(&config).unwrap();
        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            config: Descriptor::new(MEDIA_TYPE_OCI_CONFIG, config_digest, config.len() as u64),
            layers: vec![Descriptor::new(
                MEDIA_TYPE_OCI_LAYER_GZIP,
                layer_digest,
                layer.len() as u64,
            )],
            annotations: None,
        };
        let manifest_digest = service
            .store
            .write_blob(&serde_json::to_vec(&manifest).unwrap())
            .unwrap();
        service.store.put(reference, &manifest_digest, None).unwrap()
    }

    fn service(tmp: &TempDir) -> LocalImageService {
        let data = DataStore::new(tmp.path(), "/run/test.sock");
        LocalImageService::new(&data, "default", Vec::new(), false).unwrap()
    }

    #[tokio::test]
    async fn test_get_by_name_and_id() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let stored = seed(&svc, "docker.io/library/alpine:latest");

        let info = svc.get("alpine").await.unwrap();
        assert_eq!(info.id, stored.config_digest);
        assert_eq!(info.familiar_name(), "alpine:latest");
        assert_eq!(info.config.cmd, Some(vec!["/bin/sh".to_string()]));
        assert_eq!(info.config.volumes, vec!["/data".to_string()]);
        assert_eq!(info.config.exposed_ports, vec!["80/tcp".to_string()]);
        assert_eq!(info.history.len(), 2);
        assert!(info.history[1].empty_layer);
        assert!(info.history[0].size > 0);

        let by_id = svc.get(digest_hex(&stored.config_digest)).await.unwrap();
        assert_eq!(by_id.name, "docker.io/library/alpine:latest");
        assert!(svc.get("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_tag_and_remove() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        seed(&svc, "docker.io/library/alpine:latest");
        svc.tag("alpine", "myrepo/alpine:v1").await.unwrap();
        assert_eq!(svc.list().await.unwrap().len(), 2);

        svc.remove("alpine").await.unwrap();
        let left = svc.list().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "docker.io/myrepo/alpine:v1");
        // Content is still referenced by the remaining tag.
        assert!(svc.get("myrepo/alpine:v1").await.is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_and_commit() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        seed(&svc, "docker.io/library/alpine:latest");
        let image = svc.get("alpine").await.unwrap();

        let rootfs = svc.prepare_snapshot("c1", &image).await.unwrap();
        assert!(rootfs.join("etc/passwd").exists());
        std::fs::write(rootfs.join("hello.txt"), "hi").unwrap();
        std::fs::remove_file(rootfs.join("data/seed")).unwrap();

        let changes = svc.diff("c1").await.unwrap();
        assert!(changes.contains(&FileChange {
            kind: ChangeKind::Added,
            path: "/hello.txt".to_string()
        }));
        assert!(changes.contains(&FileChange {
            kind: ChangeKind::Deleted,
            path: "/data/seed".to_string()
        }));
        assert_eq!(svc.snapshot_usage("c1").await.unwrap(), 2);

        let mut config = image.config.clone();
        config.cmd = Some(vec!["cat".to_string(), "/hello.txt".to_string()]);
        let committed = svc
            .commit(CommitRequest {
                snapshot_key: "c1".to_string(),
                base_image: image.name.clone(),
                reference: "snap:v1".to_string(),
                author: Some("ops".to_string()),
                message: Some("add hello".to_string()),
                config,
            })
            .await
            .unwrap();
        assert_eq!(committed.name, "docker.io/library/snap:v1");
        assert_eq!(committed.diff_ids.len(), 2);
        assert_eq!(committed.author.as_deref(), Some("ops"));
        assert_eq!(committed.history.last().unwrap().comment, "add hello");
        assert_eq!(committed.config.cmd.as_ref().unwrap()[0], "cat");

        let new_root = svc.prepare_snapshot("c2", &committed).await.unwrap();
        assert_eq!(std::fs::read_to_string(new_root.join("hello.txt")).unwrap(), "hi");
        assert!(!new_root.join("data/seed").exists());

        svc.remove_snapshot("c1").await.unwrap();
        assert!(!rootfs.exists());
    }

    #[tokio::test]
    async fn test_save_then_load_into_fresh_store() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        seed(&svc, "docker.io/library/alpine:latest");
        let archive = tmp.path().join("out/alpine.tar");
        svc.save(&["alpine".to_string()], &archive).await.unwrap();

        let other = TempDir::new().unwrap();
        let fresh = service(&other);
        let loaded = fresh.load(&archive).await.unwrap();
        assert_eq!(loaded, vec!["docker.io/library/alpine:latest".to_string()]);
        let info = fresh.get("alpine").await.unwrap();
        assert_eq!(info.config.labels.get("maintainer").map(String::as_str), Some("ops"));
    }

    #[tokio::test]
    async fn test_load_rejects_garbage() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let path = tmp.path().join("junk.tar");
        std::fs::write(&path, b"definitely not a tar archive at all").unwrap();
        assert!(svc.load(&path).await.is_err());
    }
}
