//! Runtime collaborators.
//!
//! The lifecycle engine and the compose orchestrator only talk to the
//! runtime through the traits in this module. Local implementations live in
//! the submodules: JSON container records, an OCI runtime binary driven by a
//! detached task monitor, an OCI image-layout store with a registry client,
//! CNI plugin execution, and a `buildctl` builder.

pub mod attach;
pub mod builder;
pub mod cni;
pub mod image;
pub mod namespaces;
pub mod records;
pub mod runc;
pub mod task;

#[cfg(test)]
pub mod fake;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cdbox_core::config::{DataStore, GlobalConfig};
use cdbox_core::container::{ContainerStatus, PortMapping};
use cdbox_core::error::Result;
use chrono::{DateTime, Utc};
use oci_spec::runtime::{Process, Spec};
use serde::{Deserialize, Serialize};

pub use attach::AttachStream;
pub use image::{ChangeKind, FileChange, HistoryEntry, ImageConfig, ImageInfo};

/// Runtime name recorded on containers created by the local task service.
pub const DEFAULT_RUNTIME: &str = "io.containerd.runc.v2";

/// A container record as stored by the container service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    /// Image reference the container was created from (empty for `--rootfs`).
    pub image: String,
    pub runtime: String,
    /// Snapshot key of the container's root filesystem, if one was prepared.
    #[serde(default)]
    pub snapshot_key: Option<String>,
    pub spec: Spec,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Container metadata store.
#[async_trait]
pub trait ContainerService: Send + Sync {
    /// Persist a new record. Fails with `AlreadyExists` on an ID collision.
    async fn create(&self, record: ContainerRecord) -> Result<ContainerRecord>;

    async fn get(&self, id: &str) -> Result<ContainerRecord>;

    async fn list(&self) -> Result<Vec<ContainerRecord>>;

    /// Replace the full label set.
    async fn update_labels(
        &self,
        id: &str,
        labels: HashMap<String, String>,
    ) -> Result<ContainerRecord>;

    async fn update_spec(&self, id: &str, spec: Spec) -> Result<ContainerRecord>;

    async fn delete(&self, id: &str) -> Result<()>;
}

/// A runtime namespace (tenant partition).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct NamespaceInfo {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub containers: usize,
    pub volumes: usize,
}

#[async_trait]
pub trait NamespaceService: Send + Sync {
    async fn list(&self) -> Result<Vec<NamespaceInfo>>;
    async fn create(&self, name: &str, labels: HashMap<String, String>) -> Result<()>;
    /// Fails with a precondition error when the namespace still holds containers.
    async fn remove(&self, name: &str) -> Result<()>;
    async fn inspect(&self, name: &str) -> Result<NamespaceInfo>;
}

/// Observed state of a container's task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub status: ContainerStatus,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restart_count: u32,
}

impl TaskState {
    /// State of a container whose task was never started.
    pub fn created() -> Self {
        Self {
            status: ContainerStatus::Created,
            pid: None,
            exit_code: None,
            started_at: None,
            finished_at: None,
            restart_count: 0,
        }
    }
}

/// Exit of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: i32,
    pub exited_at: DateTime<Utc>,
}

/// How to start a task.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Connect an attach stream before the process starts so no output is lost.
    pub attach: bool,
    /// Keep stdin open (`-i`).
    pub stdin: bool,
    pub tty: bool,
}

/// A started task.
pub struct StartedTask {
    pub pid: u32,
    pub stream: Option<AttachStream>,
}

/// An auxiliary process to run inside a container.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub exec_id: String,
    pub process: Process,
    pub detach: bool,
    /// Wire the caller's stdin (`-i`).
    pub stdin: bool,
    /// Discard output (health checks).
    pub quiet: bool,
}

/// Task supervision.
#[async_trait]
pub trait TaskService: Send + Sync {
    async fn start(&self, record: &ContainerRecord, opts: StartOptions) -> Result<StartedTask>;

    /// Current state; `Created` when no task has ever run.
    async fn state(&self, id: &str) -> Result<TaskState>;

    /// Send `signal` to the init process, or to every process when `all`.
    async fn kill(&self, id: &str, signal: i32, all: bool) -> Result<()>;

    async fn pause(&self, id: &str) -> Result<()>;

    async fn resume(&self, id: &str) -> Result<()>;

    /// Resolve on the next exit of the task (immediately if it is not running).
    async fn wait(&self, id: &str) -> Result<ExitStatus>;

    /// Release runtime resources of a stopped task. Idempotent.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Run an auxiliary process; returns its exit code (0 when detached).
    async fn exec(&self, id: &str, req: ExecRequest) -> Result<i32>;

    async fn pids(&self, id: &str) -> Result<Vec<u32>>;

    /// Attach to the stdio of a running task.
    async fn attach(&self, id: &str) -> Result<AttachStream>;
}

/// Options for pull and push.
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    /// `os/arch[/variant]`, defaults to the host platform.
    pub platform: Option<String>,
    pub insecure: bool,
}

/// What `commit` records on the new image.
#[derive(Debug, Clone, Default)]
pub struct CommitRequest {
    pub snapshot_key: String,
    pub base_image: String,
    pub reference: String,
    pub author: Option<String>,
    pub message: Option<String>,
    /// Replaces the base image config (cmd, entrypoint, env, ...).
    pub config: ImageConfig,
}

/// Image store and snapshotter.
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Look up an image by normalized name or by config digest.
    async fn get(&self, reference: &str) -> Result<ImageInfo>;

    async fn list(&self) -> Result<Vec<ImageInfo>>;

    async fn pull(&self, reference: &str, opts: &PullOptions) -> Result<ImageInfo>;

    async fn push(&self, reference: &str, opts: &PullOptions) -> Result<()>;

    async fn tag(&self, source: &str, target: &str) -> Result<()>;

    /// Untag a name; content is deleted once no name references it.
    async fn remove(&self, name: &str) -> Result<()>;

    /// Materialize a writable root filesystem for `image`; returns its path.
    async fn prepare_snapshot(&self, key: &str, image: &ImageInfo) -> Result<PathBuf>;

    async fn remove_snapshot(&self, key: &str) -> Result<()>;

    /// Bytes used by the snapshot's writable content.
    async fn snapshot_usage(&self, key: &str) -> Result<u64>;

    /// Filesystem changes of a snapshot against its image.
    async fn diff(&self, key: &str) -> Result<Vec<FileChange>>;

    async fn commit(&self, req: CommitRequest) -> Result<ImageInfo>;

    /// Write the images as an OCI archive.
    async fn save(&self, references: &[String], out: &Path) -> Result<()>;

    /// Import an OCI (or docker-save) archive; returns the loaded names.
    async fn load(&self, input: &Path) -> Result<Vec<String>>;
}

/// Per-call runtime configuration for a CNI plugin invocation.
#[derive(Debug, Clone, Default)]
pub struct CniRuntimeConf {
    pub container_id: String,
    /// Network namespace path; `None` is only valid for `DEL`.
    pub netns: Option<PathBuf>,
    pub ifname: String,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub port_mappings: Vec<PortMapping>,
}

/// Interesting parts of a CNI `ADD` result.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CniResult {
    /// Assigned addresses in CIDR form.
    pub ips: Vec<String>,
    pub gateway: Option<String>,
    pub mac: Option<String>,
    pub raw: serde_json::Value,
}

impl CniResult {
    /// First assigned address without the prefix length.
    pub fn primary_ip(&self) -> Option<String> {
        self.ips
            .first()
            .map(|ip| ip.split('/').next().unwrap_or(ip).to_string())
    }
}

/// CNI plugin invoker.
#[async_trait]
pub trait NetworkPlugin: Send + Sync {
    async fn add(&self, conflist: &serde_json::Value, rt: &CniRuntimeConf) -> Result<CniResult>;
    async fn del(&self, conflist: &serde_json::Value, rt: &CniRuntimeConf) -> Result<()>;
    async fn check(&self, conflist: &serde_json::Value, rt: &CniRuntimeConf) -> Result<()>;
}

/// Inputs for an image build.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildRequest {
    pub context: PathBuf,
    pub dockerfile: Option<PathBuf>,
    pub tags: Vec<String>,
    pub build_args: Vec<(String, String)>,
    pub target: Option<String>,
    pub platform: Option<String>,
    pub no_cache: bool,
    pub labels: HashMap<String, String>,
}

/// External image builder.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build and return the path of the resulting OCI archive.
    async fn build(&self, req: &BuildRequest, out_dir: &Path) -> Result<PathBuf>;
}

/// The set of collaborators one command works with.
#[derive(Clone)]
pub struct Services {
    pub containers: Arc<dyn ContainerService>,
    pub tasks: Arc<dyn TaskService>,
    pub images: Arc<dyn ImageService>,
    pub namespaces: Arc<dyn NamespaceService>,
    pub cni: Arc<dyn NetworkPlugin>,
    pub builder: Arc<dyn ImageBuilder>,
}

impl Services {
    /// Local implementations rooted at the data store of `config`.
    pub fn local(config: &GlobalConfig, namespace: &str) -> Result<Self> {
        let store = config.data_store();
        Ok(Self {
            containers: Arc::new(records::LocalContainerService::new(
                store.records_dir(namespace),
            )),
            tasks: Arc::new(task::RuncTaskService::new(config, namespace)?),
            images: Arc::new(image::LocalImageService::new(
                &store,
                namespace,
                config.hosts_dir.clone(),
                config.insecure_registry,
            )?),
            namespaces: Arc::new(namespaces::LocalNamespaceService::new(store.clone())),
            cni: Arc::new(cni::CniExec::new(config.cni_path.display().to_string())),
            builder: Arc::new(builder::BuildctlBuilder::default()),
        })
    }

    /// Build an image and load the result, tagging every requested name.
    pub async fn build_image(&self, store: &DataStore, req: &BuildRequest) -> Result<Vec<String>> {
        let scratch = store.root().join("tmp");
        std::fs::create_dir_all(&scratch)?;
        let out_dir = tempdir_in(&scratch)?;
        let archive = self.builder.build(req, &out_dir).await;
        let result = match archive {
            Ok(path) => self.images.load(&path).await,
            Err(e) => Err(e),
        };
        let _ = std::fs::remove_dir_all(&out_dir);
        let loaded = result?;
        if let Some(first) = loaded.first() {
            for tag in &req.tags {
                let normalized = image::normalize_reference(tag)?;
                if &normalized != first {
                    self.images.tag(first, &normalized).await?;
                }
            }
        }
        Ok(loaded)
    }
}

fn tempdir_in(parent: &Path) -> Result<PathBuf> {
    let dir = parent.join(format!("build-{}", crate::ids::random_hex(8)));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
