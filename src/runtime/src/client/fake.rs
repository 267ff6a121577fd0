//! In-memory runtime used by unit tests.
//!
//! Task behavior is driven by the container's process args:
//! `sh -c "exit N"` exits immediately with `N`, `/nonexistent` fails to
//! start with 127, an arg containing `ignore-term` survives SIGTERM, and
//! anything else runs until killed.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cdbox_core::container::ContainerStatus;
use cdbox_core::error::{BoxError, Result};
use chrono::Utc;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::Notify;

use super::attach::{write_frame, AttachStream, Frame};
use super::{
    BuildRequest, CniResult, CniRuntimeConf, CommitRequest, ContainerRecord, ContainerService,
    ExecRequest, ExitStatus, FileChange, ImageBuilder, ImageConfig, ImageInfo, ImageService,
    NamespaceInfo, NamespaceService, NetworkPlugin, PullOptions, Services, StartOptions,
    StartedTask, TaskService, TaskState,
};

#[derive(Default)]
struct State {
    containers: HashMap<String, ContainerRecord>,
    tasks: HashMap<String, TaskState>,
    images: HashMap<String, ImageInfo>,
    /// Files seeded into snapshots of an image, keyed by image name.
    image_files: HashMap<String, Vec<(String, String)>>,
    pullable: HashMap<String, ImageInfo>,
    namespaces: HashMap<String, HashMap<String, String>>,
    snapshots: HashSet<String>,
}

/// Recorded calls, for assertions.
#[derive(Debug, Default, Clone)]
pub struct Calls {
    pub pulls: Vec<String>,
    pub pushes: Vec<String>,
    pub starts: Vec<String>,
    pub kills: Vec<(String, i32)>,
    pub execs: Vec<(String, Vec<String>)>,
    pub cni_add: Vec<String>,
    pub cni_del: Vec<String>,
    pub builds: Vec<BuildRequest>,
    pub commits: Vec<String>,
}

pub struct FakeRuntime {
    root: TempDir,
    state: Mutex<State>,
    calls: Mutex<Calls>,
    /// Exit codes handed out to successive `exec` calls; 0 once drained.
    exec_codes: Mutex<Vec<i32>>,
    exited: Notify,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            root: TempDir::new().expect("tempdir"),
            state: Mutex::new(State::default()),
            calls: Mutex::new(Calls::default()),
            exec_codes: Mutex::new(Vec::new()),
            exited: Notify::new(),
        })
    }

    pub fn services(self: &Arc<Self>) -> Services {
        Services {
            containers: self.clone(),
            tasks: self.clone(),
            images: self.clone(),
            namespaces: self.clone(),
            cni: self.clone(),
            builder: self.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Register a local image.
    pub fn add_image(&self, name: &str, config: ImageConfig) -> ImageInfo {
        let info = image(name, config);
        self.state.lock().images.insert(info.name.clone(), info.clone());
        info
    }

    /// Make an image available for `pull` without storing it locally.
    pub fn add_remote_image(&self, name: &str, config: ImageConfig) {
        let info = image(name, config);
        self.state.lock().pullable.insert(info.name.clone(), info);
    }

    /// Seed a file into every snapshot prepared from `image`.
    pub fn add_image_file(&self, image: &str, path: &str, content: &str) {
        let name = super::image::normalize_reference(image).unwrap_or_else(|_| image.to_string());
        self.state
            .lock()
            .image_files
            .entry(name)
            .or_default()
            .push((path.to_string(), content.to_string()));
    }

    pub fn push_exec_codes(&self, codes: &[i32]) {
        self.exec_codes.lock().extend(codes.iter().rev());
    }

    pub fn calls(&self) -> Calls {
        self.calls.lock().clone()
    }

    /// Simulate the task exiting on its own.
    pub fn exit_task(&self, id: &str, code: i32) {
        if let Some(task) = self.state.lock().tasks.get_mut(id) {
            task.status = ContainerStatus::Stopped;
            task.pid = None;
            task.exit_code = Some(code);
            task.finished_at = Some(Utc::now());
        }
        self.exited.notify_waiters();
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().containers.len()
    }

    pub fn has_snapshot(&self, key: &str) -> bool {
        self.state.lock().snapshots.contains(key)
    }

    fn snapshot_dir(&self, key: &str) -> PathBuf {
        self.root.path().join("snapshots").join(key)
    }

    fn lookup_image(&self, reference: &str) -> Option<ImageInfo> {
        let state = self.state.lock();
        if let Some(info) = state.images.get(reference) {
            return Some(info.clone());
        }
        if let Ok(name) = super::image::normalize_reference(reference) {
            if let Some(info) = state.images.get(&name) {
                return Some(info.clone());
            }
        }
        state
            .images
            .values()
            .find(|i| i.id == reference || i.id.trim_start_matches("sha256:").starts_with(reference))
            .cloned()
    }
}

/// A minimal image record.
pub fn image(name: &str, config: ImageConfig) -> ImageInfo {
    let name = super::image::normalize_reference(name).unwrap_or_else(|_| name.to_string());
    let digest = format!("sha256:{}", crate::ids::sha256_hex(name.as_bytes()));
    ImageInfo {
        name,
        id: digest.clone(),
        digest: digest.clone(),
        repo_digest: None,
        size: 1024,
        created: Some(Utc::now()),
        os: "linux".to_string(),
        architecture: "amd64".to_string(),
        variant: None,
        author: None,
        config,
        history: Vec::new(),
        diff_ids: vec![digest],
    }
}

fn process_args(record: &ContainerRecord) -> Vec<String> {
    record
        .spec
        .process()
        .as_ref()
        .and_then(|p| p.args().clone())
        .unwrap_or_default()
}

fn scripted_exit(args: &[String]) -> Option<i32> {
    let last = args.last()?;
    let rest = last.trim().strip_prefix("exit ")?;
    rest.trim().parse().ok()
}

#[async_trait]
impl ContainerService for FakeRuntime {
    async fn create(&self, record: ContainerRecord) -> Result<ContainerRecord> {
        let mut state = self.state.lock();
        if state.containers.contains_key(&record.id) {
            return Err(BoxError::AlreadyExists(format!("container {}", record.id)));
        }
        state.containers.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<ContainerRecord> {
        self.state
            .lock()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| BoxError::not_found("container", id))
    }

    async fn list(&self) -> Result<Vec<ContainerRecord>> {
        let mut all: Vec<_> = self.state.lock().containers.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn update_labels(
        &self,
        id: &str,
        labels: HashMap<String, String>,
    ) -> Result<ContainerRecord> {
        let mut state = self.state.lock();
        let record = state
            .containers
            .get_mut(id)
            .ok_or_else(|| BoxError::not_found("container", id))?;
        record.labels = labels;
        Ok(record.clone())
    }

    async fn update_spec(&self, id: &str, spec: oci_spec::runtime::Spec) -> Result<ContainerRecord> {
        let mut state = self.state.lock();
        let record = state
            .containers
            .get_mut(id)
            .ok_or_else(|| BoxError::not_found("container", id))?;
        record.spec = spec;
        Ok(record.clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| BoxError::not_found("container", id))
    }
}

#[async_trait]
impl TaskService for FakeRuntime {
    async fn start(&self, record: &ContainerRecord, opts: StartOptions) -> Result<StartedTask> {
        let args = process_args(record);
        if args.first().map(String::as_str) == Some("/nonexistent") {
            return Err(BoxError::CommandFailed {
                code: 127,
                message: "exec: \"/nonexistent\": executable file not found in $PATH".to_string(),
            });
        }
        self.calls.lock().starts.push(record.id.clone());
        let exit = scripted_exit(&args);
        {
            let mut state = self.state.lock();
            let prev_restarts = state.tasks.get(&record.id).map(|t| t.restart_count).unwrap_or(0);
            let task = TaskState {
                status: if exit.is_some() {
                    ContainerStatus::Stopped
                } else {
                    ContainerStatus::Running
                },
                pid: exit.is_none().then_some(4242),
                exit_code: exit,
                started_at: Some(Utc::now()),
                finished_at: exit.map(|_| Utc::now()),
                restart_count: prev_restarts,
            };
            state.tasks.insert(record.id.clone(), task);
        }
        self.exited.notify_waiters();

        let stream = if opts.attach {
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            let name = record.id.clone();
            let code = exit;
            tokio::spawn(async move {
                let mut theirs = theirs;
                let _ = write_frame(&mut theirs, &Frame::Stdout(format!("hello from {name}\n").into_bytes())).await;
                if let Some(code) = code {
                    let _ = write_frame(&mut theirs, &Frame::Exit(code)).await;
                }
            });
            Some(AttachStream::new(Box::new(ours)))
        } else {
            None
        };
        Ok(StartedTask { pid: 4242, stream })
    }

    async fn state(&self, id: &str) -> Result<TaskState> {
        Ok(self
            .state
            .lock()
            .tasks
            .get(id)
            .cloned()
            .unwrap_or_else(TaskState::created))
    }

    async fn kill(&self, id: &str, signal: i32, _all: bool) -> Result<()> {
        let ignores_term = {
            let state = self.state.lock();
            let task = state.tasks.get(id);
            if !task.map(|t| t.status.is_live()).unwrap_or(false) {
                return Err(BoxError::Precondition(format!("container {id} is not running")));
            }
            state
                .containers
                .get(id)
                .map(|r| process_args(r).iter().any(|a| a.contains("ignore-term")))
                .unwrap_or(false)
        };
        self.calls.lock().kills.push((id.to_string(), signal));
        if signal == libc::SIGKILL || !ignores_term {
            self.exit_task(id, 128 + signal);
        }
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        match state.tasks.get_mut(id) {
            Some(t) if t.status == ContainerStatus::Running => {
                t.status = ContainerStatus::Paused;
                Ok(())
            }
            _ => Err(BoxError::Precondition(format!("container {id} is not running"))),
        }
    }

    async fn resume(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        match state.tasks.get_mut(id) {
            Some(t) if t.status == ContainerStatus::Paused => {
                t.status = ContainerStatus::Running;
                Ok(())
            }
            _ => Err(BoxError::Precondition(format!("container {id} is not paused"))),
        }
    }

    async fn wait(&self, id: &str) -> Result<ExitStatus> {
        loop {
            let notified = self.exited.notified();
            {
                let state = self.state.lock();
                let task = state.tasks.get(id).cloned().unwrap_or_else(TaskState::created);
                if !task.status.is_live() {
                    return Ok(ExitStatus {
                        code: task.exit_code.unwrap_or(0),
                        exited_at: task.finished_at.unwrap_or_else(Utc::now),
                    });
                }
            }
            notified.await;
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(task) = state.tasks.get(id) {
            if task.status.is_live() {
                return Err(BoxError::Precondition(format!("task {id} is still running")));
            }
        }
        Ok(())
    }

    async fn exec(&self, id: &str, req: ExecRequest) -> Result<i32> {
        let live = self
            .state
            .lock()
            .tasks
            .get(id)
            .map(|t| t.status == ContainerStatus::Running)
            .unwrap_or(false);
        if !live {
            return Err(BoxError::Precondition(format!("container {id} is not running")));
        }
        let args = req.process.args().clone().unwrap_or_default();
        self.calls.lock().execs.push((id.to_string(), args));
        Ok(self.exec_codes.lock().pop().unwrap_or(0))
    }

    async fn pids(&self, id: &str) -> Result<Vec<u32>> {
        let state = self.state.lock();
        match state.tasks.get(id) {
            Some(t) if t.status.is_live() => Ok(vec![4242]),
            _ => Err(BoxError::Precondition(format!("container {id} is not running"))),
        }
    }

    async fn attach(&self, id: &str) -> Result<AttachStream> {
        let live = self
            .state
            .lock()
            .tasks
            .get(id)
            .map(|t| t.status.is_live())
            .unwrap_or(false);
        if !live {
            return Err(BoxError::Precondition(format!("container {id} is not running")));
        }
        let (ours, _theirs) = tokio::io::duplex(1024);
        Ok(AttachStream::new(Box::new(ours)))
    }
}

#[async_trait]
impl ImageService for FakeRuntime {
    async fn get(&self, reference: &str) -> Result<ImageInfo> {
        self.lookup_image(reference)
            .ok_or_else(|| BoxError::not_found("image", reference))
    }

    async fn list(&self) -> Result<Vec<ImageInfo>> {
        let mut all: Vec<_> = self.state.lock().images.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn pull(&self, reference: &str, _opts: &PullOptions) -> Result<ImageInfo> {
        let name = super::image::normalize_reference(reference)?;
        self.calls.lock().pulls.push(name.clone());
        let mut state = self.state.lock();
        let info = state
            .pullable
            .get(&name)
            .or_else(|| state.images.get(&name))
            .cloned()
            .ok_or_else(|| BoxError::runtime("pull", format!("{name}: not found in registry")))?;
        state.images.insert(name, info.clone());
        Ok(info)
    }

    async fn push(&self, reference: &str, _opts: &PullOptions) -> Result<()> {
        let name = super::image::normalize_reference(reference)?;
        if self.lookup_image(&name).is_none() {
            return Err(BoxError::not_found("image", reference));
        }
        self.calls.lock().pushes.push(name);
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        let mut info = self
            .lookup_image(source)
            .ok_or_else(|| BoxError::not_found("image", source))?;
        info.name = super::image::normalize_reference(target)?;
        self.state.lock().images.insert(info.name.clone(), info);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let info = self
            .lookup_image(name)
            .ok_or_else(|| BoxError::not_found("image", name))?;
        self.state.lock().images.remove(&info.name);
        Ok(())
    }

    async fn prepare_snapshot(&self, key: &str, image: &ImageInfo) -> Result<PathBuf> {
        let dir = self.snapshot_dir(key);
        if dir.exists() {
            return Err(BoxError::AlreadyExists(format!("snapshot {key}")));
        }
        std::fs::create_dir_all(&dir)?;
        let files = self
            .state
            .lock()
            .image_files
            .get(&image.name)
            .cloned()
            .unwrap_or_default();
        for (path, content) in files {
            let target = dir.join(path.trim_start_matches('/'));
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, content)?;
        }
        self.state.lock().snapshots.insert(key.to_string());
        Ok(dir)
    }

    async fn remove_snapshot(&self, key: &str) -> Result<()> {
        crate::fs::remove_dir_all_if_exists(&self.snapshot_dir(key))?;
        self.state.lock().snapshots.remove(key);
        Ok(())
    }

    async fn snapshot_usage(&self, key: &str) -> Result<u64> {
        Ok(crate::fs::dir_size(&self.snapshot_dir(key)))
    }

    async fn diff(&self, key: &str) -> Result<Vec<FileChange>> {
        if !self.state.lock().snapshots.contains(key) {
            return Err(BoxError::not_found("snapshot", key));
        }
        Ok(Vec::new())
    }

    async fn commit(&self, req: CommitRequest) -> Result<ImageInfo> {
        self.calls.lock().commits.push(req.snapshot_key.clone());
        let name = if req.reference.is_empty() {
            format!("sha256:{}", crate::ids::random_hex(32))
        } else {
            super::image::normalize_reference(&req.reference)?
        };
        let mut info = image(&name, req.config);
        info.name = name;
        info.author = req.author;
        self.state.lock().images.insert(info.name.clone(), info.clone());
        Ok(info)
    }

    async fn save(&self, references: &[String], out: &Path) -> Result<()> {
        let names = references
            .iter()
            .map(|r| {
                self.lookup_image(r)
                    .map(|i| i.name)
                    .ok_or_else(|| BoxError::not_found("image", r.as_str()))
            })
            .collect::<Result<Vec<_>>>()?;
        std::fs::write(out, serde_json::to_vec(&names)?)?;
        Ok(())
    }

    async fn load(&self, input: &Path) -> Result<Vec<String>> {
        let names: Vec<String> = serde_json::from_slice(&std::fs::read(input)?)?;
        for name in &names {
            self.add_image(name, ImageConfig::default());
        }
        Ok(names)
    }
}

#[async_trait]
impl NamespaceService for FakeRuntime {
    async fn list(&self) -> Result<Vec<NamespaceInfo>> {
        let state = self.state.lock();
        let mut out: Vec<_> = state
            .namespaces
            .iter()
            .map(|(name, labels)| NamespaceInfo {
                name: name.clone(),
                labels: labels.clone(),
                containers: 0,
                volumes: 0,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn create(&self, name: &str, labels: HashMap<String, String>) -> Result<()> {
        let mut state = self.state.lock();
        if state.namespaces.contains_key(name) {
            return Err(BoxError::AlreadyExists(format!("namespace {name}")));
        }
        state.namespaces.insert(name.to_string(), labels);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.state
            .lock()
            .namespaces
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BoxError::not_found("namespace", name))
    }

    async fn inspect(&self, name: &str) -> Result<NamespaceInfo> {
        let state = self.state.lock();
        let labels = state
            .namespaces
            .get(name)
            .ok_or_else(|| BoxError::not_found("namespace", name))?;
        Ok(NamespaceInfo {
            name: name.to_string(),
            labels: labels.clone(),
            containers: state.containers.len(),
            volumes: 0,
        })
    }
}

#[async_trait]
impl NetworkPlugin for FakeRuntime {
    async fn add(&self, conflist: &serde_json::Value, rt: &CniRuntimeConf) -> Result<CniResult> {
        let name = conflist["name"].as_str().unwrap_or_default().to_string();
        self.calls.lock().cni_add.push(format!("{}@{}", rt.container_id, name));
        Ok(CniResult {
            ips: vec![rt.ip.clone().map(|ip| format!("{ip}/24")).unwrap_or_else(|| "10.4.0.2/24".to_string())],
            gateway: Some("10.4.0.1".to_string()),
            mac: rt.mac.clone(),
            raw: serde_json::json!({}),
        })
    }

    async fn del(&self, conflist: &serde_json::Value, rt: &CniRuntimeConf) -> Result<()> {
        let name = conflist["name"].as_str().unwrap_or_default().to_string();
        self.calls.lock().cni_del.push(format!("{}@{}", rt.container_id, name));
        Ok(())
    }

    async fn check(&self, _conflist: &serde_json::Value, _rt: &CniRuntimeConf) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ImageBuilder for FakeRuntime {
    async fn build(&self, req: &BuildRequest, out_dir: &Path) -> Result<PathBuf> {
        self.calls.lock().builds.push(req.clone());
        let names = req
            .tags
            .iter()
            .map(|t| super::image::normalize_reference(t))
            .collect::<Result<Vec<_>>>()?;
        let archive = out_dir.join("image.tar");
        std::fs::write(&archive, serde_json::to_vec(&names)?)?;
        Ok(archive)
    }
}
