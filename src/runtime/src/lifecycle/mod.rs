//! Container Lifecycle Engine.
//!
//! [`ContainerManager`] drives create/start/stop/kill/remove for one
//! namespace. Container metadata lives only in the labels of the runtime
//! record; every operation on a container holds that container's lock.

pub mod attach;
pub mod commit;
pub mod cp;
pub mod create;
pub mod exec;
pub mod health;
pub mod inspect;
mod locks;
pub mod logs;
pub mod names;
pub mod ps;
pub mod remove;
pub mod start;
pub mod stop;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cdbox_core::config::{DataStore, GlobalConfig};
use cdbox_core::container::{short_id, ContainerStatus, MountType};
use cdbox_core::error::Result;
use cdbox_core::labels::ContainerLabels;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::client::{ContainerRecord, Services, TaskState};
use crate::network::NetworkStore;
use crate::resolve::resolve;
use crate::volume::VolumeStore;

pub use attach::DetachKeys;
pub use create::CreateRequest;
pub use exec::ExecOptions;
pub use health::{HealthState, HealthStatus};
pub use inspect::ContainerInspect;
pub use locks::ContainerLocks;
pub use names::NameStore;
pub use ps::{ListOptions, PsRow};
pub use remove::RemoveOptions;

/// Default grace period of `stop` in seconds.
pub const DEFAULT_STOP_TIMEOUT: u64 = 10;

/// How the runtime and the log helper call back into the cdbox binary.
#[derive(Debug, Clone)]
pub struct SelfExe {
    pub exe: PathBuf,
    /// Global flags repeated on every callback so it sees the same data root.
    pub global_args: Vec<String>,
}

/// A container record with its decoded labels and current task state.
#[derive(Debug, Clone)]
pub struct Container {
    pub record: ContainerRecord,
    pub labels: ContainerLabels,
    pub state: TaskState,
}

impl Container {
    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn short_id(&self) -> &str {
        short_id(&self.record.id)
    }

    pub fn name(&self) -> &str {
        &self.labels.name
    }

    pub fn status(&self) -> ContainerStatus {
        self.state.status
    }

    /// Process arguments as one string.
    pub fn command(&self) -> String {
        self.record
            .spec
            .process()
            .as_ref()
            .and_then(|p| p.args().clone())
            .unwrap_or_default()
            .join(" ")
    }

    /// Names of volumes referenced by the container's mounts.
    pub fn volume_names(&self) -> impl Iterator<Item = &str> {
        self.labels
            .mounts
            .iter()
            .filter(|m| m.kind == MountType::Volume)
            .map(|m| m.name.as_str())
    }

    /// `Up 5 minutes`, `Exited (0) 3 seconds ago`, `Created`.
    pub fn status_text(&self, now: DateTime<Utc>) -> String {
        let s = &self.state;
        match s.status {
            ContainerStatus::Running | ContainerStatus::Paused => {
                let since = s.started_at.unwrap_or(self.record.created_at);
                let mut out = format!("Up {}", human_duration(now - since));
                if s.status == ContainerStatus::Paused {
                    out.push_str(" (Paused)");
                }
                out
            }
            ContainerStatus::Stopped => match s.finished_at {
                Some(at) => format!(
                    "Exited ({}) {} ago",
                    s.exit_code.unwrap_or(0),
                    human_duration(now - at)
                ),
                None => format!("Exited ({})", s.exit_code.unwrap_or(0)),
            },
            ContainerStatus::Created => "Created".to_string(),
            ContainerStatus::Unknown => "Unknown".to_string(),
        }
    }
}

/// Docker's rounded duration wording.
pub fn human_duration(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    let plural = |n: i64, unit: &str| format!("{n} {unit}{}", if n == 1 { "" } else { "s" });
    match secs {
        0 => "Less than a second".to_string(),
        1..=59 => plural(secs, "second"),
        60..=119 => "About a minute".to_string(),
        120..=2759 => plural(secs / 60, "minute"),
        2760..=7199 => "About an hour".to_string(),
        7200..=172_799 => plural(secs / 3600, "hour"),
        172_800..=1_209_599 => plural(secs / 86_400, "day"),
        1_209_600..=4_838_399 => plural(secs / 604_800, "week"),
        4_838_400..=63_071_999 => plural(secs / 2_592_000, "month"),
        _ => plural(secs / 31_536_000, "year"),
    }
}

/// Lifecycle engine for one namespace.
pub struct ContainerManager {
    /// Runtime collaborators
    services: Services,

    config: GlobalConfig,

    namespace: String,

    /// Persisted layout under the data root
    store: DataStore,

    volumes: Arc<VolumeStore>,

    networks: Arc<NetworkStore>,

    /// Container name reservations
    names: NameStore,

    locks: ContainerLocks,

    /// Callback binary for OCI hooks and the logger, if known
    self_exe: Option<SelfExe>,

    /// Root of every cancellable wait
    cancel: CancellationToken,
}

impl ContainerManager {
    pub fn new(services: Services, config: GlobalConfig, namespace: &str) -> Self {
        let store = config.data_store();
        Self {
            volumes: Arc::new(VolumeStore::for_namespace(&store, namespace)),
            networks: Arc::new(NetworkStore::open(&store)),
            names: NameStore::new(store.names_dir(namespace)),
            locks: ContainerLocks::default(),
            self_exe: None,
            cancel: crate::context::root(),
            namespace: namespace.to_string(),
            services,
            config,
            store,
        }
    }

    /// Register the binary the runtime calls back for network hooks.
    pub fn with_self_exe(mut self, exe: PathBuf, global_args: Vec<String>) -> Self {
        self.self_exe = Some(SelfExe { exe, global_args });
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    pub fn volumes(&self) -> &Arc<VolumeStore> {
        &self.volumes
    }

    pub fn networks(&self) -> &Arc<NetworkStore> {
        &self.networks
    }

    pub fn names(&self) -> &NameStore {
        &self.names
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// State directory of a container.
    pub fn state_dir(&self, container: &Container) -> PathBuf {
        container
            .labels
            .state_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.store.container_state_dir(&self.namespace, container.id()))
    }

    /// Root filesystem path from the runtime spec.
    pub fn rootfs(&self, container: &Container) -> PathBuf {
        container
            .record
            .spec
            .root()
            .as_ref()
            .map(|r| r.path().clone())
            .unwrap_or_else(|| Path::new("/").to_path_buf())
    }

    pub async fn records(&self) -> Result<Vec<ContainerRecord>> {
        self.services.containers.list().await
    }

    /// Decode a record and query its task.
    pub async fn load(&self, record: ContainerRecord) -> Container {
        let labels = ContainerLabels::from_map(&record.labels).unwrap_or_else(|e| {
            tracing::warn!(id = %record.id, error = %e, "undecodable container labels");
            ContainerLabels::default()
        });
        let state = match self.services.tasks.state(&record.id).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(id = %record.id, error = %e, "cannot query task state");
                TaskState {
                    status: ContainerStatus::Unknown,
                    ..TaskState::created()
                }
            }
        };
        Container {
            record,
            labels,
            state,
        }
    }

    /// Every container of the namespace, oldest first.
    pub async fn containers(&self) -> Result<Vec<Container>> {
        let mut out = Vec::new();
        for record in self.records().await? {
            out.push(self.load(record).await);
        }
        Ok(out)
    }

    /// Resolve a user token to one container.
    pub async fn find(&self, token: &str) -> Result<Container> {
        let records = self.records().await?;
        let record = resolve(&records, token)?.clone();
        Ok(self.load(record).await)
    }

    /// Re-read a container by full ID.
    pub async fn reload(&self, id: &str) -> Result<Container> {
        let record = self.services.containers.get(id).await?;
        Ok(self.load(record).await)
    }

    /// Volumes referenced by any container.
    pub async fn volumes_in_use(&self) -> Result<HashSet<String>> {
        let mut used = HashSet::new();
        for record in self.records().await? {
            if let Ok(labels) = ContainerLabels::from_map(&record.labels) {
                used.extend(
                    labels
                        .mounts
                        .into_iter()
                        .filter(|m| m.kind == MountType::Volume)
                        .map(|m| m.name),
                );
            }
        }
        Ok(used)
    }

    /// Networks declared by live containers.
    pub async fn networks_in_use(&self) -> Result<HashSet<String>> {
        let mut used = HashSet::new();
        for c in self.containers().await? {
            if c.state.status.is_live() || c.state.status == ContainerStatus::Unknown {
                used.extend(c.labels.networks.iter().cloned());
            }
        }
        Ok(used)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;

    use cdbox_core::config::GlobalConfig;

    use super::ContainerManager;
    use crate::client::fake::FakeRuntime;
    use crate::client::ImageConfig;

    /// A manager over a fake runtime with `alpine` available locally.
    pub fn manager() -> (Arc<FakeRuntime>, ContainerManager) {
        let fake = FakeRuntime::new();
        let config = GlobalConfig {
            data_root: fake.root().join("data"),
            ..GlobalConfig::default()
        };
        fake.add_image("alpine", ImageConfig {
            cmd: Some(vec!["/bin/sh".to_string()]),
            ..ImageConfig::default()
        });
        let manager = ContainerManager::new(fake.services(), config, "default");
        (fake, manager)
    }

    pub fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }
}
