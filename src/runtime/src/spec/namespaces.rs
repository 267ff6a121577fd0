//! `--ipc`, `--pid`, `--uts`, `--cgroupns` and the namespace side of `--network`.

use std::path::{Path, PathBuf};

use cdbox_core::error::{BoxError, Result};
use cdbox_core::network::NetworkMode;

use super::draft::{DraftMount, NamespaceKind};
use super::modifier::SpecModifier;
use super::mounts::MountIntent;

/// Directory under a container's state dir backing a shareable `/dev/shm`.
pub const SHM_DIR: &str = "shm";

/// A running container whose namespaces another container joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTarget {
    pub id: String,
    pub pid: u32,
    pub state_dir: PathBuf,
}

impl JoinTarget {
    fn ns_path(&self, kind: NamespaceKind) -> PathBuf {
        PathBuf::from(format!("/proc/{}/ns/{}", self.pid, kind.proc_name()))
    }
}

/// Resolves `container:<token>` to a running container.
pub type JoinResolver<'a> = &'a dyn Fn(&str) -> Result<JoinTarget>;

#[derive(Debug, Default)]
pub struct NamespacePlan {
    pub modifiers: Vec<SpecModifier>,
    pub intents: Vec<MountIntent>,
    /// Containers whose namespaces are joined, by ID.
    pub joined: Vec<String>,
}

pub struct NamespaceInput<'a> {
    pub ipc: Option<&'a str>,
    pub pid: Option<&'a str>,
    pub uts: Option<&'a str>,
    pub cgroupns: Option<&'a str>,
    pub network: &'a NetworkMode,
    pub hostname_given: bool,
    pub cgroup_v2: bool,
    pub state_dir: &'a Path,
    pub resolve: JoinResolver<'a>,
}

fn bind(dest: &str, source: &Path) -> SpecModifier {
    SpecModifier::AddMount(DraftMount {
        destination: dest.to_string(),
        kind: "bind".to_string(),
        source: source.display().to_string(),
        options: vec!["rbind".into(), "rprivate".into(), "rw".into()],
    })
}

impl<'a> NamespaceInput<'a> {
    pub fn plan(&self) -> Result<NamespacePlan> {
        let mut plan = NamespacePlan::default();

        match self.ipc.unwrap_or("private") {
            "" | "private" => {}
            "host" => {
                plan.modifiers.push(SpecModifier::RemoveNamespace(NamespaceKind::Ipc));
                plan.modifiers.push(bind("/dev/shm", Path::new("/dev/shm")));
            }
            "none" => plan.modifiers.push(SpecModifier::RemoveMount("/dev/shm".into())),
            "shareable" => {
                let dir = self.state_dir.join(SHM_DIR);
                plan.intents.push(MountIntent::HostDir(dir.clone()));
                plan.modifiers.push(bind("/dev/shm", &dir));
            }
            other => {
                let target = self.join("ipc", other)?;
                plan.modifiers.push(SpecModifier::SetNamespace(
                    NamespaceKind::Ipc,
                    Some(target.ns_path(NamespaceKind::Ipc)),
                ));
                let shm = target.state_dir.join(SHM_DIR);
                if shm.is_dir() {
                    plan.modifiers.push(bind("/dev/shm", &shm));
                }
                plan.joined.push(target.id);
            }
        }

        match self.pid.unwrap_or("") {
            "" | "private" => {}
            "host" => plan.modifiers.push(SpecModifier::RemoveNamespace(NamespaceKind::Pid)),
            other => {
                let target = self.join("pid", other)?;
                plan.modifiers.push(SpecModifier::SetNamespace(
                    NamespaceKind::Pid,
                    Some(target.ns_path(NamespaceKind::Pid)),
                ));
                plan.joined.push(target.id);
            }
        }

        match self.uts.unwrap_or("") {
            "" | "private" => {}
            "host" => {
                if self.hostname_given {
                    return Err(BoxError::invalid(
                        "conflicting options: hostname and the UTS mode host",
                    ));
                }
                plan.modifiers.push(SpecModifier::RemoveNamespace(NamespaceKind::Uts));
            }
            other => {
                return Err(BoxError::invalid(format!(
                    "invalid UTS mode {other:?} (expected host)"
                )))
            }
        }

        let cgroupns = self
            .cgroupns
            .unwrap_or(if self.cgroup_v2 { "private" } else { "host" });
        match cgroupns {
            "private" => plan
                .modifiers
                .push(SpecModifier::SetNamespace(NamespaceKind::Cgroup, None)),
            "host" => plan.modifiers.push(SpecModifier::RemoveNamespace(NamespaceKind::Cgroup)),
            other => {
                return Err(BoxError::invalid(format!(
                    "invalid cgroupns mode {other:?} (expected host or private)"
                )))
            }
        }

        match self.network {
            NetworkMode::Host => {
                plan.modifiers.push(SpecModifier::RemoveNamespace(NamespaceKind::Network))
            }
            NetworkMode::Container(token) => {
                let target = (self.resolve)(token)?;
                plan.modifiers.push(SpecModifier::SetNamespace(
                    NamespaceKind::Network,
                    Some(target.ns_path(NamespaceKind::Network)),
                ));
                plan.joined.push(target.id);
            }
            NetworkMode::None | NetworkMode::Bridge | NetworkMode::Named(_) => {}
        }
        Ok(plan)
    }

    fn join(&self, what: &str, mode: &str) -> Result<JoinTarget> {
        match mode.strip_prefix("container:") {
            Some(token) if !token.is_empty() => (self.resolve)(token),
            _ => Err(BoxError::invalid(format!(
                "invalid {what} mode {mode:?} (expected host, private or container:<id>)"
            ))),
        }
    }
}

/// Whether the host runs the unified cgroup hierarchy.
pub fn host_cgroup_v2() -> bool {
    Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
}
