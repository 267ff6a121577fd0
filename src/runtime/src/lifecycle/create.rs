//! Container creation.
//!
//! Every step that leaves something behind pushes an [`Undo`] entry; on any
//! failure the entries are unwound in reverse and the original error is
//! returned.

use std::collections::HashMap;
use std::io::Write as _;
use std::net::{IpAddr, Ipv4Addr, TcpListener, UdpSocket};
use std::path::{Path, PathBuf};

use cdbox_core::container::{ContainerStatus, PortMapping};
use cdbox_core::error::{BoxError, Result};
use cdbox_core::labels::{ComposeLabels, ContainerLabels};
use cdbox_core::network::NetworkMode;
use chrono::Utc;

use super::{Container, ContainerManager};
use crate::client::{ContainerRecord, ImageInfo, PullOptions, DEFAULT_RUNTIME};
use crate::context::cancellable;
use crate::fs::{copy_dir_recursive, is_empty_dir, remove_dir_all_if_exists};
use crate::hook::HookConfig;
use crate::network::NetworkInfo;
use crate::resolve::resolve;
use crate::spec::{self, CreateOptions, HookCommand, HostFiles, JoinTarget, MountIntent, PullPolicy, SpecInput};

/// Environment variable that tells the logger where the data root is.
pub const LOGGING_ENV: &str = "_CDBOX_INTERNAL_LOGGING";

/// What to create.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    /// Image reference; ignored when `opts.rootfs` is set.
    pub image: String,
    pub opts: CreateOptions,
    /// Set by the compose orchestrator.
    pub compose: Option<ComposeLabels>,
}

/// A reversible side effect of create.
#[derive(Debug)]
enum Undo {
    Name(String),
    StateDir(PathBuf),
    Snapshot(String),
    Volume(String),
    Record(String),
}

impl ContainerManager {
    /// Resolve `reference` locally, pulling according to `policy`.
    pub async fn ensure_image(
        &self,
        reference: &str,
        policy: PullPolicy,
        platform: Option<&str>,
    ) -> Result<ImageInfo> {
        let images = &self.services().images;
        match policy {
            PullPolicy::Always => self.pull_image(reference, platform).await,
            PullPolicy::Missing => match images.get(reference).await {
                Ok(info) => Ok(info),
                Err(e) if e.is_not_found() => self.pull_image(reference, platform).await,
                Err(e) => Err(e),
            },
            PullPolicy::Never => images.get(reference).await.map_err(|e| {
                if e.is_not_found() {
                    BoxError::not_found("image", format!("{reference} (pull policy is never)"))
                } else {
                    e
                }
            }),
        }
    }

    pub async fn pull_image(&self, reference: &str, platform: Option<&str>) -> Result<ImageInfo> {
        tracing::info!(image = %reference, "pulling image");
        let opts = PullOptions {
            platform: platform.map(str::to_string),
            insecure: self.config().insecure_registry,
        };
        cancellable(self.cancel_token(), self.services().images.pull(reference, &opts)).await
    }

    /// Create a container. Nothing is left behind on failure.
    pub async fn create(&self, req: &CreateRequest) -> Result<Container> {
        let mut undo = Vec::new();
        let id = crate::ids::generate_id();
        match self.create_steps(&id, req, &mut undo).await {
            Ok(container) => {
                self.names().commit(container.name());
                tracing::debug!(id = %id, name = %container.name(), "container created");
                Ok(container)
            }
            Err(e) => {
                tracing::debug!(id = %id, error = %e, "create failed, rolling back");
                self.rollback(&id, undo).await;
                Err(e)
            }
        }
    }

    async fn rollback(&self, id: &str, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            let res = match &step {
                Undo::Record(id) => self.services().containers.delete(id).await,
                Undo::Volume(name) => self.volumes().delete(name),
                Undo::Snapshot(key) => self.services().images.remove_snapshot(key).await,
                Undo::StateDir(dir) => remove_dir_all_if_exists(dir),
                Undo::Name(name) => self.names().release(name, id),
            };
            if let Err(e) = res {
                tracing::warn!(id, step = ?step, error = %e, "rollback step failed");
            }
        }
    }

    async fn create_steps(
        &self,
        id: &str,
        req: &CreateRequest,
        undo: &mut Vec<Undo>,
    ) -> Result<Container> {
        let opts = &req.opts;
        if let Some(cidfile) = &opts.cidfile {
            if cidfile.exists() {
                return Err(BoxError::invalid(format!(
                    "container ID file found, make sure the other container isn't running or delete {}",
                    cidfile.display()
                )));
            }
        }

        // 1. Image.
        let image = match &opts.rootfs {
            Some(_) => None,
            None => {
                if req.image.is_empty() {
                    return Err(BoxError::invalid("an image reference is required"));
                }
                Some(
                    self.ensure_image(&req.image, opts.pull, opts.platform.as_deref())
                        .await?,
                )
            }
        };

        // 2. Name.
        let name = match &opts.name {
            Some(name) => {
                self.names().reserve(name, id)?;
                name.clone()
            }
            None => self.names().reserve_generated(id)?,
        };
        undo.push(Undo::Name(name.clone()));

        // 3. State directory and root filesystem.
        let state_dir = self.store().container_state_dir(self.namespace(), id);
        std::fs::create_dir_all(&state_dir)?;
        undo.push(Undo::StateDir(state_dir.clone()));

        let (rootfs, snapshot_key) = match (&opts.rootfs, &image) {
            (Some(path), _) => (absolute(path)?, None),
            (None, Some(image)) => {
                let images = &self.services().images;
                let path =
                    cancellable(self.cancel_token(), images.prepare_snapshot(id, image)).await?;
                undo.push(Undo::Snapshot(id.to_string()));
                (path, Some(id.to_string()))
            }
            (None, None) => return Err(BoxError::invalid("an image reference is required")),
        };

        // 4. Network attachments.
        let existing = self.containers().await?;
        let networks = spec::parse_networks(&opts.networks)?;
        let cni_networks = self.cni_networks(&networks)?;
        if let Some(ip) = &opts.ip {
            check_static_ip(ip, &cni_networks, &existing)?;
        }

        // 5. Runtime spec.
        let records: Vec<ContainerRecord> = existing.iter().map(|c| c.record.clone()).collect();
        let join = |token: &str| -> Result<JoinTarget> {
            let record = resolve(&records, token)?;
            let target = existing
                .iter()
                .find(|c| c.id() == record.id)
                .ok_or_else(|| BoxError::not_found("container", token))?;
            match (target.state.status, target.state.pid) {
                (ContainerStatus::Running, Some(pid)) => Ok(JoinTarget {
                    id: target.id().to_string(),
                    pid,
                    state_dir: self.state_dir(target),
                }),
                _ => Err(BoxError::Precondition(format!(
                    "container {token} is not running"
                ))),
            }
        };
        let host_env = |key: &str| std::env::var(key).ok();
        let host_files = HostFiles::read();
        let cwd = std::env::current_dir()?;
        let hook = self.self_exe.as_ref().map(|s| HookCommand {
            exe: &s.exe,
            global_args: &s.global_args,
        });
        let host_gateway = self.host_gateway();
        let built = spec::build(&SpecInput {
            id,
            namespace: self.namespace(),
            state_dir: &state_dir,
            rootfs: &rootfs,
            image: image.as_ref().map(|i| &i.config),
            opts,
            volumes: self.volumes(),
            cgroup_manager: self.config().cgroup_manager,
            cgroup_v2: Path::new("/sys/fs/cgroup/cgroup.controllers").exists(),
            host_gateway,
            host_env: &host_env,
            host_files: &host_files,
            cwd: &cwd,
            hook,
            resolve: &join,
            dev_root: Path::new("/dev"),
        })?;
        let ports = allocate_host_ports(built.ports.clone(), &existing)?;

        // Volumes, copy-ups and bind sources.
        for intent in &built.intents {
            match intent {
                MountIntent::NamedVolume(name) => {
                    if !self.volumes().exists(name) {
                        self.volumes().create(name, HashMap::new())?;
                        undo.push(Undo::Volume(name.clone()));
                    }
                }
                MountIntent::AnonymousVolume(name) => {
                    self.volumes().create(name, HashMap::new())?;
                    undo.push(Undo::Volume(name.clone()));
                }
                MountIntent::CopyUp {
                    volume,
                    destination,
                } => {
                    let source = rootfs.join(destination.trim_start_matches('/'));
                    let target = self.volumes().mountpoint(volume);
                    if source.is_dir() && is_empty_dir(&target) {
                        copy_dir_recursive(&source, &target)?;
                    }
                }
                MountIntent::HostDir(path) => std::fs::create_dir_all(path)?,
            }
        }

        // 6. State files, labels and the runtime record.
        built.etc_files.write(&state_dir)?;
        let mut log_config = built.log_config.clone();
        log_config.logger_path = self.self_exe.as_ref().map(|s| s.exe.clone());
        log_config.save(&state_dir)?;

        let cni_names: Vec<String> = cni_networks.iter().map(|n| n.name.clone()).collect();
        if !cni_names.is_empty() {
            HookConfig {
                id: id.to_string(),
                namespace: self.namespace().to_string(),
                hostname: built.hostname.clone(),
                networks: cni_names.clone(),
                ports: ports.clone(),
                ip: opts.ip.clone(),
                mac: opts.mac_address.clone(),
            }
            .save(&state_dir)?;
        }

        let labels = ContainerLabels {
            name: name.clone(),
            namespace: self.namespace().to_string(),
            hostname: Some(built.hostname.clone()),
            state_dir: Some(state_dir.display().to_string()),
            log_uri: self.self_exe.as_ref().map(|s| {
                format!(
                    "binary://{}?{}={}",
                    s.exe.display(),
                    LOGGING_ENV,
                    self.config().data_root.display()
                )
            }),
            extra_hosts: built.extra_hosts.clone(),
            ports,
            networks: cni_names,
            ip_address: opts.ip.clone(),
            mac_address: opts.mac_address.clone(),
            mounts: built.mounts.clone(),
            anon_volumes: built.anon_volumes.clone(),
            pid_file: opts.pid_file.as_ref().map(|p| p.display().to_string()),
            platform: opts.platform.clone(),
            user: built.user.clone(),
            auto_remove: opts.rm,
            restart: built.restart,
            healthcheck: built.healthcheck.clone(),
            stop_signal: Some(built.stop_signal.clone()),
            stop_timeout: opts.stop_timeout,
            compose: req.compose.clone(),
            user_labels: built.labels.clone(),
        };
        let record = ContainerRecord {
            id: id.to_string(),
            image: image.as_ref().map(|i| i.name.clone()).unwrap_or_default(),
            runtime: DEFAULT_RUNTIME.to_string(),
            snapshot_key,
            spec: built.spec,
            labels: labels.to_map()?,
            created_at: Utc::now(),
        };
        let record = self.services().containers.create(record).await?;
        undo.push(Undo::Record(id.to_string()));

        if let Some(cidfile) = &opts.cidfile {
            write_cidfile(cidfile, id)?;
        }

        Ok(Container {
            record,
            labels,
            state: crate::client::TaskState::created(),
        })
    }

    /// The network configs of every CNI mode, which must exist.
    fn cni_networks(&self, modes: &[NetworkMode]) -> Result<Vec<NetworkInfo>> {
        modes
            .iter()
            .filter(|m| m.uses_cni())
            .map(|m| self.networks().get(&m.network_name()))
            .collect()
    }

    fn host_gateway(&self) -> Option<IpAddr> {
        self.config().host_gateway_ip.or_else(|| {
            crate::network::NetworkStore::default_bridge()
                .gateway
                .and_then(|gw| gw.parse().ok())
        })
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn write_cidfile(path: &Path, id: &str) -> Result<()> {
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| BoxError::invalid(format!("failed to create the container ID file {}: {e}", path.display())))?;
    f.write_all(id.as_bytes())?;
    Ok(())
}

/// A static address must lie in the primary network and be unused there.
fn check_static_ip(ip: &str, networks: &[NetworkInfo], existing: &[Container]) -> Result<()> {
    let Some(primary) = networks.first() else {
        return Ok(());
    };
    let addr: Ipv4Addr = ip
        .parse()
        .map_err(|_| BoxError::invalid(format!("invalid IPv4 address {ip:?}")))?;
    if let Some(ipam) = primary.ipam()? {
        ipam.validate_static(&addr)?;
    }
    let taken = existing.iter().any(|c| {
        c.labels.ip_address.as_deref() == Some(ip)
            && c.labels.networks.first() == Some(&primary.name)
    });
    if taken {
        return Err(BoxError::Precondition(format!(
            "address {ip} is already in use on network {}",
            primary.name
        )));
    }
    Ok(())
}

fn unspecified(ip: &str) -> bool {
    ip.is_empty() || ip == "0.0.0.0" || ip == "::"
}

/// Reject host ports held by other live containers and pick free ports for 0.
fn allocate_host_ports(mut ports: Vec<PortMapping>, existing: &[Container]) -> Result<Vec<PortMapping>> {
    let held: Vec<&PortMapping> = existing
        .iter()
        .filter(|c| c.state.status.is_live())
        .flat_map(|c| c.labels.ports.iter())
        .collect();
    for port in &mut ports {
        if port.host_port == 0 {
            port.host_port = free_port(&port.host_ip, &port.protocol)?;
            continue;
        }
        let clash = held.iter().any(|h| {
            h.host_port == port.host_port
                && h.protocol == port.protocol
                && (h.host_ip == port.host_ip || unspecified(&h.host_ip) || unspecified(&port.host_ip))
        });
        if clash {
            return Err(BoxError::Precondition(format!(
                "Bind for {}:{} failed: port is already allocated",
                if port.host_ip.is_empty() { "0.0.0.0" } else { &port.host_ip },
                port.host_port
            )));
        }
    }
    Ok(ports)
}

/// Ask the kernel for an unused port.
fn free_port(host_ip: &str, protocol: &str) -> Result<u16> {
    let ip = if host_ip.is_empty() { "0.0.0.0" } else { host_ip };
    let addr = format!("{ip}:0");
    let port = if protocol == "udp" {
        UdpSocket::bind(&addr)?.local_addr()?.port()
    } else {
        TcpListener::bind(&addr)?.local_addr()?.port()
    };
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ImageConfig;
    use crate::lifecycle::testutil::{manager, strings};
    use cdbox_core::error::BoxError;

    fn request(image: &str, args: &[&str]) -> CreateRequest {
        CreateRequest {
            image: image.to_string(),
            opts: CreateOptions {
                args: strings(args),
                ..CreateOptions::default()
            },
            compose: None,
        }
    }

    #[tokio::test]
    async fn test_create_stamps_labels_and_state_dir() {
        let (fake, mgr) = manager();
        let mut req = request("alpine", &["sleep", "60"]);
        req.opts.name = Some("web".into());
        req.opts.labels = strings(&["tier=front"]);
        let c = mgr.create(&req).await.unwrap();

        assert_eq!(c.name(), "web");
        assert_eq!(c.status(), ContainerStatus::Created);
        assert_eq!(c.record.image, "docker.io/library/alpine:latest");
        assert_eq!(c.labels.user_labels.get("tier").map(String::as_str), Some("front"));
        assert_eq!(c.labels.networks, vec!["bridge".to_string()]);
        let dir = mgr.state_dir(&c);
        assert!(dir.join("hosts").exists());
        assert!(dir.join(cdbox_core::log::LOG_CONFIG_FILE).exists());
        assert!(dir.join(crate::hook::HOOK_CONFIG).exists());
        assert!(fake.has_snapshot(c.id()));
        assert_eq!(mgr.names().owner("web").as_deref(), Some(c.id()));
    }

    #[tokio::test]
    async fn test_name_collision() {
        let (_fake, mgr) = manager();
        let mut req = request("alpine", &["true"]);
        req.opts.name = Some("dup".into());
        mgr.create(&req).await.unwrap();
        let err = mgr.create(&req).await.unwrap_err();
        assert!(matches!(err, BoxError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_failed_create_leaves_nothing_behind() {
        let (fake, mgr) = manager();
        let mut req = request("alpine", &["true"]);
        req.opts.name = Some("broken".into());
        req.opts.volumes = strings(&["/data"]);
        // Rejected by the spec builder after the name, state dir and snapshot exist.
        req.opts.restart = Some("always".into());
        req.opts.rm = true;
        let err = mgr.create(&req).await.unwrap_err();
        assert_eq!(err.exit_code(), 125);

        assert!(mgr.names().owner("broken").is_none());
        assert_eq!(fake.container_count(), 0);
        let containers_dir = mgr.store().containers_dir("default");
        let leftovers = std::fs::read_dir(&containers_dir)
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
        let snapshots = std::fs::read_dir(fake.root().join("snapshots"))
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(snapshots, 0);
    }

    #[tokio::test]
    async fn test_pull_policies() {
        let (fake, mgr) = manager();
        fake.add_remote_image("nginx", ImageConfig {
            cmd: Some(strings(&["nginx"])),
            ..ImageConfig::default()
        });

        let mut req = request("nginx", &[]);
        req.opts.pull = PullPolicy::Never;
        assert!(mgr.create(&req).await.unwrap_err().is_not_found());
        assert!(fake.calls().pulls.is_empty());

        req.opts.pull = PullPolicy::Missing;
        mgr.create(&req).await.unwrap();
        assert_eq!(fake.calls().pulls, vec!["docker.io/library/nginx:latest".to_string()]);

        // Present locally now: no second pull.
        mgr.create(&req).await.unwrap();
        assert_eq!(fake.calls().pulls.len(), 1);

        req.opts.pull = PullPolicy::Always;
        mgr.create(&req).await.unwrap();
        assert_eq!(fake.calls().pulls.len(), 2);
    }

    #[tokio::test]
    async fn test_image_volume_copy_up() {
        let (fake, mgr) = manager();
        fake.add_image("db", ImageConfig {
            cmd: Some(strings(&["postgres"])),
            volumes: strings(&["/data"]),
            ..ImageConfig::default()
        });
        fake.add_image_file("db", "/data/seed.txt", "seed");
        let c = mgr.create(&request("db", &[])).await.unwrap();

        assert_eq!(c.labels.anon_volumes.len(), 1);
        let volume = &c.labels.anon_volumes[0];
        assert!(mgr.volumes().exists(volume));
        let seeded = mgr.volumes().mountpoint(volume).join("seed.txt");
        assert_eq!(std::fs::read_to_string(seeded).unwrap(), "seed");
    }

    #[tokio::test]
    async fn test_cidfile() {
        let (fake, mgr) = manager();
        let cidfile = fake.root().join("cid");
        let mut req = request("alpine", &["true"]);
        req.opts.cidfile = Some(cidfile.clone());
        let c = mgr.create(&req).await.unwrap();
        assert_eq!(std::fs::read_to_string(&cidfile).unwrap(), c.id());
        // An existing file is refused before anything is created.
        assert_eq!(mgr.create(&req).await.unwrap_err().exit_code(), 125);
        assert_eq!(fake.container_count(), 1);
    }

    #[tokio::test]
    async fn test_host_port_conflict_and_allocation() {
        let (fake, mgr) = manager();
        let mut req = request("alpine", &["sleep", "60"]);
        req.opts.publish = strings(&["127.0.0.1:18080:80"]);
        let first = mgr.create(&req).await.unwrap();
        mgr.start(first.id(), false, false).await.unwrap();

        let err = mgr.create(&req).await.unwrap_err();
        assert!(matches!(err, BoxError::Precondition(_)), "{err}");

        let mut req = request("alpine", &["sleep", "60"]);
        req.opts.publish = strings(&["127.0.0.1::80"]);
        let c = mgr.create(&req).await.unwrap();
        assert_ne!(c.labels.ports[0].host_port, 0);
        assert_eq!(fake.container_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_network_rejected() {
        let (_fake, mgr) = manager();
        let mut req = request("alpine", &["true"]);
        req.opts.networks = strings(&["nosuchnet"]);
        assert!(mgr.create(&req).await.unwrap_err().is_not_found());
    }
}
