//! Global configuration and the persisted data-root layout.
//!
//! Values come from (highest precedence first) command-line flags,
//! environment variables, the TOML config file, and built-in defaults.
//! The CLI applies flags and env on top of [`GlobalConfig::load`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{BoxError, Result};

/// Default runtime namespace.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default runtime address.
pub const DEFAULT_ADDRESS: &str = "/run/containerd/containerd.sock";

/// Default CNI plugin directory.
pub const DEFAULT_CNI_PATH: &str = "/opt/cni/bin";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "CDBOX_TOML";

/// Cgroup manager selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CgroupManager {
    None,
    #[default]
    Cgroupfs,
    Systemd,
}

impl FromStr for CgroupManager {
    type Err = BoxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "cgroupfs" => Ok(Self::Cgroupfs),
            "systemd" => Ok(Self::Systemd),
            other => Err(BoxError::invalid(format!(
                "invalid cgroup manager {other:?} (expected none, cgroupfs or systemd)"
            ))),
        }
    }
}

impl std::fmt::Display for CgroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Cgroupfs => write!(f, "cgroupfs"),
            Self::Systemd => write!(f, "systemd"),
        }
    }
}

/// Global configuration shared by every command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GlobalConfig {
    pub namespace: String,
    pub address: String,
    pub snapshotter: String,
    pub cgroup_manager: CgroupManager,
    pub data_root: PathBuf,
    pub insecure_registry: bool,
    pub hosts_dir: Vec<PathBuf>,
    pub host_gateway_ip: Option<IpAddr>,
    pub debug: bool,
    pub debug_full: bool,
    pub cni_path: PathBuf,
    /// OCI runtime binary driven by the task service.
    pub runtime: String,
    pub experimental: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            address: DEFAULT_ADDRESS.to_string(),
            snapshotter: "overlayfs".to_string(),
            cgroup_manager: default_cgroup_manager(),
            data_root: default_data_root(),
            insecure_registry: false,
            hosts_dir: vec![
                PathBuf::from("/etc/containerd/certs.d"),
                PathBuf::from("/etc/docker/certs.d"),
            ],
            host_gateway_ip: None,
            debug: false,
            debug_full: false,
            cni_path: PathBuf::from(DEFAULT_CNI_PATH),
            runtime: "runc".to_string(),
            experimental: false,
        }
    }
}

impl GlobalConfig {
    /// Load the config file (if any) on top of the defaults.
    pub fn load() -> Result<Self> {
        match config_file_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load from an explicit TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            BoxError::Other(format!("failed to read config {}: {}", path.display(), e))
        })?;
        let config: GlobalConfig = toml::from_str(&data)?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// The data-store view of this configuration.
    pub fn data_store(&self) -> DataStore {
        DataStore::new(&self.data_root, &self.address)
    }
}

/// Resolve the config file location.
fn config_file_path() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(explicit));
    }
    if is_rootless() {
        dirs::config_dir().map(|d| d.join("cdbox").join("cdbox.toml"))
    } else {
        Some(PathBuf::from("/etc/cdbox/cdbox.toml"))
    }
}

/// Whether we run without root privileges.
pub fn is_rootless() -> bool {
    unsafe { libc::geteuid() != 0 }
}

fn default_data_root() -> PathBuf {
    if is_rootless() {
        dirs::data_local_dir()
            .map(|d| d.join("cdbox"))
            .unwrap_or_else(|| PathBuf::from(".cdbox"))
    } else {
        PathBuf::from("/var/lib/cdbox")
    }
}

fn default_cgroup_manager() -> CgroupManager {
    if Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
        && Path::new("/run/systemd/system").exists()
    {
        CgroupManager::Systemd
    } else {
        CgroupManager::Cgroupfs
    }
}

/// Persisted state layout, rooted at `<data-root>/<addr-hash>/`.
///
/// ```text
/// containers/<namespace>/<id>/   per-container state directory
/// volumes/<namespace>/<name>/    volume directory (_data + labels.json)
/// networks/<name>.conflist       CNI config lists
/// names/<namespace>/<name>       name reservations
/// records/<namespace>/<id>.json  local runtime container records
/// images/                        OCI image layout store
/// snapshots/<namespace>/<key>/   container root filesystems
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataStore {
    root: PathBuf,
}

impl DataStore {
    /// Compute the data store for a runtime address.
    pub fn new(data_root: &Path, address: &str) -> Self {
        Self {
            root: data_root.join(address_hash(address)),
        }
    }

    /// Root of this data store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn containers_dir(&self, namespace: &str) -> PathBuf {
        self.root.join("containers").join(namespace)
    }

    /// Per-container state directory.
    pub fn container_state_dir(&self, namespace: &str, id: &str) -> PathBuf {
        self.containers_dir(namespace).join(id)
    }

    pub fn volumes_dir(&self, namespace: &str) -> PathBuf {
        self.root.join("volumes").join(namespace)
    }

    pub fn networks_dir(&self) -> PathBuf {
        self.root.join("networks")
    }

    pub fn names_dir(&self, namespace: &str) -> PathBuf {
        self.root.join("names").join(namespace)
    }

    pub fn records_dir(&self, namespace: &str) -> PathBuf {
        self.root.join("records").join(namespace)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn snapshots_dir(&self, namespace: &str) -> PathBuf {
        self.root.join("snapshots").join(namespace)
    }

    /// Root directory handed to the OCI runtime binary (`runc --root`).
    pub fn runtime_root(&self, namespace: &str) -> PathBuf {
        self.root.join("runtime").join(namespace)
    }
}

/// First 8 hex chars of sha256(address).
pub fn address_hash(address: &str) -> String {
    let digest = Sha256::digest(address.as_bytes());
    hex::encode(digest)[..8].to_string()
}

/// Validate a namespace, volume or network name: `[A-Za-z0-9][A-Za-z0-9_.-]*`.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(BoxError::invalid(format!(
            "invalid {kind} name {name:?}: only [a-zA-Z0-9][a-zA-Z0-9_.-] are allowed"
        )))
    }
}
