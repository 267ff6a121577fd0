//! OCI hooks that wire containers into CNI networks.
//!
//! The spec builder registers `cdbox internal oci-hook createRuntime` and
//! `... postStop`. The runtime runs them with the OCI state on stdin; the
//! bundle is the container's state directory, where [`HOOK_CONFIG`] says
//! which networks to join.

use std::path::{Path, PathBuf};

use cdbox_core::container::PortMapping;
use cdbox_core::error::{BoxError, Result};
use oci_spec::runtime::{Hook, HookBuilder, Hooks, HooksBuilder};
use serde::{Deserialize, Serialize};

use crate::client::{CniRuntimeConf, NetworkPlugin};
use crate::fs::{read_json, write_json};
use crate::network::NetworkStore;

/// What the hook needs to know, written at create time.
pub const HOOK_CONFIG: &str = "oci-hook.json";
/// Addresses assigned by the last `createRuntime`.
pub const NETWORK_STATE: &str = "network-state.json";
/// Bind-mounted as the container's `/etc/hosts`.
pub const HOSTS_FILE: &str = "hosts";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookConfig {
    pub id: String,
    pub namespace: String,
    pub hostname: String,
    /// CNI networks in attach order; the first one gets ports and static addresses.
    pub networks: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
}

impl HookConfig {
    pub fn load(bundle: &Path) -> Result<Self> {
        read_json(&bundle.join(HOOK_CONFIG))?.ok_or_else(|| {
            BoxError::not_found("hook config", bundle.join(HOOK_CONFIG).display().to_string())
        })
    }

    pub fn save(&self, state_dir: &Path) -> Result<()> {
        write_json(&state_dir.join(HOOK_CONFIG), self)
    }
}

/// One network the container is attached to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedNetwork {
    pub network: String,
    pub interface: String,
    pub ip: Option<String>,
    pub prefix_len: Option<u8>,
    pub gateway: Option<String>,
    pub mac: Option<String>,
}

/// Networks recorded by the last successful `createRuntime`, if any.
pub fn attached_networks(state_dir: &Path) -> Result<Vec<AttachedNetwork>> {
    Ok(read_json(&state_dir.join(NETWORK_STATE))?.unwrap_or_default())
}

/// The `createRuntime`/`postStop` pair for a container's spec.
pub fn oci_hooks(exe: &Path, global_args: &[String]) -> Result<Hooks> {
    let hook = |event: HookEvent| -> Result<Hook> {
        let mut args = vec![exe.display().to_string()];
        args.extend(global_args.iter().cloned());
        args.extend(["internal".to_string(), "oci-hook".to_string(), event.as_str().to_string()]);
        HookBuilder::default()
            .path(exe)
            .args(args)
            .build()
            .map_err(|e| BoxError::runtime("spec", e))
    };
    HooksBuilder::default()
        .create_runtime(vec![hook(HookEvent::CreateRuntime)?])
        .poststop(vec![hook(HookEvent::PostStop)?])
        .build()
        .map_err(|e| BoxError::runtime("spec", e))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    CreateRuntime,
    PostStop,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateRuntime => "createRuntime",
            Self::PostStop => "postStop",
        }
    }
}

impl std::str::FromStr for HookEvent {
    type Err = BoxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "createRuntime" => Ok(Self::CreateRuntime),
            "postStop" => Ok(Self::PostStop),
            other => Err(BoxError::invalid(format!("unsupported hook event {other:?}"))),
        }
    }
}

/// The OCI state document the runtime passes on stdin.
#[derive(Debug, Clone, Deserialize)]
pub struct OciState {
    pub id: String,
    #[serde(default)]
    pub pid: Option<u32>,
    pub bundle: PathBuf,
}

/// Run one hook invocation.
pub async fn run(
    event: HookEvent,
    state: &OciState,
    plugin: &dyn NetworkPlugin,
    networks: &NetworkStore,
) -> Result<()> {
    let config = HookConfig::load(&state.bundle)?;
    match event {
        HookEvent::CreateRuntime => {
            let pid = state
                .pid
                .ok_or_else(|| BoxError::runtime("network", "OCI state carries no pid"))?;
            let netns = PathBuf::from(format!("/proc/{pid}/ns/net"));
            attach(&config, &state.bundle, netns, plugin, networks).await
        }
        HookEvent::PostStop => {
            detach(&config, &state.bundle, plugin, networks).await;
            Ok(())
        }
    }
}

fn runtime_conf(config: &HookConfig, index: usize, netns: Option<PathBuf>) -> CniRuntimeConf {
    let primary = index == 0;
    CniRuntimeConf {
        container_id: config.id.clone(),
        netns,
        ifname: format!("eth{index}"),
        ip: if primary { config.ip.clone() } else { None },
        mac: if primary { config.mac.clone() } else { None },
        port_mappings: if primary { config.ports.clone() } else { Vec::new() },
    }
}

async fn attach(
    config: &HookConfig,
    bundle: &Path,
    netns: PathBuf,
    plugin: &dyn NetworkPlugin,
    networks: &NetworkStore,
) -> Result<()> {
    let mut attached = Vec::new();
    for (index, name) in config.networks.iter().enumerate() {
        let rt = runtime_conf(config, index, Some(netns.clone()));
        let result = match networks.get(name) {
            Ok(net) => plugin.add(&net.conflist, &rt).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(result) => {
                let (ip, prefix_len) = match result.ips.first() {
                    Some(cidr) => split_cidr(cidr),
                    None => (None, None),
                };
                tracing::debug!(id = %config.id, network = %name, ip = ?ip, "attached network");
                attached.push(AttachedNetwork {
                    network: name.clone(),
                    interface: rt.ifname.clone(),
                    ip,
                    prefix_len,
                    gateway: result.gateway,
                    mac: result.mac,
                });
            }
            Err(e) => {
                // Undo what was attached so a failed create leaves nothing behind.
                for (undo_index, done) in attached.iter().enumerate().rev() {
                    if let Ok(net) = networks.get(&done.network) {
                        let rt = runtime_conf(config, undo_index, Some(netns.clone()));
                        if let Err(e) = plugin.del(&net.conflist, &rt).await {
                            tracing::warn!(network = %done.network, error = %e, "rollback of network attach failed");
                        }
                    }
                }
                return Err(BoxError::runtime(
                    "network",
                    format!("failed to attach network {name}: {e}"),
                ));
            }
        }
    }
    write_json(&bundle.join(NETWORK_STATE), &attached)?;
    if let Some(ip) = attached.iter().find_map(|a| a.ip.as_deref()) {
        add_hosts_entry(&bundle.join(HOSTS_FILE), ip, &config.hostname)?;
    }
    Ok(())
}

/// Release every network of a container. Best effort; failures are logged.
pub async fn detach(config: &HookConfig, bundle: &Path, plugin: &dyn NetworkPlugin, networks: &NetworkStore) {
    for (index, name) in config.networks.iter().enumerate().rev() {
        let net = match networks.get(name) {
            Ok(net) => net,
            Err(e) => {
                tracing::warn!(network = %name, error = %e, "network gone, skipping detach");
                continue;
            }
        };
        let rt = runtime_conf(config, index, None);
        if let Err(e) = plugin.del(&net.conflist, &rt).await {
            tracing::warn!(id = %config.id, network = %name, error = %e, "network detach failed");
        }
    }
    let _ = std::fs::remove_file(bundle.join(NETWORK_STATE));
}

fn split_cidr(cidr: &str) -> (Option<String>, Option<u8>) {
    match cidr.split_once('/') {
        Some((ip, len)) => (Some(ip.to_string()), len.parse().ok()),
        None => (Some(cidr.to_string()), None),
    }
}

/// Replace any previous line for `hostname` with `ip hostname`.
fn add_hosts_entry(path: &Path, ip: &str, hostname: &str) -> Result<()> {
    let existing = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut out: String = existing
        .lines()
        .filter(|line| {
            let mut fields = line.split_whitespace();
            let _addr = fields.next();
            !(fields.next() == Some(hostname) && !line.starts_with("127.") && !line.starts_with("::1"))
        })
        .map(|l| format!("{l}\n"))
        .collect();
    out.push_str(&format!("{ip}\t{hostname}\n"));
    crate::fs::atomic_write(path, out.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeRuntime;
    use crate::network::NetworkCreate;
    use tempfile::TempDir;

    fn setup() -> (TempDir, NetworkStore, HookConfig) {
        let dir = TempDir::new().unwrap();
        let store = NetworkStore::new(dir.path().join("networks"));
        store
            .create(NetworkCreate {
                name: "backend".to_string(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .unwrap();
        let config = HookConfig {
            id: "c1".to_string(),
            namespace: "default".to_string(),
            hostname: "web".to_string(),
            networks: vec!["bridge".to_string(), "backend".to_string()],
            ports: vec![],
            ip: Some("10.4.0.9".to_string()),
            mac: None,
        };
        let bundle = dir.path().join("bundle");
        std::fs::create_dir_all(&bundle).unwrap();
        config.save(&bundle).unwrap();
        std::fs::write(bundle.join(HOSTS_FILE), "127.0.0.1\tlocalhost\n").unwrap();
        (dir, store, config)
    }

    #[test]
    fn test_hook_event_names() {
        assert_eq!("createRuntime".parse::<HookEvent>().unwrap(), HookEvent::CreateRuntime);
        assert_eq!(HookEvent::PostStop.as_str(), "postStop");
        assert!("prestart".parse::<HookEvent>().is_err());
    }

    #[test]
    fn test_oci_hooks_carry_event_args() {
        let hooks = oci_hooks(Path::new("/usr/bin/cdbox"), &["--namespace".into(), "ns".into()]).unwrap();
        let create = &hooks.create_runtime().as_ref().unwrap()[0];
        let args = create.args().as_ref().unwrap();
        assert_eq!(args.last().unwrap(), "createRuntime");
        assert!(args.contains(&"ns".to_string()));
        assert_eq!(hooks.poststop().as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_runtime_attaches_in_order_and_writes_hosts() {
        let (dir, store, _config) = setup();
        let fake = FakeRuntime::new();
        let state = OciState {
            id: "c1".to_string(),
            pid: Some(4242),
            bundle: dir.path().join("bundle"),
        };
        run(HookEvent::CreateRuntime, &state, &*fake, &store).await.unwrap();

        assert_eq!(fake.calls().cni_add, vec!["c1@bridge", "c1@backend"]);
        let attached = attached_networks(&state.bundle).unwrap();
        assert_eq!(attached.len(), 2);
        assert_eq!(attached[0].ip.as_deref(), Some("10.4.0.9"));
        assert_eq!(attached[0].prefix_len, Some(24));
        assert_eq!(attached[1].interface, "eth1");
        let hosts = std::fs::read_to_string(state.bundle.join(HOSTS_FILE)).unwrap();
        assert!(hosts.contains("127.0.0.1\tlocalhost"));
        assert!(hosts.ends_with("10.4.0.9\tweb\n"));
    }

    #[tokio::test]
    async fn test_create_runtime_rolls_back_on_missing_network() {
        let (dir, store, mut config) = setup();
        config.networks.push("ghost".to_string());
        let bundle = dir.path().join("bundle");
        config.save(&bundle).unwrap();
        let fake = FakeRuntime::new();
        let state = OciState { id: "c1".to_string(), pid: Some(1), bundle: bundle.clone() };
        let err = run(HookEvent::CreateRuntime, &state, &*fake, &store).await.unwrap_err();
        assert!(err.to_string().contains("ghost"));
        assert_eq!(fake.calls().cni_del, vec!["c1@backend", "c1@bridge"]);
        assert!(!bundle.join(NETWORK_STATE).exists());
    }

    #[tokio::test]
    async fn test_post_stop_detaches_in_reverse() {
        let (dir, store, _config) = setup();
        let fake = FakeRuntime::new();
        let state = OciState { id: "c1".to_string(), pid: None, bundle: dir.path().join("bundle") };
        run(HookEvent::PostStop, &state, &*fake, &store).await.unwrap();
        assert_eq!(fake.calls().cni_del, vec!["c1@backend", "c1@bridge"]);
    }

    #[test]
    fn test_hosts_entry_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1\tlocalhost\n10.4.0.3\tweb\n").unwrap();
        add_hosts_entry(&path, "10.4.0.7", "web").unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "127.0.0.1\tlocalhost\n10.4.0.7\tweb\n"
        );
    }
}
