//! Docker-compatible `inspect` view and `port`.

use std::collections::{BTreeMap, HashMap};

use cdbox_core::container::{ContainerStatus, HealthCheck, PortMapping};
use cdbox_core::error::{BoxError, Result};
use cdbox_core::log::LogConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::health::HealthState;
use super::{Container, ContainerManager};
use crate::hook::attached_networks;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    pub created: DateTime<Utc>,
    pub path: String,
    pub args: Vec<String>,
    pub state: InspectState,
    pub image: String,
    pub name: String,
    pub restart_count: u32,
    pub platform: String,
    pub log_path: Option<String>,
    pub mounts: Vec<InspectMount>,
    pub config: InspectConfig,
    pub host_config: InspectHostConfig,
    pub network_settings: InspectNetworkSettings,
    /// Volumes created for this container and removed with `rm -v`.
    pub anon_volumes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectState {
    pub status: ContainerStatus,
    pub running: bool,
    pub paused: bool,
    pub pid: u32,
    pub exit_code: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthState>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectMount {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub source: String,
    pub destination: String,
    pub mode: String,
    #[serde(rename = "RW")]
    pub rw: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectConfig {
    pub hostname: String,
    pub user: String,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub working_dir: String,
    pub tty: bool,
    /// User labels only.
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheck>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectRestartPolicy {
    pub name: String,
    pub maximum_retry_count: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectLogConfig {
    #[serde(rename = "Type")]
    pub driver: String,
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostBinding {
    pub host_ip: String,
    pub host_port: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectHostConfig {
    pub restart_policy: InspectRestartPolicy,
    pub auto_remove: bool,
    pub port_bindings: BTreeMap<String, Vec<HostBinding>>,
    pub extra_hosts: Vec<String>,
    pub network_mode: String,
    pub log_config: InspectLogConfig,
    pub readonly_rootfs: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectEndpoint {
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "IPPrefixLen")]
    pub ip_prefix_len: u8,
    pub gateway: String,
    pub mac_address: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectNetworkSettings {
    pub ports: BTreeMap<String, Vec<HostBinding>>,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    pub mac_address: String,
    pub networks: BTreeMap<String, InspectEndpoint>,
}

fn port_key(p: &PortMapping) -> String {
    format!("{}/{}", p.container_port, p.protocol)
}

fn port_bindings(ports: &[PortMapping]) -> BTreeMap<String, Vec<HostBinding>> {
    let mut out: BTreeMap<String, Vec<HostBinding>> = BTreeMap::new();
    for p in ports {
        out.entry(port_key(p)).or_default().push(HostBinding {
            host_ip: p.host_ip.clone(),
            host_port: p.host_port.to_string(),
        });
    }
    out
}

impl ContainerManager {
    pub async fn inspect(&self, token: &str) -> Result<ContainerInspect> {
        let container = self.find(token).await?;
        self.inspect_container(&container)
    }

    pub fn inspect_container(&self, c: &Container) -> Result<ContainerInspect> {
        let state_dir = self.state_dir(c);
        let spec = &c.record.spec;
        let process = spec.process().clone().unwrap_or_default();
        let args = process.args().clone().unwrap_or_default();
        let (path, rest) = match args.split_first() {
            Some((first, rest)) => (first.clone(), rest.to_vec()),
            None => (String::new(), Vec::new()),
        };
        let health = if c.labels.healthcheck.is_some() {
            HealthState::load(&state_dir)?
        } else {
            None
        };
        let log_config = LogConfig::load(&state_dir).unwrap_or_default();
        let log_path = match log_config.driver {
            cdbox_core::log::LogDriver::JsonFile => Some(
                log_config
                    .json_log_path(&state_dir, c.id())
                    .display()
                    .to_string(),
            ),
            _ => None,
        };

        let mounts = c
            .labels
            .mounts
            .iter()
            .map(|m| InspectMount {
                kind: m.kind.to_string(),
                name: if m.kind == cdbox_core::container::MountType::Volume {
                    m.name.clone()
                } else {
                    String::new()
                },
                source: m.source.clone(),
                destination: m.destination.clone(),
                mode: m.options.join(","),
                rw: !m.read_only(),
            })
            .collect();

        let attached = attached_networks(&state_dir).unwrap_or_default();
        let networks: BTreeMap<String, InspectEndpoint> = attached
            .iter()
            .map(|n| {
                (
                    n.network.clone(),
                    InspectEndpoint {
                        ip_address: n.ip.clone().unwrap_or_default(),
                        ip_prefix_len: n.prefix_len.unwrap_or(0),
                        gateway: n.gateway.clone().unwrap_or_default(),
                        mac_address: n.mac.clone().unwrap_or_default(),
                    },
                )
            })
            .collect();
        let primary = attached.first();

        let network_mode = c
            .labels
            .networks
            .first()
            .cloned()
            .unwrap_or_else(|| network_mode_from_spec(c));

        let (restart_name, max_retries) = match c.labels.restart {
            cdbox_core::container::RestartPolicy::OnFailure { max_retries } => {
                ("on-failure".to_string(), max_retries.unwrap_or(0))
            }
            other => (other.to_string(), 0),
        };
        let ports = port_bindings(&c.labels.ports);
        let user = c.labels.user.clone().unwrap_or_else(|| {
            format!("{}:{}", process.user().uid(), process.user().gid())
        });

        Ok(ContainerInspect {
            id: c.id().to_string(),
            created: c.record.created_at,
            path,
            args: rest,
            state: InspectState {
                status: c.status(),
                running: c.status() == ContainerStatus::Running,
                paused: c.status() == ContainerStatus::Paused,
                pid: c.state.pid.unwrap_or(0),
                exit_code: c.state.exit_code.unwrap_or(0),
                started_at: c.state.started_at,
                finished_at: c.state.finished_at,
                health,
            },
            image: c.record.image.clone(),
            name: c.name().to_string(),
            restart_count: c.state.restart_count,
            platform: c.labels.platform.clone().unwrap_or_else(|| "linux".to_string()),
            log_path,
            mounts,
            config: InspectConfig {
                hostname: c
                    .labels
                    .hostname
                    .clone()
                    .or_else(|| spec.hostname().clone())
                    .unwrap_or_default(),
                user,
                env: process.env().clone().unwrap_or_default(),
                cmd: args.clone(),
                working_dir: process.cwd().display().to_string(),
                tty: process.terminal().unwrap_or(false),
                labels: c.labels.user_labels.clone(),
                stop_signal: c.labels.stop_signal.clone(),
                stop_timeout: c.labels.stop_timeout,
                healthcheck: c.labels.healthcheck.clone(),
            },
            host_config: InspectHostConfig {
                restart_policy: InspectRestartPolicy {
                    name: restart_name,
                    maximum_retry_count: max_retries,
                },
                auto_remove: c.labels.auto_remove,
                port_bindings: ports.clone(),
                extra_hosts: c.labels.extra_hosts.clone(),
                network_mode,
                log_config: InspectLogConfig {
                    driver: log_config.driver.to_string(),
                    config: log_config.opts.clone(),
                },
                readonly_rootfs: spec.root().as_ref().and_then(|r| r.readonly()).unwrap_or(false),
            },
            network_settings: InspectNetworkSettings {
                ports,
                ip_address: primary.and_then(|n| n.ip.clone()).unwrap_or_default(),
                mac_address: primary.and_then(|n| n.mac.clone()).unwrap_or_default(),
                networks,
            },
            anon_volumes: c.labels.anon_volumes.clone(),
        })
    }

    /// Published ports, optionally narrowed to `port[/proto]`.
    pub async fn port(&self, token: &str, filter: Option<&str>) -> Result<Vec<PortMapping>> {
        let container = self.find(token).await?;
        let Some(filter) = filter else {
            return Ok(container.labels.ports);
        };
        let (port, proto) = match filter.split_once('/') {
            Some((p, proto)) => (p, proto),
            None => (filter, "tcp"),
        };
        let port: u16 = port
            .parse()
            .map_err(|_| BoxError::invalid(format!("invalid port {filter:?}")))?;
        let matched: Vec<PortMapping> = container
            .labels
            .ports
            .into_iter()
            .filter(|p| p.container_port == port && p.protocol == proto)
            .collect();
        if matched.is_empty() {
            return Err(BoxError::not_found("port mapping", format!("{port}/{proto}")));
        }
        Ok(matched)
    }
}

/// `host`, `none` or `container:<id>` from the namespaces in the spec.
fn network_mode_from_spec(c: &Container) -> String {
    use oci_spec::runtime::LinuxNamespaceType;
    let ns = c
        .record
        .spec
        .linux()
        .as_ref()
        .and_then(|l| l.namespaces().clone())
        .unwrap_or_default();
    match ns.iter().find(|n| n.typ() == LinuxNamespaceType::Network) {
        None => "host".to_string(),
        Some(n) => match n.path() {
            Some(path) => format!("container:{}", path.display()),
            None => "none".to_string(),
        },
    }
}
