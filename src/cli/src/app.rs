//! Global flags and the per-invocation context built from them.

use std::path::PathBuf;

use cdbox_core::config::{CgroupManager, GlobalConfig};
use cdbox_core::error::{BoxError, Result};
use cdbox_runtime::client::Services;
use cdbox_runtime::lifecycle::ContainerManager;
use clap::Args;
use tokio_util::sync::CancellationToken;

/// Flags accepted before or after any subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Runtime namespace
    #[arg(long, global = true, env = "CONTAINERD_NAMESPACE")]
    pub namespace: Option<String>,

    /// Runtime address
    #[arg(long, global = true, env = "CONTAINERD_ADDRESS")]
    pub address: Option<String>,

    /// Snapshotter
    #[arg(long, global = true, env = "CONTAINERD_SNAPSHOTTER")]
    pub snapshotter: Option<String>,

    /// Cgroup manager (none, cgroupfs, systemd)
    #[arg(long, global = true)]
    pub cgroup_manager: Option<String>,

    /// Root directory of persistent state
    #[arg(long, global = true)]
    pub data_root: Option<PathBuf>,

    /// Allow plain HTTP and unverified TLS registries
    #[arg(long, global = true)]
    pub insecure_registry: bool,

    /// Directories with registry host configuration
    #[arg(long, global = true)]
    pub hosts_dir: Vec<PathBuf>,

    /// IP that `host-gateway` in --add-host resolves to
    #[arg(long, global = true)]
    pub host_gateway_ip: Option<String>,

    /// Debug logging for cdbox
    #[arg(long, global = true)]
    pub debug: bool,

    /// Debug logging for everything
    #[arg(long, global = true)]
    pub debug_full: bool,
}

impl GlobalArgs {
    /// The config file overlaid with these flags (and their env vars).
    pub fn config(&self) -> Result<GlobalConfig> {
        let mut config = GlobalConfig::load()?;
        self.apply(&mut config)?;
        Ok(config)
    }

    fn apply(&self, config: &mut GlobalConfig) -> Result<()> {
        if let Some(ns) = &self.namespace {
            config.namespace = ns.clone();
        }
        if let Some(address) = &self.address {
            config.address = address
                .strip_prefix("unix://")
                .unwrap_or(address)
                .to_string();
        }
        if let Some(s) = &self.snapshotter {
            config.snapshotter = s.clone();
        }
        if let Some(m) = &self.cgroup_manager {
            config.cgroup_manager = m.parse::<CgroupManager>()?;
        }
        if let Some(root) = &self.data_root {
            config.data_root = root.clone();
        }
        if self.insecure_registry {
            config.insecure_registry = true;
        }
        if !self.hosts_dir.is_empty() {
            config.hosts_dir = self.hosts_dir.clone();
        }
        if let Some(ip) = &self.host_gateway_ip {
            config.host_gateway_ip = Some(
                ip.parse()
                    .map_err(|_| BoxError::invalid(format!("invalid --host-gateway-ip {ip:?}")))?,
            );
        }
        config.debug |= self.debug;
        config.debug_full |= self.debug_full;
        cdbox_core::config::validate_name("namespace", &config.namespace)
    }
}

/// Everything a command needs to reach the runtime.
#[derive(Debug, Clone)]
pub struct App {
    pub config: GlobalConfig,
}

impl App {
    pub fn new(globals: &GlobalArgs) -> Result<Self> {
        Ok(Self {
            config: globals.config()?,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Flags that make a helper process (task monitor, OCI hook) see the
    /// same configuration as this one.
    pub fn forward_args(&self) -> Vec<String> {
        let mut args = vec![
            "--namespace".to_string(),
            self.config.namespace.clone(),
            "--address".to_string(),
            self.config.address.clone(),
            "--data-root".to_string(),
            self.config.data_root.display().to_string(),
            "--cgroup-manager".to_string(),
            self.config.cgroup_manager.to_string(),
        ];
        if let Some(ip) = self.config.host_gateway_ip {
            args.extend(["--host-gateway-ip".to_string(), ip.to_string()]);
        }
        if self.config.insecure_registry {
            args.push("--insecure-registry".to_string());
        }
        args
    }

    pub fn services(&self) -> Result<Services> {
        Services::local(&self.config, self.namespace())
    }

    /// The lifecycle engine for this namespace, cancelled with the root
    /// context.
    pub fn manager(&self) -> Result<ContainerManager> {
        self.manager_with_cancel(cdbox_runtime::context::root().child_token())
    }

    /// A lifecycle engine whose waits end only with `token`. Used where an
    /// interrupt must not abort the work (signal proxying, orderly shutdown).
    pub fn manager_with_cancel(&self, token: CancellationToken) -> Result<ContainerManager> {
        let exe = std::env::current_exe()
            .map_err(|e| BoxError::Other(format!("cannot locate own executable: {e}")))?;
        Ok(ContainerManager::new(self.services()?, self.config.clone(), self.namespace())
            .with_self_exe(exe, self.forward_args())
            .with_cancel(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let globals = GlobalArgs {
            namespace: Some("k8s".into()),
            address: Some("unix:///run/other.sock".into()),
            cgroup_manager: Some("none".into()),
            host_gateway_ip: Some("10.0.0.1".into()),
            debug: true,
            ..GlobalArgs::default()
        };
        let mut config = GlobalConfig::default();
        globals.apply(&mut config).unwrap();
        assert_eq!(config.namespace, "k8s");
        assert_eq!(config.address, "/run/other.sock");
        assert_eq!(config.cgroup_manager, CgroupManager::None);
        assert!(config.debug);

        let forwarded = App { config }.forward_args();
        assert!(forwarded.windows(2).any(|w| w == ["--namespace", "k8s"]));
        assert!(forwarded.windows(2).any(|w| w == ["--host-gateway-ip", "10.0.0.1"]));
    }

    #[test]
    fn test_bad_flags_are_invalid_input() {
        let mut config = GlobalConfig::default();
        let bad = GlobalArgs {
            cgroup_manager: Some("docker".into()),
            ..GlobalArgs::default()
        };
        assert_eq!(bad.apply(&mut config).unwrap_err().exit_code(), 125);
        let bad = GlobalArgs {
            namespace: Some("bad/ns".into()),
            ..GlobalArgs::default()
        };
        assert!(bad.apply(&mut config).is_err());
    }
}
