//! Container creation options.
//!
//! One flat set of options shared by `run`/`create` and the compose
//! orchestrator. Values stay close to their flag form; the spec builder does
//! all parsing and validation.

use std::collections::HashMap;
use std::path::PathBuf;

use cdbox_core::container::HealthCheck;

/// `--pull` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullPolicy {
    Always,
    #[default]
    Missing,
    Never,
}

impl std::str::FromStr for PullPolicy {
    type Err = cdbox_core::error::BoxError;

    fn from_str(s: &str) -> cdbox_core::error::Result<Self> {
        match s {
            "always" => Ok(Self::Always),
            "missing" | "" => Ok(Self::Missing),
            "never" => Ok(Self::Never),
            other => Err(cdbox_core::error::BoxError::invalid(format!(
                "invalid pull policy {other:?} (expected always, missing or never)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateOptions {
    // Identity
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub labels: Vec<String>,
    pub label_files: Vec<PathBuf>,
    pub annotations: Vec<String>,
    pub platform: Option<String>,
    pub pull: PullPolicy,
    pub rootfs: Option<PathBuf>,
    pub cidfile: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,

    // Process
    pub entrypoint: Option<String>,
    /// Arguments after the image reference.
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub env_files: Vec<PathBuf>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub group_add: Vec<String>,
    pub tty: bool,
    pub interactive: bool,
    pub init: bool,
    pub init_binary: Option<PathBuf>,
    pub ulimits: Vec<String>,
    pub stop_signal: Option<String>,
    pub stop_timeout: Option<u64>,
    pub sig_proxy: bool,
    pub detach_keys: Option<String>,

    // Network
    pub networks: Vec<String>,
    pub ip: Option<String>,
    pub mac_address: Option<String>,
    pub add_hosts: Vec<String>,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    pub dns_options: Vec<String>,
    pub publish: Vec<String>,
    pub expose: Vec<String>,

    // Storage
    pub volumes: Vec<String>,
    pub tmpfs: Vec<String>,
    pub mounts: Vec<String>,
    pub shm_size: Option<String>,
    pub read_only: bool,

    // Namespaces
    pub ipc: Option<String>,
    pub pid: Option<String>,
    pub uts: Option<String>,
    pub cgroupns: Option<String>,
    pub cgroup_parent: Option<String>,

    // Resources
    pub cpus: Option<f64>,
    pub cpu_shares: Option<u64>,
    pub cpu_period: Option<u64>,
    pub cpu_quota: Option<i64>,
    pub cpuset_cpus: Option<String>,
    pub cpuset_mems: Option<String>,
    pub memory: Option<String>,
    pub memory_swap: Option<String>,
    pub memory_reservation: Option<String>,
    pub memory_swappiness: Option<u64>,
    pub pids_limit: Option<i64>,
    pub blkio_weight: Option<u16>,
    pub device_read_bps: Vec<String>,
    pub device_write_bps: Vec<String>,
    pub device_read_iops: Vec<String>,
    pub device_write_iops: Vec<String>,
    pub devices: Vec<String>,
    pub oom_score_adj: Option<i32>,
    pub oom_kill_disable: bool,
    pub sysctls: Vec<String>,

    // Security
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub privileged: bool,
    pub security_opt: Vec<String>,

    // Lifecycle
    pub log_driver: Option<String>,
    pub log_opts: Vec<String>,
    pub restart: Option<String>,
    pub rm: bool,
    pub healthcheck: Option<HealthCheck>,
    pub no_healthcheck: bool,
}

impl CreateOptions {
    /// Parse `k=v` (or bare `k`) items into a map; later items win.
    pub fn key_values(items: &[String]) -> HashMap<String, String> {
        items
            .iter()
            .map(|item| match item.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (item.clone(), String::new()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_policy() {
        assert_eq!("always".parse::<PullPolicy>().unwrap(), PullPolicy::Always);
        assert_eq!("".parse::<PullPolicy>().unwrap(), PullPolicy::Missing);
        assert!("sometimes".parse::<PullPolicy>().is_err());
    }

    #[test]
    fn test_key_values_later_wins() {
        let kv = CreateOptions::key_values(&["a=1".into(), "b".into(), "a=2".into()]);
        assert_eq!(kv["a"], "2");
        assert_eq!(kv["b"], "");
    }
}
