//! Plain-data view of an OCI runtime spec.
//!
//! Modifiers edit a [`SpecDraft`]; [`SpecDraft::into_spec`] converts the
//! finished draft into an `oci_spec` [`Spec`] in one place.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use cdbox_core::error::{BoxError, Result};
use oci_spec::runtime::{
    Capability, Hooks, LinuxBlockIoBuilder, LinuxBuilder, LinuxCapabilitiesBuilder,
    LinuxCpuBuilder, LinuxDeviceBuilder, LinuxDeviceCgroupBuilder, LinuxDeviceType,
    LinuxMemoryBuilder, LinuxNamespaceBuilder, LinuxNamespaceType, LinuxPidsBuilder,
    LinuxResourcesBuilder, LinuxSeccomp, LinuxThrottleDevice, LinuxThrottleDeviceBuilder, Mount,
    MountBuilder, PosixRlimitBuilder, PosixRlimitType, ProcessBuilder, RootBuilder, Spec,
    SpecBuilder, UserBuilder,
};
use serde_json::json;

pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Capabilities granted when none are added or dropped.
pub const DEFAULT_CAPS: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FSETID",
    "CAP_FOWNER",
    "CAP_MKNOD",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_SYS_CHROOT",
    "CAP_KILL",
    "CAP_AUDIT_WRITE",
];

/// Every capability `ALL` expands to.
pub const ALL_CAPS: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
    "CAP_PERFMON",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
];

pub const DEFAULT_MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/asound",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
    "/sys/devices/virtual/powercap",
];

pub const DEFAULT_READONLY_PATHS: &[&str] = &[
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// Kernel namespace kinds a container can own or join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NamespaceKind {
    Pid,
    Network,
    Ipc,
    Uts,
    Mount,
    Cgroup,
}

impl NamespaceKind {
    fn oci(self) -> LinuxNamespaceType {
        match self {
            Self::Pid => LinuxNamespaceType::Pid,
            Self::Network => LinuxNamespaceType::Network,
            Self::Ipc => LinuxNamespaceType::Ipc,
            Self::Uts => LinuxNamespaceType::Uts,
            Self::Mount => LinuxNamespaceType::Mount,
            Self::Cgroup => LinuxNamespaceType::Cgroup,
        }
    }

    /// Entry under `/proc/<pid>/ns/`.
    pub fn proc_name(self) -> &'static str {
        match self {
            Self::Pid => "pid",
            Self::Network => "net",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::Mount => "mnt",
            Self::Cgroup => "cgroup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftMount {
    pub destination: String,
    pub kind: String,
    pub source: String,
    pub options: Vec<String>,
}

impl DraftMount {
    pub fn new(destination: &str, kind: &str, source: &str, options: &[&str]) -> Self {
        Self {
            destination: destination.to_string(),
            kind: kind.to_string(),
            source: source.to_string(),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DraftUser {
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rlimit {
    /// `RLIMIT_NOFILE` style name.
    pub kind: String,
    pub soft: u64,
    pub hard: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    pub major: i64,
    pub minor: i64,
    pub rate: u64,
}

/// Block, cpu, memory and pids limits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resources {
    pub cpu_shares: Option<u64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<u64>,
    pub cpuset_cpus: Option<String>,
    pub cpuset_mems: Option<String>,
    pub memory_limit: Option<i64>,
    pub memory_reservation: Option<i64>,
    pub memory_swap: Option<i64>,
    pub memory_swappiness: Option<u64>,
    pub oom_kill_disable: bool,
    pub pids_limit: Option<i64>,
    pub blkio_weight: Option<u16>,
    pub read_bps: Vec<Throttle>,
    pub write_bps: Vec<Throttle>,
    pub read_iops: Vec<Throttle>,
    pub write_iops: Vec<Throttle>,
}

impl Resources {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A device node created in the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub path: String,
    /// `c`, `b` or `p`.
    pub kind: char,
    pub major: i64,
    pub minor: i64,
    pub file_mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// One device cgroup rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRule {
    pub allow: bool,
    /// `a`, `c` or `b`.
    pub kind: char,
    pub major: Option<i64>,
    pub minor: Option<i64>,
    pub access: String,
}

#[derive(Debug, Clone)]
pub struct SpecDraft {
    pub root_path: PathBuf,
    pub root_readonly: bool,
    pub hostname: Option<String>,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub terminal: bool,
    pub user: DraftUser,
    pub capabilities: BTreeSet<String>,
    pub rlimits: Vec<Rlimit>,
    pub no_new_privileges: bool,
    pub apparmor_profile: Option<String>,
    pub oom_score_adj: Option<i32>,
    pub mounts: Vec<DraftMount>,
    /// Namespaces to create (`None`) or join (`Some(path)`).
    pub namespaces: BTreeMap<NamespaceKind, Option<PathBuf>>,
    pub cgroups_path: Option<String>,
    pub resources: Resources,
    pub devices: Vec<Device>,
    pub device_rules: Vec<DeviceRule>,
    pub sysctl: BTreeMap<String, String>,
    pub seccomp: Option<LinuxSeccomp>,
    pub masked_paths: Vec<String>,
    pub readonly_paths: Vec<String>,
    pub annotations: BTreeMap<String, String>,
    pub hooks: Option<Hooks>,
}

impl SpecDraft {
    /// The baseline every container starts from.
    pub fn new(root_path: PathBuf) -> Self {
        let namespaces = [
            NamespaceKind::Pid,
            NamespaceKind::Network,
            NamespaceKind::Ipc,
            NamespaceKind::Uts,
            NamespaceKind::Mount,
        ]
        .into_iter()
        .map(|k| (k, None))
        .collect();
        Self {
            root_path,
            root_readonly: false,
            hostname: None,
            args: Vec::new(),
            env: vec![format!("PATH={DEFAULT_PATH}")],
            cwd: "/".to_string(),
            terminal: false,
            user: DraftUser::default(),
            capabilities: DEFAULT_CAPS.iter().map(|c| c.to_string()).collect(),
            rlimits: vec![Rlimit {
                kind: "RLIMIT_NOFILE".to_string(),
                soft: 1024,
                hard: 1024,
            }],
            no_new_privileges: false,
            apparmor_profile: None,
            oom_score_adj: None,
            mounts: default_mounts(),
            namespaces,
            cgroups_path: None,
            resources: Resources::default(),
            devices: Vec::new(),
            device_rules: vec![DeviceRule {
                allow: false,
                kind: 'a',
                major: None,
                minor: None,
                access: "rwm".to_string(),
            }],
            sysctl: BTreeMap::new(),
            seccomp: None,
            masked_paths: DEFAULT_MASKED_PATHS.iter().map(|p| p.to_string()).collect(),
            readonly_paths: DEFAULT_READONLY_PATHS.iter().map(|p| p.to_string()).collect(),
            annotations: BTreeMap::new(),
            hooks: None,
        }
    }

    pub fn mount_at(&self, destination: &str) -> Option<&DraftMount> {
        self.mounts.iter().find(|m| same_path(&m.destination, destination))
    }

    /// Convert into an OCI spec.
    pub fn into_spec(self) -> Result<Spec> {
        let mut user = UserBuilder::default()
            .uid(self.user.uid)
            .gid(self.user.gid)
            .additional_gids(self.user.additional_gids.clone());
        if let Some(name) = &self.user.username {
            user = user.username(name.clone());
        }
        let user = user.build().map_err(spec_err)?;

        let caps = self
            .capabilities
            .iter()
            .map(|c| parse_capability(c))
            .collect::<Result<std::collections::HashSet<Capability>>>()?;
        let capabilities = LinuxCapabilitiesBuilder::default()
            .bounding(caps.clone())
            .effective(caps.clone())
            .permitted(caps)
            .build()
            .map_err(spec_err)?;

        let rlimits = self
            .rlimits
            .iter()
            .map(|r| {
                let typ: PosixRlimitType = serde_json::from_value(json!(r.kind))
                    .map_err(|_| BoxError::invalid(format!("unsupported ulimit {:?}", r.kind)))?;
                PosixRlimitBuilder::default()
                    .typ(typ)
                    .soft(r.soft)
                    .hard(r.hard)
                    .build()
                    .map_err(spec_err)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut process = ProcessBuilder::default()
            .terminal(self.terminal)
            .user(user)
            .args(self.args)
            .env(self.env)
            .cwd(self.cwd)
            .capabilities(capabilities)
            .rlimits(rlimits)
            .no_new_privileges(self.no_new_privileges);
        if let Some(profile) = self.apparmor_profile {
            process = process.apparmor_profile(profile);
        }
        if let Some(adj) = self.oom_score_adj {
            process = process.oom_score_adj(adj);
        }
        let process = process.build().map_err(spec_err)?;

        let mounts = self
            .mounts
            .into_iter()
            .map(|m| {
                MountBuilder::default()
                    .destination(PathBuf::from(m.destination))
                    .typ(m.kind)
                    .source(PathBuf::from(m.source))
                    .options(m.options)
                    .build()
                    .map_err(spec_err)
            })
            .collect::<Result<Vec<Mount>>>()?;

        let namespaces = self
            .namespaces
            .into_iter()
            .map(|(kind, path)| {
                let mut ns = LinuxNamespaceBuilder::default().typ(kind.oci());
                if let Some(path) = path {
                    ns = ns.path(path);
                }
                ns.build().map_err(spec_err)
            })
            .collect::<Result<Vec<_>>>()?;

        let devices = self
            .devices
            .iter()
            .map(|d| {
                LinuxDeviceBuilder::default()
                    .path(PathBuf::from(&d.path))
                    .typ(device_type(d.kind)?)
                    .major(d.major)
                    .minor(d.minor)
                    .file_mode(d.file_mode)
                    .uid(d.uid)
                    .gid(d.gid)
                    .build()
                    .map_err(spec_err)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut linux = LinuxBuilder::default()
            .namespaces(namespaces)
            .resources(build_resources(&self.resources, &self.device_rules)?)
            .masked_paths(self.masked_paths)
            .readonly_paths(self.readonly_paths);
        if !devices.is_empty() {
            linux = linux.devices(devices);
        }
        if !self.sysctl.is_empty() {
            linux = linux.sysctl(self.sysctl.into_iter().collect::<HashMap<_, _>>());
        }
        if let Some(path) = self.cgroups_path {
            linux = linux.cgroups_path(PathBuf::from(path));
        }
        if let Some(seccomp) = self.seccomp {
            linux = linux.seccomp(seccomp);
        }
        let linux = linux.build().map_err(spec_err)?;

        let root = RootBuilder::default()
            .path(self.root_path)
            .readonly(self.root_readonly)
            .build()
            .map_err(spec_err)?;

        let mut spec = SpecBuilder::default()
            .version("1.0.2")
            .root(root)
            .process(process)
            .mounts(mounts)
            .linux(linux);
        if let Some(hostname) = self.hostname {
            spec = spec.hostname(hostname);
        }
        if let Some(hooks) = self.hooks {
            spec = spec.hooks(hooks);
        }
        if !self.annotations.is_empty() {
            spec = spec.annotations(self.annotations.into_iter().collect::<HashMap<_, _>>());
        }
        spec.build().map_err(spec_err)
    }
}

fn build_resources(
    res: &Resources,
    rules: &[DeviceRule],
) -> Result<oci_spec::runtime::LinuxResources> {
    let device_rules = rules
        .iter()
        .map(|r| {
            let mut rule = LinuxDeviceCgroupBuilder::default()
                .allow(r.allow)
                .typ(device_type(r.kind)?)
                .access(r.access.clone());
            if let Some(major) = r.major {
                rule = rule.major(major);
            }
            if let Some(minor) = r.minor {
                rule = rule.minor(minor);
            }
            rule.build().map_err(spec_err)
        })
        .collect::<Result<Vec<_>>>()?;
    let mut builder = LinuxResourcesBuilder::default().devices(device_rules);
    if res.is_empty() {
        return builder.build().map_err(spec_err);
    }

    let mut cpu = LinuxCpuBuilder::default();
    if let Some(v) = res.cpu_shares {
        cpu = cpu.shares(v);
    }
    if let Some(v) = res.cpu_quota {
        cpu = cpu.quota(v);
    }
    if let Some(v) = res.cpu_period {
        cpu = cpu.period(v);
    }
    if let Some(v) = &res.cpuset_cpus {
        cpu = cpu.cpus(v.clone());
    }
    if let Some(v) = &res.cpuset_mems {
        cpu = cpu.mems(v.clone());
    }
    builder = builder.cpu(cpu.build().map_err(spec_err)?);

    let mut memory = LinuxMemoryBuilder::default();
    if let Some(v) = res.memory_limit {
        memory = memory.limit(v);
    }
    if let Some(v) = res.memory_reservation {
        memory = memory.reservation(v);
    }
    if let Some(v) = res.memory_swap {
        memory = memory.swap(v);
    }
    if let Some(v) = res.memory_swappiness {
        memory = memory.swappiness(v);
    }
    if res.oom_kill_disable {
        memory = memory.disable_oom_killer(true);
    }
    builder = builder.memory(memory.build().map_err(spec_err)?);

    if let Some(limit) = res.pids_limit {
        builder = builder.pids(LinuxPidsBuilder::default().limit(limit).build().map_err(spec_err)?);
    }

    let throttles = |list: &[Throttle]| -> Result<Vec<LinuxThrottleDevice>> {
        list.iter()
            .map(|t| {
                LinuxThrottleDeviceBuilder::default()
                    .major(t.major)
                    .minor(t.minor)
                    .rate(t.rate)
                    .build()
                    .map_err(spec_err)
            })
            .collect()
    };
    let mut blkio = LinuxBlockIoBuilder::default();
    if let Some(w) = res.blkio_weight {
        blkio = blkio.weight(w);
    }
    if !res.read_bps.is_empty() {
        blkio = blkio.throttle_read_bps_device(throttles(&res.read_bps)?);
    }
    if !res.write_bps.is_empty() {
        blkio = blkio.throttle_write_bps_device(throttles(&res.write_bps)?);
    }
    if !res.read_iops.is_empty() {
        blkio = blkio.throttle_read_iops_device(throttles(&res.read_iops)?);
    }
    if !res.write_iops.is_empty() {
        blkio = blkio.throttle_write_iops_device(throttles(&res.write_iops)?);
    }
    builder = builder.block_io(blkio.build().map_err(spec_err)?);

    builder.build().map_err(spec_err)
}

fn default_mounts() -> Vec<DraftMount> {
    vec![
        DraftMount::new("/proc", "proc", "proc", &["nosuid", "noexec", "nodev"]),
        DraftMount::new(
            "/dev",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        ),
        DraftMount::new(
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
        ),
        DraftMount::new(
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        ),
        DraftMount::new("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
        DraftMount::new("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
        DraftMount::new(
            "/sys/fs/cgroup",
            "cgroup",
            "cgroup",
            &["ro", "nosuid", "noexec", "nodev"],
        ),
    ]
}

/// `net_admin` and `CAP_NET_ADMIN` both name `CAP_NET_ADMIN`.
pub fn normalize_capability(name: &str) -> String {
    let upper = name.trim().to_uppercase();
    if upper == "ALL" || upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{upper}")
    }
}

pub(crate) fn parse_capability(name: &str) -> Result<Capability> {
    serde_json::from_value(json!(name))
        .map_err(|_| BoxError::invalid(format!("unknown capability {name:?}")))
}

fn device_type(kind: char) -> Result<LinuxDeviceType> {
    match kind {
        'a' => Ok(LinuxDeviceType::A),
        'b' => Ok(LinuxDeviceType::B),
        'c' => Ok(LinuxDeviceType::C),
        'u' => Ok(LinuxDeviceType::U),
        'p' => Ok(LinuxDeviceType::P),
        other => Err(BoxError::invalid(format!("unsupported device type {other:?}"))),
    }
}

pub(crate) fn same_path(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

fn spec_err(e: impl std::fmt::Display) -> BoxError {
    BoxError::runtime("spec", e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_draft_converts() {
        let spec = SpecDraft::new(PathBuf::from("/rootfs")).into_spec().unwrap();
        let process = spec.process().as_ref().unwrap();
        assert_eq!(process.cwd(), &PathBuf::from("/"));
        let caps = process.capabilities().as_ref().unwrap();
        assert_eq!(caps.bounding().as_ref().unwrap().len(), DEFAULT_CAPS.len());
        let linux = spec.linux().as_ref().unwrap();
        assert_eq!(linux.namespaces().as_ref().unwrap().len(), 5);
        assert_eq!(spec.root().as_ref().unwrap().path(), &PathBuf::from("/rootfs"));
    }

    #[test]
    fn test_all_caps_parse() {
        assert_eq!(ALL_CAPS.len(), 41);
        for cap in ALL_CAPS {
            parse_capability(cap).unwrap();
        }
    }

    #[test]
    fn test_normalize_capability() {
        assert_eq!(normalize_capability("net_admin"), "CAP_NET_ADMIN");
        assert_eq!(normalize_capability("CAP_SYS_TIME"), "CAP_SYS_TIME");
        assert_eq!(normalize_capability("all"), "ALL");
    }

    #[test]
    fn test_resources_convert() {
        let mut draft = SpecDraft::new(PathBuf::from("/rootfs"));
        draft.resources.memory_limit = Some(64 << 20);
        draft.resources.pids_limit = Some(100);
        draft.resources.read_bps.push(Throttle {
            major: 8,
            minor: 0,
            rate: 1024,
        });
        let spec = draft.into_spec().unwrap();
        let res = spec.linux().as_ref().unwrap().resources().as_ref().unwrap();
        assert_eq!(res.memory().as_ref().unwrap().limit(), Some(64 << 20));
        assert_eq!(res.pids().as_ref().unwrap().limit(), 100);
        let blkio = res.block_io().as_ref().unwrap();
        assert_eq!(blkio.throttle_read_bps_device().as_ref().unwrap().len(), 1);
    }
}
