//! Spec builder: image config + create options -> OCI runtime spec.
//!
//! [`build`] reads the image's `/etc/passwd`, env files and label files but
//! never writes anything. Volumes to create, copy-ups, host directories and
//! generated `/etc` files come back in [`BuiltSpec`] for the lifecycle engine
//! to commit.

pub mod draft;
pub mod env;
pub mod hosts;
pub mod modifier;
pub mod mounts;
pub mod namespaces;
pub mod options;
pub mod ports;
pub mod process;
pub mod resources;
pub mod security;
pub mod user;

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use oci_spec::runtime::Spec;

use cdbox_core::config::CgroupManager;
use cdbox_core::container::{HealthCheck, MountRecord, PortMapping, RestartPolicy};
use cdbox_core::error::{BoxError, Result};
use cdbox_core::labels::validate_user_labels;
use cdbox_core::log::LogConfig;
use cdbox_core::network::{validate_mac, NetworkMode};
use cdbox_core::signal::{parse_signal, DEFAULT_STOP_SIGNAL};

use crate::client::ImageConfig;
use crate::hook::{oci_hooks, HOSTS_FILE};
use crate::volume::VolumeStore;

pub use draft::{DraftMount, DraftUser, SpecDraft};
pub use modifier::{apply_all, SpecModifier};
pub use mounts::MountIntent;
pub use namespaces::{JoinResolver, JoinTarget};
pub use options::{CreateOptions, PullPolicy};

/// Generated `/etc/hostname`, relative to the state dir.
pub const HOSTNAME_FILE: &str = "hostname";
/// Generated `/etc/resolv.conf`, relative to the state dir.
pub const RESOLV_FILE: &str = "resolv.conf";

/// How the runtime calls back into cdbox for network hooks.
#[derive(Debug, Clone, Copy)]
pub struct HookCommand<'a> {
    pub exe: &'a Path,
    pub global_args: &'a [String],
}

/// Host files the generated `/etc` files are derived from.
#[derive(Debug, Clone, Default)]
pub struct HostFiles {
    pub resolv_conf: String,
    pub hosts: String,
    pub hostname: String,
}

impl HostFiles {
    pub fn read() -> Self {
        let read = |p: &str| std::fs::read_to_string(p).unwrap_or_default();
        Self {
            resolv_conf: read("/etc/resolv.conf"),
            hosts: read("/etc/hosts"),
            hostname: read("/etc/hostname").trim().to_string(),
        }
    }
}

pub struct SpecInput<'a> {
    pub id: &'a str,
    pub namespace: &'a str,
    pub state_dir: &'a Path,
    pub rootfs: &'a Path,
    pub image: Option<&'a ImageConfig>,
    pub opts: &'a CreateOptions,
    pub volumes: &'a VolumeStore,
    pub cgroup_manager: CgroupManager,
    pub cgroup_v2: bool,
    /// Address `host-gateway` resolves to.
    pub host_gateway: Option<IpAddr>,
    pub host_env: &'a dyn Fn(&str) -> Option<String>,
    pub host_files: &'a HostFiles,
    /// Base for relative bind sources.
    pub cwd: &'a Path,
    pub hook: Option<HookCommand<'a>>,
    pub resolve: JoinResolver<'a>,
    /// Host `/dev`, walked for `--privileged`.
    pub dev_root: &'a Path,
}

/// Contents of the files bind-mounted over `/etc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcFiles {
    pub hosts: String,
    pub resolv_conf: String,
    pub hostname: String,
}

impl EtcFiles {
    /// Write into the state dir under the names the spec mounts.
    pub fn write(&self, state_dir: &Path) -> Result<()> {
        crate::fs::atomic_write(&state_dir.join(HOSTS_FILE), self.hosts.as_bytes())?;
        crate::fs::atomic_write(&state_dir.join(RESOLV_FILE), self.resolv_conf.as_bytes())?;
        crate::fs::atomic_write(
            &state_dir.join(HOSTNAME_FILE),
            format!("{}\n", self.hostname).as_bytes(),
        )
    }
}

#[derive(Debug)]
pub struct BuiltSpec {
    pub spec: Spec,
    pub mounts: Vec<MountRecord>,
    pub intents: Vec<MountIntent>,
    pub anon_volumes: Vec<String>,
    pub networks: Vec<NetworkMode>,
    pub ports: Vec<PortMapping>,
    /// `port/proto` entries from the image, `--expose` and `--publish`.
    pub exposed: Vec<String>,
    /// `name:ip` as given to `--add-host`, after host-gateway resolution.
    pub extra_hosts: Vec<String>,
    pub hostname: String,
    pub etc_files: EtcFiles,
    pub log_config: LogConfig,
    /// Image labels overlaid with label files and `--label`.
    pub labels: HashMap<String, String>,
    pub user: Option<String>,
    pub env: Vec<String>,
    pub stop_signal: String,
    pub restart: RestartPolicy,
    pub healthcheck: Option<HealthCheck>,
    /// IDs of containers whose namespaces are joined.
    pub joined: Vec<String>,
}

/// Parse and check `--network` values. No value means the default bridge.
pub fn parse_networks(values: &[String]) -> Result<Vec<NetworkMode>> {
    let mut modes: Vec<NetworkMode> = Vec::new();
    for value in values.iter().flat_map(|v| v.split(',')).filter(|v| !v.is_empty()) {
        let mode: NetworkMode = value.parse()?;
        if !modes.contains(&mode) {
            modes.push(mode);
        }
    }
    if modes.is_empty() {
        modes.push(NetworkMode::Bridge);
    }
    if modes.len() > 1 && modes.iter().any(|m| !m.uses_cni()) {
        return Err(BoxError::invalid(
            "conflicting options: host, none and container networks cannot be combined with other networks",
        ));
    }
    Ok(modes)
}

fn read_label_files(paths: &[PathBuf]) -> Result<Vec<String>> {
    let mut items = Vec::new();
    for path in paths {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BoxError::invalid(format!("failed to read label file {}: {e}", path.display()))
        })?;
        items.extend(env::parse_env_file(&content));
    }
    Ok(items)
}

fn etc_bind(dest: &str, source: PathBuf, read_only: bool) -> SpecModifier {
    SpecModifier::AddMount(DraftMount {
        destination: dest.to_string(),
        kind: "bind".to_string(),
        source: source.display().to_string(),
        options: vec![
            "rbind".into(),
            "rprivate".into(),
            if read_only { "ro" } else { "rw" }.into(),
        ],
    })
}

/// Build the runtime spec for one container.
pub fn build(input: &SpecInput<'_>) -> Result<BuiltSpec> {
    let opts = input.opts;
    let image = input.image.cloned().unwrap_or_default();
    let mut mods: Vec<SpecModifier> = Vec::new();

    // Networks.
    let networks = parse_networks(&opts.networks)?;
    let primary = &networks[0];
    let cni = primary.uses_cni();
    let host_network = *primary == NetworkMode::Host;
    if (opts.ip.is_some() || opts.mac_address.is_some()) && !cni {
        return Err(BoxError::invalid(format!(
            "--ip and --mac-address need a CNI network, not {primary}"
        )));
    }
    if let Some(ip) = &opts.ip {
        ip.parse::<IpAddr>()
            .map_err(|_| BoxError::invalid(format!("invalid IP address {ip:?}")))?;
    }
    if let Some(mac) = &opts.mac_address {
        validate_mac(mac)?;
    }
    let mut ports = Vec::new();
    for spec in &opts.publish {
        ports.extend(ports::parse_publish(spec)?);
    }
    if !ports.is_empty() && !cni {
        tracing::warn!(network = %primary, "published ports are discarded on a non-CNI network");
        ports.clear();
    }
    let mut exposed: BTreeSet<String> = image.exposed_ports.iter().cloned().collect();
    for spec in &opts.expose {
        exposed.extend(ports::parse_expose(spec)?);
    }
    exposed.extend(ports.iter().map(|p| format!("{}/{}", p.container_port, p.protocol)));

    // Hostname and /etc files.
    if let Some(h) = &opts.hostname {
        hosts::validate_hostname(h)?;
    }
    let hostname = match (&opts.hostname, host_network) {
        (Some(h), _) => h.clone(),
        (None, true) => input.host_files.hostname.clone(),
        (None, false) => cdbox_core::container::short_id(input.id).to_string(),
    };
    let extra = hosts::parse_extra_hosts(&opts.add_hosts, input.host_gateway)?;
    let hosts_content = if host_network {
        let mut out = input.host_files.hosts.clone();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        for (name, ip) in &extra {
            out.push_str(&format!("{ip}\t{name}\n"));
        }
        out
    } else {
        hosts::hosts_file(&extra)
    };
    let etc_files = EtcFiles {
        hosts: hosts_content,
        resolv_conf: hosts::resolv_conf(
            &input.host_files.resolv_conf,
            &opts.dns,
            &opts.dns_search,
            &opts.dns_options,
            host_network,
        )?,
        hostname: hostname.clone(),
    };
    mods.push(SpecModifier::SetHostname(hostname.clone()));
    mods.push(etc_bind("/etc/hosts", input.state_dir.join(HOSTS_FILE), false));
    mods.push(etc_bind("/etc/resolv.conf", input.state_dir.join(RESOLV_FILE), false));
    mods.push(etc_bind("/etc/hostname", input.state_dir.join(HOSTNAME_FILE), false));

    // Process.
    let args = process::command_args(
        opts.entrypoint.as_deref(),
        &opts.args,
        image.entrypoint.as_deref(),
        image.cmd.as_deref(),
    )?;
    let env_files = env::read_env_files(&opts.env_files)?;
    let env = env::build_env(&image.env, &env_files, &opts.env, input.host_env)?.into_vec();
    mods.push(SpecModifier::SetEnv(env.clone()));
    mods.push(SpecModifier::SetCwd(process::working_dir(
        opts.workdir.as_deref(),
        image.working_dir.as_deref(),
    )?));
    mods.push(SpecModifier::SetTerminal(opts.tty));

    let user_spec = opts.user.clone().or_else(|| image.user.clone());
    let users = user::UserDb::load(input.rootfs);
    mods.push(SpecModifier::SetUser(users.resolve(user_spec.as_deref().unwrap_or(""))?));
    if !opts.group_add.is_empty() {
        mods.push(SpecModifier::AddGroups(users.group_ids(&opts.group_add)?));
    }
    for u in &opts.ulimits {
        mods.push(SpecModifier::SetRlimit(process::parse_ulimit(u)?));
    }
    if let Some(adj) = opts.oom_score_adj {
        process::check_oom_score_adj(adj)?;
        mods.push(SpecModifier::SetOomScoreAdj(adj));
    }

    // Storage.
    let plan = mounts::MountInput {
        volumes: &opts.volumes,
        tmpfs: &opts.tmpfs,
        mounts: &opts.mounts,
        image_volumes: &image.volumes,
        shm_size: opts.shm_size.as_deref(),
        read_only: opts.read_only,
        store: input.volumes,
        cwd: input.cwd,
    }
    .plan()?;
    mods.extend(plan.modifiers);
    let mut intents = plan.intents;

    // Namespaces.
    let ns = namespaces::NamespaceInput {
        ipc: opts.ipc.as_deref(),
        pid: opts.pid.as_deref(),
        uts: opts.uts.as_deref(),
        cgroupns: opts.cgroupns.as_deref(),
        network: primary,
        hostname_given: opts.hostname.is_some(),
        cgroup_v2: input.cgroup_v2,
        state_dir: input.state_dir,
        resolve: input.resolve,
    }
    .plan()?;
    mods.extend(ns.modifiers);
    intents.extend(ns.intents);

    // Resources.
    if let Some(path) = resources::cgroups_path(
        input.cgroup_manager,
        opts.cgroup_parent.as_deref(),
        input.namespace,
        input.id,
    ) {
        mods.push(SpecModifier::SetCgroup(path));
    }
    mods.push(SpecModifier::SetResources(resources::resources(opts)?));
    for d in &opts.devices {
        mods.extend(resources::device_modifiers(d)?);
    }
    mods.extend(resources::sysctl_modifiers(&opts.sysctls, host_network)?);

    // Security.
    if opts.privileged {
        mods.extend(security::privileged_modifiers(input.dev_root));
    }
    mods.extend(security::capability_modifiers(&opts.cap_add, &opts.cap_drop)?);
    let caps = security::effective_caps(&opts.cap_add, &opts.cap_drop, opts.privileged)?;
    mods.extend(security::security_opt_modifiers(&opts.security_opt, &caps)?);

    // Annotations and hooks.
    for (k, v) in CreateOptions::key_values(&opts.annotations) {
        mods.push(SpecModifier::SetAnnotation(k, v));
    }
    if networks.iter().any(NetworkMode::uses_cni) {
        if let Some(hook) = input.hook {
            mods.push(SpecModifier::SetHooks(oci_hooks(hook.exe, hook.global_args)?));
        }
    }

    // Init goes last so it wraps the final argv.
    if opts.init {
        let path_env = (input.host_env)("PATH");
        let binary = process::find_init_binary(opts.init_binary.as_deref(), path_env.as_deref())?;
        mods.extend(process::init_modifiers(&binary, args));
    } else {
        mods.push(SpecModifier::SetArgs(args));
    }

    // Lifecycle settings carried in labels.
    let restart: RestartPolicy = opts.restart.as_deref().unwrap_or("no").parse()?;
    if opts.rm && restart != RestartPolicy::No {
        return Err(BoxError::invalid(
            "conflicting options: cannot specify both --restart and --rm",
        ));
    }
    let stop_signal = opts
        .stop_signal
        .clone()
        .or_else(|| image.stop_signal.clone())
        .unwrap_or_else(|| DEFAULT_STOP_SIGNAL.to_string());
    parse_signal(&stop_signal)?;
    let log_config = LogConfig::from_flags(opts.log_driver.as_deref(), &opts.log_opts)?;

    let mut labels = image.labels.clone();
    labels.extend(CreateOptions::key_values(&read_label_files(&opts.label_files)?));
    labels.extend(CreateOptions::key_values(&opts.labels));
    validate_user_labels(&labels)?;

    let mut draft = SpecDraft::new(input.rootfs.to_path_buf());
    apply_all(&mut draft, mods);
    let spec = draft.into_spec()?;

    tracing::debug!(id = %input.id, mounts = plan.records.len(), "built runtime spec");
    Ok(BuiltSpec {
        spec,
        mounts: plan.records,
        intents,
        anon_volumes: plan.anon_volumes,
        networks,
        ports,
        exposed: exposed.into_iter().collect(),
        extra_hosts: extra.into_iter().map(|(n, ip)| format!("{n}:{ip}")).collect(),
        hostname,
        etc_files,
        log_config,
        labels,
        user: user_spec,
        env,
        stop_signal,
        restart,
        healthcheck: if opts.no_healthcheck { None } else { opts.healthcheck.clone() },
        joined: ns.joined,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        store: VolumeStore,
        host_files: HostFiles,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir_all(dir.path().join("rootfs/etc")).unwrap();
            std::fs::write(
                dir.path().join("rootfs/etc/passwd"),
                "root:x:0:0:root:/root:/bin/sh\nnginx:x:101:101::/:/sbin/nologin\n",
            )
            .unwrap();
            std::fs::create_dir_all(dir.path().join("state")).unwrap();
            let store = VolumeStore::new(dir.path().join("volumes"));
            Self {
                dir,
                store,
                host_files: HostFiles {
                    resolv_conf: "nameserver 10.0.0.2\n".into(),
                    hosts: "127.0.0.1\tlocalhost\n".into(),
                    hostname: "buildhost".into(),
                },
            }
        }

        fn build(&self, opts: &CreateOptions, image: Option<&ImageConfig>) -> Result<BuiltSpec> {
            let host_env = |k: &str| (k == "CORGE").then(|| "corge-value-in-host".to_string());
            let resolve = |t: &str| -> Result<JoinTarget> { Err(BoxError::not_found("container", t)) };
            let state_dir = self.dir.path().join("state");
            let rootfs = self.dir.path().join("rootfs");
            build(&SpecInput {
                id: "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
                namespace: "default",
                state_dir: &state_dir,
                rootfs: &rootfs,
                image,
                opts,
                volumes: &self.store,
                cgroup_manager: CgroupManager::Cgroupfs,
                cgroup_v2: true,
                host_gateway: "10.4.0.1".parse().ok(),
                host_env: &host_env,
                host_files: &self.host_files,
                cwd: self.dir.path(),
                hook: Some(HookCommand {
                    exe: Path::new("/usr/local/bin/cdbox"),
                    global_args: &[],
                }),
                resolve: &resolve,
                dev_root: Path::new("/nonexistent"),
            })
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn alpine() -> ImageConfig {
        ImageConfig {
            cmd: Some(strings(&["/bin/sh"])),
            env: strings(&["PATH=/usr/bin:/bin"]),
            ..Default::default()
        }
    }

    #[test]
    fn test_env_precedence() {
        let fx = Fixture::new();
        let opts = CreateOptions {
            env: strings(&["FOO=foo1,foo2", "BAR=bar1", "BAZ=", "QUX", "QUUX=quux1", "QUUX=quux2", "CORGE"]),
            ..Default::default()
        };
        let built = fx.build(&opts, Some(&alpine())).unwrap();
        let env = built.spec.process().as_ref().unwrap().env().clone().unwrap();
        for want in ["FOO=foo1,foo2", "BAR=bar1", "BAZ=", "QUUX=quux2", "CORGE=corge-value-in-host"] {
            assert!(env.contains(&want.to_string()), "missing {want} in {env:?}");
        }
        assert!(!env.iter().any(|e| e.starts_with("QUX")));
        assert!(env.contains(&"PATH=/usr/bin:/bin".to_string()));
    }

    #[test]
    fn test_add_host_and_hostname() {
        let fx = Fixture::new();
        let opts = CreateOptions {
            add_hosts: strings(&["test:10.0.0.1", "test1:10.0.0.1", "gw:host-gateway"]),
            ..Default::default()
        };
        let built = fx.build(&opts, Some(&alpine())).unwrap();
        assert_eq!(built.hostname, "0123456789ab");
        assert!(built.etc_files.hosts.contains("10.0.0.1\ttest\n"));
        assert!(built.etc_files.hosts.contains("10.0.0.1\ttest1\n"));
        assert!(built.etc_files.hosts.contains("10.4.0.1\tgw\n"));
        assert_eq!(built.extra_hosts[0], "test:10.0.0.1");
        let mounts = built.spec.mounts().clone().unwrap();
        assert!(mounts.iter().any(|m| m.destination() == Path::new("/etc/hosts")));
    }

    #[test]
    fn test_image_volume_becomes_anonymous() {
        let fx = Fixture::new();
        let image = ImageConfig {
            volumes: strings(&["/data"]),
            ..alpine()
        };
        let built = fx.build(&CreateOptions::default(), Some(&image)).unwrap();
        assert_eq!(built.anon_volumes.len(), 1);
        let name = &built.anon_volumes[0];
        assert!(built.intents.contains(&MountIntent::AnonymousVolume(name.clone())));
        assert!(built.intents.contains(&MountIntent::CopyUp {
            volume: name.clone(),
            destination: "/data".into()
        }));
        assert!(built.mounts.iter().any(|m| m.destination == "/data" && m.anonymous));
    }

    #[test]
    fn test_port_ranges_and_exposed() {
        let fx = Fixture::new();
        let opts = CreateOptions {
            publish: strings(&["7000-7005:79-84"]),
            expose: strings(&["9000"]),
            ..Default::default()
        };
        let built = fx.build(&opts, Some(&alpine())).unwrap();
        assert_eq!(built.ports.len(), 6);
        assert_eq!(built.ports[5].host_port, 7005);
        assert_eq!(built.ports[5].container_port, 84);
        assert!(built.exposed.contains(&"9000/tcp".to_string()));
        assert!(built.exposed.contains(&"79/tcp".to_string()));
        assert!(built.spec.hooks().is_some());
    }

    #[test]
    fn test_host_network_discards_ports_and_hooks() {
        let fx = Fixture::new();
        let opts = CreateOptions {
            networks: strings(&["host"]),
            publish: strings(&["8080:80"]),
            ..Default::default()
        };
        let built = fx.build(&opts, Some(&alpine())).unwrap();
        assert!(built.ports.is_empty());
        assert!(built.spec.hooks().is_none());
        assert_eq!(built.hostname, "buildhost");
        assert!(built.etc_files.hosts.starts_with("127.0.0.1\tlocalhost\n"));
    }

    #[test]
    fn test_network_conflicts() {
        assert!(parse_networks(&strings(&["host", "bridge"])).is_err());
        assert_eq!(parse_networks(&[]).unwrap(), vec![NetworkMode::Bridge]);
        let fx = Fixture::new();
        let opts = CreateOptions {
            networks: strings(&["none"]),
            ip: Some("10.4.0.9".into()),
            ..Default::default()
        };
        assert_eq!(fx.build(&opts, Some(&alpine())).unwrap_err().exit_code(), 125);
    }

    #[test]
    fn test_user_labels_and_stop_signal() {
        let fx = Fixture::new();
        let label_file = fx.dir.path().join("labels");
        std::fs::write(&label_file, "tier=backend\nowner=file\n").unwrap();
        let image = ImageConfig {
            labels: [("owner".to_string(), "image".to_string())].into(),
            stop_signal: Some("SIGQUIT".into()),
            user: Some("nginx".into()),
            ..alpine()
        };
        let opts = CreateOptions {
            labels: strings(&["owner=flag"]),
            label_files: vec![label_file],
            ..Default::default()
        };
        let built = fx.build(&opts, Some(&image)).unwrap();
        assert_eq!(built.labels["owner"], "flag");
        assert_eq!(built.labels["tier"], "backend");
        assert_eq!(built.stop_signal, "SIGQUIT");
        let user = built.spec.process().as_ref().unwrap().user().clone();
        assert_eq!((user.uid(), user.gid()), (101, 101));
    }

    #[test]
    fn test_rm_with_restart_rejected() {
        let fx = Fixture::new();
        let opts = CreateOptions {
            rm: true,
            restart: Some("always".into()),
            ..Default::default()
        };
        assert!(fx.build(&opts, Some(&alpine())).is_err());
    }

    #[test]
    fn test_missing_command() {
        let fx = Fixture::new();
        assert!(fx.build(&CreateOptions::default(), None).is_err());
    }
}
