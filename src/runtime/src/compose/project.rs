//! A loaded compose project and the translation of its services into
//! container create options.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::{Component, Path, PathBuf};

use cdbox_core::container::HealthCheck;
use cdbox_core::error::{BoxError, Result};
use cdbox_core::labels::COMPOSE_PROJECT;
use cdbox_core::units::parse_duration;

use super::graph::Graph;
use super::model::{ComposeFile, FileRef, Healthcheck, NetworkDecl, Service, ServiceNetwork, StringOrList, VolumeEntry};
use crate::client::BuildRequest;
use crate::network::NetworkCreate;
use crate::spec::{CreateOptions, PullPolicy};

/// Key of the implicit project network.
pub const DEFAULT_NETWORK: &str = "default";

/// Lowercase and strip a project name down to `[a-z0-9_-]`.
pub fn normalize_project_name(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        .collect::<String>()
        .trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Join `rel` onto `base` dropping `.` and resolving `..` lexically.
fn join_clean(base: &Path, rel: &str) -> PathBuf {
    let mut out = base.to_path_buf();
    for c in Path::new(rel).components() {
        match c {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn is_host_path(source: &str) -> bool {
    source.starts_with('.') || source.starts_with('/') || source.starts_with('~')
}

#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    /// Directory relative paths in the file resolve against.
    pub dir: PathBuf,
    pub file: ComposeFile,
    graph: Graph,
    order: Vec<String>,
}

impl Project {
    /// Validate `file` and fix the service order.
    pub fn new(name: &str, dir: PathBuf, file: ComposeFile) -> Result<Self> {
        let name = normalize_project_name(name);
        if name.is_empty() {
            return Err(BoxError::invalid(
                "project name must contain at least one lowercase letter or digit",
            ));
        }
        if file.services.is_empty() {
            return Err(BoxError::invalid("no services defined in the compose file"));
        }
        let graph = Graph::new(&file.services)?;
        let order = graph.order()?;
        let project = Self {
            name,
            dir,
            file,
            graph,
            order,
        };
        for (svc_name, svc) in &project.file.services {
            if svc.image.is_none() && svc.build.is_none() {
                return Err(BoxError::invalid(format!(
                    "service {svc_name} has neither an image nor a build context"
                )));
            }
            if svc.container_name.is_some() && svc.replicas() > 1 {
                return Err(BoxError::invalid(format!(
                    "service {svc_name}: container_name cannot be used with more than one replica"
                )));
            }
            project.create_options(svc_name, 1)?;
        }
        Ok(project)
    }

    /// Service names in dependency order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn service(&self, name: &str) -> Result<&Service> {
        self.file
            .services
            .get(name)
            .ok_or_else(|| BoxError::not_found("service", name))
    }

    /// Named services (all when empty), optionally with their dependencies,
    /// in dependency order.
    pub fn select(&self, names: &[String], with_deps: bool) -> Result<Vec<String>> {
        if names.is_empty() {
            return Ok(self.order.clone());
        }
        for n in names {
            self.service(n)?;
        }
        let wanted: BTreeSet<String> = if with_deps {
            self.graph.closure(names)
        } else {
            names.iter().cloned().collect()
        };
        Ok(self.order.iter().filter(|s| wanted.contains(*s)).cloned().collect())
    }

    /// Labels stamped on project volumes and networks.
    pub fn resource_labels(&self) -> HashMap<String, String> {
        HashMap::from([(COMPOSE_PROJECT.to_string(), self.name.clone())])
    }

    /// Store name of a declared volume.
    pub fn volume_name(&self, key: &str) -> Result<String> {
        let decl = self
            .file
            .volumes
            .get(key)
            .ok_or_else(|| BoxError::invalid(format!("undefined volume {key:?}")))?;
        Ok(match decl {
            Some(d) if d.name.is_some() => d.name.clone().unwrap_or_default(),
            Some(d) if d.external => key.to_string(),
            _ => format!("{}_{key}", self.name),
        })
    }

    /// Volumes the project owns: `(store name, labels)`, externals excluded.
    pub fn owned_volumes(&self) -> Result<Vec<(String, HashMap<String, String>)>> {
        let mut out = Vec::new();
        for (key, decl) in &self.file.volumes {
            let decl = decl.clone().unwrap_or_default();
            if decl.external {
                continue;
            }
            let mut labels = self.resource_labels();
            if let Some(l) = &decl.labels {
                labels.extend(l.pairs());
            }
            out.push((self.volume_name(key)?, labels));
        }
        Ok(out)
    }

    fn network_decl(&self, key: &str) -> Option<NetworkDecl> {
        self.file.networks.get(key).map(|d| d.clone().unwrap_or_default())
    }

    /// Store name of a project network key.
    pub fn network_name(&self, key: &str) -> Result<String> {
        match self.network_decl(key) {
            Some(d) => Ok(match d.name {
                Some(name) => name,
                None if d.external => key.to_string(),
                None => format!("{}_{key}", self.name),
            }),
            None if key == DEFAULT_NETWORK => Ok(format!("{}_{DEFAULT_NETWORK}", self.name)),
            None => Err(BoxError::invalid(format!("undefined network {key:?}"))),
        }
    }

    fn network_keys(&self, svc: &Service) -> Vec<(String, ServiceNetwork)> {
        match (&svc.network_mode, &svc.networks) {
            (Some(_), _) => Vec::new(),
            (None, Some(n)) => n.entries(),
            (None, None) => vec![(DEFAULT_NETWORK.to_string(), ServiceNetwork::default())],
        }
    }

    /// Networks to create for `services`, externals excluded.
    pub fn owned_networks(&self, services: &[String]) -> Result<Vec<NetworkCreate>> {
        let mut keys = BTreeSet::new();
        for name in services {
            for (key, _) in self.network_keys(self.service(name)?) {
                keys.insert(key);
            }
        }
        let mut out = Vec::new();
        for key in keys {
            let decl = self.network_decl(&key).unwrap_or_default();
            if decl.external {
                continue;
            }
            let mut labels = self.resource_labels();
            if let Some(l) = &decl.labels {
                labels.extend(l.pairs());
            }
            let pool = decl
                .ipam
                .as_ref()
                .and_then(|i| i.config.first())
                .cloned()
                .unwrap_or_default();
            let gateway = pool
                .gateway
                .as_deref()
                .map(|g| {
                    g.parse::<Ipv4Addr>()
                        .map_err(|_| BoxError::invalid(format!("network {key}: invalid gateway {g:?}")))
                })
                .transpose()?;
            out.push(NetworkCreate {
                name: self.network_name(&key)?,
                driver: decl.driver.clone().unwrap_or_default(),
                subnet: pool.subnet,
                gateway,
                ip_range: pool.ip_range,
                options: decl.driver_opts.clone(),
                labels,
            });
        }
        Ok(out)
    }

    /// Every network name the project may have created, externals excluded.
    pub fn all_owned_network_names(&self) -> Result<Vec<String>> {
        let all: Vec<String> = self.order.clone();
        Ok(self.owned_networks(&all)?.into_iter().map(|n| n.name).collect())
    }

    pub fn container_name(&self, service: &str, number: u32) -> String {
        match self.file.services.get(service).and_then(|s| s.container_name.clone()) {
            Some(name) => name,
            None => format!("{}-{service}-{number}", self.name),
        }
    }

    /// Image reference a service runs; build-only services get
    /// `<project>-<service>`.
    pub fn image_name(&self, service: &str) -> Result<String> {
        let svc = self.service(service)?;
        Ok(svc
            .image
            .clone()
            .unwrap_or_else(|| format!("{}-{service}", self.name)))
    }

    /// Effective pull policy of a service; `None` means "build".
    pub fn pull_policy(&self, service: &str) -> Result<Option<PullPolicy>> {
        let svc = self.service(service)?;
        match svc.pull_policy.as_deref() {
            None | Some("") | Some("missing") | Some("if_not_present") => Ok(Some(PullPolicy::Missing)),
            Some("always") => Ok(Some(PullPolicy::Always)),
            Some("never") => Ok(Some(PullPolicy::Never)),
            Some("build") => Ok(None),
            Some(other) => Err(BoxError::invalid(format!(
                "service {service}: invalid pull_policy {other:?}"
            ))),
        }
    }

    /// Build request of a service with a `build` section.
    pub fn build_request(&self, service: &str) -> Result<Option<BuildRequest>> {
        let svc = self.service(service)?;
        let Some(build) = &svc.build else {
            return Ok(None);
        };
        let cfg = build.config();
        let context = self.host_path(cfg.context.as_deref().unwrap_or("."));
        Ok(Some(BuildRequest {
            dockerfile: cfg.dockerfile.as_deref().map(|d| join_clean(&context, d)),
            context,
            tags: vec![self.image_name(service)?],
            build_args: cfg.args.as_ref().map(|a| a.pairs()).unwrap_or_default(),
            target: cfg.target.clone(),
            platform: svc.platform.clone(),
            no_cache: false,
            labels: cfg
                .labels
                .as_ref()
                .map(|l| l.pairs().into_iter().collect())
                .unwrap_or_default(),
        }))
    }

    fn host_path(&self, raw: &str) -> PathBuf {
        if let Some(rest) = raw.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return join_clean(&home, rest);
            }
        }
        if Path::new(raw).is_absolute() {
            return join_clean(Path::new("/"), raw);
        }
        join_clean(&self.dir, raw)
    }

    fn volume_flag(&self, service: &str, entry: &VolumeEntry, opts: &mut CreateOptions) -> Result<()> {
        let (kind, source, target, read_only, mode) = match entry {
            VolumeEntry::Short(s) => {
                let parts: Vec<&str> = s.splitn(3, ':').collect();
                match parts.as_slice() {
                    [target] => (None, None, target.to_string(), false, None),
                    [source, target] => (None, Some(source.to_string()), target.to_string(), false, None),
                    [source, target, mode] => (
                        None,
                        Some(source.to_string()),
                        target.to_string(),
                        false,
                        Some(mode.to_string()),
                    ),
                    _ => return Err(BoxError::invalid(format!("service {service}: invalid volume {s:?}"))),
                }
            }
            VolumeEntry::Long(l) => (l.kind.clone(), l.source.clone(), l.target.clone(), l.read_only, None),
        };
        let mut suffix = mode.map(|m| format!(":{m}")).unwrap_or_default();
        if read_only {
            suffix = ":ro".to_string();
        }
        match (kind.as_deref(), source) {
            (Some("tmpfs"), _) => opts.tmpfs.push(target),
            (Some(other), _) if !matches!(other, "bind" | "volume") => {
                return Err(BoxError::invalid(format!(
                    "service {service}: unsupported volume type {other:?}"
                )))
            }
            (_, None) => opts.volumes.push(format!("{target}{suffix}")),
            (Some("bind"), Some(src)) => {
                opts.volumes.push(format!("{}:{target}{suffix}", self.host_path(&src).display()))
            }
            (_, Some(src)) if is_host_path(&src) => {
                opts.volumes.push(format!("{}:{target}{suffix}", self.host_path(&src).display()))
            }
            (_, Some(src)) => {
                let name = self.volume_name(&src).map_err(|_| {
                    BoxError::invalid(format!("service {service} refers to undefined volume {src}"))
                })?;
                opts.volumes.push(format!("{name}:{target}{suffix}"));
            }
        }
        Ok(())
    }

    fn file_mount(&self, service: &str, reference: &FileRef, secret: bool) -> Result<String> {
        let kind = if secret { "secret" } else { "config" };
        let table = if secret { &self.file.secrets } else { &self.file.configs };
        let source = reference.source();
        let object = table.get(source).ok_or_else(|| {
            BoxError::invalid(format!("service {service} refers to undefined {kind} {source}"))
        })?;
        let file = match (&object.file, object.external) {
            (Some(file), false) => self.host_path(file),
            _ => {
                return Err(BoxError::invalid(format!(
                    "{kind} {source}: only file-backed {kind}s are supported"
                )))
            }
        };
        let target = match reference.target() {
            Some(t) if t.starts_with('/') => t.to_string(),
            Some(t) if secret => format!("/run/secrets/{t}"),
            Some(t) => format!("/{t}"),
            None if secret => format!("/run/secrets/{source}"),
            None => format!("/{source}"),
        };
        Ok(format!("{}:{target}:ro", file.display()))
    }

    /// Create options for replica `number` of `service`.
    pub fn create_options(&self, service: &str, number: u32) -> Result<CreateOptions> {
        let svc = self.service(service)?;
        let mut opts = CreateOptions {
            name: Some(self.container_name(service, number)),
            hostname: svc.hostname.clone(),
            platform: svc.platform.clone(),
            workdir: svc.working_dir.clone(),
            user: svc.user.clone(),
            tty: svc.tty,
            interactive: svc.stdin_open,
            init: svc.init,
            stop_signal: svc.stop_signal.clone(),
            read_only: svc.read_only,
            privileged: svc.privileged,
            cap_add: svc.cap_add.clone(),
            cap_drop: svc.cap_drop.clone(),
            security_opt: svc.security_opt.clone(),
            restart: svc.restart.clone(),
            ..CreateOptions::default()
        };

        if let Some(labels) = &svc.labels {
            opts.labels = labels.items('=');
        }
        if let Some(env) = &svc.environment {
            opts.env = env.items('=');
        }
        if let Some(files) = &svc.env_file {
            opts.env_files = files.items().iter().map(|f| self.host_path(f)).collect();
        }

        // An explicit entrypoint replaces the image's; its tail becomes the
        // head of the arguments.
        let mut args = Vec::new();
        if let Some(ep) = &svc.entrypoint {
            let mut words = ep.words()?.into_iter();
            opts.entrypoint = Some(words.next().unwrap_or_default());
            args.extend(words);
        }
        if let Some(cmd) = &svc.command {
            args.extend(cmd.words()?);
        }
        opts.args = args;

        for (name, limit) in &svc.ulimits {
            opts.ulimits.push(limit.flag(name));
        }
        if let Some(period) = &svc.stop_grace_period {
            opts.stop_timeout = Some(parse_duration(period)?.as_secs());
        }

        // Network.
        match svc.network_mode.as_deref() {
            Some(mode) => {
                let mode = match mode.strip_prefix("service:") {
                    Some(other) => {
                        self.service(other)?;
                        format!("container:{}", self.container_name(other, 1))
                    }
                    None => mode.to_string(),
                };
                opts.networks.push(mode);
            }
            None => {
                for (i, (key, settings)) in self.network_keys(svc).into_iter().enumerate() {
                    opts.networks.push(self.network_name(&key).map_err(|_| {
                        BoxError::invalid(format!("service {service} refers to undefined network {key}"))
                    })?);
                    if i == 0 {
                        opts.ip = settings.ipv4_address;
                        opts.mac_address = settings.mac_address;
                    }
                }
            }
        }
        if let Some(hosts) = &svc.extra_hosts {
            opts.add_hosts = hosts
                .items(':')
                .into_iter()
                .map(|h| match h.split_once('=') {
                    Some((host, ip)) => format!("{host}:{ip}"),
                    None => h,
                })
                .collect();
        }
        if let Some(dns) = &svc.dns {
            opts.dns = dns.items();
        }
        opts.publish = svc.ports.iter().map(|p| p.publish_spec()).collect();
        opts.expose = svc.expose.iter().map(|e| e.to_string()).collect();

        // Storage.
        for entry in &svc.volumes {
            self.volume_flag(service, entry, &mut opts)?;
        }
        if let Some(tmpfs) = &svc.tmpfs {
            opts.tmpfs.extend(tmpfs.items());
        }
        for c in &svc.configs {
            opts.volumes.push(self.file_mount(service, c, false)?);
        }
        for s in &svc.secrets {
            opts.volumes.push(self.file_mount(service, s, true)?);
        }

        // Resources.
        if let Some(sysctls) = &svc.sysctls {
            opts.sysctls = sysctls.items('=');
        }
        if let Some(limits) = svc.limits() {
            if let Some(cpus) = &limits.cpus {
                let cpus = cpus.to_string();
                opts.cpus = Some(cpus.parse().map_err(|_| {
                    BoxError::invalid(format!("service {service}: invalid cpus limit {cpus:?}"))
                })?);
            }
            opts.memory = limits.memory.clone();
            opts.pids_limit = limits.pids;
        }

        if let Some(logging) = &svc.logging {
            opts.log_driver = logging.driver.clone();
            opts.log_opts = logging.options.iter().map(|(k, v)| format!("{k}={v}")).collect();
        }
        if let Some(hc) = &svc.healthcheck {
            let (check, disabled) = healthcheck(service, hc)?;
            opts.healthcheck = check;
            opts.no_healthcheck = disabled;
        }
        Ok(opts)
    }
}

fn seconds(service: &str, field: &str, raw: Option<&str>, default: u64) -> Result<u64> {
    match raw {
        Some(v) => parse_duration(v)
            .map(|d| d.as_secs())
            .map_err(|e| BoxError::invalid(format!("service {service}: healthcheck {field}: {e}"))),
        None => Ok(default),
    }
}

/// Health check of a service, and whether it is explicitly disabled.
fn healthcheck(service: &str, hc: &Healthcheck) -> Result<(Option<HealthCheck>, bool)> {
    let test = match &hc.test {
        Some(StringOrList::String(s)) => vec!["CMD-SHELL".to_string(), s.clone()],
        Some(StringOrList::List(l)) => l.clone(),
        None => Vec::new(),
    };
    if hc.disable || test.first().map(String::as_str) == Some("NONE") {
        return Ok((None, true));
    }
    if test.is_empty() {
        return Ok((None, false));
    }
    if !matches!(test[0].as_str(), "CMD" | "CMD-SHELL") {
        return Err(BoxError::invalid(format!(
            "service {service}: healthcheck test must start with CMD, CMD-SHELL or NONE"
        )));
    }
    let defaults = HealthCheck::default();
    Ok((
        Some(HealthCheck {
            test,
            interval_secs: seconds(service, "interval", hc.interval.as_deref(), defaults.interval_secs)?,
            timeout_secs: seconds(service, "timeout", hc.timeout.as_deref(), defaults.timeout_secs)?,
            retries: hc.retries.unwrap_or(defaults.retries),
            start_period_secs: seconds(
                service,
                "start_period",
                hc.start_period.as_deref(),
                defaults.start_period_secs,
            )?,
        }),
        false,
    ))
}
