//! `cdbox create` command and the container flags it shares with `run`.

use std::path::PathBuf;

use cdbox_core::container::HealthCheck;
use cdbox_core::error::{BoxError, Result};
use cdbox_core::units::parse_duration;
use cdbox_runtime::lifecycle::{Container, CreateRequest};
use cdbox_runtime::spec::{CreateOptions, PullPolicy};
use clap::{ArgAction, Args};

use crate::app::App;

/// Flags describing a new container.
#[derive(Args, Debug, Clone, Default)]
pub struct CreateFlags {
    /// Assign a name to the container
    #[arg(long)]
    pub name: Option<String>,

    /// Container host name
    #[arg(long)]
    pub hostname: Option<String>,

    /// Set metadata on the container (key=value)
    #[arg(short = 'l', long = "label")]
    pub labels: Vec<String>,

    /// Read labels from a line-delimited file
    #[arg(long = "label-file")]
    pub label_files: Vec<PathBuf>,

    /// Add an OCI runtime annotation (key=value)
    #[arg(long = "annotation")]
    pub annotations: Vec<String>,

    /// Platform of the image, e.g. linux/arm64
    #[arg(long)]
    pub platform: Option<String>,

    /// Pull image before running (always, missing, never)
    #[arg(long, default_value = "missing")]
    pub pull: String,

    /// The image argument is a path to an exploded root filesystem
    #[arg(long)]
    pub rootfs: bool,

    /// Write the container ID to the file
    #[arg(long)]
    pub cidfile: Option<PathBuf>,

    /// Write the container's init PID to the file
    #[arg(long)]
    pub pidfile: Option<PathBuf>,

    /// Overwrite the default entrypoint of the image
    #[arg(long)]
    pub entrypoint: Option<String>,

    /// Set environment variables (KEY=VALUE or KEY)
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,

    /// Read environment variables from a file
    #[arg(long = "env-file")]
    pub env_files: Vec<PathBuf>,

    /// Working directory inside the container
    #[arg(short = 'w', long)]
    pub workdir: Option<String>,

    /// Username or UID (format: <name|uid>[:<group|gid>])
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// Add additional groups to join
    #[arg(long = "group-add")]
    pub group_add: Vec<String>,

    /// Allocate a pseudo-TTY
    #[arg(short = 't', long)]
    pub tty: bool,

    /// Keep STDIN open even if not attached
    #[arg(short = 'i', long)]
    pub interactive: bool,

    /// Run an init inside the container that forwards signals and reaps processes
    #[arg(long)]
    pub init: bool,

    /// Custom init binary
    #[arg(long = "init-binary")]
    pub init_binary: Option<PathBuf>,

    /// Ulimit options (e.g. nofile=1024:2048)
    #[arg(long = "ulimit")]
    pub ulimits: Vec<String>,

    /// Signal to stop the container
    #[arg(long = "stop-signal")]
    pub stop_signal: Option<String>,

    /// Timeout (in seconds) to stop the container
    #[arg(long = "stop-timeout")]
    pub stop_timeout: Option<u64>,

    /// Proxy received signals to the process
    #[arg(long = "sig-proxy", default_value_t = true, action = ArgAction::Set)]
    pub sig_proxy: bool,

    /// Override the key sequence for detaching a container
    #[arg(long = "detach-keys")]
    pub detach_keys: Option<String>,

    /// Connect a container to a network
    #[arg(long = "network", visible_alias = "net")]
    pub networks: Vec<String>,

    /// IPv4 address
    #[arg(long)]
    pub ip: Option<String>,

    /// MAC address
    #[arg(long = "mac-address")]
    pub mac_address: Option<String>,

    /// Add a custom host-to-IP mapping (host:ip)
    #[arg(long = "add-host")]
    pub add_hosts: Vec<String>,

    /// Set custom DNS servers
    #[arg(long)]
    pub dns: Vec<String>,

    /// Set custom DNS search domains
    #[arg(long = "dns-search")]
    pub dns_search: Vec<String>,

    /// Set DNS options
    #[arg(long = "dns-option", visible_alias = "dns-opt")]
    pub dns_options: Vec<String>,

    /// Publish a container's port(s) to the host
    #[arg(short = 'p', long = "publish")]
    pub publish: Vec<String>,

    /// Expose a port or a range of ports
    #[arg(long)]
    pub expose: Vec<String>,

    /// Bind mount a volume
    #[arg(short = 'v', long = "volume")]
    pub volumes: Vec<String>,

    /// Mount a tmpfs directory
    #[arg(long)]
    pub tmpfs: Vec<String>,

    /// Attach a filesystem mount to the container
    #[arg(long = "mount")]
    pub mounts: Vec<String>,

    /// Size of /dev/shm
    #[arg(long = "shm-size")]
    pub shm_size: Option<String>,

    /// Mount the container's root filesystem as read only
    #[arg(long = "read-only")]
    pub read_only: bool,

    /// IPC mode to use
    #[arg(long)]
    pub ipc: Option<String>,

    /// PID namespace to use
    #[arg(long)]
    pub pid: Option<String>,

    /// UTS namespace to use
    #[arg(long)]
    pub uts: Option<String>,

    /// Cgroup namespace to use (host, private)
    #[arg(long)]
    pub cgroupns: Option<String>,

    /// Optional parent cgroup for the container
    #[arg(long = "cgroup-parent")]
    pub cgroup_parent: Option<String>,

    /// Number of CPUs
    #[arg(long)]
    pub cpus: Option<f64>,

    /// CPU shares (relative weight)
    #[arg(short = 'c', long = "cpu-shares")]
    pub cpu_shares: Option<u64>,

    /// Limit CPU CFS period
    #[arg(long = "cpu-period")]
    pub cpu_period: Option<u64>,

    /// Limit CPU CFS quota
    #[arg(long = "cpu-quota")]
    pub cpu_quota: Option<i64>,

    /// CPUs in which to allow execution (0-3, 0,1)
    #[arg(long = "cpuset-cpus")]
    pub cpuset_cpus: Option<String>,

    /// Memory nodes in which to allow execution
    #[arg(long = "cpuset-mems")]
    pub cpuset_mems: Option<String>,

    /// Memory limit
    #[arg(short = 'm', long)]
    pub memory: Option<String>,

    /// Swap limit equal to memory plus swap, -1 for unlimited
    #[arg(long = "memory-swap", allow_hyphen_values = true)]
    pub memory_swap: Option<String>,

    /// Memory soft limit
    #[arg(long = "memory-reservation")]
    pub memory_reservation: Option<String>,

    /// Tune container memory swappiness (0 to 100)
    #[arg(long = "memory-swappiness")]
    pub memory_swappiness: Option<u64>,

    /// Tune container pids limit, -1 for unlimited
    #[arg(long = "pids-limit", allow_hyphen_values = true)]
    pub pids_limit: Option<i64>,

    /// Block IO weight (10 to 1000)
    #[arg(long = "blkio-weight")]
    pub blkio_weight: Option<u16>,

    /// Limit read rate (bytes per second) from a device
    #[arg(long = "device-read-bps")]
    pub device_read_bps: Vec<String>,

    /// Limit write rate (bytes per second) to a device
    #[arg(long = "device-write-bps")]
    pub device_write_bps: Vec<String>,

    /// Limit read rate (IO per second) from a device
    #[arg(long = "device-read-iops")]
    pub device_read_iops: Vec<String>,

    /// Limit write rate (IO per second) to a device
    #[arg(long = "device-write-iops")]
    pub device_write_iops: Vec<String>,

    /// Add a host device to the container
    #[arg(long = "device")]
    pub devices: Vec<String>,

    /// Tune the host's OOM preferences (-1000 to 1000)
    #[arg(long = "oom-score-adj", allow_hyphen_values = true)]
    pub oom_score_adj: Option<i32>,

    /// Disable OOM killer
    #[arg(long = "oom-kill-disable")]
    pub oom_kill_disable: bool,

    /// Sysctl options
    #[arg(long = "sysctl")]
    pub sysctls: Vec<String>,

    /// Add Linux capabilities
    #[arg(long = "cap-add")]
    pub cap_add: Vec<String>,

    /// Drop Linux capabilities
    #[arg(long = "cap-drop")]
    pub cap_drop: Vec<String>,

    /// Give extended privileges to this container
    #[arg(long)]
    pub privileged: bool,

    /// Security options
    #[arg(long = "security-opt")]
    pub security_opt: Vec<String>,

    /// Logging driver for the container
    #[arg(long = "log-driver")]
    pub log_driver: Option<String>,

    /// Log driver options
    #[arg(long = "log-opt")]
    pub log_opts: Vec<String>,

    /// Restart policy (no, always, on-failure[:max-retries], unless-stopped)
    #[arg(long)]
    pub restart: Option<String>,

    /// Automatically remove the container when it exits
    #[arg(long)]
    pub rm: bool,

    /// Command to run to check health
    #[arg(long = "health-cmd")]
    pub health_cmd: Option<String>,

    /// Time between running the check (e.g. 30s)
    #[arg(long = "health-interval")]
    pub health_interval: Option<String>,

    /// Maximum time to allow one check to run
    #[arg(long = "health-timeout")]
    pub health_timeout: Option<String>,

    /// Consecutive failures needed to report unhealthy
    #[arg(long = "health-retries")]
    pub health_retries: Option<u32>,

    /// Start period for the container to initialize before counting retries
    #[arg(long = "health-start-period")]
    pub health_start_period: Option<String>,

    /// Disable any container-specified HEALTHCHECK
    #[arg(long = "no-healthcheck")]
    pub no_healthcheck: bool,
}

fn seconds(flag: &str, raw: Option<&str>, default: u64) -> Result<u64> {
    match raw {
        None => Ok(default),
        Some(raw) => parse_duration(raw)
            .map(|d| d.as_secs())
            .map_err(|_| BoxError::invalid(format!("invalid --{flag} {raw:?}"))),
    }
}

impl CreateFlags {
    fn healthcheck(&self) -> Result<Option<HealthCheck>> {
        let tuned = self.health_interval.is_some()
            || self.health_timeout.is_some()
            || self.health_retries.is_some()
            || self.health_start_period.is_some();
        let Some(cmd) = &self.health_cmd else {
            if tuned {
                tracing::warn!("health check options have no effect without --health-cmd");
            }
            return Ok(None);
        };
        if self.no_healthcheck {
            return Err(BoxError::invalid(
                "--no-healthcheck conflicts with --health-* options",
            ));
        }
        let defaults = HealthCheck::default();
        Ok(Some(HealthCheck {
            test: vec!["CMD-SHELL".to_string(), cmd.clone()],
            interval_secs: seconds("health-interval", self.health_interval.as_deref(), defaults.interval_secs)?,
            timeout_secs: seconds("health-timeout", self.health_timeout.as_deref(), defaults.timeout_secs)?,
            retries: self.health_retries.unwrap_or(defaults.retries),
            start_period_secs: seconds(
                "health-start-period",
                self.health_start_period.as_deref(),
                defaults.start_period_secs,
            )?,
        }))
    }

    /// Turn the flags plus the positional image and command into a request.
    pub fn into_request(self, image: String, args: Vec<String>) -> Result<CreateRequest> {
        let pull: PullPolicy = self.pull.parse()?;
        let healthcheck = self.healthcheck()?;
        let (image, rootfs) = if self.rootfs {
            (String::new(), Some(PathBuf::from(image)))
        } else {
            (image, None)
        };
        let opts = CreateOptions {
            name: self.name,
            hostname: self.hostname,
            labels: self.labels,
            label_files: self.label_files,
            annotations: self.annotations,
            platform: self.platform,
            pull,
            rootfs,
            cidfile: self.cidfile,
            pid_file: self.pidfile,
            entrypoint: self.entrypoint,
            args,
            env: self.env,
            env_files: self.env_files,
            workdir: self.workdir,
            user: self.user,
            group_add: self.group_add,
            tty: self.tty,
            interactive: self.interactive,
            init: self.init,
            init_binary: self.init_binary,
            ulimits: self.ulimits,
            stop_signal: self.stop_signal,
            stop_timeout: self.stop_timeout,
            sig_proxy: self.sig_proxy,
            detach_keys: self.detach_keys,
            networks: self.networks,
            ip: self.ip,
            mac_address: self.mac_address,
            add_hosts: self.add_hosts,
            dns: self.dns,
            dns_search: self.dns_search,
            dns_options: self.dns_options,
            publish: self.publish,
            expose: self.expose,
            volumes: self.volumes,
            tmpfs: self.tmpfs,
            mounts: self.mounts,
            shm_size: self.shm_size,
            read_only: self.read_only,
            ipc: self.ipc,
            pid: self.pid,
            uts: self.uts,
            cgroupns: self.cgroupns,
            cgroup_parent: self.cgroup_parent,
            cpus: self.cpus,
            cpu_shares: self.cpu_shares,
            cpu_period: self.cpu_period,
            cpu_quota: self.cpu_quota,
            cpuset_cpus: self.cpuset_cpus,
            cpuset_mems: self.cpuset_mems,
            memory: self.memory,
            memory_swap: self.memory_swap,
            memory_reservation: self.memory_reservation,
            memory_swappiness: self.memory_swappiness,
            pids_limit: self.pids_limit,
            blkio_weight: self.blkio_weight,
            device_read_bps: self.device_read_bps,
            device_write_bps: self.device_write_bps,
            device_read_iops: self.device_read_iops,
            device_write_iops: self.device_write_iops,
            devices: self.devices,
            oom_score_adj: self.oom_score_adj,
            oom_kill_disable: self.oom_kill_disable,
            sysctls: self.sysctls,
            cap_add: self.cap_add,
            cap_drop: self.cap_drop,
            privileged: self.privileged,
            security_opt: self.security_opt,
            log_driver: self.log_driver,
            log_opts: self.log_opts,
            restart: self.restart,
            rm: self.rm,
            healthcheck,
            no_healthcheck: self.no_healthcheck,
        };
        Ok(CreateRequest {
            image,
            opts,
            compose: None,
        })
    }
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    #[command(flatten)]
    pub flags: CreateFlags,

    /// Image reference (or root filesystem path with --rootfs)
    pub image: String,

    /// Command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

pub async fn execute(app: &App, args: CreateArgs) -> Result<()> {
    let mgr = app.manager()?;
    let req = args.flags.into_request(args.image, args.command)?;
    let container = create_container(&mgr, &req).await?;
    println!("{}", container.id());
    Ok(())
}

/// Create from a request, logging what was made.
pub(crate) async fn create_container(
    mgr: &cdbox_runtime::ContainerManager,
    req: &CreateRequest,
) -> Result<Container> {
    let container = mgr.create(req).await?;
    tracing::info!(id = %container.id(), name = %container.name(), "created container");
    Ok(container)
}
