//! `cdbox compose` subcommands.

use std::path::PathBuf;
use std::time::Duration;

use cdbox_core::error::{BoxError, Result};
use cdbox_core::units::format_bytes;
use cdbox_runtime::compose::{self, DownOptions, LoadOptions, Orchestrator, Project, Report, UpOptions};
use cdbox_runtime::spec::PullPolicy;
use cdbox_runtime::ContainerManager;
use clap::{Args, Subcommand};
use tokio_util::sync::CancellationToken;

use super::logs::{print_entry, LogFlags};
use super::port::host_address;
use super::top::process_table;
use crate::app::App;
use crate::output::{new_table, print_rows, Format};

/// Flags that select the project.
#[derive(Args, Debug, Clone, Default)]
pub struct ProjectFlags {
    /// Compose configuration files
    #[arg(short = 'f', long = "file")]
    pub files: Vec<PathBuf>,

    /// Project name
    #[arg(short = 'p', long = "project-name")]
    pub project_name: Option<String>,

    /// Alternate working directory (default: the directory of the first file)
    #[arg(long = "project-directory")]
    pub project_directory: Option<PathBuf>,

    /// Alternate environment files
    #[arg(long = "env-file")]
    pub env_files: Vec<PathBuf>,
}

impl ProjectFlags {
    fn load(&self) -> Result<Project> {
        let opts = LoadOptions {
            files: self.files.clone(),
            project_dir: self.project_directory.clone(),
            project_name: self.project_name.clone(),
            env_files: self.env_files.clone(),
        };
        let cwd = std::env::current_dir()?;
        compose::load(&opts, &cwd, &|k| std::env::var(k).ok())
    }
}

#[derive(Args, Debug)]
pub struct ComposeArgs {
    #[command(flatten)]
    pub project: ProjectFlags,

    #[command(subcommand)]
    pub command: ComposeCommand,
}

#[derive(Subcommand, Debug)]
pub enum ComposeCommand {
    /// Create and start containers
    Up(UpArgs),
    /// Stop and remove containers and networks
    Down(DownArgs),
    /// Build or rebuild services
    Build(BuildArgs),
    /// Pull service images
    Pull(Services),
    /// Push service images
    Push(Services),
    /// Create containers for services
    Create(CreateArgs),
    /// Start services
    Start(Services),
    /// Stop services
    Stop(TimeoutArgs),
    /// Restart services
    Restart(TimeoutArgs),
    /// Force stop service containers
    Kill(KillArgs),
    /// Pause services
    Pause(Services),
    /// Unpause services
    Unpause(Services),
    /// List containers
    Ps(PsArgs),
    /// View output from containers
    Logs(LogsArgs),
    /// Display the running processes
    Top(Services),
    /// List images used by the created containers
    Images(ImagesArgs),
    /// Print the public port for a port binding
    Port(PortArgs),
    /// Parse, resolve and render the compose file
    #[command(alias = "convert")]
    Config(ConfigArgs),
    /// Remove stopped service containers
    Rm(RmArgs),
}

#[derive(Args, Debug, Default)]
pub struct Services {
    pub services: Vec<String>,
}

#[derive(Args, Debug, Default)]
pub struct RecreateFlags {
    /// Build images before starting containers
    #[arg(long)]
    pub build: bool,

    /// Don't build an image, even if it's missing
    #[arg(long = "no-build")]
    pub no_build: bool,

    /// Pull image before running (always, missing, never)
    #[arg(long)]
    pub pull: Option<String>,

    /// Recreate containers even if their configuration hasn't changed
    #[arg(long = "force-recreate")]
    pub force_recreate: bool,

    /// Don't recreate containers that already exist
    #[arg(long = "no-recreate")]
    pub no_recreate: bool,
}

#[derive(Args, Debug, Default)]
pub struct UpArgs {
    #[command(flatten)]
    pub recreate: RecreateFlags,

    /// Detached mode: run containers in the background
    #[arg(short = 'd', long)]
    pub detach: bool,

    /// Don't start linked services
    #[arg(long = "no-deps")]
    pub no_deps: bool,

    /// Don't start the services after creating them
    #[arg(long = "no-start")]
    pub no_start: bool,

    /// Don't prefix log lines with the container name
    #[arg(long = "no-log-prefix")]
    pub no_log_prefix: bool,

    /// Shutdown timeout in seconds
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    pub services: Vec<String>,
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    #[command(flatten)]
    pub recreate: RecreateFlags,

    pub services: Vec<String>,
}

#[derive(Args, Debug)]
pub struct DownArgs {
    /// Remove named volumes declared in the file and anonymous volumes
    #[arg(short = 'v', long)]
    pub volumes: bool,

    /// Remove containers for services not defined in the file
    #[arg(long = "remove-orphans")]
    pub remove_orphans: bool,

    /// Shutdown timeout in seconds
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Do not use cache when building the image
    #[arg(long = "no-cache")]
    pub no_cache: bool,

    pub services: Vec<String>,
}

#[derive(Args, Debug)]
pub struct TimeoutArgs {
    /// Shutdown timeout in seconds
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    pub services: Vec<String>,
}

#[derive(Args, Debug)]
pub struct KillArgs {
    /// Signal to send to the container
    #[arg(short = 's', long, default_value = "SIGKILL")]
    pub signal: String,

    pub services: Vec<String>,
}

#[derive(Args, Debug)]
pub struct PsArgs {
    /// Show all stopped containers
    #[arg(short = 'a', long)]
    pub all: bool,

    /// Only display IDs
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Display services
    #[arg(long = "services")]
    pub list_services: bool,

    /// Format output using a template, or `json`
    #[arg(long)]
    pub format: Option<String>,

    pub services: Vec<String>,
}

#[derive(Args, Debug)]
pub struct LogsArgs {
    #[command(flatten)]
    pub flags: LogFlags,

    /// Don't print the container name prefix
    #[arg(long = "no-log-prefix")]
    pub no_log_prefix: bool,

    pub services: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ImagesArgs {
    /// Only display IDs
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Format output using a template, or `json`
    #[arg(long)]
    pub format: Option<String>,

    pub services: Vec<String>,
}

#[derive(Args, Debug)]
pub struct PortArgs {
    /// Index of the container if the service has multiple replicas
    #[arg(long, default_value_t = 1)]
    pub index: u32,

    /// tcp or udp
    #[arg(long, default_value = "tcp")]
    pub protocol: String,

    pub service: String,

    pub private_port: u16,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Only validate the configuration, don't print anything
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Print the service names, one per line
    #[arg(long = "services")]
    pub list_services: bool,

    /// Print the volume names, one per line
    #[arg(long = "volumes")]
    pub list_volumes: bool,
}

#[derive(Args, Debug)]
pub struct RmArgs {
    /// Don't ask to confirm removal
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Stop the containers, if required, before removing
    #[arg(short = 's', long)]
    pub stop: bool,

    /// Remove anonymous volumes attached to containers
    #[arg(short = 'v', long)]
    pub volumes: bool,

    pub services: Vec<String>,
}

impl RecreateFlags {
    fn options(&self, services: Vec<String>) -> Result<UpOptions> {
        if self.build && self.no_build {
            return Err(BoxError::invalid("--build and --no-build are incompatible"));
        }
        Ok(UpOptions {
            services,
            build: self.build,
            no_build: self.no_build,
            pull: self.pull.as_deref().map(str::parse::<PullPolicy>).transpose()?,
            force_recreate: self.force_recreate,
            no_recreate: self.no_recreate,
            ..UpOptions::default()
        })
    }
}

fn secs(t: Option<u64>) -> Option<Duration> {
    t.map(Duration::from_secs)
}

/// Print what happened, then fail with every error the operation collected.
fn finish(report: Report) -> Result<()> {
    for (what, e) in &report.failed {
        tracing::debug!(resource = %what, error = %e, "compose operation failed");
    }
    for change in report.into_result()? {
        eprintln!(" {change}");
    }
    Ok(())
}

pub async fn execute(app: &App, args: ComposeArgs) -> Result<()> {
    let project = args.project.load()?;
    let mgr = app.manager()?;
    let orch = Orchestrator::new(&mgr, &project);
    match args.command {
        ComposeCommand::Up(up) => run_up(app, &orch, up).await,
        ComposeCommand::Down(a) => finish(
            orch.down(&DownOptions {
                volumes: a.volumes,
                remove_orphans: a.remove_orphans,
                timeout: secs(a.timeout),
            })
            .await?,
        ),
        ComposeCommand::Build(a) => finish(orch.build(&a.services, a.no_cache).await?),
        ComposeCommand::Pull(a) => finish(orch.pull(&a.services).await?),
        ComposeCommand::Push(a) => finish(orch.push(&a.services).await?),
        ComposeCommand::Create(a) => finish(orch.create(&a.recreate.options(a.services)?).await?),
        ComposeCommand::Start(a) => finish(orch.start(&a.services).await?),
        ComposeCommand::Stop(a) => finish(orch.stop(&a.services, secs(a.timeout)).await?),
        ComposeCommand::Restart(a) => finish(orch.restart(&a.services, secs(a.timeout)).await?),
        ComposeCommand::Kill(a) => {
            cdbox_core::signal::parse_signal(&a.signal)?;
            finish(orch.kill(&a.services, Some(&a.signal)).await?)
        }
        ComposeCommand::Pause(a) => finish(orch.pause(&a.services).await?),
        ComposeCommand::Unpause(a) => finish(orch.unpause(&a.services).await?),
        ComposeCommand::Ps(a) => ps(&orch, a).await,
        ComposeCommand::Logs(a) => {
            let query = a.flags.query()?;
            let timestamps = query.timestamps;
            let no_prefix = a.no_log_prefix;
            let emit = move |name: &str, entry: &cdbox_core::log::LogEntry| {
                let prefix = if no_prefix { String::new() } else { format!("{name} | ") };
                print_entry(&prefix, entry, timestamps)
            };
            match orch.logs(&a.services, &query, &emit).await {
                Err(BoxError::Cancelled) if query.follow => Ok(()),
                other => other,
            }
        }
        ComposeCommand::Top(a) => {
            for (name, pids) in orch.top(&a.services).await? {
                println!("{name}");
                println!("{}", process_table(&pids));
                println!();
            }
            Ok(())
        }
        ComposeCommand::Images(a) => {
            let rows = orch.images(&a.services).await?;
            if a.quiet {
                for r in &rows {
                    println!("{}", r.id);
                }
                return Ok(());
            }
            print_rows(&rows, &Format::parse(a.format.as_deref()), |rows| {
                let mut t = new_table(&["CONTAINER", "REPOSITORY", "TAG", "IMAGE ID", "SIZE"]);
                for r in rows {
                    t.add_row(vec![
                        r.container.clone(),
                        r.repository.clone(),
                        r.tag.clone(),
                        r.id.clone(),
                        format_bytes(r.size),
                    ]);
                }
                t
            })
        }
        ComposeCommand::Port(a) => {
            let private = format!("{}/{}", a.private_port, a.protocol);
            let mapping = orch.port(&a.service, &private, a.index).await?;
            println!("{}", host_address(&mapping));
            Ok(())
        }
        ComposeCommand::Config(a) => {
            if a.quiet {
                return Ok(());
            }
            if a.list_services {
                for name in project.order() {
                    println!("{name}");
                }
                return Ok(());
            }
            if a.list_volumes {
                for name in project.file.volumes.keys() {
                    println!("{name}");
                }
                return Ok(());
            }
            print!("{}", orch.config()?);
            Ok(())
        }
        ComposeCommand::Rm(a) => {
            let _ = a.force;
            finish(orch.rm(&a.services, a.stop, a.volumes).await?)
        }
    }
}

async fn ps(orch: &Orchestrator<'_>, a: PsArgs) -> Result<()> {
    if a.list_services {
        for name in orch.project().select(&a.services, false)? {
            println!("{name}");
        }
        return Ok(());
    }
    let rows = orch.ps(&a.services, a.all).await?;
    if a.quiet {
        for r in &rows {
            println!("{}", r.id);
        }
        return Ok(());
    }
    print_rows(&rows, &Format::parse(a.format.as_deref()), |rows| {
        let mut t = new_table(&["NAME", "IMAGE", "COMMAND", "SERVICE", "CREATED", "STATUS", "PORTS"]);
        for r in rows {
            t.add_row(vec![
                r.name.clone(),
                r.image.clone(),
                format!("{:?}", r.command),
                r.service.clone(),
                r.created.clone(),
                r.status.clone(),
                r.ports.clone(),
            ]);
        }
        t
    })
}

/// `up`: converge, then (unless detached) follow logs until interrupted and
/// stop the project in reverse dependency order.
async fn run_up(app: &App, orch: &Orchestrator<'_>, a: UpArgs) -> Result<()> {
    let mut opts = a.recreate.options(a.services.clone())?;
    opts.no_deps = a.no_deps;
    opts.no_start = a.no_start;
    opts.timeout = secs(a.timeout);
    match orch.up(&opts).await {
        Ok(report) => finish(report)?,
        // Services of earlier levels may already be running.
        Err(BoxError::Cancelled) => return graceful_stop(app, orch, &a).await,
        Err(e) => return Err(e),
    }
    if a.detach || a.no_start {
        return Ok(());
    }

    let query = cdbox_runtime::logging::consumer::LogQuery {
        follow: true,
        ..Default::default()
    };
    let no_prefix = a.no_log_prefix;
    let emit = move |name: &str, entry: &cdbox_core::log::LogEntry| {
        let prefix = if no_prefix { String::new() } else { format!("{name} | ") };
        print_entry(&prefix, entry, false)
    };
    match orch.logs(&a.services, &query, &emit).await {
        Ok(()) => Ok(()),
        Err(BoxError::Cancelled) => graceful_stop(app, orch, &a).await,
        Err(e) => Err(e),
    }
}

/// Stop the project in reverse dependency order after an interrupt. The
/// stop runs under a fresh token so the interrupt that got us here does not
/// abort it; a second Ctrl+C does. Always ends with `Cancelled` (exit 130).
async fn graceful_stop(app: &App, orch: &Orchestrator<'_>, a: &UpArgs) -> Result<()> {
    eprintln!("Gracefully stopping... (press Ctrl+C again to force)");
    let shutdown: ContainerManager = app.manager_with_cancel(CancellationToken::new())?;
    let stopper = Orchestrator::new(&shutdown, orch.project());
    let stopping = stopper.stop(&a.services, secs(a.timeout));
    tokio::select! {
        report = stopping => finish(report?)?,
        _ = tokio::signal::ctrl_c() => {}
    }
    Err(BoxError::Cancelled)
}
