//! `cdbox system` subcommands and the top-level `info` and `version`.

use std::path::Path;

use cdbox_core::container::ContainerStatus;
use cdbox_core::error::Result;
use cdbox_core::units::format_bytes;
use cdbox_runtime::filters::Filters;
use clap::{Args, Subcommand};
use serde::Serialize;
use sysinfo::System;

use super::events::EventsArgs;
use crate::app::App;
use crate::output::print_document;

#[derive(Subcommand, Debug)]
pub enum SystemCommand {
    /// Display system-wide information
    Info(InfoArgs),
    /// Show version information
    Version(VersionArgs),
    /// Get real time events
    Events(EventsArgs),
    /// Remove unused data
    Prune(PruneArgs),
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Format output using a template, or `json`
    #[arg(short = 'f', long)]
    pub format: Option<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Format output using a template, or `json`
    #[arg(short = 'f', long)]
    pub format: Option<String>,
}

#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Remove all unused images, not just dangling ones
    #[arg(short = 'a', long)]
    pub all: bool,

    /// Prune anonymous volumes too
    #[arg(long)]
    pub volumes: bool,

    /// Do not prompt for confirmation
    #[arg(short = 'f', long)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Info {
    pub namespace: String,
    pub address: String,
    pub data_root: String,
    pub snapshotter: String,
    pub runtime: String,
    pub cgroup_driver: String,
    pub cgroup_version: String,
    pub rootless: bool,
    pub containers: usize,
    pub containers_running: usize,
    pub containers_paused: usize,
    pub containers_stopped: usize,
    pub images: usize,
    pub kernel_version: String,
    pub operating_system: String,
    pub architecture: String,
    #[serde(rename = "NCPU")]
    pub ncpu: usize,
    pub mem_total: u64,
    pub name: String,
}

fn cgroup_version() -> &'static str {
    if Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
        "2"
    } else {
        "1"
    }
}

pub async fn info(app: &App, args: InfoArgs) -> Result<()> {
    let mgr = app.manager()?;
    let containers = mgr.containers().await?;
    let count = |s: ContainerStatus| containers.iter().filter(|c| c.status() == s).count();
    let images = mgr.services().images.list().await?.len();
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu();
    let config = &app.config;
    let info = Info {
        namespace: config.namespace.clone(),
        address: config.address.clone(),
        data_root: config.data_root.display().to_string(),
        snapshotter: config.snapshotter.clone(),
        runtime: config.runtime.clone(),
        cgroup_driver: config.cgroup_manager.to_string(),
        cgroup_version: cgroup_version().to_string(),
        rootless: cdbox_core::config::is_rootless(),
        containers: containers.len(),
        containers_running: count(ContainerStatus::Running),
        containers_paused: count(ContainerStatus::Paused),
        containers_stopped: count(ContainerStatus::Stopped) + count(ContainerStatus::Created),
        images,
        kernel_version: System::kernel_version().unwrap_or_default(),
        operating_system: System::long_os_version().unwrap_or_default(),
        architecture: std::env::consts::ARCH.to_string(),
        ncpu: sys.cpus().len(),
        mem_total: sys.total_memory(),
        name: System::host_name().unwrap_or_default(),
    };
    if args.format.is_some() {
        return print_document(&info, args.format.as_deref());
    }
    println!("Client:");
    println!(" Namespace:\t{}", info.namespace);
    println!(" Debug Mode:\t{}", config.debug);
    println!();
    println!("Server:");
    println!(" Containers: {}", info.containers);
    println!("  Running: {}", info.containers_running);
    println!("  Paused: {}", info.containers_paused);
    println!("  Stopped: {}", info.containers_stopped);
    println!(" Images: {}", info.images);
    println!(" Server Version: {}", env!("CARGO_PKG_VERSION"));
    println!(" Storage Driver: {}", info.snapshotter);
    println!(" Logging Driver: json-file");
    println!(" Cgroup Driver: {}", info.cgroup_driver);
    println!(" Cgroup Version: {}", info.cgroup_version);
    println!(" Runtime: {}", info.runtime);
    println!(" Rootless: {}", info.rootless);
    println!(" Kernel Version: {}", info.kernel_version);
    println!(" Operating System: {}", info.operating_system);
    println!(" Architecture: {}", info.architecture);
    println!(" CPUs: {}", info.ncpu);
    println!(" Total Memory: {}", format_bytes(info.mem_total));
    println!(" Name: {}", info.name);
    println!(" Data Root: {}", info.data_root);
    println!(" Address: {}", info.address);
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComponentVersion {
    pub version: String,
    pub os: String,
    pub arch: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Version {
    pub client: ComponentVersion,
    /// First line of `<runtime> --version`, when the binary is found.
    pub runtime: Option<String>,
}

async fn runtime_version(binary: &str) -> Option<String> {
    let out = tokio::process::Command::new(binary)
        .arg("--version")
        .output()
        .await
        .ok()?;
    if !out.status.success() {
        return None;
    }
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .next()
        .map(|l| l.trim().to_string())
}

pub async fn version(app: &App, args: VersionArgs) -> Result<()> {
    let version = Version {
        client: ComponentVersion {
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        },
        runtime: runtime_version(&app.config.runtime).await,
    };
    if args.format.is_some() {
        return print_document(&version, args.format.as_deref());
    }
    println!("Client:");
    println!(" Version:\t{}", version.client.version);
    println!(" OS/Arch:\t{}/{}", version.client.os, version.client.arch);
    println!();
    println!("Server:");
    println!(" {}:", app.config.runtime);
    println!("  Version:\t{}", version.runtime.as_deref().unwrap_or("unknown"));
    Ok(())
}

pub async fn prune(app: &App, args: PruneArgs) -> Result<()> {
    let mgr = app.manager()?;
    let mut reclaimed = 0u64;

    let containers = mgr.prune(&Filters::default()).await?;
    reclaimed += containers.iter().map(|(_, s)| s).sum::<u64>();
    super::container::print_pruned(&containers);

    let networks = mgr.networks().prune(&mgr.networks_in_use().await?)?;
    super::network::print_pruned(&networks);

    if args.volumes {
        let in_use = mgr.volumes_in_use().await?;
        let volumes = mgr.volumes().prune(&Filters::default(), &in_use, false)?;
        reclaimed += volumes.iter().map(|(_, s)| s).sum::<u64>();
        if !volumes.is_empty() {
            println!("Deleted Volumes:");
            for (name, _) in &volumes {
                println!("{name}");
            }
            println!();
        }
    }

    let images = super::images::prune_images(&mgr, args.all).await?;
    if !images.is_empty() {
        println!("Deleted Images:");
        for name in &images {
            println!("untagged: {name}");
        }
        println!();
    }

    println!("Total reclaimed space: {}", format_bytes(reclaimed));
    Ok(())
}
