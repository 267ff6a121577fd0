//! `cdbox volume` subcommands.

use cdbox_core::error::{BoxError, Result};
use cdbox_core::units::format_bytes;
use cdbox_runtime::filters::Filters;
use cdbox_runtime::volume::FILTER_KEYS;
use clap::{Args, Subcommand};
use serde::Serialize;

use super::key_values;
use crate::app::App;
use crate::output::{new_table, print_document, print_rows, Format};

#[derive(Subcommand, Debug)]
pub enum VolumeCommand {
    /// Create a volume
    Create(CreateArgs),
    /// List volumes
    #[command(alias = "list")]
    Ls(LsArgs),
    /// Display detailed information on one or more volumes
    Inspect(InspectArgs),
    /// Remove one or more volumes
    #[command(alias = "remove")]
    Rm(RmArgs),
    /// Remove unused local volumes
    Prune(PruneArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Volume name (generated when omitted)
    pub name: Option<String>,

    /// Set metadata for the volume
    #[arg(short = 'l', long = "label")]
    pub labels: Vec<String>,
}

#[derive(Args, Debug)]
pub struct LsArgs {
    /// Only display volume names
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Filter output based on conditions provided
    #[arg(short = 'f', long = "filter")]
    pub filters: Vec<String>,

    /// Format output using a template, or `json`
    #[arg(long)]
    pub format: Option<String>,

    /// Display the disk usage of volumes
    #[arg(short = 's', long)]
    pub size: bool,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    #[arg(required = true)]
    pub volumes: Vec<String>,

    /// Format output using a template
    #[arg(short = 'f', long)]
    pub format: Option<String>,

    /// Display the disk usage of each volume
    #[arg(short = 's', long)]
    pub size: bool,
}

#[derive(Args, Debug)]
pub struct RmArgs {
    #[arg(required = true)]
    pub volumes: Vec<String>,

    /// Remove volumes even when a stopped container still refers to them
    #[arg(short = 'f', long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Remove all unused volumes, not just anonymous ones
    #[arg(short = 'a', long)]
    pub all: bool,

    /// Filter the volumes to prune
    #[arg(long = "filter")]
    pub filters: Vec<String>,

    /// Do not prompt for confirmation
    #[arg(short = 'f', long)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct VolumeRow {
    name: String,
    driver: String,
    scope: String,
    mountpoint: String,
    labels: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<String>,
}

pub async fn execute(app: &App, command: VolumeCommand) -> Result<()> {
    let mgr = app.manager()?;
    let volumes = mgr.volumes();
    match command {
        VolumeCommand::Create(args) => {
            let labels = key_values(&args.labels, "label")?;
            let name = args.name.unwrap_or_else(cdbox_runtime::ids::generate_id);
            let info = volumes.create(&name, labels)?;
            println!("{}", info.name);
            Ok(())
        }
        VolumeCommand::Ls(args) => {
            let filters = Filters::parse(&args.filters, FILTER_KEYS)?;
            let in_use = mgr.volumes_in_use().await?;
            let list = volumes.list(&filters, &in_use)?;
            if args.quiet {
                for v in &list {
                    println!("{}", v.name);
                }
                return Ok(());
            }
            let rows: Vec<VolumeRow> = list
                .into_iter()
                .map(|v| {
                    let mut labels: Vec<String> = v.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
                    labels.sort();
                    VolumeRow {
                        size: args
                            .size
                            .then(|| volumes.usage(&v.name).map(format_bytes).unwrap_or_else(|_| "N/A".into())),
                        name: v.name,
                        driver: v.driver,
                        scope: v.scope,
                        mountpoint: v.mountpoint.display().to_string(),
                        labels: labels.join(","),
                    }
                })
                .collect();
            print_rows(&rows, &Format::parse(args.format.as_deref()), |rows| {
                let mut headers = vec!["VOLUME NAME", "DIRECTORY"];
                if args.size {
                    headers.push("SIZE");
                }
                let mut t = new_table(&headers);
                for r in rows {
                    let mut cells = vec![r.name.clone(), r.mountpoint.clone()];
                    if let Some(s) = &r.size {
                        cells.push(s.clone());
                    }
                    t.add_row(cells);
                }
                t
            })
        }
        VolumeCommand::Inspect(args) if !args.size => {
            let kinds = [super::inspect::ObjectType::Volume];
            super::inspect::inspect_all(&mgr, &kinds, &args.volumes, args.format.as_deref()).await
        }
        VolumeCommand::Inspect(args) => {
            let mut docs = Vec::new();
            let mut failed = 0;
            for name in &args.volumes {
                let sized = volumes.get(name).and_then(|mut info| {
                    info.size = Some(volumes.usage(name)?);
                    Ok(info)
                });
                match sized {
                    Ok(info) => docs.push(serde_json::to_value(info)?),
                    Err(e) => {
                        eprintln!("Error: {e}");
                        failed += 1;
                    }
                }
            }
            super::inspect::print_documents(&docs, args.format.as_deref())?;
            if failed == 0 {
                Ok(())
            } else {
                Err(BoxError::Reported(failed))
            }
        }
        VolumeCommand::Rm(args) => {
            let in_use = mgr.volumes_in_use().await?;
            let outcome = volumes.remove(&args.volumes, &in_use, args.force);
            for name in &outcome.removed {
                println!("{name}");
            }
            for (name, e) in &outcome.failed {
                tracing::debug!(volume = %name, "volume removal failed");
                eprintln!("Error: {e}");
            }
            if outcome.failed.is_empty() {
                Ok(())
            } else {
                Err(BoxError::Reported(outcome.failed.len()))
            }
        }
        VolumeCommand::Prune(args) => {
            let filters = Filters::parse(&args.filters, &["label"])?;
            let in_use = mgr.volumes_in_use().await?;
            let pruned = volumes.prune(&filters, &in_use, args.all)?;
            print_pruned(&pruned);
            Ok(())
        }
    }
}

pub(crate) fn print_pruned(pruned: &[(String, u64)]) {
    if !pruned.is_empty() {
        println!("Deleted Volumes:");
        for (name, _) in pruned {
            println!("{name}");
        }
        println!();
    }
    let total: u64 = pruned.iter().map(|(_, size)| size).sum();
    println!("Total reclaimed space: {}", format_bytes(total));
}
