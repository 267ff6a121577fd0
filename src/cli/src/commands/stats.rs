//! `cdbox stats` command: live resource usage of containers.
//!
//! CPU is sampled as a delta between two refreshes; memory is the sum over
//! every process of the container.

use cdbox_core::error::Result;
use cdbox_core::units::format_bytes;
use cdbox_runtime::lifecycle::ListOptions;
use cdbox_runtime::Container;
use clap::Args;
use serde::Serialize;
use sysinfo::{Pid, System};

use crate::app::App;
use crate::output::{new_table, print_rows, Format};

const SAMPLE: std::time::Duration = std::time::Duration::from_millis(500);

#[derive(Args, Debug)]
pub struct StatsArgs {
    /// Containers to show (default: all running)
    pub containers: Vec<String>,

    /// Show all containers (default shows just running)
    #[arg(short = 'a', long)]
    pub all: bool,

    /// Disable streaming stats and only pull the first result
    #[arg(long = "no-stream")]
    pub no_stream: bool,

    /// Format output using a template, or `json`
    #[arg(long)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatsRow {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    #[serde(rename = "CPUPerc")]
    pub cpu_perc: String,
    pub mem_usage: String,
    pub mem_perc: String,
    #[serde(rename = "PIDs")]
    pub pids: String,
}

fn memory_limit(c: &Container) -> Option<u64> {
    c.record
        .spec
        .linux()
        .as_ref()
        .and_then(|l| l.resources().as_ref())
        .and_then(|r| r.memory().as_ref())
        .and_then(|m| m.limit())
        .filter(|l| *l > 0)
        .map(|l| l as u64)
}

fn row(c: &Container, sys: &System, pids: &[u32], host_memory: u64) -> StatsRow {
    let (cpu, mem) = pids
        .iter()
        .filter_map(|pid| sys.process(Pid::from_u32(*pid)))
        .fold((0f32, 0u64), |(cpu, mem), p| (cpu + p.cpu_usage(), mem + p.memory()));
    let limit = memory_limit(c).unwrap_or(host_memory);
    let perc = if limit > 0 { mem as f64 / limit as f64 * 100.0 } else { 0.0 };
    StatsRow {
        id: c.short_id().to_string(),
        name: c.name().to_string(),
        cpu_perc: format!("{cpu:.2}%"),
        mem_usage: format!("{} / {}", format_bytes(mem), format_bytes(limit)),
        mem_perc: format!("{perc:.2}%"),
        pids: pids.len().to_string(),
    }
}

fn table(rows: &[StatsRow]) -> comfy_table::Table {
    let mut table = new_table(&["CONTAINER ID", "NAME", "CPU %", "MEM USAGE / LIMIT", "MEM %", "PIDS"]);
    for r in rows {
        table.add_row(vec![
            r.id.clone(),
            r.name.clone(),
            r.cpu_perc.clone(),
            r.mem_usage.clone(),
            r.mem_perc.clone(),
            r.pids.clone(),
        ]);
    }
    table
}

pub async fn execute(app: &App, args: StatsArgs) -> Result<()> {
    let mgr = app.manager()?;
    let format = Format::parse(args.format.as_deref());
    let mut sys = System::new();
    sys.refresh_memory();
    let host_memory = sys.total_memory();

    loop {
        let containers: Vec<Container> = if args.containers.is_empty() {
            mgr.list(&ListOptions {
                all: args.all,
                ..ListOptions::default()
            })
            .await?
        } else {
            let mut found = Vec::new();
            for token in &args.containers {
                found.push(mgr.find(token).await?);
            }
            found
        };

        let mut sampled = Vec::new();
        for c in &containers {
            let pids = if c.status().is_live() {
                mgr.services().tasks.pids(c.id()).await.unwrap_or_default()
            } else {
                Vec::new()
            };
            for pid in &pids {
                sys.refresh_process(Pid::from_u32(*pid));
            }
            sampled.push((c, pids));
        }
        tokio::time::sleep(SAMPLE).await;
        let rows: Vec<StatsRow> = sampled
            .iter()
            .map(|(c, pids)| {
                for pid in pids {
                    sys.refresh_process(Pid::from_u32(*pid));
                }
                row(c, &sys, pids, host_memory)
            })
            .collect();

        if !args.no_stream && format == Format::Table {
            print!("\x1B[2J\x1B[H");
        }
        print_rows(&rows, &format, table)?;
        if args.no_stream {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
            _ = mgr.cancel_token().cancelled() => return Ok(()),
        }
    }
}
