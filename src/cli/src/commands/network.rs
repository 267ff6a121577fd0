//! `cdbox network` subcommands.

use std::net::Ipv4Addr;

use cdbox_core::error::{BoxError, Result};
use cdbox_runtime::filters::Filters;
use cdbox_runtime::network::{NetworkCreate, NetworkInfo, FILTER_KEYS};
use clap::{Args, Subcommand};
use serde::Serialize;

use super::key_values;
use crate::app::App;
use crate::output::{each_target, new_table, print_rows, Format};

#[derive(Subcommand, Debug)]
pub enum NetworkCommand {
    /// Create a network
    Create(CreateArgs),
    /// List networks
    #[command(alias = "list")]
    Ls(LsArgs),
    /// Display detailed information on one or more networks
    Inspect(InspectArgs),
    /// Remove one or more networks
    #[command(alias = "remove")]
    Rm(RmArgs),
    /// Remove all unused networks
    Prune(PruneArgs),
}

#[derive(Args, Debug, Default)]
pub struct CreateArgs {
    pub name: String,

    /// Driver to manage the network (bridge, macvlan, ipvlan)
    #[arg(short = 'd', long, default_value = "bridge")]
    pub driver: String,

    /// Subnet in CIDR format
    #[arg(long)]
    pub subnet: Option<String>,

    /// Gateway for the subnet
    #[arg(long)]
    pub gateway: Option<String>,

    /// Allocate container IPs from a sub-range
    #[arg(long = "ip-range")]
    pub ip_range: Option<String>,

    /// Driver specific options
    #[arg(short = 'o', long = "opt")]
    pub options: Vec<String>,

    /// Set metadata on a network
    #[arg(long = "label")]
    pub labels: Vec<String>,
}

impl CreateArgs {
    fn request(self) -> Result<NetworkCreate> {
        let gateway = self
            .gateway
            .as_deref()
            .map(|g| {
                g.parse::<Ipv4Addr>()
                    .map_err(|_| BoxError::invalid(format!("invalid gateway {g:?}")))
            })
            .transpose()?;
        if gateway.is_some() && self.subnet.is_none() {
            return Err(BoxError::invalid("--gateway requires --subnet"));
        }
        Ok(NetworkCreate {
            options: key_values(&self.options, "option")?.into_iter().collect(),
            labels: key_values(&self.labels, "label")?,
            name: self.name,
            driver: self.driver,
            subnet: self.subnet,
            gateway,
            ip_range: self.ip_range,
        })
    }
}

#[derive(Args, Debug)]
pub struct LsArgs {
    /// Only display network names
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Filter output based on conditions provided
    #[arg(short = 'f', long = "filter")]
    pub filters: Vec<String>,

    /// Format output using a template, or `json`
    #[arg(long)]
    pub format: Option<String>,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    #[arg(required = true)]
    pub networks: Vec<String>,

    /// Format output using a template
    #[arg(short = 'f', long)]
    pub format: Option<String>,
}

#[derive(Args, Debug)]
pub struct RmArgs {
    #[arg(required = true)]
    pub networks: Vec<String>,
}

#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Do not prompt for confirmation
    #[arg(short = 'f', long)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkRow {
    #[serde(rename = "ID")]
    id: String,
    name: String,
    driver: String,
    subnet: String,
    labels: String,
}

fn matches(net: &NetworkInfo, filters: &Filters) -> bool {
    let id = net.id.map(|i| i.to_string()).unwrap_or_default();
    filters.any("name", |p| cdbox_runtime::filters::glob_match(p, &net.name) || net.name.contains(p))
        && filters.any("driver", |d| d == net.driver)
        && filters.any("id", |p| !id.is_empty() && id.starts_with(p))
        && filters.labels_match(&net.labels)
}

fn row(net: &NetworkInfo) -> NetworkRow {
    let mut labels: Vec<String> = net.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    labels.sort();
    NetworkRow {
        id: net.id.map(|i| i.to_string()).unwrap_or_default(),
        name: net.name.clone(),
        driver: net.driver.clone(),
        subnet: net.subnet.clone().unwrap_or_default(),
        labels: labels.join(","),
    }
}

pub async fn execute(app: &App, command: NetworkCommand) -> Result<()> {
    let mgr = app.manager()?;
    let networks = mgr.networks();
    match command {
        NetworkCommand::Create(args) => {
            let info = networks.create(args.request()?)?;
            println!("{}", info.id.map(|i| i.to_string()).unwrap_or(info.name));
            Ok(())
        }
        NetworkCommand::Ls(args) => {
            let filters = Filters::parse(&args.filters, FILTER_KEYS)?;
            let list: Vec<NetworkInfo> = networks
                .list()?
                .into_iter()
                .filter(|n| matches(n, &filters))
                .collect();
            if args.quiet {
                for n in &list {
                    println!("{}", n.name);
                }
                return Ok(());
            }
            let rows: Vec<NetworkRow> = list.iter().map(row).collect();
            print_rows(&rows, &Format::parse(args.format.as_deref()), |rows| {
                let mut t = new_table(&["NETWORK ID", "NAME", "DRIVER", "SUBNET"]);
                for r in rows {
                    t.add_row(vec![r.id.clone(), r.name.clone(), r.driver.clone(), r.subnet.clone()]);
                }
                t
            })
        }
        NetworkCommand::Inspect(args) => {
            let kinds = [super::inspect::ObjectType::Network];
            super::inspect::inspect_all(&mgr, &kinds, &args.networks, args.format.as_deref()).await
        }
        NetworkCommand::Rm(args) => {
            let in_use = mgr.networks_in_use().await?;
            each_target(&args.networks, |name| {
                let in_use = &in_use;
                async move {
                    networks.remove(name, in_use)?;
                    Ok(name.to_string())
                }
            })
            .await
        }
        NetworkCommand::Prune(_) => {
            let in_use = mgr.networks_in_use().await?;
            let removed = networks.prune(&in_use)?;
            print_pruned(&removed);
            Ok(())
        }
    }
}

pub(crate) fn print_pruned(removed: &[String]) {
    if removed.is_empty() {
        return;
    }
    println!("Deleted Networks:");
    for name in removed {
        println!("{name}");
    }
    println!();
}
