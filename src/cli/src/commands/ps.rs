//! `cdbox ps` command: list containers.

use cdbox_core::error::Result;
use cdbox_runtime::filters::Filters;
use cdbox_runtime::lifecycle::ps::{PsRow, PS_FILTER_KEYS};
use cdbox_runtime::lifecycle::ListOptions;
use clap::Args;

use crate::app::App;
use crate::output::{new_table, print_rows, Format};

const COMMAND_WIDTH: usize = 20;

#[derive(Args, Debug, Default)]
pub struct PsArgs {
    /// Show all containers (default shows just running)
    #[arg(short = 'a', long)]
    pub all: bool,

    /// Only display container IDs
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Show n last created containers (includes all states)
    #[arg(short = 'n', long)]
    pub last: Option<usize>,

    /// Show the latest created container (includes all states)
    #[arg(short = 'l', long)]
    pub latest: bool,

    /// Filter output based on conditions provided
    #[arg(short = 'f', long = "filter")]
    pub filters: Vec<String>,

    /// Format output using a template, or `json`
    #[arg(long)]
    pub format: Option<String>,

    /// Don't truncate output
    #[arg(long = "no-trunc")]
    pub no_trunc: bool,
}

impl PsArgs {
    fn options(&self) -> Result<ListOptions> {
        Ok(ListOptions {
            all: self.all,
            filters: Filters::parse(&self.filters, PS_FILTER_KEYS)?,
            last: if self.latest { Some(1) } else { self.last },
        })
    }
}

/// `"nginx -g 'daemo…"`
fn short_command(command: &str) -> String {
    if command.chars().count() <= COMMAND_WIDTH {
        return format!("\"{command}\"");
    }
    let head: String = command.chars().take(COMMAND_WIDTH - 1).collect();
    format!("\"{head}…\"")
}

fn table(rows: &[PsRow], no_trunc: bool) -> comfy_table::Table {
    let mut table = new_table(&["CONTAINER ID", "IMAGE", "COMMAND", "CREATED", "STATUS", "PORTS", "NAMES"]);
    for row in rows {
        let command = if no_trunc {
            format!("\"{}\"", row.command)
        } else {
            short_command(&row.command)
        };
        table.add_row(vec![
            row.id.clone(),
            row.image.clone(),
            command,
            row.running_for.clone(),
            row.status.clone(),
            row.ports.clone(),
            row.names.clone(),
        ]);
    }
    table
}

pub async fn execute(app: &App, args: PsArgs) -> Result<()> {
    let opts = args.options()?;
    let format = Format::parse(args.format.as_deref());
    let mgr = app.manager()?;
    let containers = mgr.list(&opts).await?;

    if args.quiet {
        for c in &containers {
            println!("{}", if args.no_trunc { c.id() } else { c.short_id() });
        }
        return Ok(());
    }

    let now = chrono::Utc::now();
    let rows: Vec<PsRow> = containers
        .iter()
        .map(|c| {
            let mut row = PsRow::new(c, now);
            if args.no_trunc {
                row.id = c.id().to_string();
            }
            row
        })
        .collect();
    print_rows(&rows, &format, |rows| table(rows, args.no_trunc))
}
