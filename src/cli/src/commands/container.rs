//! `cdbox container prune` command.

use cdbox_core::error::Result;
use cdbox_core::units::format_bytes;
use cdbox_runtime::filters::Filters;
use cdbox_runtime::lifecycle::remove::PRUNE_FILTER_KEYS;
use clap::Args;

use crate::app::App;

#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Filter the containers to prune (label, until)
    #[arg(long = "filter")]
    pub filters: Vec<String>,

    /// Do not prompt for confirmation
    #[arg(short = 'f', long)]
    pub force: bool,
}

pub(crate) fn print_pruned(removed: &[(String, u64)]) {
    if !removed.is_empty() {
        println!("Deleted Containers:");
        for (id, _) in removed {
            println!("{id}");
        }
        println!();
    }
}

pub async fn prune(app: &App, args: PruneArgs) -> Result<()> {
    let filters = Filters::parse(&args.filters, PRUNE_FILTER_KEYS)?;
    let mgr = app.manager()?;
    let removed = mgr.prune(&filters).await?;
    print_pruned(&removed);
    let total: u64 = removed.iter().map(|(_, size)| size).sum();
    println!("Total reclaimed space: {}", format_bytes(total));
    Ok(())
}
