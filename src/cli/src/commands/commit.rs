//! `cdbox commit`, `cdbox diff` and `cdbox rename` commands.

use cdbox_core::error::Result;
use cdbox_runtime::lifecycle::commit::CommitOptions;
use clap::{ArgAction, Args};

use crate::app::App;

#[derive(Args, Debug)]
pub struct CommitArgs {
    /// Author (e.g., "John Hannibal Smith <hannibal@a-team.com>")
    #[arg(short = 'a', long)]
    pub author: Option<String>,

    /// Commit message
    #[arg(short = 'm', long)]
    pub message: Option<String>,

    /// Apply Dockerfile instruction to the created image
    #[arg(short = 'c', long = "change")]
    pub changes: Vec<String>,

    /// Pause container during commit
    #[arg(short = 'p', long, default_value_t = true, action = ArgAction::Set)]
    pub pause: bool,

    /// Container name or ID
    pub container: String,

    /// Repository name and tag for the new image
    pub reference: Option<String>,
}

pub async fn commit(app: &App, args: CommitArgs) -> Result<()> {
    let mgr = app.manager()?;
    let opts = CommitOptions {
        reference: args.reference.unwrap_or_default(),
        author: args.author,
        message: args.message,
        changes: args.changes,
        pause: args.pause,
    };
    let image = mgr.commit(&args.container, &opts).await?;
    println!("{}", image.id);
    Ok(())
}

#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Container name or ID
    pub container: String,
}

pub async fn diff(app: &App, args: DiffArgs) -> Result<()> {
    let mgr = app.manager()?;
    for change in mgr.diff(&args.container).await? {
        println!("{} {}", change.kind, change.path);
    }
    Ok(())
}

#[derive(Args, Debug)]
pub struct RenameArgs {
    /// Container name or ID
    pub container: String,

    /// New container name
    pub new_name: String,
}

pub async fn rename(app: &App, args: RenameArgs) -> Result<()> {
    let mgr = app.manager()?;
    mgr.rename(&args.container, &args.new_name).await
}
