//! `cdbox rm` command: remove containers.

use cdbox_core::error::Result;
use cdbox_runtime::lifecycle::RemoveOptions;
use clap::Args;

use crate::app::App;
use crate::output::each_target;

#[derive(Args, Debug)]
pub struct RmArgs {
    /// Container name(s) or ID(s)
    #[arg(required = true)]
    pub containers: Vec<String>,

    /// Force the removal of a running container (uses SIGKILL)
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Remove anonymous volumes associated with the container
    #[arg(short = 'v', long)]
    pub volumes: bool,
}

pub async fn execute(app: &App, args: RmArgs) -> Result<()> {
    let mgr = app.manager()?;
    let opts = RemoveOptions {
        force: args.force,
        volumes: args.volumes,
    };
    each_target(&args.containers, |token| {
        let mgr = &mgr;
        async move {
            mgr.remove(token, opts).await?;
            Ok(token.to_string())
        }
    })
    .await
}
