//! `cdbox pause` and `cdbox unpause` commands.

use cdbox_core::error::Result;
use clap::Args;

use crate::app::App;
use crate::output::each_target;

#[derive(Args, Debug)]
pub struct PauseArgs {
    /// Container name(s) or ID(s)
    #[arg(required = true)]
    pub containers: Vec<String>,
}

pub async fn pause(app: &App, args: PauseArgs) -> Result<()> {
    let mgr = app.manager()?;
    each_target(&args.containers, |token| {
        let mgr = &mgr;
        async move {
            mgr.pause(token).await?;
            Ok(token.to_string())
        }
    })
    .await
}

pub async fn unpause(app: &App, args: PauseArgs) -> Result<()> {
    let mgr = app.manager()?;
    each_target(&args.containers, |token| {
        let mgr = &mgr;
        async move {
            mgr.unpause(token).await?;
            Ok(token.to_string())
        }
    })
    .await
}
