//! `cdbox wait` command: block until containers stop, printing exit codes.

use cdbox_core::error::Result;
use clap::Args;

use crate::app::App;
use crate::output::each_target;

#[derive(Args, Debug)]
pub struct WaitArgs {
    /// Container name(s) or ID(s)
    #[arg(required = true)]
    pub containers: Vec<String>,
}

pub async fn execute(app: &App, args: WaitArgs) -> Result<()> {
    let mgr = app.manager()?;
    each_target(&args.containers, |token| {
        let mgr = &mgr;
        async move { Ok(mgr.wait(token).await?.code.to_string()) }
    })
    .await
}
