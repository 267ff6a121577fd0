//! `cdbox kill` command: send a signal to running containers.

use cdbox_core::error::Result;
use clap::Args;

use crate::app::App;
use crate::output::each_target;

#[derive(Args, Debug)]
pub struct KillArgs {
    /// Container name(s) or ID(s)
    #[arg(required = true)]
    pub containers: Vec<String>,

    /// Signal to send to the container
    #[arg(short = 's', long, default_value = "SIGKILL")]
    pub signal: String,
}

pub async fn execute(app: &App, args: KillArgs) -> Result<()> {
    cdbox_core::signal::parse_signal(&args.signal)?;
    let mgr = app.manager()?;
    each_target(&args.containers, |token| {
        let mgr = &mgr;
        let signal = args.signal.as_str();
        async move {
            mgr.kill(token, Some(signal)).await?;
            Ok(token.to_string())
        }
    })
    .await
}
