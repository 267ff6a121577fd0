//! `cdbox stop` command: graceful stop of one or more containers.

use std::time::Duration;

use cdbox_core::error::Result;
use clap::Args;

use crate::app::App;
use crate::output::each_target;

#[derive(Args, Debug)]
pub struct StopArgs {
    /// Container name(s) or ID(s)
    #[arg(required = true)]
    pub containers: Vec<String>,

    /// Seconds to wait before killing the container
    #[arg(short = 't', long = "time")]
    pub time: Option<u64>,
}

pub async fn execute(app: &App, args: StopArgs) -> Result<()> {
    let mgr = app.manager()?;
    let timeout = args.time.map(Duration::from_secs);
    each_target(&args.containers, |token| {
        let mgr = &mgr;
        async move {
            mgr.stop(token, timeout).await?;
            Ok(token.to_string())
        }
    })
    .await
}
