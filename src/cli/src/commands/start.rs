//! `cdbox start` command: start created or stopped containers.

use cdbox_core::error::{BoxError, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;

use super::attach::{finish, has_tty, run_session, Session};
use crate::app::App;
use crate::output::each_target;

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Container name(s) or ID(s)
    #[arg(required = true)]
    pub containers: Vec<String>,

    /// Attach STDOUT/STDERR and forward signals
    #[arg(short = 'a', long)]
    pub attach: bool,

    /// Attach container's STDIN
    #[arg(short = 'i', long)]
    pub interactive: bool,

    /// Override the key sequence for detaching a container
    #[arg(long = "detach-keys")]
    pub detach_keys: Option<String>,
}

pub async fn execute(app: &App, args: StartArgs) -> Result<()> {
    let mgr = app.manager()?;
    if !args.attach && !args.interactive {
        return each_target(&args.containers, |token| {
            let mgr = &mgr;
            async move {
                mgr.start(token, false, false).await?;
                Ok(token.to_string())
            }
        })
        .await;
    }

    let [token] = args.containers.as_slice() else {
        return Err(BoxError::invalid(
            "you cannot start and attach multiple containers at once",
        ));
    };
    let container = mgr.find(token).await?;
    let session = Session::new(has_tty(&container), args.interactive, true, args.detach_keys.as_deref())?;
    let stream = match mgr.start_container(&container, true, args.interactive).await? {
        Some(stream) => stream,
        // Already running: join it like `attach` would.
        None => mgr.attach(container.id()).await?,
    };
    let proxy = app.manager_with_cancel(CancellationToken::new())?;
    finish(run_session(&proxy, container.id(), stream, session).await?)
}
