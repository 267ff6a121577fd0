//! `cdbox run` command: create, start and (unless detached) attach.

use cdbox_core::error::{BoxError, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;

use super::attach::{finish, run_session, Session};
use super::create::{create_container, CreateFlags};
use crate::app::App;

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub flags: CreateFlags,

    /// Run container in background and print container ID
    #[arg(short = 'd', long)]
    pub detach: bool,

    /// Image reference (or root filesystem path with --rootfs)
    pub image: String,

    /// Command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

pub async fn execute(app: &App, args: RunArgs) -> Result<()> {
    let session = Session::new(
        args.flags.tty,
        args.flags.interactive,
        args.flags.sig_proxy,
        args.flags.detach_keys.as_deref(),
    )?;

    // Signal forwarding needs a manager that outlives the interrupt; setup
    // stays cancellable through the root context.
    let setup = app.manager()?;
    let req = args.flags.into_request(args.image, args.command)?;
    let container = create_container(&setup, &req).await?;

    if args.detach {
        setup.start_container(&container, false, false).await?;
        println!("{}", container.id());
        return Ok(());
    }

    let stream = setup
        .start_container(&container, true, session.stdin)
        .await?
        .ok_or_else(|| BoxError::runtime("task start", "no attach stream for a foreground container"))?;
    let mgr = app.manager_with_cancel(CancellationToken::new())?;
    finish(run_session(&mgr, container.id(), stream, session).await?)
}

#[cfg(test)]
mod tests {
    use crate::commands::{Cli, Command};
    use clap::Parser;

    #[test]
    fn test_run_args_stop_at_image() {
        let cli = Cli::try_parse_from([
            "cdbox", "run", "--rm", "-it", "-d", "--name", "x", "alpine", "sh", "-c", "echo hi",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.detach && args.flags.tty && args.flags.interactive && args.flags.rm);
        assert_eq!(args.image, "alpine");
        assert_eq!(args.command, vec!["sh", "-c", "echo hi"]);
    }

    #[test]
    fn test_flags_after_image_belong_to_command() {
        let cli = Cli::try_parse_from(["cdbox", "run", "alpine", "ls", "-d"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(!args.detach);
        assert_eq!(args.command, vec!["ls", "-d"]);
    }
}
