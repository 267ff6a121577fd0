//! `cdbox exec` command: run a process in a running container.

use std::io::IsTerminal;
use std::path::PathBuf;

use cdbox_core::error::{BoxError, Result};
use cdbox_runtime::lifecycle::ExecOptions;
use clap::Args;

use super::attach::RawTerminal;
use crate::app::App;

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Detached mode: run command in the background
    #[arg(short = 'd', long)]
    pub detach: bool,

    /// Keep STDIN open even if not attached
    #[arg(short = 'i', long)]
    pub interactive: bool,

    /// Allocate a pseudo-TTY
    #[arg(short = 't', long)]
    pub tty: bool,

    /// Username or UID (format: <name|uid>[:<group|gid>])
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// Working directory inside the container
    #[arg(short = 'w', long)]
    pub workdir: Option<String>,

    /// Set environment variables
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,

    /// Read in a file of environment variables
    #[arg(long = "env-file")]
    pub env_files: Vec<PathBuf>,

    /// Give extended privileges to the command
    #[arg(long)]
    pub privileged: bool,

    /// Container name or ID
    pub container: String,

    /// Command and arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl ExecArgs {
    fn options(&self) -> ExecOptions {
        ExecOptions {
            args: self.command.clone(),
            tty: self.tty,
            interactive: self.interactive,
            detach: self.detach,
            user: self.user.clone(),
            workdir: self.workdir.clone(),
            env: self.env.clone(),
            env_files: self.env_files.clone(),
            privileged: self.privileged,
        }
    }
}

pub async fn execute(app: &App, args: ExecArgs) -> Result<()> {
    if args.detach && args.interactive {
        return Err(BoxError::invalid("currently flag -i and -d cannot be specified together"));
    }
    let mgr = app.manager()?;
    let opts = args.options();
    let _raw = if args.tty && args.interactive && !args.detach && std::io::stdin().is_terminal() {
        Some(RawTerminal::enable()?)
    } else {
        None
    };
    match mgr.exec(&args.container, &opts).await? {
        0 => Ok(()),
        code => Err(BoxError::ContainerExit(code)),
    }
}

#[cfg(test)]
mod tests {
    use crate::commands::{Cli, Command};
    use clap::Parser;

    #[test]
    fn test_exec_options() {
        let cli = Cli::try_parse_from([
            "cdbox", "exec", "-it", "-u", "1000", "-e", "A=1", "web", "sh", "-c", "ls -l",
        ])
        .unwrap();
        let Command::Exec(args) = cli.command else {
            panic!("expected exec");
        };
        let opts = args.options();
        assert!(opts.tty && opts.interactive && !opts.detach);
        assert_eq!(opts.user.as_deref(), Some("1000"));
        assert_eq!(opts.args, vec!["sh", "-c", "ls -l"]);
        assert_eq!(args.container, "web");
    }
}
