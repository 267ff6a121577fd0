//! CLI command definitions and dispatch.

mod attach;
mod build;
mod commit;
mod compose;
mod container;
mod cp;
mod create;
mod events;
mod exec;
mod images;
mod inspect;
mod internal;
mod kill;
mod login;
mod logs;
mod namespace;
mod network;
mod pause;
mod port;
mod ps;
mod pull;
mod restart;
mod rm;
mod rmi;
mod run;
mod save;
mod start;
mod stats;
mod stop;
mod system;
mod tag;
mod top;
mod volume;
mod wait;

use std::collections::HashMap;

use cdbox_core::error::{BoxError, Result};
use clap::{Args, Parser, Subcommand};

use crate::app::{App, GlobalArgs};

/// cdbox: Docker-compatible containers on a local OCI runtime.
#[derive(Parser, Debug)]
#[command(name = "cdbox", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub globals: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create and run a new container from an image
    Run(run::RunArgs),
    /// Create a new container
    Create(create::CreateArgs),
    /// Start one or more stopped containers
    Start(start::StartArgs),
    /// Stop one or more running containers
    Stop(stop::StopArgs),
    /// Restart one or more containers
    Restart(restart::RestartArgs),
    /// Kill one or more running containers
    Kill(kill::KillArgs),
    /// Pause all processes within one or more containers
    Pause(pause::PauseArgs),
    /// Unpause all processes within one or more containers
    Unpause(pause::PauseArgs),
    /// Remove one or more containers
    Rm(rm::RmArgs),
    /// Block until one or more containers stop, then print their exit codes
    Wait(wait::WaitArgs),
    /// Attach local standard input, output, and error streams to a running container
    Attach(attach::AttachArgs),
    /// Fetch the logs of a container
    Logs(logs::LogsArgs),
    /// Execute a command in a running container
    Exec(exec::ExecArgs),
    /// List containers
    Ps(ps::PsArgs),
    /// Return low-level information on objects
    Inspect(inspect::InspectArgs),
    /// Create a new image from a container's changes
    Commit(commit::CommitArgs),
    /// Inspect changes to files on a container's filesystem
    Diff(commit::DiffArgs),
    /// List port mappings or a specific mapping for the container
    Port(port::PortArgs),
    /// Copy files between a container and the local filesystem
    Cp(cp::CpArgs),
    /// Display the running processes of a container
    Top(top::TopArgs),
    /// Display a live stream of container resource usage statistics
    Stats(stats::StatsArgs),
    /// Rename a container
    Rename(commit::RenameArgs),

    /// List images
    Images(images::ImagesArgs),
    /// Download an image from a registry
    Pull(pull::PullArgs),
    /// Upload an image to a registry
    Push(pull::PushArgs),
    /// Create a tag that refers to a local image
    Tag(tag::TagArgs),
    /// Remove one or more images
    Rmi(rmi::RmiArgs),
    /// Show the history of an image
    History(images::HistoryArgs),
    /// Save one or more images to an archive
    Save(save::SaveArgs),
    /// Load images from an archive
    Load(save::LoadArgs),
    /// Import an archive as an image
    Import(save::ImportArgs),
    /// Build an image from a Dockerfile
    Build(build::BuildArgs),

    /// Manage containers
    Container(ContainerGroup),
    /// Manage images
    Image(ImageGroup),
    /// Manage volumes
    Volume {
        #[command(subcommand)]
        command: volume::VolumeCommand,
    },
    /// Manage networks
    Network {
        #[command(subcommand)]
        command: network::NetworkCommand,
    },
    /// Manage runtime namespaces
    #[command(alias = "ns")]
    Namespace {
        #[command(subcommand)]
        command: namespace::NamespaceCommand,
    },
    /// Manage cdbox
    System {
        #[command(subcommand)]
        command: system::SystemCommand,
    },
    /// Define and run multi-container applications
    Compose(compose::ComposeArgs),

    /// Display system-wide information
    Info(system::InfoArgs),
    /// Show version information
    Version(system::VersionArgs),
    /// Get real time events
    Events(events::EventsArgs),

    /// Log in to a registry
    Login(login::LoginArgs),
    /// Log out from a registry
    Logout(login::LogoutArgs),

    #[command(hide = true)]
    Internal {
        #[command(subcommand)]
        command: internal::InternalCommand,
    },
}

#[derive(Args, Debug)]
pub struct ContainerGroup {
    #[command(subcommand)]
    pub command: ContainerCommand,
}

/// `cdbox container ...`
#[derive(Subcommand, Debug)]
pub enum ContainerCommand {
    /// List containers
    #[command(aliases = ["list", "ps"])]
    Ls(ps::PsArgs),
    /// Display detailed information on one or more containers
    Inspect(TypedInspectArgs),
    /// Remove all stopped containers
    Prune(container::PruneArgs),
    Run(run::RunArgs),
    Create(create::CreateArgs),
    Start(start::StartArgs),
    Stop(stop::StopArgs),
    Restart(restart::RestartArgs),
    Kill(kill::KillArgs),
    Pause(pause::PauseArgs),
    Unpause(pause::PauseArgs),
    #[command(alias = "remove")]
    Rm(rm::RmArgs),
    Wait(wait::WaitArgs),
    Attach(attach::AttachArgs),
    Logs(logs::LogsArgs),
    Exec(exec::ExecArgs),
    Commit(commit::CommitArgs),
    Diff(commit::DiffArgs),
    Port(port::PortArgs),
    Cp(cp::CpArgs),
    Top(top::TopArgs),
    Stats(stats::StatsArgs),
    Rename(commit::RenameArgs),
}

#[derive(Args, Debug)]
pub struct ImageGroup {
    #[command(subcommand)]
    pub command: ImageCommand,
}

/// `cdbox image ...`
#[derive(Subcommand, Debug)]
pub enum ImageCommand {
    /// List images
    #[command(alias = "list")]
    Ls(images::ImagesArgs),
    /// Display detailed information on one or more images
    Inspect(TypedInspectArgs),
    /// Remove unused images
    Prune(images::ImagePruneArgs),
    /// Copy an image under a new reference, checking its platform
    Convert(tag::ConvertArgs),
    #[command(alias = "remove")]
    Rm(rmi::RmiArgs),
    Pull(pull::PullArgs),
    Push(pull::PushArgs),
    Tag(tag::TagArgs),
    History(images::HistoryArgs),
    Save(save::SaveArgs),
    Load(save::LoadArgs),
    Import(save::ImportArgs),
    Build(build::BuildArgs),
}

/// `inspect` scoped to one object type.
#[derive(Args, Debug)]
pub struct TypedInspectArgs {
    #[arg(required = true)]
    pub objects: Vec<String>,

    /// Format output using a template
    #[arg(short = 'f', long)]
    pub format: Option<String>,
}

impl TypedInspectArgs {
    fn scoped(self, kind: inspect::ObjectType) -> inspect::InspectArgs {
        inspect::InspectArgs {
            objects: self.objects,
            kind: Some(kind),
            format: self.format,
        }
    }
}

/// Parse `KEY=VALUE` flags (`--label`, `--opt`); a bare `KEY` maps to an
/// empty value.
pub(crate) fn key_values(raw: &[String], what: &str) -> Result<HashMap<String, String>> {
    raw.iter()
        .map(|item| match item.split_once('=') {
            Some(("", _)) => Err(BoxError::invalid(format!("invalid {what} {item:?}: empty key"))),
            Some((k, v)) => Ok((k.to_string(), v.to_string())),
            None if item.is_empty() => Err(BoxError::invalid(format!("invalid {what}: empty"))),
            None => Ok((item.clone(), String::new())),
        })
        .collect()
}

/// Dispatch a parsed command to its handler.
pub async fn dispatch(app: &App, command: Command) -> Result<()> {
    match command {
        Command::Run(args) => run::execute(app, args).await,
        Command::Create(args) => create::execute(app, args).await,
        Command::Start(args) => start::execute(app, args).await,
        Command::Stop(args) => stop::execute(app, args).await,
        Command::Restart(args) => restart::execute(app, args).await,
        Command::Kill(args) => kill::execute(app, args).await,
        Command::Pause(args) => pause::pause(app, args).await,
        Command::Unpause(args) => pause::unpause(app, args).await,
        Command::Rm(args) => rm::execute(app, args).await,
        Command::Wait(args) => wait::execute(app, args).await,
        Command::Attach(args) => attach::execute(app, args).await,
        Command::Logs(args) => logs::execute(app, args).await,
        Command::Exec(args) => exec::execute(app, args).await,
        Command::Ps(args) => ps::execute(app, args).await,
        Command::Inspect(args) => inspect::execute(app, args).await,
        Command::Commit(args) => commit::commit(app, args).await,
        Command::Diff(args) => commit::diff(app, args).await,
        Command::Port(args) => port::execute(app, args).await,
        Command::Cp(args) => cp::execute(app, args).await,
        Command::Top(args) => top::execute(app, args).await,
        Command::Stats(args) => stats::execute(app, args).await,
        Command::Rename(args) => commit::rename(app, args).await,
        Command::Images(args) => images::list(app, args).await,
        Command::Pull(args) => pull::pull(app, args).await,
        Command::Push(args) => pull::push(app, args).await,
        Command::Tag(args) => tag::tag(app, args).await,
        Command::Rmi(args) => rmi::execute(app, args).await,
        Command::History(args) => images::history(app, args).await,
        Command::Save(args) => save::save(app, args).await,
        Command::Load(args) => save::load(app, args).await,
        Command::Import(args) => save::import(app, args).await,
        Command::Build(args) => build::execute(app, args).await,
        Command::Container(group) => container_command(app, group.command).await,
        Command::Image(group) => image_command(app, group.command).await,
        Command::Volume { command } => volume::execute(app, command).await,
        Command::Network { command } => network::execute(app, command).await,
        Command::Namespace { command } => namespace::execute(app, command).await,
        Command::System { command } => match command {
            system::SystemCommand::Info(args) => system::info(app, args).await,
            system::SystemCommand::Version(args) => system::version(app, args).await,
            system::SystemCommand::Events(args) => events::execute(app, args).await,
            system::SystemCommand::Prune(args) => system::prune(app, args).await,
        },
        Command::Compose(args) => compose::execute(app, args).await,
        Command::Info(args) => system::info(app, args).await,
        Command::Version(args) => system::version(app, args).await,
        Command::Events(args) => events::execute(app, args).await,
        Command::Login(args) => login::login(args).await,
        Command::Logout(args) => login::logout(args).await,
        Command::Internal { command } => internal::execute(app, command).await,
    }
}

async fn container_command(app: &App, command: ContainerCommand) -> Result<()> {
    match command {
        ContainerCommand::Ls(args) => ps::execute(app, args).await,
        ContainerCommand::Inspect(args) => {
            inspect::execute(app, args.scoped(inspect::ObjectType::Container)).await
        }
        ContainerCommand::Prune(args) => container::prune(app, args).await,
        ContainerCommand::Run(args) => run::execute(app, args).await,
        ContainerCommand::Create(args) => create::execute(app, args).await,
        ContainerCommand::Start(args) => start::execute(app, args).await,
        ContainerCommand::Stop(args) => stop::execute(app, args).await,
        ContainerCommand::Restart(args) => restart::execute(app, args).await,
        ContainerCommand::Kill(args) => kill::execute(app, args).await,
        ContainerCommand::Pause(args) => pause::pause(app, args).await,
        ContainerCommand::Unpause(args) => pause::unpause(app, args).await,
        ContainerCommand::Rm(args) => rm::execute(app, args).await,
        ContainerCommand::Wait(args) => wait::execute(app, args).await,
        ContainerCommand::Attach(args) => attach::execute(app, args).await,
        ContainerCommand::Logs(args) => logs::execute(app, args).await,
        ContainerCommand::Exec(args) => exec::execute(app, args).await,
        ContainerCommand::Commit(args) => commit::commit(app, args).await,
        ContainerCommand::Diff(args) => commit::diff(app, args).await,
        ContainerCommand::Port(args) => port::execute(app, args).await,
        ContainerCommand::Cp(args) => cp::execute(app, args).await,
        ContainerCommand::Top(args) => top::execute(app, args).await,
        ContainerCommand::Stats(args) => stats::execute(app, args).await,
        ContainerCommand::Rename(args) => commit::rename(app, args).await,
    }
}

async fn image_command(app: &App, command: ImageCommand) -> Result<()> {
    match command {
        ImageCommand::Ls(args) => images::list(app, args).await,
        ImageCommand::Inspect(args) => {
            inspect::execute(app, args.scoped(inspect::ObjectType::Image)).await
        }
        ImageCommand::Prune(args) => images::prune(app, args).await,
        ImageCommand::Convert(args) => tag::convert(app, args).await,
        ImageCommand::Rm(args) => rmi::execute(app, args).await,
        ImageCommand::Pull(args) => pull::pull(app, args).await,
        ImageCommand::Push(args) => pull::push(app, args).await,
        ImageCommand::Tag(args) => tag::tag(app, args).await,
        ImageCommand::History(args) => images::history(app, args).await,
        ImageCommand::Save(args) => save::save(app, args).await,
        ImageCommand::Load(args) => save::load(app, args).await,
        ImageCommand::Import(args) => save::import(app, args).await,
        ImageCommand::Build(args) => build::execute(app, args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_anywhere() {
        let cli = Cli::try_parse_from(["cdbox", "ps", "--namespace", "k8s", "-a"]).unwrap();
        assert_eq!(cli.globals.namespace.as_deref(), Some("k8s"));
        let cli = Cli::try_parse_from(["cdbox", "--debug", "volume", "ls"]).unwrap();
        assert!(cli.globals.debug);
        assert!(matches!(cli.command, Command::Volume { .. }));
    }

    #[test]
    fn test_groups_reuse_command_args() {
        let cli = Cli::try_parse_from(["cdbox", "container", "list", "-a"]).unwrap();
        let Command::Container(ContainerGroup {
            command: ContainerCommand::Ls(args),
        }) = cli.command
        else {
            panic!("expected container ls");
        };
        assert!(args.all);

        let cli = Cli::try_parse_from(["cdbox", "image", "inspect", "alpine", "-f", "{{.ID}}"]).unwrap();
        let Command::Image(ImageGroup {
            command: ImageCommand::Inspect(args),
        }) = cli.command
        else {
            panic!("expected image inspect");
        };
        let scoped = args.scoped(inspect::ObjectType::Image);
        assert_eq!(scoped.kind, Some(inspect::ObjectType::Image));
        assert_eq!(scoped.objects, vec!["alpine"]);
    }

    #[test]
    fn test_key_values() {
        let parsed = key_values(&["a=1".into(), "b".into(), "c=x=y".into()], "label").unwrap();
        assert_eq!(parsed["a"], "1");
        assert_eq!(parsed["b"], "");
        assert_eq!(parsed["c"], "x=y");
        assert_eq!(key_values(&["=v".into()], "label").unwrap_err().exit_code(), 125);
    }
}
