//! `cdbox namespace` subcommands.

use cdbox_core::error::Result;
use clap::{Args, Subcommand};

use super::key_values;
use crate::app::App;
use crate::output::{each_target, new_table, print_document, print_rows, Format};

#[derive(Subcommand, Debug)]
pub enum NamespaceCommand {
    /// Create a namespace
    Create(CreateArgs),
    /// List namespaces
    #[command(alias = "list")]
    Ls(LsArgs),
    /// Remove one or more empty namespaces
    #[command(alias = "rm")]
    Remove(RemoveArgs),
    /// Display detailed information on one or more namespaces
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    pub name: String,

    /// Set labels on the namespace
    #[arg(long = "label")]
    pub labels: Vec<String>,
}

#[derive(Args, Debug)]
pub struct LsArgs {
    /// Only display namespace names
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Format output using a template, or `json`
    #[arg(long)]
    pub format: Option<String>,
}

#[derive(Args, Debug)]
pub struct RemoveArgs {
    #[arg(required = true)]
    pub namespaces: Vec<String>,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    #[arg(required = true)]
    pub namespaces: Vec<String>,

    /// Format output using a template
    #[arg(short = 'f', long)]
    pub format: Option<String>,
}

pub async fn execute(app: &App, command: NamespaceCommand) -> Result<()> {
    let namespaces = app.services()?.namespaces;
    match command {
        NamespaceCommand::Create(args) => {
            cdbox_core::config::validate_name("namespace", &args.name)?;
            namespaces.create(&args.name, key_values(&args.labels, "label")?).await
        }
        NamespaceCommand::Ls(args) => {
            let list = namespaces.list().await?;
            if args.quiet {
                for ns in &list {
                    println!("{}", ns.name);
                }
                return Ok(());
            }
            print_rows(&list, &Format::parse(args.format.as_deref()), |rows| {
                let mut t = new_table(&["NAME", "CONTAINERS", "VOLUMES", "LABELS"]);
                for ns in rows {
                    let mut labels: Vec<String> = ns.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
                    labels.sort();
                    t.add_row(vec![
                        ns.name.clone(),
                        ns.containers.to_string(),
                        ns.volumes.to_string(),
                        labels.join(","),
                    ]);
                }
                t
            })
        }
        NamespaceCommand::Remove(args) => {
            let namespaces = &namespaces;
            each_target(&args.namespaces, |name| async move {
                namespaces.remove(name).await?;
                Ok(name.to_string())
            })
            .await
        }
        NamespaceCommand::Inspect(args) => {
            let mut failed = 0;
            for name in &args.namespaces {
                match namespaces.inspect(name).await {
                    Ok(info) => print_document(&info, args.format.as_deref())?,
                    Err(e) => {
                        eprintln!("Error: {e}");
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                return Err(cdbox_core::error::BoxError::Reported(failed));
            }
            Ok(())
        }
    }
}
