//! `cdbox inspect` command: low-level information on any object.

use cdbox_core::error::{BoxError, Result};
use cdbox_runtime::ContainerManager;
use clap::{Args, ValueEnum};
use serde_json::Value;

use crate::app::App;
use crate::output::render;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ObjectType {
    Container,
    Image,
    Volume,
    Network,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Names or IDs of objects to inspect
    #[arg(required = true)]
    pub objects: Vec<String>,

    /// Only inspect objects of this type
    #[arg(long = "type", value_enum)]
    pub kind: Option<ObjectType>,

    /// Format output using a template
    #[arg(short = 'f', long)]
    pub format: Option<String>,
}

async fn inspect_as(mgr: &ContainerManager, kind: ObjectType, token: &str) -> Result<Value> {
    Ok(match kind {
        ObjectType::Container => serde_json::to_value(mgr.inspect(token).await?)?,
        ObjectType::Image => serde_json::to_value(mgr.services().images.get(token).await?)?,
        ObjectType::Volume => serde_json::to_value(mgr.volumes().get(token)?)?,
        ObjectType::Network => serde_json::to_value(mgr.networks().get(token)?)?,
    })
}

/// Look `token` up as each candidate type in turn; the first hit wins.
pub(crate) async fn inspect_one(
    mgr: &ContainerManager,
    kinds: &[ObjectType],
    token: &str,
) -> Result<Value> {
    let probing = kinds.len() > 1;
    for kind in kinds {
        match inspect_as(mgr, *kind, token).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_not_found() => continue,
            // Not a valid name for this kind of object.
            Err(BoxError::InvalidArgument(_)) if probing => continue,
            Err(e) => return Err(e),
        }
    }
    Err(BoxError::not_found("object", token))
}

/// Print documents the way every `inspect` variant does: one JSON array, or
/// one rendered template line per document.
pub(crate) fn print_documents(docs: &[Value], format: Option<&str>) -> Result<()> {
    match format {
        None | Some("") | Some("json") => println!("{}", serde_json::to_string_pretty(docs)?),
        Some(t) => {
            for doc in docs {
                println!("{}", render(t, doc)?);
            }
        }
    }
    Ok(())
}

/// Inspect every token, printing what was found and then each failure.
pub(crate) async fn inspect_all(
    mgr: &ContainerManager,
    kinds: &[ObjectType],
    tokens: &[String],
    format: Option<&str>,
) -> Result<()> {
    let mut docs = Vec::new();
    let mut failures = Vec::new();
    for token in tokens {
        match inspect_one(mgr, kinds, token).await {
            Ok(doc) => docs.push(doc),
            Err(BoxError::Cancelled) => return Err(BoxError::Cancelled),
            Err(e) => failures.push(e),
        }
    }
    if !docs.is_empty() || failures.is_empty() {
        print_documents(&docs, format)?;
    }
    for e in &failures {
        eprintln!("Error: {e}");
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(BoxError::Reported(failures.len()))
    }
}

pub async fn execute(app: &App, args: InspectArgs) -> Result<()> {
    let mgr = app.manager()?;
    let kinds: Vec<ObjectType> = match args.kind {
        Some(k) => vec![k],
        None => vec![
            ObjectType::Container,
            ObjectType::Image,
            ObjectType::Volume,
            ObjectType::Network,
        ],
    };
    inspect_all(&mgr, &kinds, &args.objects, args.format.as_deref()).await
}
