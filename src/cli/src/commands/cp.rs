//! `cdbox cp` command: copy files between a container and the host.

use std::path::PathBuf;

use cdbox_core::error::{BoxError, Result};
use clap::Args;

use crate::app::App;

#[derive(Args, Debug)]
pub struct CpArgs {
    /// Source: CONTAINER:SRC_PATH or a host path
    pub src: String,

    /// Destination: CONTAINER:DEST_PATH or a host path
    pub dest: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Endpoint {
    Host(PathBuf),
    Container { token: String, path: String },
}

/// `name:path` is a container path unless the argument is clearly a host
/// path (absolute, relative with `.`, or a `/` before the colon).
fn parse_endpoint(arg: &str) -> Endpoint {
    if arg.starts_with('/') || arg.starts_with('.') {
        return Endpoint::Host(PathBuf::from(arg));
    }
    match arg.split_once(':') {
        Some((token, path)) if !token.is_empty() && !token.contains('/') => Endpoint::Container {
            token: token.to_string(),
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
        },
        _ => Endpoint::Host(PathBuf::from(arg)),
    }
}

pub async fn execute(app: &App, args: CpArgs) -> Result<()> {
    if args.src == "-" || args.dest == "-" {
        return Err(BoxError::invalid("copying to or from a tar stream is not supported"));
    }
    let mgr = app.manager()?;
    match (parse_endpoint(&args.src), parse_endpoint(&args.dest)) {
        (Endpoint::Container { token, path }, Endpoint::Host(dest)) => {
            mgr.copy_from(&token, &path, &dest).await?;
        }
        (Endpoint::Host(src), Endpoint::Container { token, path }) => {
            mgr.copy_to(&token, &src, &path).await?;
        }
        (Endpoint::Container { .. }, Endpoint::Container { .. }) => {
            return Err(BoxError::invalid("copying between containers is not supported"));
        }
        (Endpoint::Host(_), Endpoint::Host(_)) => {
            return Err(BoxError::invalid(
                "must specify at least one container source, e.g. web:/etc/hosts",
            ));
        }
    }
    Ok(())
}
