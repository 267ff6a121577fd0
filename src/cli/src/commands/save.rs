//! `cdbox save`, `cdbox load` and `cdbox import` commands.

use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};

use cdbox_core::error::{BoxError, Result};
use cdbox_runtime::client::image::normalize_reference;
use clap::Args;

use crate::app::App;

#[derive(Args, Debug)]
pub struct SaveArgs {
    /// Image reference(s)
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Write to a file instead of STDOUT
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,
}

pub async fn save(app: &App, args: SaveArgs) -> Result<()> {
    let services = app.services()?;
    let mut names = Vec::with_capacity(args.images.len());
    for image in &args.images {
        names.push(services.images.get(image).await?.name);
    }
    match args.output {
        Some(path) => services.images.save(&names, &path).await,
        None => {
            if std::io::stdout().is_terminal() {
                return Err(BoxError::invalid(
                    "refusing to write an archive to a terminal, use -o or redirect stdout",
                ));
            }
            let scratch = tempfile::NamedTempFile::new()?;
            services.images.save(&names, scratch.path()).await?;
            let mut file = std::fs::File::open(scratch.path())?;
            let mut out = std::io::stdout().lock();
            std::io::copy(&mut file, &mut out)?;
            out.flush()?;
            Ok(())
        }
    }
}

#[derive(Args, Debug)]
pub struct LoadArgs {
    /// Read from an archive file instead of STDIN
    #[arg(short = 'i', long)]
    pub input: Option<PathBuf>,

    /// Suppress the load output
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

/// Spool STDIN into a temporary file the image service can read.
fn spool_stdin() -> Result<tempfile::NamedTempFile> {
    if std::io::stdin().is_terminal() {
        return Err(BoxError::invalid(
            "requested load from stdin, but stdin is empty",
        ));
    }
    let mut scratch = tempfile::NamedTempFile::new()?;
    std::io::copy(&mut std::io::stdin().lock(), &mut scratch)?;
    scratch.flush()?;
    Ok(scratch)
}

async fn load_archive(app: &App, input: Option<&Path>) -> Result<Vec<String>> {
    let services = app.services()?;
    match input {
        Some(path) => services.images.load(path).await,
        None => {
            let scratch = tokio::task::spawn_blocking(spool_stdin)
                .await
                .map_err(|e| BoxError::Other(format!("stdin reader failed: {e}")))??;
            services.images.load(scratch.path()).await
        }
    }
}

pub async fn load(app: &App, args: LoadArgs) -> Result<()> {
    let loaded = load_archive(app, args.input.as_deref()).await?;
    if !args.quiet {
        for name in loaded {
            println!("Loaded image: {name}");
        }
    }
    Ok(())
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Archive file, or `-` for STDIN
    pub file: String,

    /// Reference for the imported image
    pub reference: Option<String>,
}

/// Load an archive and name its first image.
pub async fn import(app: &App, args: ImportArgs) -> Result<()> {
    let input = (args.file != "-").then(|| PathBuf::from(&args.file));
    let loaded = load_archive(app, input.as_deref()).await?;
    let first = loaded
        .first()
        .ok_or_else(|| BoxError::invalid(format!("{} contains no image", args.file)))?;
    let services = app.services()?;
    let name = match &args.reference {
        Some(reference) => {
            let target = normalize_reference(reference)?;
            if &target != first {
                services.images.tag(first, &target).await?;
            }
            target
        }
        None => first.clone(),
    };
    println!("{}", services.images.get(&name).await?.id);
    Ok(())
}
