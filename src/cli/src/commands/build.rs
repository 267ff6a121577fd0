//! `cdbox build` command.

use std::path::PathBuf;

use cdbox_core::error::{BoxError, Result};
use cdbox_runtime::client::BuildRequest;
use clap::Args;

use super::key_values;
use crate::app::App;

#[derive(Args, Debug, Default)]
pub struct BuildArgs {
    /// Build context directory
    pub context: PathBuf,

    /// Name and optionally a tag (name:tag)
    #[arg(short = 't', long = "tag")]
    pub tags: Vec<String>,

    /// Dockerfile path, relative to the working directory
    #[arg(short = 'f', long = "file")]
    pub file: Option<PathBuf>,

    /// Build-time variables (KEY=VALUE, or KEY to take the host value)
    #[arg(long = "build-arg")]
    pub build_args: Vec<String>,

    /// Build stage to stop at
    #[arg(long)]
    pub target: Option<String>,

    /// Target platform (os/arch[/variant])
    #[arg(long)]
    pub platform: Option<String>,

    /// Do not use the build cache
    #[arg(long = "no-cache")]
    pub no_cache: bool,

    /// Image labels (KEY=VALUE)
    #[arg(long = "label")]
    pub labels: Vec<String>,

    /// Only print the image ID
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

fn build_args(raw: &[String], host: impl Fn(&str) -> Option<String>) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    let mut set = |k: String, v: String| match out.iter_mut().find(|(key, _)| *key == k) {
        Some(entry) => entry.1 = v,
        None => out.push((k, v)),
    };
    for arg in raw {
        match arg.split_once('=') {
            Some((k, v)) => set(k.to_string(), v.to_string()),
            None => {
                if let Some(v) = host(arg) {
                    set(arg.clone(), v);
                }
            }
        }
    }
    if !out.iter().any(|(k, _)| k == "SOURCE_DATE_EPOCH") {
        if let Some(epoch) = host("SOURCE_DATE_EPOCH") {
            out.push(("SOURCE_DATE_EPOCH".to_string(), epoch));
        }
    }
    out
}

impl BuildArgs {
    fn request(&self, host: impl Fn(&str) -> Option<String>) -> Result<BuildRequest> {
        if !self.context.is_dir() {
            return Err(BoxError::invalid(format!(
                "build context {} is not a directory",
                self.context.display()
            )));
        }
        Ok(BuildRequest {
            context: self.context.clone(),
            dockerfile: self.file.clone(),
            tags: self.tags.clone(),
            build_args: build_args(&self.build_args, host),
            target: self.target.clone(),
            platform: self.platform.clone(),
            no_cache: self.no_cache,
            labels: key_values(&self.labels, "label")?,
        })
    }
}

pub async fn execute(app: &App, args: BuildArgs) -> Result<()> {
    let req = args.request(|k| std::env::var(k).ok())?;
    let mgr = app.manager()?;
    let loaded = cdbox_runtime::context::cancellable(
        mgr.cancel_token(),
        mgr.services().build_image(mgr.store(), &req),
    )
    .await?;
    let Some(first) = loaded.first() else {
        return Err(BoxError::runtime("build", "builder produced no image"));
    };
    let info = mgr.services().images.get(first).await?;
    if args.quiet {
        println!("{}", info.id);
        return Ok(());
    }
    println!("Successfully built {}", info.id);
    for tag in &args.tags {
        println!("Successfully tagged {tag}");
    }
    Ok(())
}
