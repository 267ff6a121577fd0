//! `cdbox tag` and `cdbox image convert` commands.

use cdbox_core::error::{BoxError, Result};
use cdbox_runtime::client::image::{normalize_reference, Platform};
use cdbox_runtime::client::ImageInfo;
use clap::Args;

use crate::app::App;

#[derive(Args, Debug)]
pub struct TagArgs {
    /// Source image reference or ID
    pub source: String,

    /// Target reference
    pub target: String,
}

pub async fn tag(app: &App, args: TagArgs) -> Result<()> {
    let services = app.services()?;
    let source = services.images.get(&args.source).await?;
    let target = normalize_reference(&args.target)?;
    services.images.tag(&source.name, &target).await
}

#[derive(Args, Debug)]
pub struct ConvertArgs {
    /// Source image reference or ID
    pub source: String,

    /// Target reference
    pub target: String,

    /// Only accept a source built for this platform
    #[arg(long)]
    pub platform: Option<String>,

    /// Produce an OCI image (the only format stored locally)
    #[arg(long)]
    pub oci: bool,
}

fn check_platform(info: &ImageInfo, wanted: &str) -> Result<()> {
    let wanted = Platform::parse(wanted)?;
    let have = Platform {
        os: info.os.clone(),
        architecture: info.architecture.clone(),
        variant: info.variant.clone(),
    };
    if wanted.os != have.os
        || wanted.architecture != have.architecture
        || (wanted.variant.is_some() && wanted.variant != have.variant)
    {
        return Err(BoxError::invalid(format!(
            "image {} is {}/{}, not {}",
            info.familiar_name(),
            info.os,
            info.architecture,
            wanted
        )));
    }
    Ok(())
}

/// Images are stored as OCI already, so conversion re-tags the content under
/// the target name.
pub async fn convert(app: &App, args: ConvertArgs) -> Result<()> {
    let services = app.services()?;
    let source = services.images.get(&args.source).await?;
    if let Some(p) = &args.platform {
        check_platform(&source, p)?;
    }
    let target = normalize_reference(&args.target)?;
    services.images.tag(&source.name, &target).await?;
    println!("{}", source.digest);
    Ok(())
}
