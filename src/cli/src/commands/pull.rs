//! `cdbox pull` and `cdbox push` commands.

use cdbox_core::error::Result;
use cdbox_runtime::client::image::normalize_reference;
use cdbox_runtime::client::PullOptions;
use cdbox_runtime::context::cancellable;
use clap::Args;

use crate::app::App;

#[derive(Args, Debug)]
pub struct PullArgs {
    /// Image reference
    pub image: String,

    /// Pull for this platform (os/arch[/variant])
    #[arg(long)]
    pub platform: Option<String>,

    /// Suppress progress output
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

pub async fn pull(app: &App, args: PullArgs) -> Result<()> {
    let mgr = app.manager()?;
    let name = normalize_reference(&args.image)?;
    if !args.quiet {
        println!("Pulling {name}");
    }
    let info = mgr.pull_image(&args.image, args.platform.as_deref()).await?;
    if args.quiet {
        println!("{}", info.name);
    } else {
        println!("Digest: {}", info.digest);
        println!("Status: Downloaded newer image for {}", info.familiar_name());
    }
    Ok(())
}

#[derive(Args, Debug)]
pub struct PushArgs {
    /// Image reference
    pub image: String,

    /// Push the manifest for this platform
    #[arg(long)]
    pub platform: Option<String>,

    /// Suppress progress output
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

pub async fn push(app: &App, args: PushArgs) -> Result<()> {
    let services = app.services()?;
    let name = normalize_reference(&args.image)?;
    // Fails fast on an unknown local image.
    let info = services.images.get(&name).await?;
    let opts = PullOptions {
        platform: args.platform,
        insecure: app.config.insecure_registry,
    };
    tracing::info!(image = %name, "pushing image");
    let token = cdbox_runtime::context::root().child_token();
    cancellable(&token, services.images.push(&name, &opts)).await?;
    if !args.quiet {
        println!("{}: digest: {}", info.familiar_name(), info.digest);
    }
    Ok(())
}
