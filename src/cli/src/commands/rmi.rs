//! `cdbox rmi` command.

use cdbox_core::error::{BoxError, Result};
use clap::Args;

use crate::app::App;
use crate::output::each_target;

#[derive(Args, Debug)]
pub struct RmiArgs {
    /// Image reference(s) or ID(s)
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Remove the image even if containers use it
    #[arg(short = 'f', long)]
    pub force: bool,
}

pub async fn execute(app: &App, args: RmiArgs) -> Result<()> {
    let mgr = app.manager()?;
    let containers = mgr.containers().await?;
    let images = &mgr.services().images;
    let force = args.force;
    each_target(&args.images, |token| {
        let containers = &containers;
        async move {
            let info = images.get(token).await?;
            if !force {
                let users: Vec<&str> = containers
                    .iter()
                    .filter(|c| !c.record.image.is_empty() && c.record.image == info.name)
                    .map(|c| c.short_id())
                    .collect();
                if !users.is_empty() {
                    return Err(BoxError::Precondition(format!(
                        "conflict: unable to remove image {token}: image is being used by container(s) {}",
                        users.join(", ")
                    )));
                }
            }
            images.remove(&info.name).await?;
            Ok(format!("Untagged: {}", info.familiar_name()))
        }
    })
    .await
}
