//! `cdbox port` command: list port mappings of a container.

use cdbox_core::container::PortMapping;
use cdbox_core::error::Result;
use clap::Args;

use crate::app::App;

#[derive(Args, Debug)]
pub struct PortArgs {
    /// Container name or ID
    pub container: String,

    /// Private port, optionally with protocol (e.g. 80/tcp)
    pub port: Option<String>,
}

/// `0.0.0.0:8080`
pub(crate) fn host_address(p: &PortMapping) -> String {
    if p.host_ip.contains(':') {
        format!("[{}]:{}", p.host_ip, p.host_port)
    } else {
        format!("{}:{}", p.host_ip, p.host_port)
    }
}

pub async fn execute(app: &App, args: PortArgs) -> Result<()> {
    let mgr = app.manager()?;
    let ports = mgr.port(&args.container, args.port.as_deref()).await?;
    for p in &ports {
        if args.port.is_some() {
            println!("{}", host_address(p));
        } else {
            println!("{p}");
        }
    }
    Ok(())
}
