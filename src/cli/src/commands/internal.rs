//! Hidden helper commands the runtime calls back into: the per-container
//! task monitor and the OCI network hooks.

use std::io::Read;

use cdbox_core::error::{BoxError, Result};
use cdbox_runtime::hook::{self, HookEvent, OciState};
use cdbox_runtime::lifecycle::RemoveOptions;
use cdbox_runtime::monitor::{self, MonitorOptions};
use cdbox_runtime::NetworkStore;
use clap::{Args, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::app::App;

#[derive(Subcommand, Debug)]
pub enum InternalCommand {
    /// Supervise a container task until it exits
    Monitor(MonitorArgs),
    /// Handle an OCI runtime hook (state document on STDIN)
    OciHook(HookArgs),
}

#[derive(Args, Debug)]
pub struct MonitorArgs {
    /// OCI runtime binary
    #[arg(long)]
    pub runtime: String,

    /// Hold the task until a client attaches
    #[arg(long = "wait-attach")]
    pub wait_attach: bool,

    /// Keep the task's STDIN open
    #[arg(long)]
    pub stdin: bool,

    /// The task has a terminal
    #[arg(long)]
    pub tty: bool,

    pub id: String,
}

#[derive(Args, Debug)]
pub struct HookArgs {
    /// createRuntime or postStop
    pub event: String,
}

pub async fn execute(app: &App, command: InternalCommand) -> Result<()> {
    match command {
        InternalCommand::Monitor(args) => {
            let id = args.id.clone();
            let opts = MonitorOptions {
                id: args.id,
                runtime: args.runtime,
                wait_attach: args.wait_attach,
                stdin: args.stdin,
                tty: args.tty,
            };
            let outcome = monitor::run(&app.config, app.namespace(), opts).await?;
            if outcome.auto_remove {
                // Nothing may cancel the cleanup of a --rm container.
                let mgr = app.manager_with_cancel(CancellationToken::new())?;
                let opts = RemoveOptions {
                    force: true,
                    volumes: true,
                };
                if let Err(e) = mgr.remove(&id, opts).await {
                    if !e.is_not_found() {
                        tracing::warn!(id = %id, error = %e, "failed to remove container after exit");
                    }
                }
            }
            tracing::debug!(id = %id, code = outcome.exit_code, "monitor finished");
            match outcome.exit_code {
                0 => Ok(()),
                code => Err(BoxError::ContainerExit(code)),
            }
        }
        InternalCommand::OciHook(args) => {
            let event: HookEvent = args.event.parse()?;
            let mut raw = String::new();
            std::io::stdin().read_to_string(&mut raw)?;
            let state: OciState = serde_json::from_str(&raw)?;
            let services = app.services()?;
            let networks = NetworkStore::open(&app.config.data_store());
            hook::run(event, &state, services.cni.as_ref(), &networks).await
        }
    }
}
