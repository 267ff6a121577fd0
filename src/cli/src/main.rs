//! cdbox CLI entry point.

use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cdbox_cli::app::App;
use cdbox_cli::commands::{dispatch, Cli, Command};
use cdbox_core::error::BoxError;

fn init_tracing(debug: bool, debug_full: bool) {
    let filter = if debug_full {
        EnvFilter::new("trace")
    } else if debug {
        EnvFilter::new("warn,cdbox_cli=debug,cdbox_runtime=debug,cdbox_core=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 125,
            };
        }
    };

    let app = match App::new(&cli.globals) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("Error: {e}");
            return e.exit_code();
        }
    };
    init_tracing(app.config.debug, app.config.debug_full);

    // Helpers invoked by the runtime keep the default signal dispositions.
    if !matches!(cli.command, Command::Internal { .. }) {
        cdbox_runtime::context::install_signal_handler();
    }

    match dispatch(&app, cli.command).await {
        Ok(()) => 0,
        Err(e) => {
            match &e {
                BoxError::Reported(_) | BoxError::ContainerExit(_) | BoxError::Cancelled => {}
                other => {
                    for line in other.to_string().lines() {
                        eprintln!("Error: {line}");
                    }
                }
            }
            tracing::debug!(error = ?e, "command failed");
            e.exit_code()
        }
    }
}

#[tokio::main]
async fn main() {
    let code = run().await;
    // A blocking STDIN read may still hold a runtime thread.
    std::process::exit(code);
}
