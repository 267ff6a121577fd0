//! `cdbox attach` and the interactive stdio session shared with `run` and
//! `start -a`.

use std::io::IsTerminal;

use cdbox_core::error::{BoxError, Result};
use cdbox_runtime::client::attach::{AttachWriter, Frame};
use cdbox_runtime::client::AttachStream;
use cdbox_runtime::lifecycle::attach::{DetachScanner, DEFAULT_DETACH_KEYS};
use cdbox_runtime::lifecycle::DetachKeys;
use cdbox_runtime::{Container, ContainerManager};
use clap::{ArgAction, Args};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::signal::unix::{signal, Signal, SignalKind};

use crate::app::App;

#[derive(Args, Debug)]
pub struct AttachArgs {
    /// Container name or ID
    pub container: String,

    /// Do not attach STDIN
    #[arg(long = "no-stdin")]
    pub no_stdin: bool,

    /// Proxy received signals to the process
    #[arg(long = "sig-proxy", default_value_t = true, action = ArgAction::Set)]
    pub sig_proxy: bool,

    /// Override the key sequence for detaching a container
    #[arg(long = "detach-keys")]
    pub detach_keys: Option<String>,
}

/// How the local terminal is wired to a container.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub tty: bool,
    pub stdin: bool,
    pub sig_proxy: bool,
    pub detach_keys: DetachKeys,
}

impl Session {
    pub fn new(tty: bool, stdin: bool, sig_proxy: bool, detach_keys: Option<&str>) -> Result<Self> {
        Ok(Self {
            tty,
            stdin,
            // A terminal delivers ^C as input, not as a signal to us.
            sig_proxy: sig_proxy && !tty,
            detach_keys: DetachKeys::parse(detach_keys.unwrap_or(DEFAULT_DETACH_KEYS))?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    Exited(i32),
    Detached,
}

/// Raw mode on the controlling terminal, restored on drop.
pub(crate) struct RawTerminal;

impl RawTerminal {
    pub(crate) fn enable() -> Result<Self> {
        crossterm::terminal::enable_raw_mode()
            .map_err(|e| BoxError::Other(format!("failed to set terminal raw mode: {e}")))?;
        Ok(Self)
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        if let Err(e) = crossterm::terminal::disable_raw_mode() {
            tracing::warn!(error = %e, "failed to restore terminal");
        }
    }
}

async fn read_some(input: &mut Option<tokio::io::Stdin>, buf: &mut [u8]) -> std::io::Result<usize> {
    match input {
        Some(i) => i.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn next_signal(sig: &mut Option<Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}

async fn send_size(writer: &mut AttachWriter) -> Result<()> {
    if let Ok((cols, rows)) = crossterm::terminal::size() {
        writer.send(&Frame::Resize { rows, cols }).await?;
    }
    Ok(())
}

enum Input {
    Read(std::io::Result<usize>),
    Resize,
}

/// Forward stdin and terminal resizes. Returns `true` when the detach
/// sequence was typed.
async fn pump_input(mut writer: AttachWriter, session: Session, mut scanner: DetachScanner) -> Result<bool> {
    let mut winch = if session.tty {
        send_size(&mut writer).await?;
        Some(signal(SignalKind::window_change())?)
    } else {
        None
    };
    let mut input = session.stdin.then(tokio::io::stdin);
    let mut buf = vec![0u8; 4096];
    while input.is_some() || winch.is_some() {
        let event = tokio::select! {
            n = read_some(&mut input, &mut buf) => Input::Read(n),
            _ = next_signal(&mut winch) => Input::Resize,
        };
        match event {
            Input::Resize => send_size(&mut writer).await?,
            Input::Read(Ok(0)) => {
                writer.send(&Frame::CloseStdin).await?;
                input = None;
                if !session.tty {
                    winch = None;
                }
            }
            Input::Read(Ok(n)) => {
                let scanned = scanner.feed(&buf[..n]);
                if !scanned.forward.is_empty() {
                    writer.send(&Frame::Stdin(scanned.forward)).await?;
                }
                if scanned.detached {
                    return Ok(true);
                }
            }
            Input::Read(Err(e)) => return Err(e.into()),
        }
    }
    Ok(false)
}

/// Run an attach session until the process exits or the user detaches.
pub(crate) async fn run_session(
    mgr: &ContainerManager,
    id: &str,
    stream: AttachStream,
    session: Session,
) -> Result<SessionEnd> {
    let _raw = if session.tty && std::io::stdin().is_terminal() {
        Some(RawTerminal::enable()?)
    } else {
        None
    };
    let (mut reader, writer) = stream.split();
    let scanner = session.detach_keys.scanner();
    let mut input = tokio::spawn(pump_input(writer, session.clone(), scanner));
    let mut input_done = false;

    let proxy = session.sig_proxy;
    let mut sigint = if proxy { Some(signal(SignalKind::interrupt())?) } else { None };
    let mut sigterm = if proxy { Some(signal(SignalKind::terminate())?) } else { None };
    let root = cdbox_runtime::context::root();
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();

    let end = loop {
        tokio::select! {
            frame = reader.recv() => match frame? {
                Some(Frame::Stdout(b)) => {
                    stdout.write_all(&b).await?;
                    stdout.flush().await?;
                }
                Some(Frame::Stderr(b)) => {
                    stderr.write_all(&b).await?;
                    stderr.flush().await?;
                }
                Some(Frame::Exit(code)) => break SessionEnd::Exited(code),
                Some(_) => {}
                None => {
                    tracing::debug!(id, "attach stream closed without exit frame");
                    break SessionEnd::Exited(mgr.wait_container(id).await?.code);
                }
            },
            res = &mut input, if !input_done => {
                input_done = true;
                match res {
                    Ok(Ok(true)) => break SessionEnd::Detached,
                    Ok(Ok(false)) => {}
                    Ok(Err(e)) => tracing::debug!(error = %e, "stdin forwarding stopped"),
                    Err(e) => tracing::debug!(error = %e, "stdin task failed"),
                }
            }
            _ = next_signal(&mut sigint) => forward(mgr, id, "SIGINT").await,
            _ = next_signal(&mut sigterm) => forward(mgr, id, "SIGTERM").await,
            _ = root.cancelled(), if !proxy => return Err(BoxError::Cancelled),
        }
    };
    input.abort();
    Ok(end)
}

async fn forward(mgr: &ContainerManager, id: &str, sig: &str) {
    tracing::debug!(id, signal = sig, "forwarding signal");
    if let Err(e) = mgr.kill(id, Some(sig)).await {
        tracing::warn!(id, signal = sig, error = %e, "failed to forward signal");
    }
}

pub(crate) fn has_tty(container: &Container) -> bool {
    container
        .record
        .spec
        .process()
        .as_ref()
        .and_then(|p| p.terminal())
        .unwrap_or(false)
}

/// Map a finished session onto the command's result.
pub(crate) fn finish(end: SessionEnd) -> Result<()> {
    match end {
        SessionEnd::Exited(0) | SessionEnd::Detached => Ok(()),
        SessionEnd::Exited(code) => Err(BoxError::ContainerExit(code)),
    }
}

pub async fn execute(app: &App, args: AttachArgs) -> Result<()> {
    // Signal forwarding needs a manager that outlives the interrupt.
    let mgr = app.manager_with_cancel(tokio_util::sync::CancellationToken::new())?;
    let container = mgr.find(&args.container).await?;
    let stream = mgr.attach(container.id()).await?;
    let session = Session::new(
        has_tty(&container),
        !args.no_stdin,
        args.sig_proxy,
        args.detach_keys.as_deref(),
    )?;
    finish(run_session(&mgr, container.id(), stream, session).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_disables_proxy_under_tty() {
        let s = Session::new(true, true, true, None).unwrap();
        assert!(!s.sig_proxy);
        assert_eq!(s.detach_keys, DetachKeys::default());
        let s = Session::new(false, false, true, Some("ctrl-x")).unwrap();
        assert!(s.sig_proxy);
        assert_eq!(s.detach_keys.bytes(), &[24]);
        assert!(Session::new(false, false, true, Some("ctrl-12")).is_err());
    }

    #[test]
    fn test_finish_maps_exit_codes() {
        assert!(finish(SessionEnd::Exited(0)).is_ok());
        assert!(finish(SessionEnd::Detached).is_ok());
        assert_eq!(finish(SessionEnd::Exited(3)).unwrap_err().exit_code(), 3);
    }
}
