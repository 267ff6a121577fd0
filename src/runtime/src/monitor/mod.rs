//! Task monitor: the detached process that owns one container's task.
//!
//! Started by [`crate::client::task::RuncTaskService`] as
//! `cdbox internal monitor <id>`. It creates and starts the task with the
//! OCI runtime, reports progress on stdout with [`Handshake`] lines, pumps
//! the task's stdio into the log driver and to clients of `attach.sock`,
//! records every exit and applies the restart policy.

pub mod console;

use std::io::Write as _;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cdbox_core::config::GlobalConfig;
use cdbox_core::container::{ContainerStatus, RestartPolicy};
use cdbox_core::error::{BoxError, Result};
use cdbox_core::labels::ContainerLabels;
use cdbox_core::log::{LogConfig, LogStream};
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::client::attach::{read_frame, write_frame, Frame, HELLO_ATTACH, HELLO_WAIT};
use crate::client::records::LocalContainerService;
use crate::client::runc::{clean_error, Runc};
use crate::client::task::{
    ExitRecord, Handshake, ATTACH_SOCKET, CONSOLE_SOCKET, EXIT_FILE, INIT_PID_FILE,
    MONITOR_PID_FILE, STOPPED_MARKER, TASK_FILE,
};
use crate::client::{ContainerService, TaskState};
use crate::fs::write_json;
use crate::logging::producer::LogProducer;
use crate::logging::{open_sink, LogTarget};
use console::ConsoleSocket;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// A run that lasted this long resets the restart backoff.
const STABLE_RUN: Duration = Duration::from_secs(10);
/// How long to wait for the first attach client with `--wait-attach`.
const ATTACH_WAIT: Duration = Duration::from_secs(10);
/// Grace for output still buffered in pipes after the task exited.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub id: String,
    pub runtime: String,
    pub wait_attach: bool,
    pub stdin: bool,
    pub tty: bool,
}

/// Result of a monitor's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct MonitorOutcome {
    pub exit_code: i32,
    /// The container was created with `--rm`; the caller removes it.
    pub auto_remove: bool,
}

/// Prints handshake lines until the caller has what it waits for.
struct Reporter {
    done: bool,
}

impl Reporter {
    fn report(&mut self, line: Handshake) {
        if self.done {
            return;
        }
        self.done = !matches!(line, Handshake::Created(_));
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(line.render().as_bytes());
        let _ = out.flush();
    }
}

enum Input {
    Pipe(tokio::process::ChildStdin),
    Pty { writer: tokio::fs::File, master: Arc<OwnedFd> },
}

/// Fan-out of task output and fan-in of client input.
struct Hub {
    output: broadcast::Sender<Frame>,
    input: mpsc::UnboundedSender<Frame>,
    attached: watch::Sender<bool>,
}

impl Hub {
    fn publish(&self, frame: Frame) {
        // No subscribers is fine.
        let _ = self.output.send(frame);
    }
}

async fn serve_client(hub: Arc<Hub>, mut stream: UnixStream) -> Result<()> {
    let mut hello = [0u8; 1];
    stream.read_exact(&mut hello).await?;
    let mut output = hub.output.subscribe();
    match hello[0] {
        HELLO_WAIT => loop {
            match output.recv().await {
                Ok(Frame::Exit(code)) => return write_frame(&mut stream, &Frame::Exit(code)).await,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        },
        HELLO_ATTACH => {
            let _ = hub.attached.send(true);
            let (mut reader, mut writer) = stream.into_split();
            let input = hub.input.clone();
            let forward = tokio::spawn(async move {
                while let Ok(Some(frame)) = read_frame(&mut reader).await {
                    if matches!(frame, Frame::Stdin(_) | Frame::Resize { .. } | Frame::CloseStdin)
                        && input.send(frame).is_err()
                    {
                        break;
                    }
                }
            });
            let result = loop {
                let frame = match output.recv().await {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "attach client fell behind");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break Ok(()),
                };
                let exit = matches!(frame, Frame::Exit(_));
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    break Err(e);
                }
                if exit {
                    break Ok(());
                }
            };
            forward.abort();
            result
        }
        other => Err(BoxError::invalid(format!("unknown attach hello {other:#x}"))),
    }
}

async fn route_input(mut rx: mpsc::UnboundedReceiver<Frame>, target: Arc<Mutex<Option<Input>>>) {
    while let Some(frame) = rx.recv().await {
        let mut guard = target.lock().await;
        let Some(input) = guard.as_mut() else {
            continue;
        };
        let mut close = false;
        let res = match frame {
            Frame::Stdin(data) => match input {
                Input::Pipe(stdin) => stdin.write_all(&data).await.map_err(BoxError::from),
                Input::Pty { writer, .. } => writer.write_all(&data).await.map_err(BoxError::from),
            },
            Frame::Resize { rows, cols } => match input {
                Input::Pty { master, .. } => console::resize(master.as_raw_fd(), rows, cols),
                Input::Pipe(_) => Ok(()),
            },
            Frame::CloseStdin => match input {
                Input::Pipe(_) => {
                    close = true;
                    Ok(())
                }
                // ^D on a terminal.
                Input::Pty { writer, .. } => writer.write_all(&[0x04]).await.map_err(BoxError::from),
            },
            _ => Ok(()),
        };
        if let Err(e) = res {
            tracing::debug!(error = %e, "dropping stdin");
            close = true;
        }
        if close {
            *guard = None;
        }
    }
}

type LogSender = mpsc::UnboundedSender<(LogStream, Vec<u8>)>;

fn pump<R>(mut reader: R, stream: LogStream, hub: Arc<Hub>, logs: LogSender) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = buf[..n].to_vec();
                    hub.publish(match stream {
                        LogStream::Stdout => Frame::Stdout(chunk.clone()),
                        LogStream::Stderr => Frame::Stderr(chunk.clone()),
                    });
                    let _ = logs.send((stream, chunk));
                }
                // EIO on a pty master once the slave side is gone.
                Err(_) => break,
            }
        }
    })
}

/// Exit status of a process we are the (sub)reaper of.
fn wait_pid(pid: i32) -> std::io::Result<i32> {
    let mut status = 0;
    loop {
        let r = unsafe { libc::waitpid(pid, &mut status, 0) };
        if r >= 0 {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    Ok(decode_status(status))
}

/// Docker exit code of a wait status: the exit code, or 128 + signal.
pub fn decode_status(status: i32) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        255
    }
}

/// Next restart delay: doubles, capped, and reset after a stable run.
pub fn next_backoff(current: Duration, ran_for: Duration) -> Duration {
    if ran_for >= STABLE_RUN {
        INITIAL_BACKOFF
    } else {
        (current * 2).min(MAX_BACKOFF)
    }
}

struct Monitor {
    opts: MonitorOptions,
    dir: PathBuf,
    runc: Runc,
    hub: Arc<Hub>,
    input: Arc<Mutex<Option<Input>>>,
    logs: LogSender,
    attached: watch::Receiver<bool>,
    reporter: Reporter,
}

impl Monitor {
    fn write_state(&self, state: &TaskState) -> Result<()> {
        write_json(&self.dir.join(TASK_FILE), state)
    }

    /// One create/start/wait cycle. Returns the exit code of the task.
    async fn run_once(&mut self, first: bool, restart_count: u32) -> Result<i32> {
        let id = self.opts.id.clone();
        self.runc.delete(&id, true).await?;
        let pid_file = self.dir.join(INIT_PID_FILE);
        let _ = std::fs::remove_file(&pid_file);

        let console = if self.opts.tty {
            Some(ConsoleSocket::bind(&self.dir.join(CONSOLE_SOCKET))?)
        } else {
            None
        };
        let mut cmd = self.runc.create_command(
            &id,
            &self.dir,
            &pid_file,
            console.as_ref().map(ConsoleSocket::path),
        );
        cmd.stdin(if self.opts.stdin && !self.opts.tty {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(if self.opts.tty { Stdio::null() } else { Stdio::piped() })
        .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| BoxError::runtime("task create", format!("failed to run runtime: {e}")))?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let master = console.map(|c| tokio::spawn(async move { c.receive_master().await }));

        let status = child.wait().await?;
        if !status.success() {
            if let Some(task) = master {
                task.abort();
            }
            let mut raw = String::new();
            if let Some(mut err) = stderr.take() {
                let _ = err.read_to_string(&mut raw).await;
            }
            return Err(BoxError::runtime("task create", clean_error(&raw)));
        }
        let pid: i32 = std::fs::read_to_string(&pid_file)?
            .trim()
            .parse()
            .map_err(|_| BoxError::runtime("task create", "invalid init pid file"))?;
        if first {
            self.reporter.report(Handshake::Created(pid as u32));
        }

        let mut pumps = Vec::new();
        match master {
            Some(task) => {
                let fd = task
                    .await
                    .map_err(|e| BoxError::runtime("console", e))??;
                let master = Arc::new(fd);
                let reader = tokio::fs::File::from_std(std::fs::File::from(master.try_clone()?));
                let writer = tokio::fs::File::from_std(std::fs::File::from(master.try_clone()?));
                pumps.push(pump(reader, LogStream::Stdout, self.hub.clone(), self.logs.clone()));
                if self.opts.stdin {
                    *self.input.lock().await = Some(Input::Pty { writer, master });
                }
                // runc's own stderr; empty once it exited.
                drop(stderr.take());
            }
            None => {
                if let Some(out) = stdout {
                    pumps.push(pump(out, LogStream::Stdout, self.hub.clone(), self.logs.clone()));
                }
                if let Some(err) = stderr.take() {
                    pumps.push(pump(err, LogStream::Stderr, self.hub.clone(), self.logs.clone()));
                }
                if let Some(stdin) = stdin {
                    *self.input.lock().await = Some(Input::Pipe(stdin));
                }
            }
        }

        if first && self.opts.wait_attach {
            let mut attached = self.attached.clone();
            if tokio::time::timeout(ATTACH_WAIT, attached.wait_for(|a| *a)).await.is_err() {
                tracing::warn!(id = %id, "no attach client arrived, starting anyway");
            }
        }

        if let Err(e) = self.runc.start(&id).await {
            let _ = self.runc.delete(&id, true).await;
            return Err(e);
        }
        let started_at = Utc::now();
        self.write_state(&TaskState {
            status: ContainerStatus::Running,
            pid: Some(pid as u32),
            exit_code: None,
            started_at: Some(started_at),
            finished_at: None,
            restart_count,
        })?;
        if first {
            self.reporter.report(Handshake::Started);
        }
        tracing::info!(id = %id, pid, "task running");

        let code = tokio::task::spawn_blocking(move || wait_pid(pid))
            .await
            .map_err(|e| BoxError::runtime("task wait", e))??;
        let finished_at = Utc::now();
        tracing::info!(id = %id, code, "task exited");

        let aborts: Vec<_> = pumps.iter().map(JoinHandle::abort_handle).collect();
        let drain = futures::future::join_all(pumps);
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            tracing::debug!(id = %id, "output still open after exit, detaching");
            aborts.iter().for_each(|a| a.abort());
        }
        *self.input.lock().await = None;

        write_json(
            &self.dir.join(EXIT_FILE),
            &ExitRecord {
                code,
                exited_at: finished_at,
            },
        )?;
        self.write_state(&TaskState {
            status: ContainerStatus::Stopped,
            pid: None,
            exit_code: Some(code),
            started_at: Some(started_at),
            finished_at: Some(finished_at),
            restart_count,
        })?;
        self.hub.publish(Frame::Exit(code));

        if let Err(e) = self.runc.delete(&id, false).await {
            tracing::warn!(id = %id, error = %e, "runtime delete failed");
        }
        Ok(code)
    }
}

fn set_subreaper() {
    if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) } != 0 {
        tracing::warn!(error = %std::io::Error::last_os_error(), "cannot become subreaper");
    }
}

fn log_config(dir: &Path) -> LogConfig {
    LogConfig::load(dir).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "no usable log config, using json-file");
        LogConfig::default()
    })
}

/// Run the monitor until the task exits for good.
pub async fn run(config: &GlobalConfig, namespace: &str, opts: MonitorOptions) -> Result<MonitorOutcome> {
    set_subreaper();
    let store = config.data_store();
    let dir = store.container_state_dir(namespace, &opts.id);
    let records = LocalContainerService::new(store.records_dir(namespace));

    let mut reporter = Reporter { done: false };
    let record = match records.get(&opts.id).await {
        Ok(r) => r,
        Err(e) => {
            reporter.report(Handshake::Error(e.to_string()));
            return Err(e);
        }
    };
    let labels = ContainerLabels::from_map(&record.labels)?;
    let policy: RestartPolicy = labels.restart.clone();

    let log_config = log_config(&dir);
    let target = LogTarget {
        namespace,
        id: &opts.id,
        name: &labels.name,
        state_dir: &dir,
    };
    let mut producer = match open_sink(&log_config, &target) {
        Ok(sink) => LogProducer::new(sink),
        Err(e) => {
            tracing::warn!(error = %e, driver = %log_config.driver, "log driver unavailable, output is not logged");
            LogProducer::new(None)
        }
    };
    let (logs, mut log_rx) = mpsc::unbounded_channel::<(LogStream, Vec<u8>)>();
    let log_thread = std::thread::spawn(move || {
        while let Some((stream, chunk)) = log_rx.blocking_recv() {
            if let Err(e) = producer.push(stream, &chunk) {
                tracing::warn!(error = %e, "log driver write failed");
            }
        }
        if let Err(e) = producer.finish() {
            tracing::warn!(error = %e, "log driver close failed");
        }
    });

    let (output, _) = broadcast::channel(1024);
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (attached_tx, attached) = watch::channel(false);
    let hub = Arc::new(Hub {
        output,
        input: input_tx,
        attached: attached_tx,
    });
    let input = Arc::new(Mutex::new(None));
    tokio::spawn(route_input(input_rx, input.clone()));

    let socket = dir.join(ATTACH_SOCKET);
    let _ = std::fs::remove_file(&socket);
    let listener = UnixListener::bind(&socket)?;
    let accept_hub = hub.clone();
    let acceptor = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let hub = accept_hub.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_client(hub, stream).await {
                    tracing::debug!(error = %e, "attach client ended");
                }
            });
        }
    });
    std::fs::write(dir.join(MONITOR_PID_FILE), std::process::id().to_string())?;

    let mut monitor = Monitor {
        runc: Runc::new(opts.runtime.clone(), store.runtime_root(namespace), config.cgroup_manager),
        opts,
        dir: dir.clone(),
        hub,
        input,
        logs,
        attached,
        reporter,
    };

    let mut restarts = 0u32;
    let mut backoff = INITIAL_BACKOFF;
    let mut first = true;
    let result = loop {
        let began = Instant::now();
        let code = match monitor.run_once(first, restarts).await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!(id = %monitor.opts.id, error = %e, "task run failed");
                if first {
                    monitor.reporter.report(Handshake::Error(e.to_string()));
                    break Err(e);
                }
                break Ok(e.exit_code());
            }
        };
        first = false;
        let stopped_by_user = dir.join(STOPPED_MARKER).exists();
        if !policy.should_restart(code, restarts, stopped_by_user) {
            break Ok(code);
        }
        backoff = next_backoff(backoff, began.elapsed());
        tracing::info!(id = %monitor.opts.id, code, restarts, delay = ?backoff, "restarting task");
        tokio::time::sleep(backoff).await;
        restarts += 1;
    };

    acceptor.abort();
    let _ = std::fs::remove_file(&socket);
    let _ = std::fs::remove_file(dir.join(MONITOR_PID_FILE));
    drop(monitor);
    if tokio::task::spawn_blocking(move || log_thread.join()).await.is_err() {
        tracing::warn!("log writer did not finish cleanly");
    }

    result.map(|exit_code| MonitorOutcome {
        exit_code,
        auto_remove: labels.auto_remove,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::attach::AttachStream;
    use tempfile::TempDir;

    fn hub() -> (Arc<Hub>, mpsc::UnboundedReceiver<Frame>, watch::Receiver<bool>) {
        let (output, _) = broadcast::channel(16);
        let (input, rx) = mpsc::unbounded_channel();
        let (attached, attached_rx) = watch::channel(false);
        (Arc::new(Hub { output, input, attached }), rx, attached_rx)
    }

    #[test]
    fn test_decode_status() {
        // exit(3)
        assert_eq!(decode_status(3 << 8), 3);
        // killed by SIGKILL
        assert_eq!(decode_status(9), 137);
    }

    #[test]
    fn test_next_backoff() {
        assert_eq!(next_backoff(INITIAL_BACKOFF, Duration::ZERO), Duration::from_millis(200));
        assert_eq!(next_backoff(Duration::from_secs(50), Duration::ZERO), MAX_BACKOFF);
        assert_eq!(next_backoff(Duration::from_secs(50), STABLE_RUN), INITIAL_BACKOFF);
    }

    #[test]
    fn test_wait_pid_reports_exit_code() {
        let child = std::process::Command::new("sh").args(["-c", "exit 7"]).spawn().unwrap();
        assert_eq!(wait_pid(child.id() as i32).unwrap(), 7);
    }

    #[tokio::test]
    async fn test_attach_client_gets_output_and_exit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("attach.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let (hub, mut input_rx, mut attached) = hub();
        let server_hub = hub.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve_client(server_hub, stream).await.unwrap();
        });

        let mut conn = UnixStream::connect(&path).await.unwrap();
        conn.write_all(&[HELLO_ATTACH]).await.unwrap();
        attached.wait_for(|a| *a).await.unwrap();
        let mut client = AttachStream::new(Box::new(conn));
        client.send(&Frame::Stdin(b"ping".to_vec())).await.unwrap();
        assert_eq!(input_rx.recv().await, Some(Frame::Stdin(b"ping".to_vec())));

        hub.publish(Frame::Stdout(b"out".to_vec()));
        hub.publish(Frame::Exit(4));
        assert_eq!(client.recv().await.unwrap(), Some(Frame::Stdout(b"out".to_vec())));
        assert_eq!(client.recv().await.unwrap(), Some(Frame::Exit(4)));
    }

    #[tokio::test]
    async fn test_wait_client_only_sees_exit() {
        let (hub, _input, _attached) = hub();
        let (server, mut client) = UnixStream::pair().unwrap();
        let server_hub = hub.clone();
        client.write_all(&[HELLO_WAIT]).await.unwrap();
        let task = tokio::spawn(serve_client(server_hub, server));
        // Let the server subscribe before publishing.
        while hub.output.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
        hub.publish(Frame::Stdout(b"ignored".to_vec()));
        hub.publish(Frame::Exit(0));
        assert_eq!(read_frame(&mut client).await.unwrap(), Some(Frame::Exit(0)));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_route_input_to_pipe_and_close() {
        let mut child = tokio::process::Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let stdin = child.stdin.take().unwrap();
        let mut stdout = child.stdout.take().unwrap();
        let target = Arc::new(Mutex::new(Some(Input::Pipe(stdin))));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(route_input(rx, target.clone()));

        tx.send(Frame::Stdin(b"abc".to_vec())).unwrap();
        tx.send(Frame::CloseStdin).unwrap();
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "abc");
        assert!(target.lock().await.is_none());
    }
}
