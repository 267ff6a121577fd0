//! Task service backed by an OCI runtime binary and a detached monitor.
//!
//! `start` spawns `cdbox internal monitor <id>` in its own session. The
//! monitor owns the task from then on; this side only reads the files it
//! keeps in the state directory and talks to it over `attach.sock`.

use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use cdbox_core::config::{DataStore, GlobalConfig};
use cdbox_core::container::ContainerStatus;
use cdbox_core::error::{BoxError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;

use super::attach::{read_frame, AttachStream, Frame, HELLO_ATTACH, HELLO_WAIT};
use super::runc::{start_failure_code, Runc};
use super::{
    ContainerRecord, ExecRequest, ExitStatus, StartOptions, StartedTask, TaskService, TaskState,
};
use crate::fs::{read_json, write_json};

/// OCI bundle config inside the state directory.
pub const BUNDLE_CONFIG: &str = "config.json";
/// Task state written by the monitor.
pub const TASK_FILE: &str = "task.json";
/// Last exit written by the monitor.
pub const EXIT_FILE: &str = "exit.json";
pub const ATTACH_SOCKET: &str = "attach.sock";
pub const CONSOLE_SOCKET: &str = "console.sock";
pub const INIT_PID_FILE: &str = "init.pid";
pub const MONITOR_PID_FILE: &str = "monitor.pid";
pub const MONITOR_LOG: &str = "monitor.log";
/// Present while the last stop was requested by a user; suppresses restarts.
pub const STOPPED_MARKER: &str = "stopped-by-user";

/// Persisted exit of the most recent run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExitRecord {
    pub code: i32,
    pub exited_at: chrono::DateTime<Utc>,
}

/// Lines the monitor prints on stdout while the caller waits for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Created(u32),
    Started,
    Error(String),
}

impl Handshake {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end();
        if line == "started" {
            return Some(Self::Started);
        }
        if let Some(pid) = line.strip_prefix("created ") {
            return pid.parse().ok().map(Self::Created);
        }
        line.strip_prefix("error ").map(|m| Self::Error(m.to_string()))
    }

    pub fn render(&self) -> String {
        match self {
            Self::Created(pid) => format!("created {pid}\n"),
            Self::Started => "started\n".to_string(),
            Self::Error(msg) => format!("error {}\n", msg.replace('\n', " ")),
        }
    }
}

/// Map a start failure message onto an error with the Docker exit code.
pub fn start_error(message: String) -> BoxError {
    match start_failure_code(&message) {
        Some(code) => BoxError::CommandFailed { code, message },
        None => BoxError::runtime("task start", message),
    }
}

pub struct RuncTaskService {
    runc: Runc,
    store: DataStore,
    namespace: String,
    monitor_exe: PathBuf,
    /// Global flags handed to the monitor so it sees the same configuration.
    global_args: Vec<String>,
    runtime: String,
}

impl RuncTaskService {
    pub fn new(config: &GlobalConfig, namespace: &str) -> Result<Self> {
        let store = config.data_store();
        let monitor_exe = std::env::current_exe()
            .map_err(|e| BoxError::Other(format!("cannot locate own executable: {e}")))?;
        let global_args = vec![
            "--namespace".to_string(),
            namespace.to_string(),
            "--address".to_string(),
            config.address.clone(),
            "--data-root".to_string(),
            config.data_root.display().to_string(),
            "--cgroup-manager".to_string(),
            config.cgroup_manager.to_string(),
        ];
        Ok(Self {
            runc: Runc::new(
                config.runtime.clone(),
                store.runtime_root(namespace),
                config.cgroup_manager,
            ),
            store,
            namespace: namespace.to_string(),
            monitor_exe,
            global_args,
            runtime: config.runtime.clone(),
        })
    }

    fn state_dir(&self, id: &str) -> PathBuf {
        self.store.container_state_dir(&self.namespace, id)
    }

    async fn connect(&self, id: &str, hello: u8) -> Result<UnixStream> {
        let path = self.state_dir(id).join(ATTACH_SOCKET);
        let mut stream = UnixStream::connect(&path).await.map_err(|e| {
            BoxError::Precondition(format!("container {id} has no running task ({e})"))
        })?;
        stream.write_all(&[hello]).await?;
        Ok(stream)
    }

    fn last_exit(&self, id: &str, state: &TaskState) -> Result<ExitStatus> {
        let record: Option<ExitRecord> = read_json(&self.state_dir(id).join(EXIT_FILE))?;
        Ok(match record {
            Some(r) => ExitStatus {
                code: r.code,
                exited_at: r.exited_at,
            },
            None => ExitStatus {
                code: state.exit_code.unwrap_or(0),
                exited_at: state.finished_at.unwrap_or_else(Utc::now),
            },
        })
    }

    async fn ensure_running(&self, id: &str) -> Result<TaskState> {
        let state = self.state(id).await?;
        if !state.status.is_live() {
            return Err(BoxError::Precondition(format!(
                "container {id} is not running"
            )));
        }
        Ok(state)
    }

    fn monitor_command(&self, id: &str, opts: &StartOptions, dir: &Path) -> Result<Command> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(MONITOR_LOG))?;
        let mut cmd = Command::new(&self.monitor_exe);
        cmd.args(&self.global_args)
            .arg("internal")
            .arg("monitor")
            .arg("--runtime")
            .arg(&self.runtime);
        if opts.attach {
            cmd.arg("--wait-attach");
        }
        if opts.stdin {
            cmd.arg("--stdin");
        }
        if opts.tty {
            cmd.arg("--tty");
        }
        cmd.arg(id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log));
        // Own session: the monitor must outlive this process and its terminal.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        Ok(cmd)
    }
}

#[async_trait]
impl TaskService for RuncTaskService {
    async fn start(&self, record: &ContainerRecord, opts: StartOptions) -> Result<StartedTask> {
        let id = record.id.as_str();
        if let Some(existing) = self.runc.state(id).await? {
            if existing.status == "running" || existing.status == "paused" {
                return Err(BoxError::Precondition(format!(
                    "container {id} is already running"
                )));
            }
            self.runc.delete(id, true).await?;
        }

        let dir = self.state_dir(id);
        std::fs::create_dir_all(&dir)?;
        write_json(&dir.join(BUNDLE_CONFIG), &record.spec)?;
        let _ = std::fs::remove_file(dir.join(STOPPED_MARKER));

        let mut child = self.monitor_command(id, &opts, &dir)?.spawn().map_err(|e| {
            BoxError::runtime(
                "task start",
                format!("failed to spawn monitor {}: {}", self.monitor_exe.display(), e),
            )
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BoxError::runtime("task start", "monitor stdout unavailable"))?;
        let mut lines = BufReader::new(stdout).lines();

        let next = |line: Option<String>| -> Result<Handshake> {
            line.as_deref().and_then(Handshake::parse).ok_or_else(|| {
                BoxError::runtime(
                    "task start",
                    format!(
                        "monitor exited unexpectedly (see {})",
                        dir.join(MONITOR_LOG).display()
                    ),
                )
            })
        };

        let pid = match next(lines.next_line().await?)? {
            Handshake::Created(pid) => pid,
            Handshake::Error(msg) => return Err(start_error(msg)),
            Handshake::Started => {
                return Err(BoxError::runtime("task start", "monitor skipped create"))
            }
        };
        let stream = if opts.attach {
            Some(AttachStream::new(Box::new(
                self.connect(id, HELLO_ATTACH).await?,
            )))
        } else {
            None
        };
        match next(lines.next_line().await?)? {
            Handshake::Started => {}
            Handshake::Error(msg) => return Err(start_error(msg)),
            Handshake::Created(_) => {
                return Err(BoxError::runtime("task start", "unexpected monitor handshake"))
            }
        }

        // Reap the monitor if it exits while we are still around.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        tracing::debug!(id, pid, "task started");
        Ok(StartedTask { pid, stream })
    }

    async fn state(&self, id: &str) -> Result<TaskState> {
        let saved: Option<TaskState> = read_json(&self.state_dir(id).join(TASK_FILE))?;
        let Some(mut state) = saved else {
            return Ok(TaskState::created());
        };
        match self.runc.state(id).await {
            Ok(Some(rs)) => {
                state.status = match rs.status.as_str() {
                    "running" => ContainerStatus::Running,
                    "paused" => ContainerStatus::Paused,
                    "created" => ContainerStatus::Created,
                    _ => ContainerStatus::Stopped,
                };
                if state.status.is_live() {
                    state.pid = Some(rs.pid);
                }
            }
            Ok(None) => {
                if state.status.is_live() {
                    // The monitor died without recording an exit.
                    state.status = ContainerStatus::Stopped;
                    state.pid = None;
                }
            }
            Err(e) => {
                tracing::warn!(id, error = %e, "cannot query task state");
                state.status = ContainerStatus::Unknown;
            }
        }
        Ok(state)
    }

    async fn kill(&self, id: &str, signal: i32, all: bool) -> Result<()> {
        self.ensure_running(id).await?;
        std::fs::write(self.state_dir(id).join(STOPPED_MARKER), b"")?;
        self.runc.kill(id, signal, all).await
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.runc.pause(id).await
    }

    async fn resume(&self, id: &str) -> Result<()> {
        self.runc.resume(id).await
    }

    async fn wait(&self, id: &str) -> Result<ExitStatus> {
        let state = self.state(id).await?;
        if !state.status.is_live() {
            return self.last_exit(id, &state);
        }
        match self.connect(id, HELLO_WAIT).await {
            Ok(mut stream) => loop {
                match read_frame(&mut stream).await? {
                    Some(Frame::Exit(code)) => {
                        return Ok(ExitStatus {
                            code,
                            exited_at: Utc::now(),
                        })
                    }
                    Some(_) => continue,
                    None => break,
                }
            },
            Err(e) => tracing::debug!(id, error = %e, "wait socket unavailable, polling"),
        }
        loop {
            let state = self.state(id).await?;
            if !state.status.is_live() {
                return self.last_exit(id, &state);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.runc.delete(id, true).await?;
        let dir = self.state_dir(id);
        for file in [TASK_FILE, EXIT_FILE, ATTACH_SOCKET, CONSOLE_SOCKET, INIT_PID_FILE] {
            let _ = std::fs::remove_file(dir.join(file));
        }
        Ok(())
    }

    async fn exec(&self, id: &str, req: ExecRequest) -> Result<i32> {
        self.ensure_running(id).await?;
        let dir = self.state_dir(id);
        let process_file = dir.join(format!("exec-{}.json", req.exec_id));
        write_json(&process_file, &req.process)?;

        let tty = req.process.terminal().unwrap_or(false) && !req.detach;
        let mut cmd = self.runc.exec_command(id, &process_file, req.detach, tty);
        if req.quiet || req.detach {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
        } else {
            cmd.stdin(if req.stdin {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| BoxError::runtime("exec", format!("failed to run runtime: {e}")))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| BoxError::runtime("exec", "stderr unavailable"))?;
        let forward = !req.quiet && !req.detach;
        let collector = tokio::spawn(async move {
            let mut tail = Vec::new();
            let mut buf = [0u8; 4096];
            let mut out = tokio::io::stderr();
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if forward {
                            let _ = out.write_all(&buf[..n]).await;
                        }
                        tail.extend_from_slice(&buf[..n]);
                        if tail.len() > 8192 {
                            tail.drain(..tail.len() - 8192);
                        }
                    }
                }
            }
            String::from_utf8_lossy(&tail).into_owned()
        });

        let status = child.wait().await?;
        let tail = collector.await.unwrap_or_default();
        let _ = std::fs::remove_file(&process_file);
        let code = status.code().unwrap_or(255);
        if code == 255 && tail.contains("exec failed") {
            let message = super::runc::clean_error(&tail);
            if let Some(code) = start_failure_code(&message) {
                return Err(BoxError::CommandFailed { code, message });
            }
            return Err(BoxError::runtime("exec", message));
        }
        Ok(if req.detach { 0 } else { code })
    }

    async fn pids(&self, id: &str) -> Result<Vec<u32>> {
        self.ensure_running(id).await?;
        self.runc.ps(id).await
    }

    async fn attach(&self, id: &str) -> Result<AttachStream> {
        self.ensure_running(id).await?;
        let stream = self.connect(id, HELLO_ATTACH).await?;
        Ok(AttachStream::new(Box::new(stream)))
    }
}
