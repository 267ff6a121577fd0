//! Thin async wrapper around an OCI runtime binary (`runc` and compatibles).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use cdbox_core::config::CgroupManager;
use cdbox_core::error::{BoxError, Result};
use serde::Deserialize;
use tokio::process::Command;

/// `runc state` output.
#[derive(Debug, Clone, Deserialize)]
pub struct RuncState {
    pub id: String,
    pub pid: u32,
    /// `created`, `running`, `paused` or `stopped`.
    pub status: String,
    pub bundle: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Runc {
    binary: String,
    root: PathBuf,
    systemd_cgroup: bool,
}

impl Runc {
    pub fn new(binary: impl Into<String>, root: PathBuf, cgroup_manager: CgroupManager) -> Self {
        Self {
            binary: binary.into(),
            root,
            systemd_cgroup: cgroup_manager == CgroupManager::Systemd,
        }
    }

    /// A command with the global flags already set.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--root").arg(&self.root);
        if self.systemd_cgroup {
            cmd.arg("--systemd-cgroup");
        }
        cmd.kill_on_drop(false);
        cmd
    }

    /// `runc create`; stdio of the returned command is left to the caller.
    pub fn create_command(
        &self,
        id: &str,
        bundle: &Path,
        pid_file: &Path,
        console_socket: Option<&Path>,
    ) -> Command {
        let mut cmd = self.command();
        cmd.arg("create")
            .arg("--bundle")
            .arg(bundle)
            .arg("--pid-file")
            .arg(pid_file);
        if let Some(socket) = console_socket {
            cmd.arg("--console-socket").arg(socket);
        }
        cmd.arg(id);
        cmd
    }

    /// `runc exec --process <file>`; stdio is left to the caller.
    pub fn exec_command(&self, id: &str, process_file: &Path, detach: bool, tty: bool) -> Command {
        let mut cmd = self.command();
        cmd.arg("exec").arg("--process").arg(process_file);
        if detach {
            cmd.arg("--detach");
        }
        if tty {
            cmd.arg("--tty");
        }
        cmd.arg(id);
        cmd
    }

    async fn run(&self, stage: &str, args: &[&str]) -> Result<Vec<u8>> {
        let output = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BoxError::runtime(stage, format!("failed to run {}: {}", self.binary, e)))?;
        if !output.status.success() {
            return Err(BoxError::runtime(
                stage,
                clean_error(&String::from_utf8_lossy(&output.stderr)),
            ));
        }
        Ok(output.stdout)
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        self.run("start", &["start", id]).await.map(|_| ())
    }

    /// `None` when the runtime does not know the container.
    pub async fn state(&self, id: &str) -> Result<Option<RuncState>> {
        match self.run("state", &["state", id]).await {
            Ok(out) => Ok(Some(serde_json::from_slice(&out)?)),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn kill(&self, id: &str, signal: i32, all: bool) -> Result<()> {
        let signal = signal.to_string();
        let mut args = vec!["kill"];
        if all {
            args.push("--all");
        }
        args.push(id);
        args.push(&signal);
        self.run("kill", &args).await.map(|_| ())
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        self.run("pause", &["pause", id]).await.map(|_| ())
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        self.run("resume", &["resume", id]).await.map(|_| ())
    }

    /// Delete the runtime container; a missing container is not an error.
    pub async fn delete(&self, id: &str, force: bool) -> Result<()> {
        let mut args = vec!["delete"];
        if force {
            args.push("--force");
        }
        args.push(id);
        match self.run("delete", &args).await {
            Err(e) if is_missing(&e) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    pub async fn ps(&self, id: &str) -> Result<Vec<u32>> {
        let out = self.run("ps", &["ps", "--format", "json", id]).await?;
        let pids: Option<Vec<u32>> = serde_json::from_slice(&out)?;
        Ok(pids.unwrap_or_default())
    }
}

fn is_missing(e: &BoxError) -> bool {
    let msg = e.to_string();
    msg.contains("does not exist") || msg.contains("not exist") || msg.contains("no such file")
}

/// runc prints logrus lines (`time="..." level=error msg="..."`); keep the message.
pub fn clean_error(stderr: &str) -> String {
    let line = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim();
    if let Some(start) = line.find("msg=\"") {
        let rest = &line[start + 5..];
        let end = rest.rfind('"').unwrap_or(rest.len());
        return rest[..end].replace("\\\"", "\"");
    }
    line.to_string()
}

/// Exit code for a process start failure: 127 when the executable is missing,
/// 126 when it cannot be executed.
pub fn start_failure_code(message: &str) -> Option<i32> {
    let lower = message.to_lowercase();
    if lower.contains("executable file not found")
        || lower.contains("no such file or directory")
        || lower.contains("not found in $path")
    {
        Some(127)
    } else if lower.contains("permission denied") || lower.contains("is a directory") {
        Some(126)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_error() {
        let stderr = "time=\"2024-01-01T00:00:00Z\" level=error msg=\"container \\\"x\\\" does not exist\"\n";
        assert_eq!(clean_error(stderr), "container \"x\" does not exist");
        assert_eq!(clean_error("plain failure\n\n"), "plain failure");
    }

    #[test]
    fn test_start_failure_code() {
        assert_eq!(
            start_failure_code("exec: \"nope\": executable file not found in $PATH"),
            Some(127)
        );
        assert_eq!(start_failure_code("exec /etc/passwd: permission denied"), Some(126));
        assert_eq!(start_failure_code("cgroup setup failed"), None);
    }

    #[test]
    fn test_create_command_args() {
        let runc = Runc::new("runc", PathBuf::from("/run/cdbox"), CgroupManager::Systemd);
        let cmd = runc.create_command(
            "abc",
            Path::new("/b"),
            Path::new("/b/init.pid"),
            Some(Path::new("/b/console.sock")),
        );
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "--root", "/run/cdbox", "--systemd-cgroup", "create", "--bundle", "/b",
                "--pid-file", "/b/init.pid", "--console-socket", "/b/console.sock", "abc"
            ]
        );
    }
}
