//! Binary driver: hands raw output to a user-supplied logger process.
//!
//! The logger inherits the container's stdout on fd 3 and stderr on fd 4,
//! gets `CONTAINER_ID`, `CONTAINER_NAMESPACE` and `CONTAINER_NAME` in its
//! environment, and the log options as `key=value` arguments.

use std::fs::File;
use std::io::Write;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use cdbox_core::error::{BoxError, Result};
use cdbox_core::log::{LogConfig, LogEntry, LogStream};

use super::{LogSink, LogTarget};

pub struct BinarySink {
    child: Child,
    stdout: Option<File>,
    stderr: Option<File>,
}

fn pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [0; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: pipe2 just returned two fresh descriptors we own.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// `key=value` arguments for the logger, in option order.
pub fn logger_args(config: &LogConfig) -> Vec<String> {
    config.opts.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

impl BinarySink {
    pub fn spawn(binary: &Path, config: &LogConfig, target: &LogTarget<'_>) -> Result<Self> {
        use std::os::fd::AsRawFd;

        let (out_read, out_write) = pipe()?;
        let (err_read, err_write) = pipe()?;
        let out_fd = out_read.as_raw_fd();
        let err_fd = err_read.as_raw_fd();

        let mut cmd = Command::new(binary);
        cmd.args(logger_args(config))
            .env("CONTAINER_ID", target.id)
            .env("CONTAINER_NAMESPACE", target.namespace)
            .env("CONTAINER_NAME", target.name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                // Move both ends above 4 first so neither dup2 clobbers the other.
                let out = libc::fcntl(out_fd, libc::F_DUPFD_CLOEXEC, 10);
                let err = libc::fcntl(err_fd, libc::F_DUPFD_CLOEXEC, 10);
                if out < 0 || err < 0 || libc::dup2(out, 3) < 0 || libc::dup2(err, 4) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = cmd
            .spawn()
            .map_err(|e| BoxError::runtime("logging", format!("failed to start logger {}: {e}", binary.display())))?;
        drop(out_read);
        drop(err_read);
        tracing::debug!(binary = %binary.display(), pid = child.id(), "started logging binary");

        Ok(Self {
            child,
            stdout: Some(File::from(out_write)),
            stderr: Some(File::from(err_write)),
        })
    }
}

impl LogSink for BinarySink {
    fn write(&mut self, entry: &LogEntry) -> Result<()> {
        let pipe = match entry.stream {
            LogStream::Stdout => self.stdout.as_mut(),
            LogStream::Stderr => self.stderr.as_mut(),
        };
        if let Some(pipe) = pipe {
            pipe.write_all(entry.log.as_bytes())
                .map_err(|e| BoxError::runtime("logging", format!("logger pipe: {e}")))?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // Closing the pipes is the logger's signal to finish.
        self.stdout.take();
        self.stderr.take();
        let status = self.child.wait()?;
        if !status.success() {
            tracing::warn!(code = ?status.code(), "logging binary exited with failure");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_logger_args() {
        let config = LogConfig::from_flags(Some("binary:///usr/bin/logger"), &["a=1".into(), "b=two".into()]).unwrap();
        assert_eq!(logger_args(&config), vec!["a=1", "b=two"]);
    }

    #[test]
    fn test_logger_receives_streams_on_fd3_and_fd4() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("logger.sh");
        let out = dir.path().join("out.txt");
        let err = dir.path().join("err.txt");
        let env = dir.path().join("env.txt");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$CONTAINER_NAME $CONTAINER_NAMESPACE $1\" > {env}\ncat <&3 > {out} &\ncat <&4 > {err}\nwait\n",
                env = env.display(),
                out = out.display(),
                err = err.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = LogConfig::from_flags(
            Some(&format!("binary://{}", script.display())),
            &["mode=test".into()],
        )
        .unwrap();
        let target = LogTarget { namespace: "ns1", id: "abc", name: "web", state_dir: dir.path() };
        let mut sink = BinarySink::spawn(&script, &config, &target).unwrap();
        sink.write(&LogEntry::now(LogStream::Stdout, "to stdout\n")).unwrap();
        sink.write(&LogEntry::now(LogStream::Stderr, "to stderr\n")).unwrap();
        sink.close().unwrap();

        assert_eq!(std::fs::read_to_string(&out).unwrap(), "to stdout\n");
        assert_eq!(std::fs::read_to_string(&err).unwrap(), "to stderr\n");
        assert_eq!(std::fs::read_to_string(&env).unwrap(), "web ns1 mode=test\n");
    }
}
