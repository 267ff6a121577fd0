//! Starting containers.

use cdbox_core::container::ContainerStatus;
use cdbox_core::error::{BoxError, Result};

use super::{Container, ContainerManager};
use crate::client::{AttachStream, StartOptions};
use crate::context::cancellable;

impl ContainerManager {
    /// Start a container by token. Already running is a no-op.
    ///
    /// With `attach`, the returned stream is connected before the process
    /// starts so no early output is lost.
    pub async fn start(&self, token: &str, attach: bool, stdin: bool) -> Result<Option<AttachStream>> {
        let container = self.find(token).await?;
        self.start_container(&container, attach, stdin).await
    }

    pub async fn start_container(
        &self,
        container: &Container,
        attach: bool,
        stdin: bool,
    ) -> Result<Option<AttachStream>> {
        let _guard = self.locks.lock(container.id()).await;
        let id = container.id();
        let state = self.services().tasks.state(id).await?;
        match state.status {
            ContainerStatus::Running => {
                tracing::debug!(id, "already running");
                return Ok(None);
            }
            ContainerStatus::Paused => {
                return Err(BoxError::Precondition(format!(
                    "cannot start a paused container {}, try unpause instead",
                    container.name()
                )));
            }
            ContainerStatus::Unknown => {
                return Err(BoxError::Precondition(format!(
                    "container {} is in an unknown state",
                    container.name()
                )));
            }
            ContainerStatus::Created | ContainerStatus::Stopped => {}
        }
        let tty = container
            .record
            .spec
            .process()
            .as_ref()
            .and_then(|p| p.terminal())
            .unwrap_or(false);

        let started = cancellable(
            self.cancel_token(),
            self.services().tasks.start(
                &container.record,
                StartOptions { attach, stdin, tty },
            ),
        )
        .await?;

        if let Some(pid_file) = &container.labels.pid_file {
            crate::fs::atomic_write(std::path::Path::new(pid_file), started.pid.to_string().as_bytes())?;
        }
        tracing::debug!(id, pid = started.pid, "container started");
        Ok(started.stream)
    }
}

#[cfg(test)]
mod tests {
    use crate::client::attach::Frame;
    use crate::lifecycle::create::CreateRequest;
    use crate::lifecycle::testutil::{manager, strings};
    use crate::spec::CreateOptions;
    use cdbox_core::container::ContainerStatus;

    fn request(args: &[&str]) -> CreateRequest {
        CreateRequest {
            image: "alpine".to_string(),
            opts: CreateOptions {
                args: strings(args),
                ..CreateOptions::default()
            },
            compose: None,
        }
    }

    #[tokio::test]
    async fn test_start_is_idempotent_on_running() {
        let (fake, mgr) = manager();
        let c = mgr.create(&request(&["sleep", "60"])).await.unwrap();
        mgr.start(c.id(), false, false).await.unwrap();
        mgr.start(c.id(), false, false).await.unwrap();
        assert_eq!(fake.calls().starts.len(), 1);
        assert_eq!(mgr.reload(c.id()).await.unwrap().status(), ContainerStatus::Running);
    }

    #[tokio::test]
    async fn test_attach_start_streams_output() {
        let (_fake, mgr) = manager();
        let c = mgr.create(&request(&["sh", "-c", "exit 3"])).await.unwrap();
        let mut stream = mgr.start(c.id(), true, false).await.unwrap().unwrap();
        let first = stream.recv().await.unwrap().unwrap();
        assert_eq!(first, Frame::Stdout(format!("hello from {}\n", c.id()).into_bytes()));
        assert_eq!(stream.recv().await.unwrap(), Some(Frame::Exit(3)));
    }

    #[tokio::test]
    async fn test_missing_command_exit_code() {
        let (_fake, mgr) = manager();
        let c = mgr.create(&request(&["/nonexistent"])).await.unwrap();
        let err = mgr.start(c.id(), false, false).await.unwrap_err();
        assert_eq!(err.exit_code(), 127);
    }

    #[tokio::test]
    async fn test_pid_file_written() {
        let (fake, mgr) = manager();
        let pid_file = fake.root().join("web.pid");
        let mut req = request(&["sleep", "60"]);
        req.opts.pid_file = Some(pid_file.clone());
        let c = mgr.create(&req).await.unwrap();
        mgr.start(c.id(), false, false).await.unwrap();
        assert_eq!(std::fs::read_to_string(pid_file).unwrap(), "4242");
    }
}
