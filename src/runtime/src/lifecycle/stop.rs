//! Stop, kill, pause, unpause, wait and restart.

use std::time::Duration;

use cdbox_core::container::ContainerStatus;
use cdbox_core::error::{BoxError, Result};
use cdbox_core::signal::{parse_signal, DEFAULT_STOP_SIGNAL};

use super::{Container, ContainerManager, DEFAULT_STOP_TIMEOUT};
use crate::client::ExitStatus;
use crate::context::cancellable;

impl ContainerManager {
    /// Stop a container; already stopped is a success.
    ///
    /// `timeout` overrides the container's configured grace period.
    pub async fn stop(&self, token: &str, timeout: Option<Duration>) -> Result<Container> {
        let container = self.find(token).await?;
        let _guard = self.locks.lock(container.id()).await;
        self.stop_locked(&container, timeout).await?;
        Ok(container)
    }

    /// Stop with the container lock already held by the caller.
    pub(crate) async fn stop_locked(&self, container: &Container, timeout: Option<Duration>) -> Result<()> {
        let id = container.id();
        let tasks = &self.services().tasks;
        let state = tasks.state(id).await?;
        if !state.status.is_live() {
            tracing::debug!(id, status = %state.status, "stop: not running");
            return Ok(());
        }

        let grace = timeout.unwrap_or_else(|| {
            Duration::from_secs(container.labels.stop_timeout.unwrap_or(DEFAULT_STOP_TIMEOUT))
        });
        let signal = parse_signal(
            container
                .labels
                .stop_signal
                .as_deref()
                .unwrap_or(DEFAULT_STOP_SIGNAL),
        )?;

        if state.status == ContainerStatus::Paused {
            // A frozen task cannot handle the stop signal.
            self.send_signal(id, libc::SIGKILL, true).await?;
            if let Err(e) = tasks.resume(id).await {
                tracing::debug!(id, error = %e, "resume after kill");
            }
        } else {
            self.send_signal(id, signal, false).await?;
            if !grace.is_zero() {
                match tokio::time::timeout(grace, cancellable(self.cancel_token(), tasks.wait(id))).await {
                    Ok(res) => {
                        let exit = res?;
                        tracing::debug!(id, code = exit.code, "stopped within grace period");
                        return self.release_task(id).await;
                    }
                    Err(_) => {
                        tracing::debug!(id, ?grace, "grace period expired, sending SIGKILL");
                    }
                }
            }
            self.send_signal(id, libc::SIGKILL, true).await?;
        }
        cancellable(self.cancel_token(), tasks.wait(id)).await?;
        self.release_task(id).await
    }

    /// Signal a task, treating a task that already exited as success.
    async fn send_signal(&self, id: &str, signal: i32, all: bool) -> Result<()> {
        match self.services().tasks.kill(id, signal, all).await {
            Ok(()) => Ok(()),
            Err(BoxError::Precondition(msg)) => {
                tracing::debug!(id, signal, reason = %msg, "signal not delivered");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn release_task(&self, id: &str) -> Result<()> {
        if let Err(e) = self.services().tasks.delete(id).await {
            tracing::warn!(id, error = %e, "failed to delete stopped task");
        }
        Ok(())
    }

    /// Send `signal` (default SIGKILL) without waiting; already stopped is a success.
    pub async fn kill(&self, token: &str, signal: Option<&str>) -> Result<Container> {
        let signal = parse_signal(signal.unwrap_or("SIGKILL"))?;
        let container = self.find(token).await?;
        let _guard = self.locks.lock(container.id()).await;
        let state = self.services().tasks.state(container.id()).await?;
        if state.status.is_live() {
            self.send_signal(container.id(), signal, false).await?;
        }
        Ok(container)
    }

    pub async fn pause(&self, token: &str) -> Result<Container> {
        let container = self.find(token).await?;
        let _guard = self.locks.lock(container.id()).await;
        let status = self.services().tasks.state(container.id()).await?.status;
        if !status.can_transition(ContainerStatus::Paused) {
            let reason = if status == ContainerStatus::Paused {
                "is already paused"
            } else {
                "is not running"
            };
            return Err(BoxError::Precondition(format!(
                "container {} {reason}",
                container.name()
            )));
        }
        self.services().tasks.pause(container.id()).await?;
        Ok(container)
    }

    pub async fn unpause(&self, token: &str) -> Result<Container> {
        let container = self.find(token).await?;
        let _guard = self.locks.lock(container.id()).await;
        let status = self.services().tasks.state(container.id()).await?.status;
        if status != ContainerStatus::Paused {
            return Err(BoxError::Precondition(format!(
                "container {} is not paused",
                container.name()
            )));
        }
        self.services().tasks.resume(container.id()).await?;
        Ok(container)
    }

    /// Block until the container's task exits.
    pub async fn wait(&self, token: &str) -> Result<ExitStatus> {
        let container = self.find(token).await?;
        self.wait_container(container.id()).await
    }

    pub async fn wait_container(&self, id: &str) -> Result<ExitStatus> {
        cancellable(self.cancel_token(), self.services().tasks.wait(id)).await
    }

    /// Stop (if running) then start again.
    pub async fn restart(&self, token: &str, timeout: Option<Duration>) -> Result<Container> {
        let container = self.stop(token, timeout).await?;
        self.start_container(&container, false, false).await?;
        Ok(container)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cdbox_core::container::ContainerStatus;

    use crate::lifecycle::create::CreateRequest;
    use crate::lifecycle::testutil::{manager, strings};
    use crate::spec::CreateOptions;

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
    async fn test_stop_with_sigterm() {
        let (fake, mgr) = manager();
        let c = mgr.create(&request(&["sleep", "60"])).await.unwrap();
        mgr.start(c.id(), false, false).await.unwrap();
        mgr.stop(c.id(), None).await.unwrap();

        let kills = fake.calls().kills;
        assert_eq!(kills, vec![(c.id().to_string(), libc::SIGTERM)]);
        let state = mgr.reload(c.id()).await.unwrap().state;
        assert_eq!(state.status, ContainerStatus::Stopped);
        assert_eq!(state.exit_code, Some(128 + libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let (fake, mgr) = manager();
        let c = mgr.create(&request(&["ignore-term"])).await.unwrap();
        mgr.start(c.id(), false, false).await.unwrap();
        mgr.stop(c.id(), Some(Duration::from_millis(50))).await.unwrap();

        let signals: Vec<i32> = fake.calls().kills.into_iter().map(|(_, s)| s).collect();
        assert_eq!(signals, vec![libc::SIGTERM, libc::SIGKILL]);
        assert_eq!(mgr.reload(c.id()).await.unwrap().status(), ContainerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_and_kill_idempotent() {
        let (fake, mgr) = manager();
        let c = mgr.create(&request(&["sleep", "60"])).await.unwrap();
        // Never started.
        mgr.stop(c.id(), None).await.unwrap();
        mgr.kill(c.id(), None).await.unwrap();
        assert!(fake.calls().kills.is_empty());

        mgr.start(c.id(), false, false).await.unwrap();
        mgr.kill(c.id(), Some("SIGKILL")).await.unwrap();
        mgr.stop(c.id(), None).await.unwrap();
        mgr.kill(c.id(), None).await.unwrap();
        assert_eq!(fake.calls().kills.len(), 1);
    }

    #[tokio::test]
    async fn test_custom_stop_signal() {
        let (fake, mgr) = manager();
        let mut req = request(&["sleep", "60"]);
        req.opts.stop_signal = Some("SIGQUIT".into());
        let c = mgr.create(&req).await.unwrap();
        mgr.start(c.id(), false, false).await.unwrap();
        mgr.stop(c.id(), None).await.unwrap();
        assert_eq!(fake.calls().kills[0].1, libc::SIGQUIT);
    }

    #[tokio::test]
    async fn test_pause_unpause_transitions() {
        let (_fake, mgr) = manager();
        let c = mgr.create(&request(&["sleep", "60"])).await.unwrap();
        assert!(mgr.pause(c.id()).await.is_err());
        mgr.start(c.id(), false, false).await.unwrap();
        mgr.pause(c.id()).await.unwrap();
        assert_eq!(mgr.reload(c.id()).await.unwrap().status(), ContainerStatus::Paused);
        assert!(mgr.pause(c.id()).await.is_err());
        mgr.unpause(c.id()).await.unwrap();
        assert!(mgr.unpause(c.id()).await.is_err());

        // Stopping a paused container kills it.
        mgr.pause(c.id()).await.unwrap();
        mgr.stop(c.id(), None).await.unwrap();
        assert_eq!(mgr.reload(c.id()).await.unwrap().status(), ContainerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_wait_and_restart() {
        let (fake, mgr) = manager();
        let c = mgr.create(&request(&["sleep", "60"])).await.unwrap();
        mgr.start(c.id(), false, false).await.unwrap();

        let id = c.id().to_string();
        let exiter = fake.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            exiter.exit_task(&id, 7);
        });
        assert_eq!(mgr.wait(c.id()).await.unwrap().code, 7);

        mgr.restart(c.id(), None).await.unwrap();
        assert_eq!(fake.calls().starts.len(), 2);
        assert_eq!(mgr.reload(c.id()).await.unwrap().status(), ContainerStatus::Running);
    }
}
