//! `logs` for containers.

use cdbox_core::error::Result;
use cdbox_core::log::LogEntry;

use super::ContainerManager;
use crate::logging::consumer::{read_logs, LogQuery, LogSource};

impl ContainerManager {
    /// Stream a container's logs into `emit`. Following ends when the task
    /// exits or the manager is cancelled.
    pub async fn logs(
        &self,
        token: &str,
        query: &LogQuery,
        emit: impl FnMut(&LogEntry) -> Result<()> + Send,
    ) -> Result<()> {
        let container = self.find(token).await?;
        let state_dir = self.state_dir(&container);
        let source = LogSource {
            state_dir: &state_dir,
            id: container.id(),
            name: container.name(),
        };
        let live = container.status().is_live();
        let tasks = self.services().tasks.clone();
        let cancel = self.cancel_token().clone();
        let id = container.id().to_string();
        let stopped = async move {
            if !live {
                return;
            }
            tokio::select! {
                res = tasks.wait(&id) => {
                    if let Err(e) = res {
                        tracing::debug!(id = %id, error = %e, "wait during log follow");
                    }
                }
                _ = cancel.cancelled() => {}
            }
        };
        read_logs(&source, query, stopped, emit).await
    }
}
