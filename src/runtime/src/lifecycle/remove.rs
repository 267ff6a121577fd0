//! Container removal and prune.

use std::time::Duration;

use cdbox_core::container::ContainerStatus;
use cdbox_core::error::{BoxError, Result};
use chrono::{DateTime, Utc};

use super::{Container, ContainerManager};
use crate::filters::Filters;
use crate::fs::remove_dir_all_if_exists;
use crate::hook::{attached_networks, HookConfig};

/// Filters accepted by `container prune`.
pub const PRUNE_FILTER_KEYS: &[&str] = &["label", "until"];

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    /// Kill a live container first.
    pub force: bool,
    /// Also destroy the container's anonymous volumes.
    pub volumes: bool,
}

impl ContainerManager {
    /// Remove a container by token; returns the removed container.
    pub async fn remove(&self, token: &str, opts: RemoveOptions) -> Result<Container> {
        let container = self.find(token).await?;
        self.remove_container(&container, opts).await?;
        Ok(container)
    }

    pub async fn remove_container(&self, container: &Container, opts: RemoveOptions) -> Result<()> {
        let _guard = self.locks.lock(container.id()).await;
        let id = container.id();
        let tasks = &self.services().tasks;

        let status = tasks.state(id).await?.status;
        if status.is_live() {
            if !opts.force {
                return Err(BoxError::Precondition(format!(
                    "you cannot remove a {status} container {id}. Stop the container before attempting removal or force remove"
                )));
            }
            self.stop_locked(container, Some(Duration::ZERO)).await?;
        }
        if let Err(e) = tasks.delete(id).await {
            if !opts.force {
                return Err(e);
            }
            tracing::warn!(id, error = %e, "failed to delete task");
        }

        let state_dir = self.state_dir(container);

        // 1. Network detach, best effort.
        if let Ok(config) = HookConfig::load(&state_dir) {
            let attached = attached_networks(&state_dir).unwrap_or_default();
            if !attached.is_empty() {
                crate::hook::detach(&config, &state_dir, self.services().cni.as_ref(), self.networks()).await;
            }
        }

        // 2. Runtime record and its snapshot.
        self.services().containers.delete(id).await?;
        if let Some(key) = &container.record.snapshot_key {
            if let Err(e) = self.services().images.remove_snapshot(key).await {
                tracing::warn!(id, error = %e, "failed to remove snapshot");
            }
        }

        // 3. Anonymous volumes.
        if opts.volumes {
            for volume in &container.labels.anon_volumes {
                if let Err(e) = self.volumes().delete(volume) {
                    tracing::warn!(id, volume = %volume, error = %e, "failed to remove anonymous volume");
                }
            }
        }

        // 4. State directory.
        remove_dir_all_if_exists(&state_dir)?;

        // 5. Name.
        self.names().release(container.name(), id)?;
        self.locks.forget(id);
        tracing::debug!(id, name = %container.name(), "container removed");
        Ok(())
    }

    /// Remove every non-running container matching `filters`.
    ///
    /// Returns the removed IDs with the bytes their snapshots held.
    pub async fn prune(&self, filters: &Filters) -> Result<Vec<(String, u64)>> {
        let until = match filters.get("until").first() {
            Some(raw) => Some(crate::logging::consumer::parse_since(raw, Utc::now())?),
            None => None,
        };
        let mut removed = Vec::new();
        for container in self.containers().await? {
            if !matches!(container.status(), ContainerStatus::Stopped | ContainerStatus::Created) {
                continue;
            }
            if !filters.labels_match(&container.labels.user_labels) {
                continue;
            }
            if !created_before(container.record.created_at, until) {
                continue;
            }
            let size = match &container.record.snapshot_key {
                Some(key) => self.services().images.snapshot_usage(key).await.unwrap_or(0),
                None => 0,
            };
            match self.remove_container(&container, RemoveOptions::default()).await {
                Ok(()) => removed.push((container.id().to_string(), size)),
                Err(e) => tracing::warn!(id = %container.id(), error = %e, "failed to prune container"),
            }
        }
        Ok(removed)
    }
}

fn created_before(created: DateTime<Utc>, until: Option<DateTime<Utc>>) -> bool {
    until.map_or(true, |u| created < u)
}
