//! Commit, diff and rename.

use cdbox_core::container::ContainerStatus;
use cdbox_core::error::{BoxError, Result};

use super::ContainerManager;
use crate::client::{CommitRequest, FileChange, ImageConfig, ImageInfo};

#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// Target `name[:tag]`; empty produces a dangling image.
    pub reference: String,
    pub author: Option<String>,
    pub message: Option<String>,
    /// Dockerfile instructions applied to the config (`--change`).
    pub changes: Vec<String>,
    /// Freeze the container while its filesystem is read.
    pub pause: bool,
}

/// Split a JSON-array or shell-form instruction argument.
fn instruction_args(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.starts_with('[') {
        if let Ok(list) = serde_json::from_str::<Vec<String>>(raw) {
            return list;
        }
    }
    vec!["/bin/sh".to_string(), "-c".to_string(), raw.to_string()]
}

/// Apply `--change` instructions to an image config.
pub fn apply_changes(config: &mut ImageConfig, changes: &[String]) -> Result<()> {
    for change in changes {
        let change = change.trim();
        let (instruction, rest) = change
            .split_once(char::is_whitespace)
            .map(|(i, r)| (i, r.trim()))
            .unwrap_or((change, ""));
        match instruction.to_ascii_uppercase().as_str() {
            "CMD" => config.cmd = Some(instruction_args(rest)),
            "ENTRYPOINT" => config.entrypoint = Some(instruction_args(rest)),
            "ENV" => {
                let (k, v) = rest
                    .split_once('=')
                    .or_else(|| rest.split_once(char::is_whitespace))
                    .ok_or_else(|| BoxError::invalid(format!("ENV requires a value: {change:?}")))?;
                let prefix = format!("{}=", k.trim());
                config.env.retain(|e| !e.starts_with(&prefix));
                config.env.push(format!("{}={}", k.trim(), v.trim()));
            }
            "EXPOSE" => {
                for port in rest.split_whitespace() {
                    let port = if port.contains('/') {
                        port.to_string()
                    } else {
                        format!("{port}/tcp")
                    };
                    if !config.exposed_ports.contains(&port) {
                        config.exposed_ports.push(port);
                    }
                }
            }
            "LABEL" => {
                let (k, v) = rest
                    .split_once('=')
                    .ok_or_else(|| BoxError::invalid(format!("LABEL requires key=value: {change:?}")))?;
                config
                    .labels
                    .insert(k.trim().to_string(), v.trim().trim_matches('"').to_string());
            }
            "USER" => config.user = Some(rest.to_string()),
            "WORKDIR" => config.working_dir = Some(rest.to_string()),
            "VOLUME" => {
                let paths = if rest.starts_with('[') {
                    instruction_args(rest)
                } else {
                    rest.split_whitespace().map(str::to_string).collect()
                };
                for path in paths {
                    if !config.volumes.contains(&path) {
                        config.volumes.push(path);
                    }
                }
            }
            "STOPSIGNAL" => config.stop_signal = Some(rest.to_string()),
            other => {
                return Err(BoxError::invalid(format!(
                    "unsupported --change instruction {other:?}"
                )))
            }
        }
    }
    Ok(())
}

impl ContainerManager {
    /// Create an image from a container's filesystem changes.
    pub async fn commit(&self, token: &str, opts: &CommitOptions) -> Result<ImageInfo> {
        let container = self.find(token).await?;
        let _guard = self.locks.lock(container.id()).await;
        let snapshot_key = container.record.snapshot_key.clone().ok_or_else(|| {
            BoxError::Precondition(format!(
                "container {} has no snapshot to commit (created with --rootfs)",
                container.name()
            ))
        })?;
        let base = self.services().images.get(&container.record.image).await?;
        let mut config = base.config.clone();
        apply_changes(&mut config, &opts.changes)?;

        let tasks = &self.services().tasks;
        let paused = opts.pause && container.status() == ContainerStatus::Running;
        if paused {
            tasks.pause(container.id()).await?;
        }
        let result = self
            .services()
            .images
            .commit(CommitRequest {
                snapshot_key,
                base_image: base.name.clone(),
                reference: opts.reference.clone(),
                author: opts.author.clone(),
                message: opts.message.clone(),
                config,
            })
            .await;
        if paused {
            if let Err(e) = tasks.resume(container.id()).await {
                tracing::warn!(id = %container.id(), error = %e, "failed to resume after commit");
            }
        }
        result
    }

    /// Filesystem changes against the container's image.
    pub async fn diff(&self, token: &str) -> Result<Vec<FileChange>> {
        let container = self.find(token).await?;
        let key = container.record.snapshot_key.as_deref().ok_or_else(|| {
            BoxError::Precondition(format!("container {} has no snapshot", container.name()))
        })?;
        self.services().images.diff(key).await
    }

    /// Give a container a new name.
    pub async fn rename(&self, token: &str, new_name: &str) -> Result<()> {
        let container = self.find(token).await?;
        let _guard = self.locks.lock(container.id()).await;
        let old = container.name().to_string();
        if old == new_name {
            return Err(BoxError::invalid(format!(
                "renaming a container with the same name as its current name: {new_name}"
            )));
        }
        self.names().rename(&old, new_name, container.id())?;

        let mut labels = container.labels.clone();
        labels.name = new_name.to_string();
        let update = match labels.to_map() {
            Ok(map) => self.services().containers.update_labels(container.id(), map).await,
            Err(e) => Err(e),
        };
        if let Err(e) = update {
            if let Err(revert) = self.names().rename(new_name, &old, container.id()) {
                tracing::warn!(id = %container.id(), error = %revert, "failed to restore name reservation");
            }
            return Err(e);
        }
        tracing::debug!(id = %container.id(), from = %old, to = %new_name, "renamed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::create::CreateRequest;
    use crate::lifecycle::testutil::{manager, strings};
    use crate::spec::CreateOptions;

    #[test]
    fn test_apply_changes() {
        let mut config = ImageConfig {
            env: strings(&["A=1"]),
            ..ImageConfig::default()
        };
        apply_changes(
            &mut config,
            &strings(&[
                "CMD [\"nginx\", \"-g\", \"daemon off;\"]",
                "ENTRYPOINT /docker-entrypoint.sh",
                "ENV A=2",
                "EXPOSE 80 53/udp",
                "LABEL tier=\"web\"",
                "USER nginx",
                "WORKDIR /srv",
                "VOLUME /data",
                "STOPSIGNAL SIGQUIT",
            ]),
        )
        .unwrap();
        assert_eq!(config.cmd, Some(strings(&["nginx", "-g", "daemon off;"])));
        assert_eq!(
            config.entrypoint,
            Some(strings(&["/bin/sh", "-c", "/docker-entrypoint.sh"]))
        );
        assert_eq!(config.env, strings(&["A=2"]));
        assert_eq!(config.exposed_ports, strings(&["80/tcp", "53/udp"]));
        assert_eq!(config.labels.get("tier").map(String::as_str), Some("web"));
        assert_eq!(config.user.as_deref(), Some("nginx"));
        assert_eq!(config.working_dir.as_deref(), Some("/srv"));
        assert_eq!(config.volumes, strings(&["/data"]));
        assert_eq!(config.stop_signal.as_deref(), Some("SIGQUIT"));

        assert!(apply_changes(&mut config, &strings(&["RUN make"])).is_err());
    }

    fn request(name: &str) -> CreateRequest {
        CreateRequest {
            image: "alpine".to_string(),
            opts: CreateOptions {
                name: Some(name.to_string()),
                args: strings(&["sleep", "60"]),
                ..CreateOptions::default()
            },
            compose: None,
        }
    }

    #[tokio::test]
    async fn test_commit_pauses_running_container() {
        let (fake, mgr) = manager();
        let c = mgr.create(&request("c")).await.unwrap();
        mgr.start(c.id(), false, false).await.unwrap();
        let opts = CommitOptions {
            reference: "snap:v1".into(),
            changes: strings(&["CMD [\"true\"]"]),
            pause: true,
            ..CommitOptions::default()
        };
        let image = mgr.commit("c", &opts).await.unwrap();
        assert_eq!(image.config.cmd, Some(strings(&["true"])));
        assert_eq!(fake.calls().commits, vec![c.id().to_string()]);
        assert_eq!(mgr.reload(c.id()).await.unwrap().status(), ContainerStatus::Running);
        assert!(mgr.services().images.get("snap:v1").await.is_ok());
    }

    #[tokio::test]
    async fn test_rename() {
        let (_fake, mgr) = manager();
        let c = mgr.create(&request("old")).await.unwrap();
        mgr.create(&request("taken")).await.unwrap();

        assert!(matches!(mgr.rename("old", "taken").await, Err(BoxError::AlreadyExists(_))));
        assert!(mgr.rename("old", "old").await.is_err());

        mgr.rename("old", "new").await.unwrap();
        assert_eq!(mgr.reload(c.id()).await.unwrap().name(), "new");
        assert_eq!(mgr.names().owner("new").as_deref(), Some(c.id()));
        assert!(mgr.names().owner("old").is_none());
        assert!(mgr.find("old").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_diff_uses_snapshot() {
        let (_fake, mgr) = manager();
        mgr.create(&request("c")).await.unwrap();
        assert!(mgr.diff("c").await.unwrap().is_empty());
    }
}
