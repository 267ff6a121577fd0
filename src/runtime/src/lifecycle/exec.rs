//! Auxiliary processes in running containers.

use std::path::PathBuf;

use cdbox_core::container::ContainerStatus;
use cdbox_core::error::{BoxError, Result};
use oci_spec::runtime::{Capability, LinuxCapabilitiesBuilder, Process, UserBuilder};

use super::{Container, ContainerManager};
use crate::client::ExecRequest;
use crate::context::cancellable;
use crate::ids::random_hex;
use crate::spec::draft::{parse_capability, ALL_CAPS};
use crate::spec::env::{build_env, read_env_files};
use crate::spec::user::UserDb;

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub args: Vec<String>,
    pub tty: bool,
    pub interactive: bool,
    pub detach: bool,
    /// Overrides the container user.
    pub user: Option<String>,
    /// Overrides the container working directory.
    pub workdir: Option<String>,
    pub env: Vec<String>,
    pub env_files: Vec<PathBuf>,
    pub privileged: bool,
}

impl ContainerManager {
    /// Run a process in a running container and return its exit code.
    pub async fn exec(&self, token: &str, opts: &ExecOptions) -> Result<i32> {
        let container = self.find(token).await?;
        self.exec_in(&container, opts, false).await
    }

    /// Exec with output discarded when `quiet` (health probes).
    pub(crate) async fn exec_in(&self, container: &Container, opts: &ExecOptions, quiet: bool) -> Result<i32> {
        if opts.args.is_empty() {
            return Err(BoxError::invalid("exec requires at least one argument"));
        }
        let status = self.services().tasks.state(container.id()).await?.status;
        match status {
            ContainerStatus::Running => {}
            ContainerStatus::Paused => {
                return Err(BoxError::Precondition(format!(
                    "container {} is paused, unpause the container before exec",
                    container.name()
                )))
            }
            _ => {
                return Err(BoxError::Precondition(format!(
                    "container {} is not running",
                    container.name()
                )))
            }
        }

        let process = self.exec_process(container, opts)?;
        let req = ExecRequest {
            exec_id: format!("exec-{}", random_hex(8)),
            process,
            detach: opts.detach,
            stdin: opts.interactive,
            quiet,
        };
        tracing::debug!(id = %container.id(), exec_id = %req.exec_id, args = ?opts.args, "exec");
        cancellable(self.cancel_token(), self.services().tasks.exec(container.id(), req)).await
    }

    /// Derive the exec process from the container's init process.
    fn exec_process(&self, container: &Container, opts: &ExecOptions) -> Result<Process> {
        let mut process = container
            .record
            .spec
            .process()
            .clone()
            .ok_or_else(|| BoxError::runtime("exec", "container spec has no process"))?;

        process.set_args(Some(opts.args.clone()));
        process.set_terminal(Some(opts.tty));
        // Console size belongs to the init process.
        process.set_console_size(None);

        if let Some(dir) = &opts.workdir {
            if !dir.starts_with('/') {
                return Err(BoxError::invalid(format!(
                    "the working directory {dir:?} is invalid, it needs to be an absolute path"
                )));
            }
            process.set_cwd(PathBuf::from(dir));
        }

        let base = process.env().clone().unwrap_or_default();
        let files = read_env_files(&opts.env_files)?;
        let host = |key: &str| std::env::var(key).ok();
        let env = build_env(&base, &files, &opts.env, &host)?;
        process.set_env(Some(env.into_vec()));

        if let Some(user) = opts.user.as_deref().filter(|u| !u.is_empty()) {
            let resolved = UserDb::load(&self.rootfs(container)).resolve(user)?;
            let mut builder = UserBuilder::default()
                .uid(resolved.uid)
                .gid(resolved.gid)
                .additional_gids(resolved.additional_gids);
            if let Some(name) = resolved.username {
                builder = builder.username(name);
            }
            process.set_user(builder.build().map_err(|e| BoxError::runtime("exec", e))?);
        }

        if opts.privileged {
            let caps = ALL_CAPS
                .iter()
                .map(|c| parse_capability(c))
                .collect::<Result<std::collections::HashSet<Capability>>>()?;
            let capabilities = LinuxCapabilitiesBuilder::default()
                .bounding(caps.clone())
                .effective(caps.clone())
                .permitted(caps)
                .build()
                .map_err(|e| BoxError::runtime("exec", e))?;
            process.set_capabilities(Some(capabilities));
        }
        Ok(process)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::create::CreateRequest;
    use crate::lifecycle::testutil::{manager, strings};
    use crate::spec::CreateOptions;

    async fn running(mgr: &ContainerManager, env: &[&str]) -> Container {
        let req = CreateRequest {
            image: "alpine".to_string(),
            opts: CreateOptions {
                args: strings(&["sleep", "60"]),
                env: strings(env),
                workdir: Some("/srv".into()),
                ..CreateOptions::default()
            },
            compose: None,
        };
        let c = mgr.create(&req).await.unwrap();
        mgr.start(c.id(), false, false).await.unwrap();
        mgr.reload(c.id()).await.unwrap()
    }

    #[tokio::test]
    async fn test_exec_inherits_container_process() {
        let (fake, mgr) = manager();
        let c = running(&mgr, &["MODE=prod"]).await;
        let opts = ExecOptions {
            args: strings(&["env"]),
            env: strings(&["EXTRA=1"]),
            ..ExecOptions::default()
        };
        let process = mgr.exec_process(&c, &opts).unwrap();
        assert_eq!(process.cwd(), &PathBuf::from("/srv"));
        let env = process.env().clone().unwrap();
        assert!(env.contains(&"MODE=prod".to_string()));
        assert!(env.contains(&"EXTRA=1".to_string()));

        fake.push_exec_codes(&[3]);
        assert_eq!(mgr.exec(c.id(), &opts).await.unwrap(), 3);
        assert_eq!(fake.calls().execs, vec![(c.id().to_string(), strings(&["env"]))]);
    }

    #[tokio::test]
    async fn test_exec_overrides() {
        let (_fake, mgr) = manager();
        let c = running(&mgr, &[]).await;
        let opts = ExecOptions {
            args: strings(&["id"]),
            user: Some("1000:1000".into()),
            workdir: Some("/tmp".into()),
            privileged: true,
            ..ExecOptions::default()
        };
        let process = mgr.exec_process(&c, &opts).unwrap();
        assert_eq!(process.user().uid(), 1000);
        assert_eq!(process.user().gid(), 1000);
        assert_eq!(process.cwd(), &PathBuf::from("/tmp"));
        let caps = process.capabilities().clone().unwrap();
        assert_eq!(caps.bounding().as_ref().unwrap().len(), ALL_CAPS.len());

        let relative = ExecOptions {
            workdir: Some("tmp".into()),
            ..opts
        };
        assert!(mgr.exec_process(&c, &relative).is_err());
    }

    #[tokio::test]
    async fn test_exec_requires_running() {
        let (_fake, mgr) = manager();
        let req = CreateRequest {
            image: "alpine".to_string(),
            opts: CreateOptions {
                args: strings(&["sleep", "60"]),
                ..CreateOptions::default()
            },
            compose: None,
        };
        let c = mgr.create(&req).await.unwrap();
        let opts = ExecOptions {
            args: strings(&["true"]),
            ..ExecOptions::default()
        };
        assert!(matches!(mgr.exec(c.id(), &opts).await, Err(BoxError::Precondition(_))));

        mgr.start(c.id(), false, false).await.unwrap();
        mgr.pause(c.id()).await.unwrap();
        let err = mgr.exec(c.id(), &opts).await.unwrap_err();
        assert!(err.to_string().contains("paused"));
    }
}
