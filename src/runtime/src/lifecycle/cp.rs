//! Copying files between the host and a container.
//!
//! Container paths are resolved against the container's mounts first and
//! its root filesystem otherwise, so the copy sees what the process sees.

use std::path::{Component, Path, PathBuf};

use cdbox_core::container::MountType;
use cdbox_core::error::{BoxError, Result};

use super::{Container, ContainerManager};
use crate::fs::copy_dir_recursive;

/// Lexically normalize an absolute container path; `..` never climbs above `/`.
fn clean(path: &str) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// Where a container path lives on the host, and whether it may be written.
struct HostPath {
    path: PathBuf,
    writable: bool,
}

impl ContainerManager {
    fn host_path(&self, container: &Container, container_path: &str) -> HostPath {
        let target = clean(container_path);
        let mount = container
            .labels
            .mounts
            .iter()
            .filter(|m| m.kind != MountType::Tmpfs)
            .filter(|m| target.starts_with(&m.destination))
            .max_by_key(|m| m.destination.len());
        if let Some(m) = mount {
            let rel = target.strip_prefix(&m.destination).unwrap_or(Path::new(""));
            return HostPath {
                path: Path::new(&m.source).join(rel),
                writable: !m.read_only(),
            };
        }
        let readonly_root = container
            .record
            .spec
            .root()
            .as_ref()
            .and_then(|r| r.readonly())
            .unwrap_or(false);
        let rel = target.strip_prefix("/").unwrap_or(&target);
        HostPath {
            path: self.rootfs(container).join(rel),
            writable: !readonly_root,
        }
    }

    /// `cp <container>:<src> <dest>`.
    pub async fn copy_from(&self, token: &str, src: &str, dest: &Path) -> Result<PathBuf> {
        let container = self.find(token).await?;
        let from = self.host_path(&container, src);
        if !from.path.exists() {
            return Err(BoxError::not_found("path", format!("{}:{src}", container.name())));
        }
        let to = copy_target(&from.path, dest)?;
        copy_any(&from.path, &to)?;
        tracing::debug!(id = %container.id(), src, dest = %to.display(), "copied from container");
        Ok(to)
    }

    /// `cp <src> <container>:<dest>`.
    pub async fn copy_to(&self, token: &str, src: &Path, dest: &str) -> Result<PathBuf> {
        let container = self.find(token).await?;
        if !src.exists() {
            return Err(BoxError::not_found("path", src.display().to_string()));
        }
        let to = self.host_path(&container, dest);
        if !to.writable {
            return Err(BoxError::Precondition(format!(
                "container path {dest} is on a read-only filesystem"
            )));
        }
        if dest.ends_with('/') && !to.path.is_dir() {
            return Err(BoxError::not_found("directory", format!("{}:{dest}", container.name())));
        }
        let target = copy_target(src, &to.path)?;
        copy_any(src, &target)?;
        tracing::debug!(id = %container.id(), src = %src.display(), dest, "copied into container");
        Ok(target)
    }
}

/// Docker's rule: copying into an existing directory nests the source under
/// its own base name, anything else replaces or creates `dest`.
fn copy_target(src: &Path, dest: &Path) -> Result<PathBuf> {
    if dest.is_dir() {
        let name = src
            .file_name()
            .ok_or_else(|| BoxError::invalid(format!("cannot copy {}", src.display())))?;
        return Ok(dest.join(name));
    }
    match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => Err(BoxError::not_found(
            "directory",
            parent.display().to_string(),
        )),
        _ => Ok(dest.to_path_buf()),
    }
}

fn copy_any(src: &Path, dest: &Path) -> Result<()> {
    if src.is_dir() {
        copy_dir_recursive(src, dest)?;
    } else {
        std::fs::copy(src, dest)?;
    }
    Ok(())
}
