//! Image builds through BuildKit's `buildctl`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use cdbox_core::error::{BoxError, Result};
use tokio::process::Command;

use super::{BuildRequest, ImageBuilder};

const DEFAULT_BUILDKIT_HOST: &str = "unix:///run/buildkit/buildkitd.sock";

/// Runs `buildctl build` and asks for an OCI tarball.
pub struct BuildctlBuilder {
    binary: PathBuf,
    address: String,
}

impl Default for BuildctlBuilder {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("buildctl"),
            address: std::env::var("BUILDKIT_HOST")
                .unwrap_or_else(|_| DEFAULT_BUILDKIT_HOST.to_string()),
        }
    }
}

impl BuildctlBuilder {
    pub fn new(binary: PathBuf, address: String) -> Self {
        Self { binary, address }
    }

    fn args(&self, req: &BuildRequest, archive: &Path) -> Result<Vec<String>> {
        let context = req.context.display().to_string();
        let dockerfile = req
            .dockerfile
            .clone()
            .unwrap_or_else(|| req.context.join("Dockerfile"));
        let dockerfile = if dockerfile.is_relative() && req.dockerfile.is_some() {
            req.context.join(dockerfile)
        } else {
            dockerfile
        };
        let (dockerfile_dir, filename) = match (dockerfile.parent(), dockerfile.file_name()) {
            (Some(dir), Some(name)) => (dir.to_path_buf(), name.to_string_lossy().into_owned()),
            _ => {
                return Err(BoxError::invalid(format!(
                    "invalid Dockerfile path {}",
                    dockerfile.display()
                )))
            }
        };

        let mut args = vec![
            "--addr".to_string(),
            self.address.clone(),
            "build".to_string(),
            "--frontend".to_string(),
            "dockerfile.v0".to_string(),
            "--local".to_string(),
            format!("context={context}"),
            "--local".to_string(),
            format!("dockerfile={}", dockerfile_dir.display()),
            "--opt".to_string(),
            format!("filename={filename}"),
        ];
        let mut build_args = req.build_args.clone();
        if let Ok(epoch) = std::env::var("SOURCE_DATE_EPOCH") {
            if !build_args.iter().any(|(k, _)| k == "SOURCE_DATE_EPOCH") {
                build_args.push(("SOURCE_DATE_EPOCH".to_string(), epoch));
            }
        }
        for (key, value) in &build_args {
            args.push("--opt".to_string());
            args.push(format!("build-arg:{key}={value}"));
        }
        let mut labels: Vec<_> = req.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            args.push("--opt".to_string());
            args.push(format!("label:{key}={value}"));
        }
        if let Some(target) = &req.target {
            args.push("--opt".to_string());
            args.push(format!("target={target}"));
        }
        if let Some(platform) = &req.platform {
            args.push("--opt".to_string());
            args.push(format!("platform={platform}"));
        }
        if req.no_cache {
            args.push("--no-cache".to_string());
        }

        let mut output = format!("type=oci,dest={}", archive.display());
        let names = req
            .tags
            .iter()
            .map(|t| super::image::normalize_reference(t))
            .collect::<Result<Vec<_>>>()?;
        if !names.is_empty() {
            output.push_str(&format!(",\"name={}\"", names.join(",")));
        }
        args.push("--output".to_string());
        args.push(output);
        Ok(args)
    }
}

#[async_trait]
impl ImageBuilder for BuildctlBuilder {
    async fn build(&self, req: &BuildRequest, out_dir: &Path) -> Result<PathBuf> {
        if !req.context.is_dir() {
            return Err(BoxError::invalid(format!(
                "build context {} is not a directory",
                req.context.display()
            )));
        }
        let archive = out_dir.join("image.tar");
        let args = self.args(req, &archive)?;
        tracing::debug!(binary = %self.binary.display(), ?args, "running buildctl");

        let status = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| {
                BoxError::runtime(
                    "build",
                    format!("failed to run {}: {} (is buildkit installed?)", self.binary.display(), e),
                )
            })?;
        if !status.success() {
            return Err(BoxError::runtime(
                "build",
                format!("buildctl exited with {}", status.code().unwrap_or(-1)),
            ));
        }
        if !archive.exists() {
            return Err(BoxError::runtime("build", "buildctl produced no image archive"));
        }
        Ok(archive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn builder() -> BuildctlBuilder {
        BuildctlBuilder::new(PathBuf::from("buildctl"), "unix:///tmp/bk.sock".to_string())
    }

    #[test]
    fn test_args_basic() {
        let req = BuildRequest {
            context: PathBuf::from("/src/app"),
            tags: vec!["app:dev".to_string()],
            build_args: vec![("VERSION".to_string(), "1.2".to_string())],
            target: Some("runtime".to_string()),
            no_cache: true,
            labels: HashMap::from([("team".to_string(), "infra".to_string())]),
            ..Default::default()
        };
        let args = builder().args(&req, Path::new("/tmp/out/image.tar")).unwrap();
        let joined = args.join(" ");
        assert!(joined.starts_with("--addr unix:///tmp/bk.sock build --frontend dockerfile.v0"));
        assert!(joined.contains("--local context=/src/app"));
        assert!(joined.contains("--local dockerfile=/src/app"));
        assert!(joined.contains("--opt filename=Dockerfile"));
        assert!(joined.contains("--opt build-arg:VERSION=1.2"));
        assert!(joined.contains("--opt label:team=infra"));
        assert!(joined.contains("--opt target=runtime"));
        assert!(joined.contains("--no-cache"));
        assert_eq!(
            args.last().unwrap(),
            "type=oci,dest=/tmp/out/image.tar,\"name=docker.io/library/app:dev\""
        );
    }

    #[test]
    fn test_args_custom_dockerfile() {
        let req = BuildRequest {
            context: PathBuf::from("/src/app"),
            dockerfile: Some(PathBuf::from("docker/Dockerfile.prod")),
            ..Default::default()
        };
        let args = builder().args(&req, Path::new("/o/image.tar")).unwrap();
        assert!(args.contains(&"dockerfile=/src/app/docker".to_string()));
        assert!(args.contains(&"filename=Dockerfile.prod".to_string()));
        assert_eq!(args.last().unwrap(), "type=oci,dest=/o/image.tar");
    }

    #[tokio::test]
    async fn test_build_rejects_missing_context() {
        let req = BuildRequest {
            context: PathBuf::from("/definitely/not/here"),
            ..Default::default()
        };
        let err = builder().build(&req, Path::new("/tmp")).await.unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }
}
