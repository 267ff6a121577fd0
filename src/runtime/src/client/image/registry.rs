//! Registry client for pulling and pushing images.
//!
//! Uses `oci-distribution`. Pulled content lands directly in the blob store;
//! pushes read manifest, config and layers back out of it.

use cdbox_core::error::{BoxError, Result};
use std::path::PathBuf;

use oci_distribution::client::{
    Certificate, CertificateEncoding, ClientConfig, ClientProtocol, Config, ImageLayer,
};
use oci_distribution::manifest::{ImageIndexEntry, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};

use super::credentials::CredentialStore;
use super::layout::{sha256_digest, ImageStore, Manifest};
use super::reference::ImageReference;

/// Credentials for one registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Credentials from the Docker config file, else anonymous.
    pub fn for_registry(registry: &str) -> Self {
        match CredentialStore::default_path().and_then(|s| s.get(registry)) {
            Ok(Some((username, password))) => Self::basic(username, password),
            Ok(None) => Self::anonymous(),
            Err(e) => {
                tracing::warn!(registry, error = %e, "ignoring unreadable credentials");
                Self::anonymous()
            }
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Platform selector, `os/arch[/variant]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Platform {
    /// The platform of this host.
    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "arm" => "arm",
            "powerpc64" => "ppc64le",
            other => other,
        };
        Self {
            os: "linux".to_string(),
            architecture: architecture.to_string(),
            variant: None,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: None,
            }),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: Some(variant.to_string()),
            }),
            _ => Err(BoxError::invalid(format!(
                "invalid platform {s:?} (expected os/arch[/variant])"
            ))),
        }
    }

    fn matches(&self, entry: &ImageIndexEntry) -> bool {
        entry.platform.as_ref().map_or(false, |p| {
            p.os == self.os
                && p.architecture == self.architecture
                && (self.variant.is_none() || p.variant == self.variant)
        })
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(v) = &self.variant {
            write!(f, "/{v}")?;
        }
        Ok(())
    }
}

/// Result of a pull: where the manifest landed in the store.
#[derive(Debug, Clone)]
pub struct Pulled {
    pub manifest_digest: String,
    pub repo_digest: String,
}

pub struct RegistryClient {
    insecure: bool,
    /// `certs.d`-style directories: `<dir>/<registry>/*.crt`.
    hosts_dirs: Vec<PathBuf>,
}

impl RegistryClient {
    pub fn new(insecure: bool, hosts_dirs: Vec<PathBuf>) -> Self {
        Self {
            insecure,
            hosts_dirs,
        }
    }

    fn extra_certificates(&self, registry: &str) -> Vec<Certificate> {
        let mut certs = Vec::new();
        for dir in &self.hosts_dirs {
            let Ok(entries) = std::fs::read_dir(dir.join(registry)) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("crt") {
                    continue;
                }
                match std::fs::read(&path) {
                    Ok(data) => certs.push(Certificate {
                        encoding: CertificateEncoding::Pem,
                        data,
                    }),
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping CA file"),
                }
            }
        }
        certs
    }

    fn client(&self, registry: &str, platform: Option<Platform>) -> Client {
        let local = registry.starts_with("localhost") || registry.starts_with("127.0.0.1");
        let protocol = if self.insecure || local {
            ClientProtocol::HttpsExcept(vec![registry.to_string()])
        } else {
            ClientProtocol::Https
        };
        let platform = platform.unwrap_or_else(Platform::host);
        let config = ClientConfig {
            protocol,
            platform_resolver: Some(Box::new(move |manifests: &[ImageIndexEntry]| {
                manifests
                    .iter()
                    .find(|entry| platform.matches(entry))
                    .map(|entry| entry.digest.clone())
            })),
            extra_root_certificates: self.extra_certificates(registry),
            ..Default::default()
        };
        Client::new(config)
    }

    /// Pull an image into `store`. Blobs already present are not fetched again.
    pub async fn pull(
        &self,
        reference: &ImageReference,
        platform: Option<Platform>,
        store: &ImageStore,
    ) -> Result<Pulled> {
        let oci_ref = to_oci_reference(reference)?;
        let client = self.client(&reference.registry, platform);
        let auth = RegistryAuth::for_registry(&reference.registry).to_oci_auth();
        let registry_err = |what: &str, e: &dyn std::fmt::Display| {
            BoxError::runtime("image pull", format!("{}: {what}: {e}", reference.registry))
        };

        tracing::info!(reference = %reference, "pulling image");
        let (image_manifest, repo_digest) = client
            .pull_image_manifest(&oci_ref, &auth)
            .await
            .map_err(|e| registry_err("failed to pull manifest", &e))?;

        let config_desc = &image_manifest.config;
        if !store.has_blob(&config_desc.digest) {
            let mut data: Vec<u8> = Vec::new();
            client
                .pull_blob(&oci_ref, config_desc, &mut data)
                .await
                .map_err(|e| registry_err("failed to pull config", &e))?;
            store.write_blob_checked(&config_desc.digest, &data)?;
        }

        for layer in &image_manifest.layers {
            if store.has_blob(&layer.digest) {
                continue;
            }
            tracing::debug!(digest = %layer.digest, size = layer.size, "pulling layer");
            let mut data: Vec<u8> = Vec::new();
            client
                .pull_blob(&oci_ref, layer, &mut data)
                .await
                .map_err(|e| registry_err(&format!("failed to pull layer {}", layer.digest), &e))?;
            store.write_blob_checked(&layer.digest, &data)?;
        }

        let manifest_json = serde_json::to_vec(&image_manifest)?;
        let manifest_digest = store.write_blob(&manifest_json)?;
        tracing::info!(reference = %reference, digest = %repo_digest, "image pulled");
        Ok(Pulled {
            manifest_digest,
            repo_digest,
        })
    }

    /// Push the image `manifest_digest` from `store` under `reference`.
    pub async fn push(
        &self,
        reference: &ImageReference,
        manifest_digest: &str,
        store: &ImageStore,
    ) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        let client = self.client(&reference.registry, None);
        let auth = RegistryAuth::for_registry(&reference.registry).to_oci_auth();

        let manifest_data = store.read_blob(manifest_digest)?;
        let manifest: Manifest = serde_json::from_slice(&manifest_data)?;
        let oci_manifest: OciImageManifest = serde_json::from_slice(&manifest_data)?;

        let config = Config::new(
            store.read_blob(&manifest.config.digest)?,
            manifest.config.media_type.clone(),
            None,
        );
        let mut layers = Vec::with_capacity(manifest.layers.len());
        for desc in &manifest.layers {
            let data = store.read_blob(&desc.digest)?;
            tracing::debug!(digest = %desc.digest, size = data.len(), "read layer for push");
            layers.push(ImageLayer::new(data, desc.media_type.clone(), None));
        }

        tracing::info!(reference = %reference, "pushing image");
        let response = client
            .push(&oci_ref, &layers, config, &auth, Some(oci_manifest))
            .await
            .map_err(|e| {
                BoxError::runtime(
                    "image push",
                    format!("{}: failed to push: {e}", reference.registry),
                )
            })?;
        tracing::info!(manifest_url = %response.manifest_url, "image pushed");
        Ok(sha256_digest(&manifest_data))
    }
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = match (&reference.tag, &reference.digest) {
        (_, Some(digest)) => format!("{}@{}", reference.name(), digest),
        (Some(tag), None) => format!("{}:{}", reference.name(), tag),
        (None, None) => format!("{}:latest", reference.name()),
    };
    ref_str
        .parse::<Reference>()
        .map_err(|e| BoxError::invalid(format!("invalid reference {ref_str:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_auth() {
        assert!(matches!(
            RegistryAuth::anonymous().to_oci_auth(),
            OciRegistryAuth::Anonymous
        ));
        assert!(matches!(
            RegistryAuth::basic("u", "p").to_oci_auth(),
            OciRegistryAuth::Basic(_, _)
        ));
    }

    #[test]
    fn test_to_oci_reference() {
        let r = ImageReference::parse("ghcr.io/org/code:v0.1.0").unwrap();
        assert_eq!(to_oci_reference(&r).unwrap().to_string(), "ghcr.io/org/code:v0.1.0");

        let digest = format!("sha256:{}", "ab".repeat(32));
        let r = ImageReference::parse(&format!("ghcr.io/org/code@{digest}")).unwrap();
        assert!(to_oci_reference(&r).unwrap().to_string().contains("sha256:"));
    }

    #[test]
    fn test_platform_parse() {
        let p = Platform::parse("linux/arm64/v8").unwrap();
        assert_eq!(p.architecture, "arm64");
        assert_eq!(p.variant.as_deref(), Some("v8"));
        assert_eq!(p.to_string(), "linux/arm64/v8");
        assert!(Platform::parse("linux").is_err());
        assert_eq!(Platform::host().os, "linux");
    }
}
