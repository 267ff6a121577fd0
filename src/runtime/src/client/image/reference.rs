//! Image reference parsing and normalization.
//!
//! `alpine` normalizes to `docker.io/library/alpine:latest`, the form under
//! which images are stored and labeled.

use cdbox_core::error::{BoxError, Result};

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, with port if any (`docker.io`, `localhost:5000`).
    pub registry: String,
    /// Repository path (`library/nginx`).
    pub repository: String,
    pub tag: Option<String>,
    /// `algorithm:hex`.
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a user-supplied reference.
    ///
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `nginx:1.25` → docker.io/library/nginx:1.25
    /// - `localhost:5000/app` → localhost:5000/app:latest
    /// - `ghcr.io/org/image@sha256:abc...` keeps the digest and takes no default tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(BoxError::invalid("empty image reference"));
        }
        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                let (algo, hex) = digest.split_once(':').ok_or_else(|| {
                    BoxError::invalid(format!(
                        "invalid digest in reference {reference:?}: expected algorithm:hex"
                    ))
                })?;
                if algo.is_empty() || hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit())
                {
                    return Err(BoxError::invalid(format!(
                        "invalid digest in reference {reference:?}"
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag is a colon after the last slash; a colon before it is a registry port.
        let last_slash = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let split = last_slash + colon;
                (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
            }
            None => (name_tag, None),
        };
        if let Some(t) = &tag {
            let valid = !t.is_empty()
                && t.len() <= 128
                && t.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
            if !valid {
                return Err(BoxError::invalid(format!("invalid tag in reference {reference:?}")));
            }
        }

        let (registry, repository) = split_registry_repository(name)?;
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(BoxError::invalid(format!(
                "invalid reference format: repository name must be lowercase: {reference}"
            )));
        }
        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Fully-qualified form.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// Short form the way Docker prints it (`alpine:latest`, `myuser/app:1`).
    pub fn familiar(&self) -> String {
        let repo = if self.registry == DEFAULT_REGISTRY {
            self.repository
                .strip_prefix("library/")
                .unwrap_or(&self.repository)
                .to_string()
        } else {
            format!("{}/{}", self.registry, self.repository)
        };
        match (&self.tag, &self.digest) {
            (Some(tag), _) => format!("{repo}:{tag}"),
            (None, Some(digest)) => format!("{repo}@{digest}"),
            (None, None) => repo,
        }
    }

    /// Repository without tag or digest (`docker.io/library/alpine`).
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full_reference())
    }
}

fn split_registry_repository(name: &str) -> Result<(String, String)> {
    if name.is_empty() {
        return Err(BoxError::invalid("empty repository name"));
    }
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(BoxError::invalid(format!("empty repository in {name:?}")));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
        return Ok((DEFAULT_REGISTRY.to_string(), name.to_string()));
    }
    Ok((DEFAULT_REGISTRY.to_string(), format!("library/{name}")))
}

/// Normalize a user reference to its stored form.
pub fn normalize_reference(reference: &str) -> Result<String> {
    Ok(ImageReference::parse(reference)?.full_reference())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert_eq!(r.full_reference(), "docker.io/library/nginx:latest");
        assert_eq!(r.familiar(), "nginx:latest");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/app").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert_eq!(r.familiar(), "localhost:5000/app:latest");
    }

    #[test]
    fn test_parse_user_repo_with_tag() {
        let r = ImageReference::parse("myuser/myimage:v2").unwrap();
        assert_eq!(r.full_reference(), "docker.io/myuser/myimage:v2");
        assert_eq!(r.familiar(), "myuser/myimage:v2");
    }

    #[test]
    fn test_parse_digest() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let r = ImageReference::parse(&format!("ghcr.io/org/img@{digest}")).unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some(digest.as_str()));
    }

    #[test]
    fn test_parse_errors() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("img@nodigest").is_err());
        assert!(ImageReference::parse("img:").is_err());
        assert!(ImageReference::parse("ghcr.io/").is_err());
        assert!(ImageReference::parse("MyImage").is_err());
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize_reference("alpine").unwrap();
        assert_eq!(normalize_reference(&once).unwrap(), once);
    }
}
