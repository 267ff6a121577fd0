//! Desired-state fingerprint of a service.

use cdbox_core::error::Result;
use sha2::{Digest, Sha256};

use super::model::Service;

/// Hash of everything that should trigger a recreate when it changes: the
/// declared service (replica count aside), the resolved image digest and
/// the dependency set.
///
/// Object keys serialize in sorted order, so equal services hash equally
/// regardless of how the file was written.
pub fn config_hash(service: &Service, image_digest: &str, depends_on: &[String]) -> Result<String> {
    let mut canonical = service.clone();
    if let Some(deploy) = canonical.deploy.as_mut() {
        deploy.replicas = None;
    }
    let json = serde_json::to_vec(&canonical)?;

    let mut hasher = Sha256::new();
    hasher.update(&json);
    hasher.update([0]);
    hasher.update(image_digest.as_bytes());
    hasher.update([0]);
    let mut deps = depends_on.to_vec();
    deps.sort();
    hasher.update(deps.join(",").as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::model::{Deploy, StringOrList};

    fn service() -> Service {
        Service {
            image: Some("redis:7".into()),
            command: Some(StringOrList::String("redis-server".into())),
            ..Service::default()
        }
    }

    #[test]
    fn test_stable_and_sensitive() {
        let base = config_hash(&service(), "sha256:aa", &["db".into(), "cache".into()]).unwrap();
        assert_eq!(base, config_hash(&service(), "sha256:aa", &["cache".into(), "db".into()]).unwrap());

        let scaled = Service {
            deploy: Some(Deploy {
                replicas: Some(3),
                ..Deploy::default()
            }),
            ..service()
        };
        let unscaled = Service {
            deploy: Some(Deploy::default()),
            ..service()
        };
        assert_eq!(
            config_hash(&scaled, "sha256:aa", &[]).unwrap(),
            config_hash(&unscaled, "sha256:aa", &[]).unwrap()
        );

        assert_ne!(base, config_hash(&service(), "sha256:bb", &["cache".into(), "db".into()]).unwrap());
        let changed = Service {
            command: Some(StringOrList::String("redis-server --save 60 1".into())),
            ..service()
        };
        assert_ne!(base, config_hash(&changed, "sha256:aa", &["cache".into(), "db".into()]).unwrap());
    }
}
