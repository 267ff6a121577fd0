//! Container label schema.
//!
//! All cdbox metadata about a container lives as string labels on the
//! runtime's container record. Non-scalar values are JSON-encoded. Readers
//! tolerate absent keys (missing means default). Keys outside the schema are
//! user labels and round-trip untouched.
//!
//! Schema version 2 extends the base key set with `restart`, `healthcheck`,
//! `stopSignal`, `stopTimeout`, `compose.number` and `compose.configHash`.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::container::{HealthCheck, MountRecord, PortMapping, RestartPolicy};
use crate::error::{BoxError, Result};

/// Prefix shared by every schema key.
pub const PREFIX: &str = "cdbox/";

/// Current schema version, stamped under [`SCHEMA_VERSION`].
pub const CURRENT_SCHEMA: u32 = 2;

pub const SCHEMA_VERSION: &str = "cdbox/schemaVersion";
pub const NAME: &str = "cdbox/name";
pub const NAMESPACE: &str = "cdbox/namespace";
pub const HOSTNAME: &str = "cdbox/hostname";
pub const STATE_DIR: &str = "cdbox/stateDir";
pub const LOG_URI: &str = "cdbox/logURI";
pub const EXTRA_HOSTS: &str = "cdbox/extraHosts";
pub const PORTS: &str = "cdbox/ports";
pub const NETWORKS: &str = "cdbox/networks";
pub const IP_ADDRESS: &str = "cdbox/ipAddress";
pub const MAC_ADDRESS: &str = "cdbox/macAddress";
pub const MOUNTS: &str = "cdbox/mounts";
pub const ANON_VOLUMES: &str = "cdbox/anonVolumes";
pub const PID_FILE: &str = "cdbox/pidFile";
pub const PLATFORM: &str = "cdbox/platform";
pub const USER: &str = "cdbox/user";
pub const AUTO_REMOVE: &str = "cdbox/rm";
pub const RESTART: &str = "cdbox/restart";
pub const HEALTHCHECK: &str = "cdbox/healthcheck";
pub const STOP_SIGNAL: &str = "cdbox/stopSignal";
pub const STOP_TIMEOUT: &str = "cdbox/stopTimeout";
pub const COMPOSE_PROJECT: &str = "cdbox/compose.project";
pub const COMPOSE_SERVICE: &str = "cdbox/compose.service";
pub const COMPOSE_DEPENDS_ON: &str = "cdbox/compose.dependsOn";
pub const COMPOSE_NUMBER: &str = "cdbox/compose.number";
pub const COMPOSE_CONFIG_HASH: &str = "cdbox/compose.configHash";

/// The closed set of schema keys.
pub const ALL_KEYS: &[&str] = &[
    SCHEMA_VERSION,
    NAME,
    NAMESPACE,
    HOSTNAME,
    STATE_DIR,
    LOG_URI,
    EXTRA_HOSTS,
    PORTS,
    NETWORKS,
    IP_ADDRESS,
    MAC_ADDRESS,
    MOUNTS,
    ANON_VOLUMES,
    PID_FILE,
    PLATFORM,
    USER,
    AUTO_REMOVE,
    RESTART,
    HEALTHCHECK,
    STOP_SIGNAL,
    STOP_TIMEOUT,
    COMPOSE_PROJECT,
    COMPOSE_SERVICE,
    COMPOSE_DEPENDS_ON,
    COMPOSE_NUMBER,
    COMPOSE_CONFIG_HASH,
];

/// Whether `key` belongs to the schema.
pub fn is_schema_key(key: &str) -> bool {
    ALL_KEYS.contains(&key)
}

/// Reject user labels that squat on the reserved prefix.
pub fn validate_user_labels(labels: &HashMap<String, String>) -> Result<()> {
    for key in labels.keys() {
        if key.starts_with(PREFIX) {
            return Err(BoxError::invalid(format!(
                "label {key:?} uses the reserved prefix {PREFIX:?}"
            )));
        }
    }
    Ok(())
}

/// Split a raw label map into (schema, user) parts.
pub fn split_user_labels(
    labels: &HashMap<String, String>,
) -> (HashMap<String, String>, HashMap<String, String>) {
    labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .partition(|(k, _)| k.starts_with(PREFIX))
}

/// Compose membership of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposeLabels {
    pub project: String,
    pub service: String,
    pub depends_on: Vec<String>,
    pub number: u32,
    pub config_hash: String,
}

/// Typed view over the schema labels of one container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerLabels {
    pub name: String,
    pub namespace: String,
    pub hostname: Option<String>,
    pub state_dir: Option<String>,
    pub log_uri: Option<String>,
    pub extra_hosts: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub networks: Vec<String>,
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
    pub mounts: Vec<MountRecord>,
    pub anon_volumes: Vec<String>,
    pub pid_file: Option<String>,
    pub platform: Option<String>,
    pub user: Option<String>,
    pub auto_remove: bool,
    pub restart: RestartPolicy,
    pub healthcheck: Option<HealthCheck>,
    pub stop_signal: Option<String>,
    pub stop_timeout: Option<u64>,
    pub compose: Option<ComposeLabels>,
    /// Labels outside the schema.
    pub user_labels: HashMap<String, String>,
}

impl ContainerLabels {
    /// Decode labels from a runtime record.
    ///
    /// Absent keys take defaults. A present key with an undecodable value is
    /// an error: that only happens if something other than cdbox wrote it.
    pub fn from_map(labels: &HashMap<String, String>) -> Result<Self> {
        let (_, user_labels) = split_user_labels(labels);
        let get = |k: &str| labels.get(k).filter(|v| !v.is_empty()).cloned();

        let compose = match labels.get(COMPOSE_PROJECT) {
            Some(project) if !project.is_empty() => Some(ComposeLabels {
                project: project.clone(),
                service: get(COMPOSE_SERVICE).unwrap_or_default(),
                depends_on: decode_json(labels, COMPOSE_DEPENDS_ON)?,
                number: get(COMPOSE_NUMBER)
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(1),
                config_hash: get(COMPOSE_CONFIG_HASH).unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(Self {
            name: get(NAME).unwrap_or_default(),
            namespace: get(NAMESPACE).unwrap_or_default(),
            hostname: get(HOSTNAME),
            state_dir: get(STATE_DIR),
            log_uri: get(LOG_URI),
            extra_hosts: decode_json(labels, EXTRA_HOSTS)?,
            ports: decode_json(labels, PORTS)?,
            networks: decode_json(labels, NETWORKS)?,
            ip_address: get(IP_ADDRESS),
            mac_address: get(MAC_ADDRESS),
            mounts: decode_json(labels, MOUNTS)?,
            anon_volumes: decode_json(labels, ANON_VOLUMES)?,
            pid_file: get(PID_FILE),
            platform: get(PLATFORM),
            user: get(USER),
            auto_remove: get(AUTO_REMOVE).as_deref() == Some("true"),
            restart: match get(RESTART) {
                Some(r) => r.parse()?,
                None => RestartPolicy::No,
            },
            healthcheck: match get(HEALTHCHECK) {
                Some(raw) => Some(serde_json::from_str(&raw)?),
                None => None,
            },
            stop_signal: get(STOP_SIGNAL),
            stop_timeout: get(STOP_TIMEOUT).and_then(|t| t.parse().ok()),
            compose,
            user_labels,
        })
    }

    /// Encode back to a flat label map (schema keys plus user labels).
    pub fn to_map(&self) -> Result<HashMap<String, String>> {
        let mut out = self.user_labels.clone();
        out.insert(SCHEMA_VERSION.to_string(), CURRENT_SCHEMA.to_string());
        out.insert(NAME.to_string(), self.name.clone());
        out.insert(NAMESPACE.to_string(), self.namespace.clone());

        let mut put = |k: &str, v: &Option<String>| {
            if let Some(v) = v {
                out.insert(k.to_string(), v.clone());
            }
        };
        put(HOSTNAME, &self.hostname);
        put(STATE_DIR, &self.state_dir);
        put(LOG_URI, &self.log_uri);
        put(IP_ADDRESS, &self.ip_address);
        put(MAC_ADDRESS, &self.mac_address);
        put(PID_FILE, &self.pid_file);
        put(PLATFORM, &self.platform);
        put(USER, &self.user);
        put(STOP_SIGNAL, &self.stop_signal);

        encode_json(&mut out, EXTRA_HOSTS, &self.extra_hosts)?;
        encode_json(&mut out, PORTS, &self.ports)?;
        encode_json(&mut out, NETWORKS, &self.networks)?;
        encode_json(&mut out, MOUNTS, &self.mounts)?;
        encode_json(&mut out, ANON_VOLUMES, &self.anon_volumes)?;

        if self.auto_remove {
            out.insert(AUTO_REMOVE.to_string(), "true".to_string());
        }
        if self.restart != RestartPolicy::No {
            out.insert(RESTART.to_string(), self.restart.to_string());
        }
        if let Some(hc) = &self.healthcheck {
            out.insert(HEALTHCHECK.to_string(), serde_json::to_string(hc)?);
        }
        if let Some(t) = self.stop_timeout {
            out.insert(STOP_TIMEOUT.to_string(), t.to_string());
        }
        if let Some(c) = &self.compose {
            out.insert(COMPOSE_PROJECT.to_string(), c.project.clone());
            out.insert(COMPOSE_SERVICE.to_string(), c.service.clone());
            out.insert(
                COMPOSE_DEPENDS_ON.to_string(),
                serde_json::to_string(&c.depends_on)?,
            );
            out.insert(COMPOSE_NUMBER.to_string(), c.number.to_string());
            if !c.config_hash.is_empty() {
                out.insert(COMPOSE_CONFIG_HASH.to_string(), c.config_hash.clone());
            }
        }
        Ok(out)
    }
}

fn decode_json<T: DeserializeOwned + Default>(
    labels: &HashMap<String, String>,
    key: &str,
) -> Result<T> {
    match labels.get(key) {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw).map_err(|e| {
            BoxError::SerializationError(format!("label {key}: {e}"))
        }),
        _ => Ok(T::default()),
    }
}

fn encode_json<T: Serialize>(
    out: &mut HashMap<String, String>,
    key: &str,
    value: &[T],
) -> Result<()> {
    if !value.is_empty() {
        out.insert(key.to_string(), serde_json::to_string(value)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::MountType;

    fn sample() -> ContainerLabels {
        ContainerLabels {
            name: "web".to_string(),
            namespace: "default".to_string(),
            hostname: Some("web".to_string()),
            state_dir: Some("/var/lib/cdbox/1234/containers/default/abc".to_string()),
            log_uri: Some("binary:///usr/local/bin/cdbox?_CDBOX_INTERNAL_LOGGING=/var/lib/cdbox/1234".to_string()),
            extra_hosts: vec!["test:10.0.0.1".to_string()],
            ports: vec![PortMapping {
                host_ip: "127.0.0.1".to_string(),
                host_port: 8080,
                container_port: 80,
                protocol: "tcp".to_string(),
            }],
            networks: vec!["bridge".to_string()],
            mounts: vec![MountRecord {
                kind: MountType::Volume,
                name: "f00d".to_string(),
                source: "/vol/f00d/_data".to_string(),
                destination: "/data".to_string(),
                options: vec!["rbind".to_string()],
                anonymous: true,
            }],
            anon_volumes: vec!["f00d".to_string()],
            auto_remove: true,
            restart: RestartPolicy::OnFailure {
                max_retries: Some(3),
            },
            user_labels: HashMap::from([("app".to_string(), "nginx".to_string())]),
            ..Default::default()
        }
    }

    #[test]
    fn test_round_trip() {
        let labels = sample();
        let map = labels.to_map().unwrap();
        let decoded = ContainerLabels::from_map(&map).unwrap();
        assert_eq!(decoded, labels);
    }

    #[test]
    fn test_encoded_keys_are_schema_or_user() {
        let map = sample().to_map().unwrap();
        for key in map.keys() {
            assert!(is_schema_key(key) || !key.starts_with(PREFIX), "stray key {key}");
        }
        assert_eq!(map.get("app").map(String::as_str), Some("nginx"));
    }

    #[test]
    fn test_missing_keys_default() {
        let decoded = ContainerLabels::from_map(&HashMap::new()).unwrap();
        assert!(decoded.name.is_empty());
        assert!(decoded.ports.is_empty());
        assert!(decoded.anon_volumes.is_empty());
        assert!(!decoded.auto_remove);
        assert_eq!(decoded.restart, RestartPolicy::No);
        assert!(decoded.compose.is_none());
    }

    #[test]
    fn test_bad_json_is_error() {
        let map = HashMap::from([(PORTS.to_string(), "not json".to_string())]);
        assert!(ContainerLabels::from_map(&map).is_err());
    }

    #[test]
    fn test_compose_labels_round_trip() {
        let mut labels = sample();
        labels.compose = Some(ComposeLabels {
            project: "demo".to_string(),
            service: "db".to_string(),
            depends_on: vec!["cache".to_string()],
            number: 2,
            config_hash: "abcd".to_string(),
        });
        let decoded = ContainerLabels::from_map(&labels.to_map().unwrap()).unwrap();
        assert_eq!(decoded.compose, labels.compose);
    }

    #[test]
    fn test_validate_user_labels() {
        let ok = HashMap::from([("com.example/x".to_string(), "1".to_string())]);
        assert!(validate_user_labels(&ok).is_ok());
        let bad = HashMap::from([(NAME.to_string(), "x".to_string())]);
        assert!(validate_user_labels(&bad).is_err());
    }

    #[test]
    fn test_split_user_labels() {
        let map = sample().to_map().unwrap();
        let (schema, user) = split_user_labels(&map);
        assert!(schema.contains_key(NAME));
        assert_eq!(user.len(), 1);
    }
}
