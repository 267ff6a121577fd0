//! Container value types shared by every subsystem.
//!
//! These are the decoded forms of the JSON values stored in container labels
//! (see [`crate::labels`]) plus the status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{BoxError, Result};

/// Length of the short container ID shown to users.
pub const SHORT_ID_LEN: usize = 12;

/// Truncate a full hex ID to its display form.
pub fn short_id(id: &str) -> &str {
    &id[..id.len().min(SHORT_ID_LEN)]
}

/// A single host ↔ container port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortMapping {
    #[serde(rename = "HostIP")]
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
}

impl fmt::Display for PortMapping {
    /// Docker `port` output: `80/tcp -> 127.0.0.1:8080`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} -> {}:{}",
            self.container_port, self.protocol, self.host_ip, self.host_port
        )
    }
}

/// Kind of a mount record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    Bind,
    Volume,
    Tmpfs,
}

impl fmt::Display for MountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountType::Bind => write!(f, "bind"),
            MountType::Volume => write!(f, "volume"),
            MountType::Tmpfs => write!(f, "tmpfs"),
        }
    }
}

impl FromStr for MountType {
    type Err = BoxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bind" => Ok(MountType::Bind),
            "volume" => Ok(MountType::Volume),
            "tmpfs" => Ok(MountType::Tmpfs),
            other => Err(BoxError::invalid(format!(
                "unsupported mount type {other:?} (expected bind, volume or tmpfs)"
            ))),
        }
    }
}

/// A resolved mount as persisted in the `mounts` label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountRecord {
    #[serde(rename = "Type")]
    pub kind: MountType,
    /// Volume name for `volume` mounts, host path for `bind`, empty for `tmpfs`.
    pub name: String,
    /// Host path actually mounted (volume mountpoint for `volume`).
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub anonymous: bool,
}

impl MountRecord {
    /// Whether the mount is read-only.
    pub fn read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

/// Container status as reported by `ps`/`inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Stopped,
    /// Read-back only: the task could not be queried.
    Unknown,
}

impl ContainerStatus {
    /// Validate a lifecycle transition.
    ///
    /// `Unknown` is never a valid target and never a valid source except for
    /// removal, which is handled outside this table.
    pub fn can_transition(self, to: ContainerStatus) -> bool {
        use ContainerStatus::*;
        matches!(
            (self, to),
            (Created, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopped)
                | (Paused, Stopped)
                | (Stopped, Running)
                | (Created, Stopped)
        )
    }

    /// Whether a live task exists.
    pub fn is_live(self) -> bool {
        matches!(self, ContainerStatus::Running | ContainerStatus::Paused)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Stopped => "exited",
            ContainerStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Restart policy applied by the task monitor to exited tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    OnFailure {
        max_retries: Option<u32>,
    },
    Always,
    UnlessStopped,
}

impl RestartPolicy {
    /// Decide whether an exited task should be restarted.
    ///
    /// `restarts` is the number of restarts already performed, `stopped_by_user`
    /// is true when the exit was caused by `stop`/`kill`.
    pub fn should_restart(&self, exit_code: i32, restarts: u32, stopped_by_user: bool) -> bool {
        if stopped_by_user {
            return false;
        }
        match self {
            RestartPolicy::No => false,
            RestartPolicy::Always | RestartPolicy::UnlessStopped => true,
            RestartPolicy::OnFailure { max_retries } => {
                exit_code != 0 && max_retries.map_or(true, |max| restarts < max)
            }
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::No => write!(f, "no"),
            RestartPolicy::OnFailure { max_retries: None } => write!(f, "on-failure"),
            RestartPolicy::OnFailure {
                max_retries: Some(n),
            } => write!(f, "on-failure:{n}"),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::UnlessStopped => write!(f, "unless-stopped"),
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = BoxError;

    fn from_str(s: &str) -> Result<Self> {
        let (name, arg) = match s.split_once(':') {
            Some((n, a)) => (n, Some(a)),
            None => (s, None),
        };
        let policy = match name {
            "" | "no" => RestartPolicy::No,
            "always" => RestartPolicy::Always,
            "unless-stopped" => RestartPolicy::UnlessStopped,
            "on-failure" => {
                let max_retries = arg
                    .map(|a| {
                        a.parse::<u32>().map_err(|_| {
                            BoxError::invalid(format!("invalid restart retry count: {a:?}"))
                        })
                    })
                    .transpose()?;
                return Ok(RestartPolicy::OnFailure { max_retries });
            }
            other => {
                return Err(BoxError::invalid(format!(
                    "invalid restart policy {other:?} (expected no, on-failure[:N], always, unless-stopped)"
                )))
            }
        };
        if arg.is_some() {
            return Err(BoxError::invalid(format!(
                "restart policy {name:?} does not take a retry count"
            )));
        }
        Ok(policy)
    }
}

/// Health check configuration, stored in the `healthcheck` label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheck {
    /// `["CMD", ...]`, `["CMD-SHELL", "..."]` or `["NONE"]`.
    pub test: Vec<String>,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub retries: u32,
    pub start_period_secs: u64,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            test: Vec::new(),
            interval_secs: 30,
            timeout_secs: 30,
            retries: 3,
            start_period_secs: 0,
        }
    }
}

impl HealthCheck {
    /// Argument vector to exec inside the container, or `None` when disabled.
    pub fn command(&self) -> Option<Vec<String>> {
        match self.test.first().map(String::as_str) {
            Some("CMD") => Some(self.test[1..].to_vec()),
            Some("CMD-SHELL") => Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                self.test[1..].join(" "),
            ]),
            Some("NONE") | None => None,
            Some(_) => Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                self.test.join(" "),
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id() {
        let id = "3f2a9c1d5e7b8a0c4d6e2f1a3b5c7d9e0f1a2b3c4d5e6f7a8b9c0d1e2f3a4b5c";
        assert_eq!(short_id(id), "3f2a9c1d5e7b");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_port_mapping_display() {
        let p = PortMapping {
            host_ip: "127.0.0.1".to_string(),
            host_port: 8080,
            container_port: 80,
            protocol: "tcp".to_string(),
        };
        assert_eq!(p.to_string(), "80/tcp -> 127.0.0.1:8080");
    }

    #[test]
    fn test_port_mapping_json_keys() {
        let p = PortMapping {
            host_ip: "0.0.0.0".to_string(),
            host_port: 7000,
            container_port: 79,
            protocol: "udp".to_string(),
        };
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"HostIP\":\"0.0.0.0\""));
        assert!(json.contains("\"HostPort\":7000"));
        assert!(json.contains("\"ContainerPort\":79"));
        assert!(json.contains("\"Protocol\":\"udp\""));
    }

    #[test]
    fn test_state_machine() {
        use ContainerStatus::*;
        assert!(Created.can_transition(Running));
        assert!(Running.can_transition(Paused));
        assert!(Paused.can_transition(Running));
        assert!(Running.can_transition(Stopped));
        assert!(Paused.can_transition(Stopped));
        assert!(Stopped.can_transition(Running));
        assert!(!Created.can_transition(Paused));
        assert!(!Stopped.can_transition(Paused));
        assert!(!Running.can_transition(Unknown));
        assert!(!Unknown.can_transition(Running));
    }

    #[test]
    fn test_restart_policy_parse() {
        assert_eq!("no".parse::<RestartPolicy>().unwrap(), RestartPolicy::No);
        assert_eq!(
            "always".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::Always
        );
        assert_eq!(
            "on-failure:5".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure {
                max_retries: Some(5)
            }
        );
        assert_eq!(
            "on-failure".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure { max_retries: None }
        );
        assert!("always:3".parse::<RestartPolicy>().is_err());
        assert!("sometimes".parse::<RestartPolicy>().is_err());
        assert!("on-failure:x".parse::<RestartPolicy>().is_err());
    }

    #[test]
    fn test_restart_policy_display_round_trip() {
        for s in ["no", "always", "unless-stopped", "on-failure", "on-failure:3"] {
            assert_eq!(s.parse::<RestartPolicy>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_should_restart() {
        let p = RestartPolicy::OnFailure {
            max_retries: Some(2),
        };
        assert!(p.should_restart(1, 0, false));
        assert!(p.should_restart(1, 1, false));
        assert!(!p.should_restart(1, 2, false));
        assert!(!p.should_restart(0, 0, false));
        assert!(RestartPolicy::Always.should_restart(0, 100, false));
        assert!(!RestartPolicy::Always.should_restart(0, 0, true));
        assert!(!RestartPolicy::No.should_restart(1, 0, false));
    }

    #[test]
    fn test_health_check_command() {
        let hc = HealthCheck {
            test: vec!["CMD-SHELL".into(), "curl -f http://localhost".into()],
            ..Default::default()
        };
        assert_eq!(
            hc.command().unwrap(),
            vec!["/bin/sh", "-c", "curl -f http://localhost"]
        );

        let hc = HealthCheck {
            test: vec!["CMD".into(), "true".into()],
            ..Default::default()
        };
        assert_eq!(hc.command().unwrap(), vec!["true"]);

        let hc = HealthCheck {
            test: vec!["NONE".into()],
            ..Default::default()
        };
        assert!(hc.command().is_none());
    }

    #[test]
    fn test_mount_type_parse() {
        assert_eq!("bind".parse::<MountType>().unwrap(), MountType::Bind);
        assert_eq!("tmpfs".parse::<MountType>().unwrap(), MountType::Tmpfs);
        assert!("npipe".parse::<MountType>().is_err());
    }
}
