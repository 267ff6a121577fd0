//! Logging driver types and configuration.
//!
//! A [`LogConfig`] is written to `<state-dir>/log-config.json` at create
//! time and read back by both the producer (task monitor) and the consumer
//! (`logs` command).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{BoxError, Result};
use crate::units::parse_size;

/// Name of the log configuration file inside a container state directory.
pub const LOG_CONFIG_FILE: &str = "log-config.json";

/// Logging driver type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum LogDriver {
    /// Docker-compatible JSON lines format (default).
    #[default]
    JsonFile,
    /// systemd journal via the native socket protocol.
    Journald,
    /// Fluent Forward protocol over TCP or a unix socket.
    Fluentd,
    /// A user-supplied logger binary fed through pipes.
    Binary(PathBuf),
    /// Disable logging entirely.
    None,
}

impl std::fmt::Display for LogDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::JsonFile => write!(f, "json-file"),
            Self::Journald => write!(f, "journald"),
            Self::Fluentd => write!(f, "fluentd"),
            Self::Binary(path) => write!(f, "binary://{}", path.display()),
            Self::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for LogDriver {
    type Err = BoxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "json-file" => Ok(Self::JsonFile),
            "journald" => Ok(Self::Journald),
            "fluentd" => Ok(Self::Fluentd),
            "none" => Ok(Self::None),
            other => {
                let path = other.strip_prefix("binary://").unwrap_or(other);
                if Path::new(path).is_absolute() {
                    Ok(Self::Binary(PathBuf::from(path)))
                } else {
                    Err(BoxError::invalid(format!(
                        "unknown log driver: '{}' (supported: json-file, journald, fluentd, none, binary://<path>)",
                        s
                    )))
                }
            }
        }
    }
}

impl TryFrom<String> for LogDriver {
    type Error = BoxError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<LogDriver> for String {
    fn from(driver: LogDriver) -> Self {
        driver.to_string()
    }
}

impl LogDriver {
    /// Options accepted by this driver. `None` means anything goes.
    fn known_options(&self) -> Option<&'static [&'static str]> {
        match self {
            Self::JsonFile => Some(&["max-size", "max-file", "log-path"]),
            Self::Journald => Some(&["tag"]),
            Self::Fluentd => Some(&[
                "fluentd-address",
                "tag",
                "fluentd-async",
                "fluentd-retry-wait",
                "fluentd-max-retries",
            ]),
            Self::Binary(_) => None,
            Self::None => Some(&[]),
        }
    }
}

/// Logging configuration for a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    pub driver: LogDriver,
    #[serde(default)]
    pub opts: BTreeMap<String, String>,
    /// Binary that runs the producer half (normally the cdbox executable).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            driver: LogDriver::JsonFile,
            opts: BTreeMap::new(),
            logger_path: None,
        }
    }
}

impl LogConfig {
    /// Build a config from `--log-driver` and repeated `--log-opt k=v`.
    pub fn from_flags(driver: Option<&str>, opts: &[String]) -> Result<Self> {
        let driver: LogDriver = driver.unwrap_or("json-file").parse()?;
        let mut parsed = BTreeMap::new();
        for opt in opts {
            let (k, v) = opt
                .split_once('=')
                .ok_or_else(|| BoxError::invalid(format!("invalid log-opt {opt:?}: expected key=value")))?;
            parsed.insert(k.to_string(), v.to_string());
        }
        let config = Self {
            driver,
            opts: parsed,
            logger_path: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject unknown options and malformed values.
    pub fn validate(&self) -> Result<()> {
        if let Some(known) = self.driver.known_options() {
            for key in self.opts.keys() {
                if !known.contains(&key.as_str()) {
                    return Err(BoxError::invalid(format!(
                        "unknown log-opt {key:?} for log driver {}",
                        self.driver
                    )));
                }
            }
        }
        if let Some(size) = self.opts.get("max-size") {
            parse_size(size)?;
        }
        if let Some(n) = self.opts.get("max-file") {
            let n: u32 = n
                .parse()
                .map_err(|_| BoxError::invalid(format!("invalid max-file {n:?}")))?;
            if n == 0 {
                return Err(BoxError::invalid("max-file must be at least 1"));
            }
        }
        if let Some(path) = self.opts.get("log-path") {
            if !Path::new(path).is_absolute() {
                return Err(BoxError::invalid(format!("log-path must be absolute: {path}")));
            }
        }
        Ok(())
    }

    /// Maximum log file size in bytes before rotation, or `None` when rotation is off.
    ///
    /// Set via `max-size` (e.g. "10m", "1g"); "0" or an absent option disables rotation.
    pub fn max_size(&self) -> Option<u64> {
        self.opts
            .get("max-size")
            .and_then(|s| parse_size(s).ok())
            .filter(|n| *n > 0)
    }

    /// Maximum number of log files (current plus rotated) to keep. Default: 1.
    pub fn max_file(&self) -> u32 {
        self.opts
            .get("max-file")
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(1)
    }

    /// Resolve the json-file path for a container.
    pub fn json_log_path(&self, state_dir: &Path, id: &str) -> PathBuf {
        match self.opts.get("log-path") {
            Some(path) => PathBuf::from(path),
            None => state_dir.join(format!("{id}-json.log")),
        }
    }

    /// Render the `tag` option (default `{{.ID}}`).
    pub fn tag(&self, full_id: &str, name: &str) -> String {
        let template = self.opts.get("tag").map(String::as_str).unwrap_or("{{.ID}}");
        render_tag(template, full_id, name)
    }

    /// Load `log-config.json` from a state directory.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(LOG_CONFIG_FILE);
        let data = std::fs::read_to_string(&path).map_err(|e| {
            BoxError::Other(format!("failed to read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Persist `log-config.json` into a state directory.
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        let path = state_dir.join(LOG_CONFIG_FILE);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Expand `{{.FullID}}`, `{{.ID}}` and `{{.Name}}` in a tag template.
pub fn render_tag(template: &str, full_id: &str, name: &str) -> String {
    let short = &full_id[..full_id.len().min(crate::container::SHORT_ID_LEN)];
    template
        .replace("{{.FullID}}", full_id)
        .replace("{{.ID}}", short)
        .replace("{{.Name}}", name)
}

/// Output stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// A single structured log entry (Docker-compatible JSON format).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The log message (including trailing newline).
    pub log: String,
    pub stream: LogStream,
    /// RFC 3339 timestamp with nanosecond precision.
    pub time: String,
}

impl LogEntry {
    /// Stamp a line with the current time.
    pub fn now(stream: LogStream, log: impl Into<String>) -> Self {
        Self {
            log: log.into(),
            stream,
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        }
    }

    /// Parsed timestamp, if well-formed.
    pub fn timestamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::parse_from_rfc3339(&self.time)
            .ok()
            .map(|t| t.with_timezone(&chrono::Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_driver_from_str() {
        assert_eq!("json-file".parse::<LogDriver>().unwrap(), LogDriver::JsonFile);
        assert_eq!("journald".parse::<LogDriver>().unwrap(), LogDriver::Journald);
        assert_eq!("fluentd".parse::<LogDriver>().unwrap(), LogDriver::Fluentd);
        assert_eq!("none".parse::<LogDriver>().unwrap(), LogDriver::None);
        assert_eq!(
            "binary:///usr/bin/logger".parse::<LogDriver>().unwrap(),
            LogDriver::Binary(PathBuf::from("/usr/bin/logger"))
        );
        assert!("unknown".parse::<LogDriver>().is_err());
    }

    #[test]
    fn test_log_config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.driver, LogDriver::JsonFile);
        assert_eq!(config.max_size(), None);
        assert_eq!(config.max_file(), 1);
    }

    #[test]
    fn test_log_config_custom_options() {
        let config = LogConfig::from_flags(
            Some("json-file"),
            &["max-size=50m".to_string(), "max-file=5".to_string()],
        )
        .unwrap();
        assert_eq!(config.max_size(), Some(50 * 1024 * 1024));
        assert_eq!(config.max_file(), 5);
    }

    #[test]
    fn test_max_size_zero_disables_rotation() {
        let config = LogConfig::from_flags(None, &["max-size=0".to_string()]).unwrap();
        assert_eq!(config.max_size(), None);
    }

    #[test]
    fn test_unknown_option_rejected() {
        assert!(LogConfig::from_flags(Some("json-file"), &["tag=x".to_string()]).is_err());
        assert!(LogConfig::from_flags(Some("journald"), &["tag=x".to_string()]).is_ok());
        assert!(LogConfig::from_flags(None, &["max-size".to_string()]).is_err());
        assert!(LogConfig::from_flags(None, &["max-file=0".to_string()]).is_err());
        assert!(LogConfig::from_flags(None, &["log-path=rel.log".to_string()]).is_err());
    }

    #[test]
    fn test_render_tag() {
        let id = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        assert_eq!(render_tag("{{.ID}}", id, "web"), "0123456789ab");
        assert_eq!(render_tag("{{.FullID}}", id, "web"), id);
        assert_eq!(render_tag("app/{{.Name}}", id, "web"), "app/web");
    }

    #[test]
    fn test_json_log_path_override() {
        let dir = Path::new("/state/abc");
        let mut config = LogConfig::default();
        assert_eq!(config.json_log_path(dir, "abc"), dir.join("abc-json.log"));
        config
            .opts
            .insert("log-path".to_string(), "/var/log/c.log".to_string());
        assert_eq!(config.json_log_path(dir, "abc"), PathBuf::from("/var/log/c.log"));
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let config = LogConfig::from_flags(Some("fluentd"), &["tag=svc".to_string()]).unwrap();
        config.save(tmp.path()).unwrap();
        let loaded = LogConfig::load(tmp.path()).unwrap();
        assert_eq!(loaded, config);
        let raw = std::fs::read_to_string(tmp.path().join(LOG_CONFIG_FILE)).unwrap();
        assert!(raw.contains("\"driver\": \"fluentd\""));
    }

    #[test]
    fn test_log_entry_serialization() {
        let entry = LogEntry {
            log: "hello\n".to_string(),
            stream: LogStream::Stdout,
            time: "2026-02-12T06:00:00.000000000Z".to_string(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"log\":\"hello\\n\""));
        assert!(json.contains("\"stream\":\"stdout\""));
        assert!(entry.timestamp().is_some());
    }
}
