//! Volume value types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Metadata persisted as `labels.json` next to a volume's `_data` directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMeta {
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl VolumeMeta {
    pub fn new(labels: HashMap<String, String>) -> Self {
        Self {
            labels,
            created_at: Utc::now(),
        }
    }
}

/// A volume as returned by the store and printed by `volume inspect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeInfo {
    pub name: String,
    pub driver: String,
    /// Absolute host path of `_data`.
    pub mountpoint: PathBuf,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub scope: String,
    /// Recursive size of `_data` in bytes, filled on request.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub size: Option<u64>,
}

impl VolumeInfo {
    pub fn new(name: &str, mountpoint: PathBuf, meta: VolumeMeta) -> Self {
        Self {
            name: name.to_string(),
            driver: "local".to_string(),
            mountpoint,
            labels: meta.labels,
            created_at: meta.created_at,
            scope: "local".to_string(),
            size: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_info_inspect_keys() {
        let mut labels = HashMap::new();
        labels.insert("env".to_string(), "prod".to_string());
        let info = VolumeInfo::new(
            "data",
            PathBuf::from("/var/lib/cdbox/x/volumes/default/data/_data"),
            VolumeMeta::new(labels),
        );
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["Name"], "data");
        assert_eq!(json["Driver"], "local");
        assert_eq!(json["Labels"]["env"], "prod");
        assert!(json.get("Size").is_none());
        assert!(json["Mountpoint"].as_str().unwrap().ends_with("_data"));
    }
}
