//! Container listing.

use std::collections::BTreeMap;

use cdbox_core::container::PortMapping;
use cdbox_core::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{human_duration, Container, ContainerManager};
use crate::client::image::normalize_reference;
use crate::filters::{glob_match, Filters};
use crate::resolve::status_matches;

/// Filter keys accepted by `ps`.
pub const PS_FILTER_KEYS: &[&str] = &[
    "status", "name", "id", "label", "ancestor", "volume", "network", "exited",
];

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Include stopped and created containers.
    pub all: bool,
    pub filters: Filters,
    /// Only the `n` most recently created containers (implies `all`).
    pub last: Option<usize>,
}

/// One `ps` row; field names are the `--format` template keys.
#[derive(Debug, Clone, Serialize)]
pub struct PsRow {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Command")]
    pub command: String,
    #[serde(rename = "CreatedAt")]
    pub created_at: String,
    #[serde(rename = "RunningFor")]
    pub running_for: String,
    #[serde(rename = "Ports")]
    pub ports: String,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Names")]
    pub names: String,
    #[serde(rename = "Labels")]
    pub labels: String,
}

/// `0.0.0.0:8080->80/tcp, ...`
pub fn format_ports(ports: &[PortMapping]) -> String {
    ports
        .iter()
        .map(|p| format!("{}:{}->{}/{}", p.host_ip, p.host_port, p.container_port, p.protocol))
        .collect::<Vec<_>>()
        .join(", ")
}

impl PsRow {
    pub fn new(c: &Container, now: DateTime<Utc>) -> Self {
        let labels: BTreeMap<_, _> = c.labels.user_labels.iter().collect();
        Self {
            id: c.short_id().to_string(),
            image: c.record.image.clone(),
            command: c.command(),
            created_at: c.record.created_at.format("%Y-%m-%d %H:%M:%S %z UTC").to_string(),
            running_for: format!("{} ago", human_duration(now - c.record.created_at)),
            ports: format_ports(&c.labels.ports),
            state: c.status().to_string(),
            status: c.status_text(now),
            names: c.name().to_string(),
            labels: labels
                .into_iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

fn ancestor_matches(image: &str, wanted: &str) -> bool {
    if image == wanted {
        return true;
    }
    normalize_reference(wanted)
        .map(|n| n == image)
        .unwrap_or(false)
}

fn name_matches(name: &str, wanted: &str) -> bool {
    if wanted.contains('*') || wanted.contains('?') {
        glob_match(wanted, name)
    } else {
        name.contains(wanted)
    }
}

impl ContainerManager {
    /// Containers matching `opts`, newest first.
    pub async fn list(&self, opts: &ListOptions) -> Result<Vec<Container>> {
        let f = &opts.filters;
        let exited: Vec<i32> = f
            .get("exited")
            .iter()
            .filter_map(|v| v.parse().ok())
            .collect();
        let show_all = opts.all || opts.last.is_some() || f.contains("status") || f.contains("exited");

        let mut out: Vec<Container> = self
            .containers()
            .await?
            .into_iter()
            .rev()
            .filter(|c| show_all || c.status().is_live())
            .filter(|c| f.any("status", |s| status_matches(c.status(), s)))
            .filter(|c| f.any("name", |n| name_matches(c.name(), n)))
            .filter(|c| f.any("id", |id| c.id().starts_with(id)))
            .filter(|c| f.labels_match(&c.labels.user_labels))
            .filter(|c| f.any("ancestor", |a| ancestor_matches(&c.record.image, a)))
            .filter(|c| f.any("volume", |v| c.volume_names().any(|n| n == v) || c.labels.mounts.iter().any(|m| m.destination == v)))
            .filter(|c| f.any("network", |n| c.labels.networks.iter().any(|have| have == n)))
            .filter(|c| {
                exited.is_empty()
                    || (c.status() == cdbox_core::container::ContainerStatus::Stopped
                        && c.state.exit_code.map_or(false, |code| exited.contains(&code)))
            })
            .collect();
        if let Some(n) = opts.last {
            out.truncate(n);
        }
        Ok(out)
    }

    pub async fn ps(&self, opts: &ListOptions) -> Result<Vec<PsRow>> {
        let now = Utc::now();
        Ok(self.list(opts).await?.iter().map(|c| PsRow::new(c, now)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::create::CreateRequest;
    use crate::lifecycle::testutil::{manager, strings};
    use crate::spec::CreateOptions;

    async fn create(mgr: &ContainerManager, name: &str, args: &[&str], labels: &[&str]) -> Container {
        let req = CreateRequest {
            image: "alpine".to_string(),
            opts: CreateOptions {
                name: Some(name.to_string()),
                args: strings(args),
                labels: strings(labels),
                ..CreateOptions::default()
            },
            compose: None,
        };
        mgr.create(&req).await.unwrap()
    }

    fn filters(items: &[&str]) -> Filters {
        Filters::parse(&strings(items), PS_FILTER_KEYS).unwrap()
    }

    #[tokio::test]
    async fn test_exit_codes_in_status() {
        let (_fake, mgr) = manager();
        for (name, code) in [("c0", 0), ("c123", 123)] {
            let script = format!("exit {code}");
            let c = create(&mgr, name, &["sh", "-c", &script], &[]).await;
            mgr.start(c.id(), false, false).await.unwrap();
            assert_eq!(mgr.wait(c.id()).await.unwrap().code, code);
        }

        assert!(mgr.ps(&ListOptions::default()).await.unwrap().is_empty());
        let rows = mgr
            .ps(&ListOptions { all: true, ..ListOptions::default() })
            .await
            .unwrap();
        let status = |name: &str| rows.iter().find(|r| r.names == name).unwrap().status.clone();
        assert!(status("c0").starts_with("Exited (0)"));
        assert!(status("c123").starts_with("Exited (123)"));

        let opts = ListOptions {
            filters: filters(&["exited=123"]),
            ..ListOptions::default()
        };
        let rows = mgr.ps(&opts).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].names, "c123");
    }

    #[tokio::test]
    async fn test_filters_and_order() {
        let (_fake, mgr) = manager();
        let web = create(&mgr, "web-1", &["sleep", "60"], &["tier=front"]).await;
        mgr.start(web.id(), false, false).await.unwrap();
        let db = create(&mgr, "db-1", &["sleep", "60"], &["tier=back"]).await;
        mgr.start(db.id(), false, false).await.unwrap();
        create(&mgr, "idle", &["sleep", "60"], &[]).await;

        let running = mgr.ps(&ListOptions::default()).await.unwrap();
        let names: Vec<_> = running.iter().map(|r| r.names.as_str()).collect();
        assert_eq!(names, vec!["db-1", "web-1"]);

        let by_label = mgr
            .list(&ListOptions { filters: filters(&["label=tier=front"]), ..ListOptions::default() })
            .await
            .unwrap();
        assert_eq!(by_label.len(), 1);
        assert_eq!(by_label[0].id(), web.id());

        let by_status = mgr
            .list(&ListOptions { filters: filters(&["status=created"]), ..ListOptions::default() })
            .await
            .unwrap();
        assert_eq!(by_status.len(), 1);
        assert_eq!(by_status[0].name(), "idle");

        let glob = mgr
            .list(&ListOptions { all: true, filters: filters(&["name=*-1"]), ..ListOptions::default() })
            .await
            .unwrap();
        assert_eq!(glob.len(), 2);

        let ancestor = mgr
            .list(&ListOptions { filters: filters(&["ancestor=alpine"]), ..ListOptions::default() })
            .await
            .unwrap();
        assert_eq!(ancestor.len(), 2);

        let last = mgr
            .list(&ListOptions { last: Some(1), ..ListOptions::default() })
            .await
            .unwrap();
        assert_eq!(last[0].name(), "idle");
    }

    #[test]
    fn test_format_ports() {
        let ports = vec![PortMapping {
            host_ip: "0.0.0.0".into(),
            host_port: 8080,
            container_port: 80,
            protocol: "tcp".into(),
        }];
        assert_eq!(format_ports(&ports), "0.0.0.0:8080->80/tcp");
    }
}
