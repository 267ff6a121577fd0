//! `cdbox events` command: container lifecycle events.
//!
//! There is no event bus; the container list is polled and consecutive
//! snapshots are diffed.

use std::collections::BTreeMap;
use std::time::Duration;

use cdbox_core::container::ContainerStatus;
use cdbox_core::error::Result;
use cdbox_runtime::lifecycle::ListOptions;
use clap::Args;
use serde::Serialize;

use crate::app::App;
use crate::output::render;

const POLL: Duration = Duration::from_millis(500);

#[derive(Args, Debug)]
pub struct EventsArgs {
    /// Format output using a template, or `json`
    #[arg(long)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Seen {
    name: String,
    image: String,
    status: ContainerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Event {
    pub time: String,
    #[serde(rename = "Type")]
    pub kind: String,
    pub action: String,
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub image: String,
}

fn action(before: ContainerStatus, after: ContainerStatus) -> Option<&'static str> {
    use ContainerStatus::*;
    match (before, after) {
        (a, b) if a == b => None,
        (Paused, Running) => Some("unpause"),
        (_, Running) => Some("start"),
        (_, Paused) => Some("pause"),
        (Running | Paused, Stopped) => Some("die"),
        _ => None,
    }
}

fn diff(before: &BTreeMap<String, Seen>, after: &BTreeMap<String, Seen>, time: &str) -> Vec<Event> {
    let event = |id: &str, seen: &Seen, action: &str| Event {
        time: time.to_string(),
        kind: "container".to_string(),
        action: action.to_string(),
        id: id.to_string(),
        name: seen.name.clone(),
        image: seen.image.clone(),
    };
    let mut out = Vec::new();
    for (id, now) in after {
        match before.get(id) {
            None => {
                out.push(event(id, now, "create"));
                if now.status.is_live() {
                    out.push(event(id, now, "start"));
                }
            }
            Some(prev) => {
                if prev.name != now.name {
                    out.push(event(id, now, "rename"));
                }
                if let Some(a) = action(prev.status, now.status) {
                    out.push(event(id, now, a));
                }
            }
        }
    }
    for (id, prev) in before {
        if !after.contains_key(id) {
            out.push(event(id, prev, "destroy"));
        }
    }
    out
}

fn print(event: &Event, format: Option<&str>) -> Result<()> {
    match format {
        None | Some("") => println!(
            "{} {} {} {} (image={}, name={})",
            event.time, event.kind, event.action, event.id, event.image, event.name
        ),
        Some("json") => println!("{}", serde_json::to_string(event)?),
        Some(t) => println!("{}", render(t, &serde_json::to_value(event)?)?),
    }
    Ok(())
}

pub async fn execute(app: &App, args: EventsArgs) -> Result<()> {
    let mgr = app.manager()?;
    let all = ListOptions {
        all: true,
        ..ListOptions::default()
    };
    let snapshot = |containers: Vec<cdbox_runtime::Container>| -> BTreeMap<String, Seen> {
        containers
            .into_iter()
            .map(|c| {
                let seen = Seen {
                    name: c.name().to_string(),
                    image: c.record.image.clone(),
                    status: c.status(),
                };
                (c.record.id, seen)
            })
            .collect()
    };
    let mut before = snapshot(mgr.list(&all).await?);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(POLL) => {}
            _ = mgr.cancel_token().cancelled() => return Ok(()),
        }
        let after = snapshot(mgr.list(&all).await?);
        let time = chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, false);
        for event in diff(&before, &after, &time) {
            print(&event, args.format.as_deref())?;
        }
        before = after;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seen(name: &str, status: ContainerStatus) -> Seen {
        Seen {
            name: name.into(),
            image: "alpine".into(),
            status,
        }
    }

    #[test]
    fn test_diff_snapshots() {
        let mut before = BTreeMap::new();
        before.insert("a".to_string(), seen("web", ContainerStatus::Running));
        before.insert("b".to_string(), seen("db", ContainerStatus::Running));
        before.insert("c".to_string(), seen("old", ContainerStatus::Stopped));

        let mut after = BTreeMap::new();
        after.insert("a".to_string(), seen("web", ContainerStatus::Paused));
        after.insert("b".to_string(), seen("db", ContainerStatus::Stopped));
        after.insert("d".to_string(), seen("new", ContainerStatus::Running));

        let actions: Vec<(String, String)> = diff(&before, &after, "t")
            .into_iter()
            .map(|e| (e.id, e.action))
            .collect();
        assert_eq!(
            actions,
            vec![
                ("a".to_string(), "pause".to_string()),
                ("b".to_string(), "die".to_string()),
                ("d".to_string(), "create".to_string()),
                ("d".to_string(), "start".to_string()),
                ("c".to_string(), "destroy".to_string()),
            ]
        );
    }
}
