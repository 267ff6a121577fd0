//! Docker-compatible identifier resolution.
//!
//! Resolution order: exact ID -> exact name -> ID prefix (at least
//! [`MIN_PREFIX_LEN`] chars). A later stage is only consulted when the
//! earlier ones matched nothing.

use cdbox_core::container::ContainerStatus;
use cdbox_core::error::{BoxError, Result};
use cdbox_core::labels;
use cdbox_core::volume::VolumeInfo;

use crate::client::{ContainerRecord, ImageInfo};

/// Shortest ID prefix accepted.
pub const MIN_PREFIX_LEN: usize = 3;

/// Something a user token can name.
pub trait Resolvable {
    /// Kind name used in error messages.
    const KIND: &'static str;

    /// Full ID without any algorithm prefix; empty when the kind has no ID.
    fn full_id(&self) -> &str;

    /// Names the object is known by.
    fn names(&self) -> Vec<String>;
}

impl Resolvable for ContainerRecord {
    const KIND: &'static str = "container";

    fn full_id(&self) -> &str {
        &self.id
    }

    fn names(&self) -> Vec<String> {
        self.labels
            .get(labels::NAME)
            .filter(|n| !n.is_empty())
            .cloned()
            .into_iter()
            .collect()
    }
}

impl Resolvable for ImageInfo {
    const KIND: &'static str = "image";

    fn full_id(&self) -> &str {
        self.id.strip_prefix("sha256:").unwrap_or(&self.id)
    }

    fn names(&self) -> Vec<String> {
        if self.is_dangling() {
            return Vec::new();
        }
        let familiar = self.familiar_name();
        let mut names = vec![self.name.clone(), familiar.clone()];
        if let Some(short) = familiar.strip_suffix(":latest") {
            names.push(short.to_string());
        }
        names
    }
}

impl Resolvable for VolumeInfo {
    const KIND: &'static str = "volume";

    fn full_id(&self) -> &str {
        ""
    }

    fn names(&self) -> Vec<String> {
        vec![self.name.clone()]
    }
}

/// Which rule produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    FullId,
    Name,
    Prefix,
}

/// One match of a token.
#[derive(Debug)]
pub struct Found<'a, T> {
    pub item: &'a T,
    /// Number of objects the token matched at the winning stage.
    pub match_count: usize,
    pub kind: MatchKind,
    /// The token as given.
    pub req: String,
}

/// Walk `items` once and yield every match of `token` at the first stage
/// that matches anything. A `match_count` above 1 means the token is ambiguous.
pub fn walk<'a, T: Resolvable>(items: &'a [T], token: &str) -> impl Iterator<Item = Found<'a, T>> {
    let query = token.strip_prefix("sha256:").unwrap_or(token);
    let mut by_id = Vec::new();
    let mut by_name = Vec::new();
    let mut by_prefix = Vec::new();
    for item in items {
        let id = item.full_id();
        if !id.is_empty() && id == query {
            by_id.push(item);
        } else if item.names().iter().any(|n| n == token) {
            by_name.push(item);
        } else if query.len() >= MIN_PREFIX_LEN && !id.is_empty() && id.starts_with(query) {
            by_prefix.push(item);
        }
    }
    let (hits, kind) = if !by_id.is_empty() {
        (by_id, MatchKind::FullId)
    } else if !by_name.is_empty() {
        (by_name, MatchKind::Name)
    } else {
        (by_prefix, MatchKind::Prefix)
    };
    let count = hits.len();
    let req = token.to_string();
    hits.into_iter().map(move |item| Found {
        item,
        match_count: count,
        kind,
        req: req.clone(),
    })
}

/// Resolve `token` to exactly one object.
pub fn resolve<'a, T: Resolvable>(items: &'a [T], token: &str) -> Result<&'a T> {
    let mut found = walk(items, token);
    match found.next() {
        None => Err(BoxError::not_found(T::KIND, token)),
        Some(f) if f.match_count > 1 => Err(BoxError::Ambiguous {
            kind: T::KIND.to_string(),
            query: token.to_string(),
            count: f.match_count,
        }),
        Some(f) => Ok(f.item),
    }
}

/// Resolve every token independently; failures do not stop the others.
pub fn resolve_all<'a, T: Resolvable>(
    items: &'a [T],
    tokens: &[String],
) -> Vec<(String, Result<&'a T>)> {
    tokens
        .iter()
        .map(|t| (t.clone(), resolve(items, t)))
        .collect()
}

/// Container status filter used by `ps` and `prune`.
pub fn status_matches(status: ContainerStatus, wanted: &str) -> bool {
    match wanted {
        "exited" => status == ContainerStatus::Stopped,
        other => status.to_string() == other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use oci_spec::runtime::Spec;
    use std::collections::HashMap;

    fn record(id: &str, name: &str) -> ContainerRecord {
        ContainerRecord {
            id: id.to_string(),
            image: "docker.io/library/alpine:latest".to_string(),
            runtime: crate::client::DEFAULT_RUNTIME.to_string(),
            snapshot_key: None,
            spec: Spec::default(),
            labels: HashMap::from([(labels::NAME.to_string(), name.to_string())]),
            created_at: Utc::now(),
        }
    }

    fn id(prefix: &str) -> String {
        format!("{prefix}{}", "0".repeat(64 - prefix.len()))
    }

    #[test]
    fn test_resolve_by_name_and_prefix() {
        let items = vec![record(&id("abc1"), "web"), record(&id("abd2"), "db")];
        assert_eq!(resolve(&items, "web").unwrap().id, id("abc1"));
        assert_eq!(resolve(&items, "abd").unwrap().id, id("abd2"));
        assert!(resolve(&items, "nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_ambiguous_prefix() {
        let items = vec![record(&id("abc1"), "a"), record(&id("abc2"), "b")];
        let err = resolve(&items, "abc").unwrap_err();
        assert!(matches!(err, BoxError::Ambiguous { count: 2, .. }));
        let found: Vec<_> = walk(&items, "abc").collect();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|f| f.match_count == 2));
    }

    #[test]
    fn test_short_prefix_is_rejected() {
        let items = vec![record(&id("abc1"), "web")];
        assert!(resolve(&items, "ab").is_err());
    }

    #[test]
    fn test_full_id_wins_without_prefix_search() {
        let full = id("abc");
        // A second container whose *name* is a prefix of the first ID.
        let items = vec![record(&full, "x"), record(&id("fff"), &full[..10])];
        let found: Vec<_> = walk(&items, &full).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, MatchKind::FullId);
    }

    #[test]
    fn test_name_beats_prefix() {
        let items = vec![record(&id("beef"), "x"), record(&id("aaaa"), "beef")];
        let found = resolve(&items, "beef").unwrap();
        assert_eq!(found.id, id("aaaa"));
    }

    #[test]
    fn test_resolve_all_reports_each() {
        let items = vec![record(&id("abc1"), "web")];
        let out = resolve_all(&items, &["web".to_string(), "ghost".to_string()]);
        assert!(out[0].1.is_ok());
        assert!(out[1].1.is_err());
    }

    #[test]
    fn test_image_names() {
        let img = crate::client::fake::image("alpine", Default::default());
        let items = vec![img];
        assert!(resolve(&items, "alpine").is_ok());
        assert!(resolve(&items, "alpine:latest").is_ok());
        assert!(resolve(&items, "docker.io/library/alpine:latest").is_ok());
        let hex = items[0].id.trim_start_matches("sha256:").to_string();
        assert!(resolve(&items, &hex[..6]).is_ok());
        assert!(resolve(&items, &format!("sha256:{hex}")).is_ok());
    }
}
