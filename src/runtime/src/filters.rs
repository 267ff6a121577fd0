//! `--filter key=value` handling shared by the listing commands.
//!
//! Values of the same key are OR'ed, different keys are AND'ed, except
//! `label` where every value must match.

use std::collections::{BTreeMap, HashMap};

use cdbox_core::error::{BoxError, Result};
use regex::Regex;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filters(BTreeMap<String, Vec<String>>);

impl Filters {
    /// Parse `key=value` arguments, rejecting keys outside `allowed`.
    pub fn parse(args: &[String], allowed: &[&str]) -> Result<Self> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for arg in args {
            let (key, value) = match arg.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (arg.trim(), ""),
            };
            if !allowed.contains(&key) {
                return Err(BoxError::invalid(format!("invalid filter {key:?}")));
            }
            map.entry(key.to_string()).or_default().push(value.to_string());
        }
        Ok(Self(map))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> &[String] {
        self.0.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// True when the key is absent or any of its values satisfies `f`.
    pub fn any(&self, key: &str, f: impl Fn(&str) -> bool) -> bool {
        match self.0.get(key) {
            None => true,
            Some(values) => values.iter().any(|v| f(v)),
        }
    }

    /// The single boolean value of `key`, if given.
    pub fn bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key).last() {
            None => Ok(None),
            Some(v) => match v.as_str() {
                "true" | "1" => Ok(Some(true)),
                "false" | "0" => Ok(Some(false)),
                other => Err(BoxError::invalid(format!(
                    "invalid filter '{key}={other}': expected true or false"
                ))),
            },
        }
    }

    /// Every `label=k` / `label=k=v` filter matches `labels`.
    pub fn labels_match(&self, labels: &HashMap<String, String>) -> bool {
        self.get("label").iter().all(|want| match want.split_once('=') {
            Some((k, v)) => labels.get(k).map(|have| have == v).unwrap_or(false),
            None => labels.contains_key(want.as_str()),
        })
    }
}

/// Shell-style glob with `*` and `?`, anchored at both ends.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let mut re = String::with_capacity(pattern.len() + 2);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map(|r| r.is_match(text)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_and_query() {
        let f = Filters::parse(&args(&["name=web*", "name=db", "dangling=true"]), &["name", "dangling"])
            .unwrap();
        assert_eq!(f.get("name").len(), 2);
        assert!(f.any("name", |p| glob_match(p, "db")));
        assert!(!f.any("name", |p| glob_match(p, "cache")));
        assert!(f.any("label", |_| false));
        assert_eq!(f.bool("dangling").unwrap(), Some(true));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(Filters::parse(&args(&["colour=red"]), &["name"]).is_err());
    }

    #[test]
    fn test_labels_match() {
        let f = Filters::parse(&args(&["label=env=prod", "label=team"]), &["label"]).unwrap();
        let mut labels = HashMap::from([("env".to_string(), "prod".to_string())]);
        assert!(!f.labels_match(&labels));
        labels.insert("team".to_string(), "x".to_string());
        assert!(f.labels_match(&labels));
        labels.insert("env".to_string(), "dev".to_string());
        assert!(!f.labels_match(&labels));
    }

    #[test]
    fn test_glob() {
        assert!(glob_match("web-*", "web-1"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "abbc"));
        assert!(glob_match("v.1", "v.1"));
        assert!(!glob_match("v.1", "vx1"));
    }
}
