//! Process environment assembly.
//!
//! Sources are layered image env, then `--env-file` contents, then `--env`.
//! A later `KEY=...` replaces an earlier one in place. A bare `KEY` imports
//! the host value and is dropped when the host does not set it.

use std::path::PathBuf;

use cdbox_core::error::{BoxError, Result};

/// Ordered `KEY=VALUE` list with replace-in-place semantics.
#[derive(Debug, Default, Clone)]
pub struct EnvList {
    entries: Vec<(String, String)>,
}

impl EnvList {
    pub fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Apply one `KEY=VALUE` or bare `KEY` item.
    pub fn apply(&mut self, item: &str, host: &dyn Fn(&str) -> Option<String>) -> Result<()> {
        match item.split_once('=') {
            Some((key, value)) => {
                validate_key(key, item)?;
                self.set(key, value);
            }
            None => {
                validate_key(item, item)?;
                if let Some(value) = host(item) {
                    self.set(item, &value);
                }
            }
        }
        Ok(())
    }

    pub fn into_vec(self) -> Vec<String> {
        self.entries
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }
}

fn validate_key(key: &str, item: &str) -> Result<()> {
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(BoxError::invalid(format!("invalid environment variable: {item:?}")));
    }
    Ok(())
}

/// Lines of an env file: blank lines and `#` comments are skipped.
pub fn parse_env_file(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|l| l.trim_start())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.trim_end_matches('\r').to_string())
        .collect()
}

pub fn read_env_files(paths: &[PathBuf]) -> Result<Vec<String>> {
    let mut items = Vec::new();
    for path in paths {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BoxError::invalid(format!("failed to read env file {}: {}", path.display(), e))
        })?;
        items.extend(parse_env_file(&content));
    }
    Ok(items)
}

/// Build the container environment.
pub fn build_env(
    image_env: &[String],
    file_items: &[String],
    flag_items: &[String],
    host: &dyn Fn(&str) -> Option<String>,
) -> Result<EnvList> {
    let mut env = EnvList::default();
    for item in image_env {
        if let Some((k, v)) = item.split_once('=') {
            env.set(k, v);
        }
    }
    for item in file_items.iter().chain(flag_items) {
        env.apply(item, host)?;
    }
    if env.get("PATH").is_none() {
        env.set("PATH", super::draft::DEFAULT_PATH);
    }
    Ok(env)
}
