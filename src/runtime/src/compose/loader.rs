//! Locating, merging and interpolating compose files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use cdbox_core::error::{BoxError, Result};
use serde_yaml::Value;

use super::interpolate::interpolate;
use super::model::ComposeFile;
use super::project::Project;
use crate::spec::env::parse_env_file;

/// File names searched when no `-f` is given, in priority order.
pub const DEFAULT_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yml",
    "docker-compose.yaml",
];

pub const PROJECT_NAME_ENV: &str = "COMPOSE_PROJECT_NAME";

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// `-f` files, merged in order.
    pub files: Vec<PathBuf>,
    pub project_dir: Option<PathBuf>,
    pub project_name: Option<String>,
    /// `--env-file`; defaults to `<project dir>/.env` when present.
    pub env_files: Vec<PathBuf>,
}

/// The first default file in `dir` or any of its parents.
pub fn find_default_file(dir: &Path) -> Option<PathBuf> {
    dir.ancestors().find_map(|d| {
        DEFAULT_FILES
            .iter()
            .map(|f| d.join(f))
            .find(|p| p.is_file())
    })
}

/// `KEY=VALUE` pairs of a dotenv file; surrounding quotes are stripped.
pub fn read_dotenv(path: &Path) -> Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| BoxError::invalid(format!("failed to read env file {}: {e}", path.display())))?;
    Ok(parse_env_file(&content)
        .into_iter()
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(&line).to_string();
            let (k, v) = line.split_once('=')?;
            let v = v.trim();
            let v = match (v.chars().next(), v.chars().last()) {
                (Some('"'), Some('"')) | (Some('\''), Some('\'')) if v.len() >= 2 => &v[1..v.len() - 1],
                _ => v,
            };
            Some((k.trim().to_string(), v.to_string()))
        })
        .collect())
}

/// Deep-merge `overlay` into `base`: mappings merge key by key, anything
/// else in the overlay replaces the base value.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(b), Value::Mapping(o)) => {
            for (k, v) in o {
                match b.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        b.insert(k, v);
                    }
                }
            }
        }
        (slot, other) => *slot = other,
    }
}

fn absolute(cwd: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        cwd.join(p)
    }
}

/// Load a project. Variables come from the env files, overridden by the
/// host environment (`host_env`).
pub fn load(opts: &LoadOptions, cwd: &Path, host_env: &dyn Fn(&str) -> Option<String>) -> Result<Project> {
    let files: Vec<PathBuf> = if opts.files.is_empty() {
        let search = opts.project_dir.as_deref().map(|d| absolute(cwd, d)).unwrap_or_else(|| cwd.to_path_buf());
        vec![find_default_file(&search).ok_or_else(|| {
            BoxError::not_found(
                "compose file",
                format!("no configuration file provided in {} or its parents", search.display()),
            )
        })?]
    } else {
        opts.files.iter().map(|f| absolute(cwd, f)).collect()
    };
    let dir = match &opts.project_dir {
        Some(d) => absolute(cwd, d),
        None => files[0]
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.to_path_buf()),
    };

    let mut file_vars = HashMap::new();
    if opts.env_files.is_empty() {
        let dotenv = dir.join(".env");
        if dotenv.is_file() {
            file_vars.extend(read_dotenv(&dotenv)?);
        }
    } else {
        for f in &opts.env_files {
            file_vars.extend(read_dotenv(&absolute(cwd, f))?);
        }
    }
    let lookup = |k: &str| host_env(k).or_else(|| file_vars.get(k).cloned());

    let mut doc = Value::Null;
    for path in &files {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BoxError::invalid(format!("failed to read compose file {}: {e}", path.display()))
        })?;
        let value: Value = serde_yaml::from_str(&content)
            .map_err(|e| BoxError::invalid(format!("{}: {e}", path.display())))?;
        if value.is_null() {
            continue;
        }
        if !value.is_mapping() {
            return Err(BoxError::invalid(format!(
                "{}: top-level object must be a mapping",
                path.display()
            )));
        }
        merge(&mut doc, value);
    }
    if doc.is_null() {
        return Err(BoxError::invalid("empty compose file"));
    }
    interpolate(&mut doc, &lookup)?;
    let file: ComposeFile =
        serde_yaml::from_value(doc).map_err(|e| BoxError::invalid(format!("invalid compose file: {e}")))?;
    for (name, svc) in &file.services {
        for key in svc.extra.keys().filter(|k| !k.starts_with("x-")) {
            tracing::warn!(service = %name, key = %key, "ignoring unsupported compose key");
        }
    }

    let name = opts
        .project_name
        .clone()
        .or_else(|| file.name.clone())
        .or_else(|| lookup(PROJECT_NAME_ENV).filter(|n| !n.is_empty()))
        .or_else(|| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default();
    tracing::debug!(project = %name, files = ?files, "compose project loaded");
    Project::new(&name, dir, file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_load_defaults_dotenv_and_host_override() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("My-Shop");
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(
            dir.join("compose.yaml"),
            "services:\n  web:\n    image: nginx:${TAG:-latest}\n    ports: [\"${PORT}:80\"]\n",
        )
        .unwrap();
        std::fs::write(dir.join(".env"), "# comment\nTAG=\"1.25\"\nexport PORT=8080\n").unwrap();

        let p = load(&LoadOptions::default(), &dir.join("sub"), &no_env).unwrap();
        assert_eq!(p.name, "my-shop");
        assert_eq!(p.dir, dir);
        let web = p.service("web").unwrap();
        assert_eq!(web.image.as_deref(), Some("nginx:1.25"));

        let host = |k: &str| (k == "TAG").then(|| "host".to_string());
        let p = load(&LoadOptions::default(), &dir, &host).unwrap();
        assert_eq!(p.service("web").unwrap().image.as_deref(), Some("nginx:host"));
    }

    #[test]
    fn test_merge_files_and_name_precedence() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("base.yml");
        let over = tmp.path().join("override.yml");
        std::fs::write(
            &base,
            "name: fromfile\nservices:\n  db:\n    image: postgres\n    environment: {A: \"1\"}\n    ports: [\"5432\"]\n",
        )
        .unwrap();
        std::fs::write(
            &over,
            "services:\n  db:\n    environment: {B: \"2\"}\n    ports: [\"6543:5432\"]\n",
        )
        .unwrap();
        let opts = LoadOptions {
            files: vec![base.clone(), over],
            ..LoadOptions::default()
        };
        let p = load(&opts, tmp.path(), &no_env).unwrap();
        assert_eq!(p.name, "fromfile");
        let db = p.service("db").unwrap();
        assert_eq!(db.environment.as_ref().unwrap().items('='), vec!["A=1", "B=2"]);
        assert_eq!(db.ports.len(), 1);

        let env = |k: &str| (k == PROJECT_NAME_ENV).then(|| "fromenv".to_string());
        let p = load(&LoadOptions { files: vec![base.clone()], ..LoadOptions::default() }, tmp.path(), &env).unwrap();
        assert_eq!(p.name, "fromfile");
        let flagged = LoadOptions {
            files: vec![base],
            project_name: Some("Flag".into()),
            ..LoadOptions::default()
        };
        assert_eq!(load(&flagged, tmp.path(), &env).unwrap().name, "flag");
    }

    #[test]
    fn test_errors() {
        let tmp = TempDir::new().unwrap();
        assert!(load(&LoadOptions::default(), tmp.path(), &no_env)
            .unwrap_err()
            .is_not_found());

        let file = tmp.path().join("compose.yaml");
        std::fs::write(&file, "services:\n  a:\n    image: ${IMAGE:?set IMAGE}\n").unwrap();
        let err = load(&LoadOptions::default(), tmp.path(), &no_env).unwrap_err();
        assert!(err.to_string().contains("set IMAGE"));

        std::fs::write(&file, "services:\n  a: {image: x, depends_on: [b]}\n  b: {image: x, depends_on: [a]}\n").unwrap();
        assert!(load(&LoadOptions::default(), tmp.path(), &no_env).is_err());
    }
}
