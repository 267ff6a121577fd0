//! Process arguments, working directory, init, rlimits and OOM tuning.

use std::path::{Path, PathBuf};

use cdbox_core::error::{BoxError, Result};

use super::draft::{DraftMount, Rlimit};
use super::modifier::SpecModifier;

/// Where the init binary is mounted inside the container.
pub const INIT_PATH: &str = "/sbin/docker-init";
const DEFAULT_INIT_BINARY: &str = "tini";

const RLIMITS: &[&str] = &[
    "as", "core", "cpu", "data", "fsize", "locks", "memlock", "msgqueue", "nice", "nofile",
    "nproc", "rss", "rtprio", "rttime", "sigpending", "stack",
];

/// Final argument vector.
///
/// `entrypoint == Some("")` clears the image entrypoint; any explicit
/// entrypoint also discards the image `CMD`.
pub fn command_args(
    entrypoint: Option<&str>,
    args: &[String],
    image_entrypoint: Option<&[String]>,
    image_cmd: Option<&[String]>,
) -> Result<Vec<String>> {
    let (entry, default_cmd): (Vec<String>, &[String]) = match entrypoint {
        Some("") => (Vec::new(), &[]),
        Some(e) => (vec![e.to_string()], &[]),
        None => (
            image_entrypoint.map(<[String]>::to_vec).unwrap_or_default(),
            image_cmd.unwrap_or(&[]),
        ),
    };
    let mut out = entry;
    if args.is_empty() {
        out.extend(default_cmd.iter().cloned());
    } else {
        out.extend(args.iter().cloned());
    }
    if out.is_empty() {
        return Err(BoxError::invalid("no command specified"));
    }
    Ok(out)
}

/// `--workdir` (must be absolute), else the image's, else `/`.
pub fn working_dir(flag: Option<&str>, image: Option<&str>) -> Result<String> {
    match flag.filter(|w| !w.is_empty()) {
        Some(w) if !w.starts_with('/') => Err(BoxError::invalid(format!(
            "the working directory {w:?} is invalid, it needs to be an absolute path"
        ))),
        Some(w) => Ok(w.to_string()),
        None => Ok(image.filter(|w| !w.is_empty()).unwrap_or("/").to_string()),
    }
}

/// `--ulimit name=soft[:hard]`.
pub fn parse_ulimit(spec: &str) -> Result<Rlimit> {
    let (name, values) = spec
        .split_once('=')
        .ok_or_else(|| BoxError::invalid(format!("invalid ulimit {spec:?}: expected name=soft[:hard]")))?;
    if !RLIMITS.contains(&name) {
        return Err(BoxError::invalid(format!("invalid ulimit type {name:?}")));
    }
    let parse = |v: &str| -> Result<u64> {
        if v == "-1" || v == "unlimited" {
            return Ok(u64::MAX);
        }
        v.parse()
            .map_err(|_| BoxError::invalid(format!("invalid ulimit value {v:?} in {spec:?}")))
    };
    let (soft, hard) = match values.split_once(':') {
        Some((s, h)) => (parse(s)?, parse(h)?),
        None => {
            let v = parse(values)?;
            (v, v)
        }
    };
    if soft > hard {
        return Err(BoxError::invalid(format!(
            "ulimit soft limit must be less than or equal to hard limit: {spec}"
        )));
    }
    Ok(Rlimit {
        kind: format!("RLIMIT_{}", name.to_uppercase()),
        soft,
        hard,
    })
}

pub fn check_oom_score_adj(adj: i32) -> Result<()> {
    if !(-1000..=1000).contains(&adj) {
        return Err(BoxError::invalid(format!(
            "invalid --oom-score-adj {adj}: must be between -1000 and 1000"
        )));
    }
    Ok(())
}

/// Locate the init binary on the host.
pub fn find_init_binary(explicit: Option<&Path>, path_env: Option<&str>) -> Result<PathBuf> {
    let name = explicit.unwrap_or(Path::new(DEFAULT_INIT_BINARY));
    if name.is_absolute() {
        return if name.is_file() {
            Ok(name.to_path_buf())
        } else {
            Err(BoxError::invalid(format!("init binary {} not found", name.display())))
        };
    }
    path_env
        .unwrap_or(super::draft::DEFAULT_PATH)
        .split(':')
        .map(|dir| Path::new(dir).join(name))
        .find(|p| p.is_file())
        .ok_or_else(|| {
            BoxError::invalid(format!("init binary {:?} not found in PATH", name.display().to_string()))
        })
}

/// Run `args` under the init binary mounted at [`INIT_PATH`].
pub fn init_modifiers(binary: &Path, args: Vec<String>) -> Vec<SpecModifier> {
    let mut wrapped = vec![INIT_PATH.to_string(), "--".to_string()];
    wrapped.extend(args);
    vec![
        SpecModifier::AddMount(DraftMount {
            destination: INIT_PATH.to_string(),
            kind: "bind".to_string(),
            source: binary.display().to_string(),
            options: vec!["bind".into(), "ro".into()],
        }),
        SpecModifier::SetArgs(wrapped),
    ]
}
