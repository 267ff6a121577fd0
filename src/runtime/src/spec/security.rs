//! Capabilities, `--privileged` and `--security-opt`.

use std::collections::BTreeSet;
use std::path::Path;

use cdbox_core::error::{BoxError, Result};
use oci_spec::runtime::LinuxSeccomp;
use serde_json::{json, Value};

use super::draft::{normalize_capability, Device, DeviceRule, DraftMount, ALL_CAPS, DEFAULT_CAPS};
use super::modifier::SpecModifier;

fn check_cap(name: &str) -> Result<String> {
    let cap = normalize_capability(name);
    if cap != "ALL" && !ALL_CAPS.contains(&cap.as_str()) {
        return Err(BoxError::invalid(format!("unknown capability: {name:?}")));
    }
    Ok(cap)
}

/// Modifiers for `--cap-add` / `--cap-drop`.
///
/// `ALL` in adds grants everything minus explicit drops; `ALL` in drops
/// starts from nothing plus explicit adds.
pub fn capability_modifiers(add: &[String], drop: &[String]) -> Result<Vec<SpecModifier>> {
    let add: Vec<String> = add.iter().map(|c| check_cap(c)).collect::<Result<_>>()?;
    let drop: Vec<String> = drop.iter().map(|c| check_cap(c)).collect::<Result<_>>()?;
    let all = |v: &[String]| v.iter().any(|c| c == "ALL");

    let mut mods = Vec::new();
    if all(&add) {
        mods.push(SpecModifier::AddCapability("ALL".into()));
        mods.extend(drop.into_iter().filter(|c| c != "ALL").map(SpecModifier::DropCapability));
    } else if all(&drop) {
        mods.push(SpecModifier::DropCapability("ALL".into()));
        mods.extend(add.into_iter().map(SpecModifier::AddCapability));
    } else {
        mods.extend(add.into_iter().map(SpecModifier::AddCapability));
        mods.extend(drop.into_iter().map(SpecModifier::DropCapability));
    }
    Ok(mods)
}

/// The capability set a container ends up with.
pub fn effective_caps(add: &[String], drop: &[String], privileged: bool) -> Result<BTreeSet<String>> {
    let mut caps: BTreeSet<String> = DEFAULT_CAPS.iter().map(|c| c.to_string()).collect();
    let mut mods = capability_modifiers(add, drop)?;
    if privileged {
        mods.insert(0, SpecModifier::AddCapability("ALL".into()));
    }
    for m in mods {
        match m {
            SpecModifier::AddCapability(c) if c == "ALL" => {
                caps.extend(ALL_CAPS.iter().map(|c| c.to_string()))
            }
            SpecModifier::AddCapability(c) => {
                caps.insert(c);
            }
            SpecModifier::DropCapability(c) if c == "ALL" => caps.clear(),
            SpecModifier::DropCapability(c) => {
                caps.remove(&c);
            }
            _ => {}
        }
    }
    Ok(caps)
}

/// Every device node under `dev`, skipping pseudo filesystems.
fn host_devices(dev: &Path) -> Vec<Device> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let mut out = Vec::new();
    let mut stack = vec![dev.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = std::fs::symlink_metadata(&path) else {
                continue;
            };
            let ft = meta.file_type();
            if ft.is_dir() {
                let name = entry.file_name();
                if !matches!(name.to_str(), Some("pts" | "shm" | "mqueue")) {
                    stack.push(path);
                }
                continue;
            }
            let kind = if ft.is_char_device() {
                'c'
            } else if ft.is_block_device() {
                'b'
            } else {
                continue;
            };
            let rdev = meta.rdev();
            out.push(Device {
                path: path.display().to_string(),
                kind,
                major: (((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff)) as i64,
                minor: ((rdev & 0xff) | ((rdev >> 12) & !0xff)) as i64,
                file_mode: meta.mode() & 0o7777,
                uid: meta.uid(),
                gid: meta.gid(),
            });
        }
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    out
}

/// Everything `--privileged` implies.
pub fn privileged_modifiers(dev_root: &Path) -> Vec<SpecModifier> {
    let mut mods = vec![
        SpecModifier::AddCapability("ALL".into()),
        SpecModifier::Unmask,
        SpecModifier::SetNoNewPrivileges(false),
        SpecModifier::SetSeccomp(None),
        SpecModifier::SetApparmor(None),
        SpecModifier::AddMount(DraftMount::new("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev"])),
        SpecModifier::AddMount(DraftMount::new(
            "/sys/fs/cgroup",
            "cgroup",
            "cgroup",
            &["nosuid", "noexec", "nodev"],
        )),
        SpecModifier::AllowDevice(DeviceRule {
            allow: true,
            kind: 'a',
            major: None,
            minor: None,
            access: "rwm".to_string(),
        }),
    ];
    mods.extend(host_devices(dev_root).into_iter().map(SpecModifier::AddDevice));
    mods
}

/// Convert a Docker-format seccomp profile into the OCI form, keeping only
/// rules whose capability conditions hold for `caps`.
pub fn convert_seccomp_profile(profile: &Value, caps: &BTreeSet<String>) -> Result<LinuxSeccomp> {
    let obj = profile
        .as_object()
        .ok_or_else(|| BoxError::invalid("seccomp profile must be a JSON object"))?;
    let mut out = serde_json::Map::new();
    let default_action = obj
        .get("defaultAction")
        .cloned()
        .ok_or_else(|| BoxError::invalid("seccomp profile has no defaultAction"))?;
    out.insert("defaultAction".into(), default_action);
    if let Some(ret) = obj.get("defaultErrnoRet") {
        out.insert("defaultErrnoRet".into(), ret.clone());
    }

    let mut arches: Vec<Value> = obj
        .get("architectures")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if let Some(map) = obj.get("archMap").and_then(Value::as_array) {
        for entry in map {
            if let Some(a) = entry.get("architecture") {
                arches.push(a.clone());
            }
            if let Some(subs) = entry.get("subArchitectures").and_then(Value::as_array) {
                arches.extend(subs.iter().cloned());
            }
        }
    }
    if !arches.is_empty() {
        out.insert("architectures".into(), Value::Array(arches));
    }

    let cap_list = |rule: &Value, key: &str| -> Vec<String> {
        rule.get(key)
            .and_then(|v| v.get("caps"))
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|c| c.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    };
    let mut syscalls = Vec::new();
    for rule in obj.get("syscalls").and_then(Value::as_array).into_iter().flatten() {
        if !cap_list(rule, "includes").iter().all(|c| caps.contains(c)) {
            continue;
        }
        if cap_list(rule, "excludes").iter().any(|c| caps.contains(c)) {
            continue;
        }
        let mut names: Vec<Value> = rule
            .get("names")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if let Some(name) = rule.get("name") {
            names.push(name.clone());
        }
        if names.is_empty() {
            continue;
        }
        let mut converted = json!({
            "names": names,
            "action": rule.get("action").cloned().unwrap_or(Value::Null),
        });
        if let Some(args) = rule.get("args").filter(|a| !a.is_null()) {
            converted["args"] = args.clone();
        }
        if let Some(ret) = rule.get("errnoRet") {
            converted["errnoRet"] = ret.clone();
        }
        syscalls.push(converted);
    }
    if !syscalls.is_empty() {
        out.insert("syscalls".into(), Value::Array(syscalls));
    }
    serde_json::from_value(Value::Object(out))
        .map_err(|e| BoxError::invalid(format!("invalid seccomp profile: {e}")))
}

fn parse_bool_opt(value: Option<&str>, raw: &str) -> Result<bool> {
    match value {
        None | Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(_) => Err(BoxError::invalid(format!("invalid security-opt {raw:?}"))),
    }
}

/// Modifiers for `--security-opt` values.
pub fn security_opt_modifiers(opts: &[String], caps: &BTreeSet<String>) -> Result<Vec<SpecModifier>> {
    let mut mods = Vec::new();
    for raw in opts {
        let (key, value) = match raw.split_once(&['=', ':'][..]) {
            Some((k, v)) => (k, Some(v)),
            None => (raw.as_str(), None),
        };
        match key {
            "seccomp" => match value {
                Some("unconfined") => mods.push(SpecModifier::SetSeccomp(None)),
                Some(path) if !path.is_empty() => {
                    let data = std::fs::read(path).map_err(|e| {
                        BoxError::invalid(format!("failed to read seccomp profile {path}: {e}"))
                    })?;
                    let profile: Value = serde_json::from_slice(&data).map_err(|e| {
                        BoxError::invalid(format!("failed to parse seccomp profile {path}: {e}"))
                    })?;
                    mods.push(SpecModifier::SetSeccomp(Some(convert_seccomp_profile(&profile, caps)?)));
                }
                _ => return Err(BoxError::invalid(format!("invalid security-opt {raw:?}"))),
            },
            "apparmor" => match value {
                Some("unconfined") => mods.push(SpecModifier::SetApparmor(None)),
                Some(profile) if !profile.is_empty() => {
                    mods.push(SpecModifier::SetApparmor(Some(profile.to_string())))
                }
                _ => return Err(BoxError::invalid(format!("invalid security-opt {raw:?}"))),
            },
            "no-new-privileges" => {
                mods.push(SpecModifier::SetNoNewPrivileges(parse_bool_opt(value, raw)?))
            }
            "label" => tracing::debug!(opt = %raw, "ignoring SELinux label option"),
            _ => {
                return Err(BoxError::invalid(format!(
                    "unknown security-opt {raw:?} (supported: seccomp, apparmor, no-new-privileges)"
                )))
            }
        }
    }
    Ok(mods)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_effective_caps() {
        let caps = effective_caps(&strings(&["net_admin"]), &strings(&["CAP_CHOWN"]), false).unwrap();
        assert!(caps.contains("CAP_NET_ADMIN"));
        assert!(!caps.contains("CAP_CHOWN"));
        assert_eq!(caps.len(), DEFAULT_CAPS.len());

        let caps = effective_caps(&strings(&["ALL"]), &strings(&["sys_admin"]), false).unwrap();
        assert_eq!(caps.len(), ALL_CAPS.len() - 1);

        let caps = effective_caps(&strings(&["kill"]), &strings(&["ALL"]), false).unwrap();
        assert_eq!(caps.into_iter().collect::<Vec<_>>(), vec!["CAP_KILL"]);

        let caps = effective_caps(&[], &[], true).unwrap();
        assert_eq!(caps.len(), ALL_CAPS.len());
    }

    #[test]
    fn test_unknown_capability() {
        assert!(capability_modifiers(&strings(&["CAP_TELEPORT"]), &[]).is_err());
    }

    #[test]
    fn test_privileged_includes_host_devices() {
        let dir = TempDir::new().unwrap();
        // Regular files are not devices and are skipped.
        std::fs::write(dir.path().join("not-a-device"), "").unwrap();
        let mods = privileged_modifiers(dir.path());
        assert!(mods.iter().any(|m| matches!(m, SpecModifier::Unmask)));
        assert!(!mods.iter().any(|m| matches!(m, SpecModifier::AddDevice(_))));

        let host = privileged_modifiers(Path::new("/dev"));
        assert!(host
            .iter()
            .any(|m| matches!(m, SpecModifier::AddDevice(d) if d.path == "/dev/null")));
    }

    #[test]
    fn test_security_opts() {
        let caps = BTreeSet::new();
        let mods = security_opt_modifiers(
            &strings(&["no-new-privileges", "apparmor=unconfined", "seccomp=unconfined"]),
            &caps,
        )
        .unwrap();
        assert!(matches!(mods[0], SpecModifier::SetNoNewPrivileges(true)));
        assert!(matches!(mods[1], SpecModifier::SetApparmor(None)));
        assert!(matches!(mods[2], SpecModifier::SetSeccomp(None)));

        let mods = security_opt_modifiers(&strings(&["no-new-privileges:false"]), &caps).unwrap();
        assert!(matches!(mods[0], SpecModifier::SetNoNewPrivileges(false)));
        assert!(security_opt_modifiers(&strings(&["selinux=on"]), &caps).is_err());
    }

    #[test]
    fn test_seccomp_profile_conversion() {
        let profile = json!({
            "defaultAction": "SCMP_ACT_ERRNO",
            "archMap": [{"architecture": "SCMP_ARCH_X86_64", "subArchitectures": ["SCMP_ARCH_X86"]}],
            "syscalls": [
                {"names": ["read", "write"], "action": "SCMP_ACT_ALLOW"},
                {"names": ["mount"], "action": "SCMP_ACT_ALLOW", "includes": {"caps": ["CAP_SYS_ADMIN"]}},
                {"names": ["chown"], "action": "SCMP_ACT_ALLOW", "excludes": {"caps": ["CAP_SYS_ADMIN"]}}
            ]
        });
        let caps: BTreeSet<String> = ["CAP_CHOWN".to_string()].into_iter().collect();
        let seccomp = convert_seccomp_profile(&profile, &caps).unwrap();
        let rules = seccomp.syscalls().as_ref().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(seccomp.architectures().as_ref().unwrap().len(), 2);

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("profile.json");
        std::fs::write(&path, profile.to_string()).unwrap();
        let mods =
            security_opt_modifiers(&[format!("seccomp={}", path.display())], &caps).unwrap();
        assert!(matches!(&mods[0], SpecModifier::SetSeccomp(Some(_))));
    }
}
