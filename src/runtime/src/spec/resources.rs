//! cgroup placement, resource limits, devices and sysctls.

use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use cdbox_core::config::CgroupManager;
use cdbox_core::error::{BoxError, Result};
use cdbox_core::units::parse_size;

use super::draft::{Device, DeviceRule, Resources, Throttle};
use super::modifier::SpecModifier;
use super::options::CreateOptions;

const DEFAULT_CPU_PERIOD: u64 = 100_000;

/// Namespaced sysctl prefixes a container may set.
const SYSCTL_PREFIXES: &[&str] = &["kernel.msg", "kernel.shm", "fs.mqueue.", "net."];
const SYSCTL_EXACT: &[&str] = &["kernel.sem", "kernel.domainname", "kernel.hostname"];

/// cgroups path for the runtime.
pub fn cgroups_path(
    manager: CgroupManager,
    parent: Option<&str>,
    namespace: &str,
    id: &str,
) -> Option<String> {
    match manager {
        CgroupManager::None => None,
        CgroupManager::Systemd => {
            let slice = parent.filter(|p| !p.is_empty()).unwrap_or("system.slice");
            Some(format!("{slice}:cdbox:{id}"))
        }
        CgroupManager::Cgroupfs => match parent.filter(|p| !p.is_empty()) {
            Some(parent) => Some(format!("{}/{id}", parent.trim_end_matches('/'))),
            None => Some(format!("/{namespace}/{id}")),
        },
    }
}

fn size_i64(raw: &str, what: &str) -> Result<i64> {
    let bytes = parse_size(raw)?;
    i64::try_from(bytes).map_err(|_| BoxError::invalid(format!("{what} too large: {raw}")))
}

fn dev_major(rdev: u64) -> i64 {
    (((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff)) as i64
}

fn dev_minor(rdev: u64) -> i64 {
    ((rdev & 0xff) | ((rdev >> 12) & !0xff)) as i64
}

/// Major, minor and type of a device node.
fn device_numbers(path: &Path) -> Result<(char, i64, i64, u32, u32, u32)> {
    let meta = std::fs::metadata(path).map_err(|e| {
        BoxError::invalid(format!("error gathering device information for {}: {}", path.display(), e))
    })?;
    let ft = meta.file_type();
    let kind = if ft.is_char_device() {
        'c'
    } else if ft.is_block_device() {
        'b'
    } else {
        return Err(BoxError::invalid(format!("{} is not a device node", path.display())));
    };
    let rdev = meta.rdev();
    Ok((kind, dev_major(rdev), dev_minor(rdev), meta.mode() & 0o7777, meta.uid(), meta.gid()))
}

fn parse_throttle(spec: &str, iops: bool) -> Result<Throttle> {
    let (path, rate) = spec
        .rsplit_once(':')
        .ok_or_else(|| BoxError::invalid(format!("invalid device throttle {spec:?}: expected <device>:<rate>")))?;
    let rate = if iops {
        rate.parse::<u64>()
            .map_err(|_| BoxError::invalid(format!("invalid rate {rate:?} in {spec:?}")))?
    } else {
        parse_size(rate)?
    };
    let (kind, major, minor, ..) = device_numbers(Path::new(path))?;
    if kind != 'b' {
        return Err(BoxError::invalid(format!("{path} is not a block device")));
    }
    Ok(Throttle { major, minor, rate })
}

/// Resource limits from the options.
pub fn resources(opts: &CreateOptions) -> Result<Resources> {
    let mut res = Resources {
        cpu_shares: opts.cpu_shares,
        cpu_quota: opts.cpu_quota,
        cpu_period: opts.cpu_period,
        cpuset_cpus: opts.cpuset_cpus.clone(),
        cpuset_mems: opts.cpuset_mems.clone(),
        oom_kill_disable: opts.oom_kill_disable,
        ..Resources::default()
    };
    if let Some(cpus) = opts.cpus {
        if opts.cpu_quota.is_some() || opts.cpu_period.is_some() {
            return Err(BoxError::invalid(
                "conflicting options: --cpus and --cpu-period/--cpu-quota cannot both be set",
            ));
        }
        if cpus <= 0.0 || !cpus.is_finite() {
            return Err(BoxError::invalid(format!("invalid --cpus value {cpus}")));
        }
        res.cpu_period = Some(DEFAULT_CPU_PERIOD);
        res.cpu_quota = Some((cpus * DEFAULT_CPU_PERIOD as f64).round() as i64);
    }

    if let Some(mem) = &opts.memory {
        res.memory_limit = Some(size_i64(mem, "memory")?);
    }
    if let Some(swap) = &opts.memory_swap {
        let limit = res
            .memory_limit
            .ok_or_else(|| BoxError::invalid("--memory-swap requires --memory"))?;
        let swap = if swap == "-1" { -1 } else { size_i64(swap, "memory-swap")? };
        if swap != -1 && swap < limit {
            return Err(BoxError::invalid(
                "minimum memoryswap limit should be larger than memory limit",
            ));
        }
        res.memory_swap = Some(swap);
    }
    if let Some(reservation) = &opts.memory_reservation {
        res.memory_reservation = Some(size_i64(reservation, "memory-reservation")?);
    }
    if let Some(swappiness) = opts.memory_swappiness {
        if swappiness > 100 {
            return Err(BoxError::invalid(format!(
                "invalid --memory-swappiness {swappiness}: must be between 0 and 100"
            )));
        }
        res.memory_swappiness = Some(swappiness);
    }

    res.pids_limit = match opts.pids_limit {
        None | Some(0) => None,
        Some(n) if n < 0 => Some(-1),
        Some(n) => Some(n),
    };

    if let Some(weight) = opts.blkio_weight {
        if weight != 0 && !(10..=1000).contains(&weight) {
            return Err(BoxError::invalid(format!(
                "invalid --blkio-weight {weight}: must be between 10 and 1000"
            )));
        }
        if weight != 0 {
            res.blkio_weight = Some(weight);
        }
    }
    res.read_bps = opts.device_read_bps.iter().map(|s| parse_throttle(s, false)).collect::<Result<_>>()?;
    res.write_bps = opts.device_write_bps.iter().map(|s| parse_throttle(s, false)).collect::<Result<_>>()?;
    res.read_iops = opts.device_read_iops.iter().map(|s| parse_throttle(s, true)).collect::<Result<_>>()?;
    res.write_iops = opts.device_write_iops.iter().map(|s| parse_throttle(s, true)).collect::<Result<_>>()?;
    Ok(res)
}

/// `--device host[:container[:mode]]`.
pub fn device_modifiers(spec: &str) -> Result<Vec<SpecModifier>> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (host, container, mode) = match parts.as_slice() {
        [host] => (*host, *host, "rwm"),
        [host, third] if is_mode(third) => (*host, *host, *third),
        [host, container] => (*host, *container, "rwm"),
        [host, container, mode] => (*host, *container, *mode),
        _ => return Err(BoxError::invalid(format!("invalid device spec {spec:?}"))),
    };
    if !is_mode(mode) {
        return Err(BoxError::invalid(format!(
            "invalid device mode {mode:?} in {spec:?}: must be a subset of rwm"
        )));
    }
    if !container.starts_with('/') {
        return Err(BoxError::invalid(format!("device path must be absolute: {container:?}")));
    }
    let (kind, major, minor, file_mode, uid, gid) = device_numbers(Path::new(host))?;
    Ok(vec![
        SpecModifier::AddDevice(Device {
            path: container.to_string(),
            kind,
            major,
            minor,
            file_mode,
            uid,
            gid,
        }),
        SpecModifier::AllowDevice(DeviceRule {
            allow: true,
            kind,
            major: Some(major),
            minor: Some(minor),
            access: mode.to_string(),
        }),
    ])
}

fn is_mode(s: &str) -> bool {
    let mut seen = std::collections::HashSet::new();
    !s.is_empty() && s.chars().all(|c| matches!(c, 'r' | 'w' | 'm') && seen.insert(c))
}

/// `--sysctl k=v`. Only namespaced keys are accepted; `net.*` needs a private
/// network namespace.
pub fn sysctl_modifiers(items: &[String], host_network: bool) -> Result<Vec<SpecModifier>> {
    items
        .iter()
        .map(|item| {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| BoxError::invalid(format!("invalid sysctl {item:?}: expected key=value")))?;
            let namespaced = SYSCTL_EXACT.contains(&key)
                || SYSCTL_PREFIXES.iter().any(|p| key.starts_with(p));
            if !namespaced {
                return Err(BoxError::invalid(format!("sysctl {key:?} is not allowed")));
            }
            if host_network && key.starts_with("net.") {
                return Err(BoxError::invalid(format!(
                    "sysctl {key:?} is not allowed in host network mode"
                )));
            }
            Ok(SpecModifier::SetSysctl(key.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cgroups_path() {
        assert_eq!(
            cgroups_path(CgroupManager::Cgroupfs, None, "default", "abc").as_deref(),
            Some("/default/abc")
        );
        assert_eq!(
            cgroups_path(CgroupManager::Cgroupfs, Some("/custom/"), "default", "abc").as_deref(),
            Some("/custom/abc")
        );
        assert_eq!(
            cgroups_path(CgroupManager::Systemd, None, "default", "abc").as_deref(),
            Some("system.slice:cdbox:abc")
        );
        assert_eq!(cgroups_path(CgroupManager::None, None, "default", "abc"), None);
    }

    #[test]
    fn test_cpus_to_quota() {
        let opts = CreateOptions {
            cpus: Some(1.5),
            ..Default::default()
        };
        let res = resources(&opts).unwrap();
        assert_eq!(res.cpu_period, Some(100_000));
        assert_eq!(res.cpu_quota, Some(150_000));

        let conflicting = CreateOptions {
            cpus: Some(1.0),
            cpu_quota: Some(5000),
            ..Default::default()
        };
        assert!(resources(&conflicting).is_err());
    }

    #[test]
    fn test_memory_limits() {
        let opts = CreateOptions {
            memory: Some("64m".into()),
            memory_swap: Some("128m".into()),
            memory_swappiness: Some(10),
            ..Default::default()
        };
        let res = resources(&opts).unwrap();
        assert_eq!(res.memory_limit, Some(64 << 20));
        assert_eq!(res.memory_swap, Some(128 << 20));

        let smaller_swap = CreateOptions {
            memory: Some("64m".into()),
            memory_swap: Some("32m".into()),
            ..Default::default()
        };
        assert!(resources(&smaller_swap).is_err());

        let swap_only = CreateOptions {
            memory_swap: Some("-1".into()),
            ..Default::default()
        };
        assert!(resources(&swap_only).is_err());
    }

    #[test]
    fn test_pids_and_blkio() {
        let opts = CreateOptions {
            pids_limit: Some(-5),
            blkio_weight: Some(500),
            ..Default::default()
        };
        let res = resources(&opts).unwrap();
        assert_eq!(res.pids_limit, Some(-1));
        assert_eq!(res.blkio_weight, Some(500));
        let bad = CreateOptions {
            blkio_weight: Some(5),
            ..Default::default()
        };
        assert!(resources(&bad).is_err());
    }

    #[test]
    fn test_device_from_host_node() {
        let mods = device_modifiers("/dev/null:/dev/mynull:rw").unwrap();
        match &mods[0] {
            SpecModifier::AddDevice(d) => {
                assert_eq!(d.path, "/dev/mynull");
                assert_eq!((d.kind, d.major, d.minor), ('c', 1, 3));
            }
            other => panic!("unexpected {other:?}"),
        }
        match &mods[1] {
            SpecModifier::AllowDevice(rule) => assert_eq!(rule.access, "rw"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(device_modifiers("/dev/null:/dev/x:rwx").is_err());
        assert!(device_modifiers("/etc/hostname").is_err());
    }

    #[test]
    fn test_device_mode_shorthand() {
        let mods = device_modifiers("/dev/zero:r").unwrap();
        match &mods[0] {
            SpecModifier::AddDevice(d) => assert_eq!(d.path, "/dev/zero"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_sysctls() {
        let ok = sysctl_modifiers(&["net.ipv4.ip_forward=1".into(), "kernel.shmmax=1".into()], false).unwrap();
        assert_eq!(ok.len(), 2);
        assert!(sysctl_modifiers(&["vm.swappiness=1".into()], false).is_err());
        assert!(sysctl_modifiers(&["net.ipv4.ip_forward=1".into()], true).is_err());
    }

    #[test]
    fn test_dev_numbers() {
        let rdev = (8u64 << 8) | 17;
        assert_eq!((dev_major(rdev), dev_minor(rdev)), (8, 17));
    }
}
