//! `-v`, `--mount`, `--tmpfs`, `--shm-size` and image `VOLUME` handling.
//!
//! Nothing here touches the volume store. Volumes that need to exist are
//! returned as [`MountIntent`]s and committed by the lifecycle engine.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use cdbox_core::config::validate_name;
use cdbox_core::container::{MountRecord, MountType};
use cdbox_core::error::{BoxError, Result};
use cdbox_core::units::parse_size;

use super::draft::{same_path, DraftMount};
use super::modifier::SpecModifier;
use crate::volume::VolumeStore;

const PROPAGATIONS: &[&str] = &["private", "rprivate", "shared", "rshared", "slave", "rslave"];

/// Work the lifecycle engine performs before the container exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountIntent {
    /// Create the named volume unless it exists.
    NamedVolume(String),
    /// Create the anonymous volume owned by the container.
    AnonymousVolume(String),
    /// Seed an empty volume with the image content at `destination`.
    CopyUp { volume: String, destination: String },
    /// Create a missing `-v` bind source.
    HostDir(PathBuf),
}

#[derive(Debug, Default)]
pub struct MountPlan {
    pub modifiers: Vec<SpecModifier>,
    pub records: Vec<MountRecord>,
    pub intents: Vec<MountIntent>,
    pub anon_volumes: Vec<String>,
}

pub struct MountInput<'a> {
    pub volumes: &'a [String],
    pub tmpfs: &'a [String],
    pub mounts: &'a [String],
    pub image_volumes: &'a [String],
    pub shm_size: Option<&'a str>,
    pub read_only: bool,
    pub store: &'a VolumeStore,
    /// Base for relative bind sources.
    pub cwd: &'a Path,
}

/// Parsed options of one mount.
#[derive(Debug, Default)]
struct MountOpts {
    read_only: bool,
    propagation: Option<String>,
    nocopy: bool,
}

impl MountOpts {
    fn bind_options(&self) -> Vec<String> {
        vec![
            "rbind".to_string(),
            self.propagation.clone().unwrap_or_else(|| "rprivate".to_string()),
            if self.read_only { "ro" } else { "rw" }.to_string(),
        ]
    }

    fn record_options(&self) -> Vec<String> {
        let mut opts = vec![if self.read_only { "ro" } else { "rw" }.to_string()];
        if let Some(p) = &self.propagation {
            opts.push(p.clone());
        }
        if self.nocopy {
            opts.push("nocopy".to_string());
        }
        opts
    }
}

enum Source {
    Bind(PathBuf),
    Named(String),
    Anonymous,
}

impl<'a> MountInput<'a> {
    pub fn plan(&self) -> Result<MountPlan> {
        let mut plan = MountPlan::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut claim = |dest: &str| -> Result<()> {
            if !seen.insert(dest.trim_end_matches('/').to_string()) {
                return Err(BoxError::invalid(format!("duplicate mount point: {dest}")));
            }
            Ok(())
        };

        for spec in self.volumes {
            let (source, dest, opts) = parse_volume(spec, self.cwd)?;
            claim(&dest)?;
            self.add(&mut plan, source, &dest, opts, true);
        }
        for spec in self.mounts {
            match parse_mount(spec, self.cwd)? {
                Typed::Tmpfs { dest, options } => {
                    claim(&dest)?;
                    add_tmpfs(&mut plan, &dest, options);
                }
                Typed::Other { source, dest, opts } => {
                    claim(&dest)?;
                    if let Source::Bind(path) = &source {
                        if !path.exists() {
                            return Err(BoxError::invalid(format!(
                                "bind source path does not exist: {}",
                                path.display()
                            )));
                        }
                    }
                    self.add(&mut plan, source, &dest, opts, false);
                }
            }
        }
        for spec in self.tmpfs {
            let (dest, options) = parse_tmpfs(spec)?;
            claim(&dest)?;
            add_tmpfs(&mut plan, &dest, options);
        }
        for dest in self.image_volumes {
            let taken = plan.records.iter().any(|r| same_path(&r.destination, dest));
            if !taken {
                self.add(&mut plan, Source::Anonymous, dest, MountOpts::default(), false);
            }
        }
        if let Some(size) = self.shm_size {
            let bytes = parse_size(size)?;
            if bytes == 0 {
                return Err(BoxError::invalid("shm-size must be greater than 0"));
            }
            plan.modifiers.push(SpecModifier::AddMount(DraftMount {
                destination: "/dev/shm".to_string(),
                kind: "tmpfs".to_string(),
                source: "shm".to_string(),
                options: vec![
                    "nosuid".into(),
                    "noexec".into(),
                    "nodev".into(),
                    "mode=1777".into(),
                    format!("size={bytes}"),
                ],
            }));
        }
        if self.read_only {
            plan.modifiers.push(SpecModifier::SetRootReadonly(true));
        }
        Ok(plan)
    }

    fn add(&self, plan: &mut MountPlan, source: Source, dest: &str, opts: MountOpts, create_host: bool) {
        let (kind, name, host_path, anonymous) = match source {
            Source::Bind(path) => {
                if create_host && !path.exists() {
                    plan.intents.push(MountIntent::HostDir(path.clone()));
                }
                let s = path.display().to_string();
                (MountType::Bind, s.clone(), s, false)
            }
            Source::Named(name) => {
                plan.intents.push(MountIntent::NamedVolume(name.clone()));
                let mp = self.store.mountpoint(&name).display().to_string();
                (MountType::Volume, name, mp, false)
            }
            Source::Anonymous => {
                let name = crate::ids::generate_id();
                plan.intents.push(MountIntent::AnonymousVolume(name.clone()));
                plan.anon_volumes.push(name.clone());
                let mp = self.store.mountpoint(&name).display().to_string();
                (MountType::Volume, name, mp, true)
            }
        };
        if kind == MountType::Volume && !opts.nocopy {
            plan.intents.push(MountIntent::CopyUp {
                volume: name.clone(),
                destination: dest.to_string(),
            });
        }
        plan.modifiers.push(SpecModifier::AddMount(DraftMount {
            destination: dest.to_string(),
            kind: "bind".to_string(),
            source: host_path.clone(),
            options: opts.bind_options(),
        }));
        plan.records.push(MountRecord {
            kind,
            name,
            source: host_path,
            destination: dest.to_string(),
            options: opts.record_options(),
            anonymous,
        });
    }
}

fn add_tmpfs(plan: &mut MountPlan, dest: &str, options: Vec<String>) {
    plan.modifiers.push(SpecModifier::AddMount(DraftMount {
        destination: dest.to_string(),
        kind: "tmpfs".to_string(),
        source: "tmpfs".to_string(),
        options: options.clone(),
    }));
    plan.records.push(MountRecord {
        kind: MountType::Tmpfs,
        name: String::new(),
        source: "tmpfs".to_string(),
        destination: dest.to_string(),
        options,
        anonymous: false,
    });
}

fn check_destination(dest: &str, raw: &str) -> Result<()> {
    if !dest.starts_with('/') {
        return Err(BoxError::invalid(format!(
            "mount destination must be absolute: {dest:?} in {raw:?}"
        )));
    }
    if dest == "/" {
        return Err(BoxError::invalid(format!("cannot mount over / in {raw:?}")));
    }
    Ok(())
}

fn classify_source(src: &str, cwd: &Path, raw: &str) -> Result<Source> {
    if src.starts_with('/') {
        return Ok(Source::Bind(PathBuf::from(src)));
    }
    if src == "." || src.starts_with("./") || src.starts_with("../") || src == ".." {
        return Ok(Source::Bind(normalize(&cwd.join(src))));
    }
    if src.contains('/') {
        return Err(BoxError::invalid(format!(
            "invalid volume source {src:?} in {raw:?}: use an absolute or ./ relative path"
        )));
    }
    validate_name("volume", src)?;
    Ok(Source::Named(src.to_string()))
}

/// Lexically resolve `.` and `..`.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

fn parse_volume_opts(raw_opts: &str, raw: &str) -> Result<MountOpts> {
    let mut opts = MountOpts::default();
    for opt in raw_opts.split(',').filter(|o| !o.is_empty()) {
        match opt {
            "ro" => opts.read_only = true,
            "rw" => opts.read_only = false,
            "nocopy" => opts.nocopy = true,
            // SELinux relabel and bind flavors are accepted and ignored.
            "z" | "Z" | "bind" | "rbind" => {}
            p if PROPAGATIONS.contains(&p) => opts.propagation = Some(p.to_string()),
            other => {
                return Err(BoxError::invalid(format!(
                    "unsupported volume option {other:?} in {raw:?}"
                )))
            }
        }
    }
    Ok(opts)
}

/// `src:dst[:opts]` or a bare `dst`.
fn parse_volume(spec: &str, cwd: &Path) -> Result<(Source, String, MountOpts)> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (source, dest, opts) = match parts.as_slice() {
        [dest] => (Source::Anonymous, *dest, MountOpts::default()),
        [src, dest] => (classify_source(src, cwd, spec)?, *dest, MountOpts::default()),
        [src, dest, opts] => (
            classify_source(src, cwd, spec)?,
            *dest,
            parse_volume_opts(opts, spec)?,
        ),
        _ => return Err(BoxError::invalid(format!("invalid volume spec {spec:?}"))),
    };
    check_destination(dest, spec)?;
    if matches!(source, Source::Bind(_)) && opts.nocopy {
        return Err(BoxError::invalid(format!("nocopy only applies to volumes: {spec:?}")));
    }
    Ok((source, dest.to_string(), opts))
}

fn tmpfs_options(size: Option<&str>, mode: Option<&str>, extra: &[&str], raw: &str) -> Result<Vec<String>> {
    let mut options = vec!["nosuid".to_string(), "noexec".to_string(), "nodev".to_string()];
    if let Some(size) = size {
        options.push(format!("size={}", parse_size(size)?));
    }
    if let Some(mode) = mode {
        u32::from_str_radix(mode, 8)
            .map_err(|_| BoxError::invalid(format!("invalid tmpfs mode {mode:?} in {raw:?}")))?;
        options.push(format!("mode={mode}"));
    }
    for opt in extra {
        if !options.iter().any(|o| o == opt) {
            options.push(opt.to_string());
        }
    }
    Ok(options)
}

/// `/dst[:opt,opt]` where options are mount(8) tmpfs options.
fn parse_tmpfs(spec: &str) -> Result<(String, Vec<String>)> {
    let (dest, raw_opts) = spec.split_once(':').unwrap_or((spec, ""));
    check_destination(dest, spec)?;
    let mut size = None;
    let mut mode = None;
    let mut extra = Vec::new();
    for opt in raw_opts.split(',').filter(|o| !o.is_empty()) {
        if let Some(v) = opt.strip_prefix("size=") {
            size = Some(v);
        } else if let Some(v) = opt.strip_prefix("mode=") {
            mode = Some(v);
        } else {
            extra.push(opt);
        }
    }
    Ok((dest.to_string(), tmpfs_options(size, mode, &extra, spec)?))
}

enum Typed {
    Tmpfs { dest: String, options: Vec<String> },
    Other { source: Source, dest: String, opts: MountOpts },
}

/// `type=bind|volume|tmpfs,source=...,target=...,...`
fn parse_mount(spec: &str, cwd: &Path) -> Result<Typed> {
    let mut kind = MountType::Volume;
    let mut source: Option<&str> = None;
    let mut target: Option<&str> = None;
    let mut opts = MountOpts::default();
    let mut tmpfs_size = None;
    let mut tmpfs_mode = None;
    let truthy = |v: &str| -> Result<bool> {
        match v {
            "" | "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            other => Err(BoxError::invalid(format!("invalid boolean {other:?} in {spec:?}"))),
        }
    };

    for field in spec.split(',').filter(|f| !f.is_empty()) {
        let (key, value) = field.split_once('=').unwrap_or((field, ""));
        match key {
            "type" => kind = value.parse()?,
            "source" | "src" => source = Some(value),
            "target" | "destination" | "dst" => target = Some(value),
            "readonly" | "ro" => opts.read_only = truthy(value)?,
            "bind-propagation" => {
                if !PROPAGATIONS.contains(&value) {
                    return Err(BoxError::invalid(format!(
                        "invalid bind-propagation {value:?} in {spec:?}"
                    )));
                }
                opts.propagation = Some(value.to_string());
            }
            "volume-nocopy" => opts.nocopy = truthy(value)?,
            "tmpfs-size" => tmpfs_size = Some(value),
            "tmpfs-mode" => tmpfs_mode = Some(value),
            other => {
                return Err(BoxError::invalid(format!(
                    "unexpected key {other:?} in mount spec {spec:?}"
                )))
            }
        }
    }
    let dest = target
        .ok_or_else(|| BoxError::invalid(format!("mount spec {spec:?} has no target")))?;
    check_destination(dest, spec)?;

    match kind {
        MountType::Tmpfs => {
            if source.is_some() {
                return Err(BoxError::invalid(format!("tmpfs mounts take no source: {spec:?}")));
            }
            let mut options = tmpfs_options(tmpfs_size, tmpfs_mode, &[], spec)?;
            if opts.read_only {
                options.push("ro".to_string());
            }
            Ok(Typed::Tmpfs {
                dest: dest.to_string(),
                options,
            })
        }
        MountType::Bind => {
            let src = source
                .filter(|s| !s.is_empty())
                .ok_or_else(|| BoxError::invalid(format!("bind mount needs a source: {spec:?}")))?;
            let path = if src.starts_with('/') {
                PathBuf::from(src)
            } else {
                normalize(&cwd.join(src))
            };
            Ok(Typed::Other {
                source: Source::Bind(path),
                dest: dest.to_string(),
                opts,
            })
        }
        MountType::Volume => {
            let source = match source.filter(|s| !s.is_empty()) {
                None => Source::Anonymous,
                Some(name) => {
                    validate_name("volume", name)?;
                    Source::Named(name.to_string())
                }
            };
            Ok(Typed::Other {
                source,
                dest: dest.to_string(),
                opts,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        store: VolumeStore,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = VolumeStore::new(dir.path().join("volumes"));
        Fixture { dir, store }
    }

    fn input<'a>(f: &'a Fixture, volumes: &'a [String]) -> MountInput<'a> {
        MountInput {
            volumes,
            tmpfs: &[],
            mounts: &[],
            image_volumes: &[],
            shm_size: None,
            read_only: false,
            store: &f.store,
            cwd: f.dir.path(),
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_bind_named_and_anonymous() {
        let f = fixture();
        let host = f.dir.path().join("host");
        std::fs::create_dir(&host).unwrap();
        let vols = strings(&[
            &format!("{}:/src:ro,rslave", host.display()),
            "cache:/cache",
            "/scratch",
        ]);
        let plan = input(&f, &vols).plan().unwrap();

        assert_eq!(plan.records.len(), 3);
        assert_eq!(plan.records[0].kind, MountType::Bind);
        assert!(plan.records[0].read_only());
        assert_eq!(plan.records[1].name, "cache");
        assert_eq!(plan.records[1].source, f.store.mountpoint("cache").display().to_string());
        assert!(plan.records[2].anonymous);
        assert_eq!(plan.anon_volumes, vec![plan.records[2].name.clone()]);

        assert!(plan.intents.contains(&MountIntent::NamedVolume("cache".into())));
        assert!(plan
            .intents
            .contains(&MountIntent::AnonymousVolume(plan.anon_volumes[0].clone())));
        let copy_ups = plan
            .intents
            .iter()
            .filter(|i| matches!(i, MountIntent::CopyUp { .. }))
            .count();
        assert_eq!(copy_ups, 2);
        assert!(!f.store.exists("cache"));
    }

    #[test]
    fn test_image_volume_becomes_anonymous_unless_mounted() {
        let f = fixture();
        let vols = strings(&["data:/data"]);
        let image_volumes = strings(&["/data", "/logs"]);
        let mut inp = input(&f, &vols);
        inp.image_volumes = &image_volumes;
        let plan = inp.plan().unwrap();
        assert_eq!(plan.anon_volumes.len(), 1);
        let anon = plan.records.iter().find(|r| r.anonymous).unwrap();
        assert_eq!(anon.destination, "/logs");
    }

    #[test]
    fn test_nocopy_skips_copy_up() {
        let f = fixture();
        let vols = strings(&["data:/data:nocopy"]);
        let plan = input(&f, &vols).plan().unwrap();
        assert!(!plan
            .intents
            .iter()
            .any(|i| matches!(i, MountIntent::CopyUp { .. })));
    }

    #[test]
    fn test_relative_bind_resolves_against_cwd() {
        let f = fixture();
        let vols = strings(&["./site/../www:/usr/share/nginx/html"]);
        let plan = input(&f, &vols).plan().unwrap();
        assert_eq!(
            plan.records[0].source,
            f.dir.path().join("www").display().to_string()
        );
        assert_eq!(plan.intents, vec![MountIntent::HostDir(f.dir.path().join("www"))]);
    }

    #[test]
    fn test_typed_mounts() {
        let f = fixture();
        let mounts = strings(&[
            "type=tmpfs,target=/run,tmpfs-size=64m,tmpfs-mode=1777",
            "type=volume,source=db,target=/var/lib/db,volume-nocopy",
            &format!("type=bind,src={},dst=/etc/app,readonly", f.dir.path().display()),
        ]);
        let mut inp = input(&f, &[]);
        inp.mounts = &mounts;
        let plan = inp.plan().unwrap();
        assert_eq!(plan.records[0].kind, MountType::Tmpfs);
        assert!(plan.records[0].options.contains(&format!("size={}", 64 << 20)));
        assert!(plan.records[0].options.contains(&"mode=1777".to_string()));
        assert_eq!(plan.records[1].name, "db");
        assert!(plan.records[2].read_only());
    }

    #[test]
    fn test_typed_bind_requires_existing_source() {
        let f = fixture();
        let mounts = strings(&["type=bind,source=/definitely/not/here,target=/x"]);
        let mut inp = input(&f, &[]);
        inp.mounts = &mounts;
        assert!(inp.plan().is_err());
    }

    #[test]
    fn test_duplicate_destination_rejected() {
        let f = fixture();
        let vols = strings(&["a:/data", "b:/data/"]);
        assert!(input(&f, &vols).plan().is_err());
    }

    #[test]
    fn test_bad_specs() {
        let f = fixture();
        for spec in ["a:relative", "a:b:c:d", "a:/x:bogus", "some/path:/x", "/:/"] {
            let vols = strings(&[spec]);
            assert!(input(&f, &vols).plan().is_err(), "{spec} should fail");
        }
    }

    #[test]
    fn test_tmpfs_flag_and_shm_size() {
        let f = fixture();
        let tmpfs = strings(&["/tmp:size=1m,exec"]);
        let mut inp = input(&f, &[]);
        inp.tmpfs = &tmpfs;
        inp.shm_size = Some("128m");
        let plan = inp.plan().unwrap();
        assert_eq!(plan.records[0].options, vec!["nosuid", "noexec", "nodev", "size=1048576", "exec"]);
        let shm = plan.modifiers.iter().any(|m| match m {
            SpecModifier::AddMount(mnt) => {
                mnt.destination == "/dev/shm" && mnt.options.contains(&format!("size={}", 128 << 20))
            }
            _ => false,
        });
        assert!(shm);
    }
}
