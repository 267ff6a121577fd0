//! Ordered edits to a [`SpecDraft`].

use std::path::PathBuf;

use oci_spec::runtime::{Hooks, LinuxSeccomp};

use super::draft::{
    same_path, Device, DeviceRule, DraftMount, DraftUser, NamespaceKind, Resources, Rlimit,
    SpecDraft, ALL_CAPS,
};

/// One edit. A build produces a list of these; they are applied in
/// insertion order, so a later modifier wins over an earlier one.
#[derive(Debug, Clone)]
pub enum SpecModifier {
    SetHostname(String),
    SetArgs(Vec<String>),
    SetEnv(Vec<String>),
    SetCwd(String),
    SetTerminal(bool),
    SetUser(DraftUser),
    AddGroups(Vec<u32>),
    /// Replaces any mount already at the same destination.
    AddMount(DraftMount),
    RemoveMount(String),
    AddCapability(String),
    DropCapability(String),
    SetCgroup(String),
    SetResources(Resources),
    /// Create the namespace (`None`) or join the one at the path.
    SetNamespace(NamespaceKind, Option<PathBuf>),
    RemoveNamespace(NamespaceKind),
    AddDevice(Device),
    AllowDevice(DeviceRule),
    SetRlimit(Rlimit),
    SetSysctl(String, String),
    SetOomScoreAdj(i32),
    SetNoNewPrivileges(bool),
    SetApparmor(Option<String>),
    SetSeccomp(Option<LinuxSeccomp>),
    /// Clear masked and read-only proc/sys paths.
    Unmask,
    SetRootReadonly(bool),
    SetAnnotation(String, String),
    SetHooks(Hooks),
}

impl SpecModifier {
    pub fn apply(self, draft: &mut SpecDraft) {
        match self {
            Self::SetHostname(h) => draft.hostname = Some(h),
            Self::SetArgs(args) => draft.args = args,
            Self::SetEnv(env) => draft.env = env,
            Self::SetCwd(cwd) => draft.cwd = cwd,
            Self::SetTerminal(t) => draft.terminal = t,
            Self::SetUser(user) => draft.user = user,
            Self::AddGroups(gids) => {
                for gid in gids {
                    if !draft.user.additional_gids.contains(&gid) {
                        draft.user.additional_gids.push(gid);
                    }
                }
            }
            Self::AddMount(mount) => {
                draft
                    .mounts
                    .retain(|m| !same_path(&m.destination, &mount.destination));
                draft.mounts.push(mount);
            }
            Self::RemoveMount(dest) => draft.mounts.retain(|m| !same_path(&m.destination, &dest)),
            Self::AddCapability(cap) if cap == "ALL" => {
                draft
                    .capabilities
                    .extend(ALL_CAPS.iter().map(|c| c.to_string()));
            }
            Self::AddCapability(cap) => {
                draft.capabilities.insert(cap);
            }
            Self::DropCapability(cap) if cap == "ALL" => draft.capabilities.clear(),
            Self::DropCapability(cap) => {
                draft.capabilities.remove(&cap);
            }
            Self::SetCgroup(path) => draft.cgroups_path = Some(path),
            Self::SetResources(res) => draft.resources = res,
            Self::SetNamespace(kind, path) => {
                draft.namespaces.insert(kind, path);
            }
            Self::RemoveNamespace(kind) => {
                draft.namespaces.remove(&kind);
            }
            Self::AddDevice(dev) => {
                draft.devices.retain(|d| d.path != dev.path);
                draft.devices.push(dev);
            }
            Self::AllowDevice(rule) => draft.device_rules.push(rule),
            Self::SetRlimit(limit) => {
                draft.rlimits.retain(|r| r.kind != limit.kind);
                draft.rlimits.push(limit);
            }
            Self::SetSysctl(k, v) => {
                draft.sysctl.insert(k, v);
            }
            Self::SetOomScoreAdj(adj) => draft.oom_score_adj = Some(adj),
            Self::SetNoNewPrivileges(v) => draft.no_new_privileges = v,
            Self::SetApparmor(profile) => draft.apparmor_profile = profile,
            Self::SetSeccomp(profile) => draft.seccomp = profile,
            Self::Unmask => {
                draft.masked_paths.clear();
                draft.readonly_paths.clear();
            }
            Self::SetRootReadonly(ro) => draft.root_readonly = ro,
            Self::SetAnnotation(k, v) => {
                draft.annotations.insert(k, v);
            }
            Self::SetHooks(hooks) => draft.hooks = Some(hooks),
        }
    }
}

/// Apply `modifiers` to `draft` in order.
pub fn apply_all(draft: &mut SpecDraft, modifiers: Vec<SpecModifier>) {
    for m in modifiers {
        m.apply(draft);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> SpecDraft {
        SpecDraft::new(PathBuf::from("/rootfs"))
    }

    #[test]
    fn test_later_mount_replaces_earlier() {
        let mut d = draft();
        apply_all(
            &mut d,
            vec![
                SpecModifier::AddMount(DraftMount::new("/data", "bind", "/a", &["rbind"])),
                SpecModifier::AddMount(DraftMount::new("/data/", "bind", "/b", &["rbind"])),
            ],
        );
        let data: Vec<_> = d.mounts.iter().filter(|m| same_path(&m.destination, "/data")).collect();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].source, "/b");
    }

    #[test]
    fn test_capability_all_then_drop() {
        let mut d = draft();
        apply_all(
            &mut d,
            vec![
                SpecModifier::AddCapability("ALL".into()),
                SpecModifier::DropCapability("CAP_SYS_ADMIN".into()),
            ],
        );
        assert_eq!(d.capabilities.len(), ALL_CAPS.len() - 1);
        assert!(!d.capabilities.contains("CAP_SYS_ADMIN"));

        apply_all(&mut d, vec![SpecModifier::DropCapability("ALL".into())]);
        assert!(d.capabilities.is_empty());
    }

    #[test]
    fn test_namespace_join_and_remove() {
        let mut d = draft();
        apply_all(
            &mut d,
            vec![
                SpecModifier::RemoveNamespace(NamespaceKind::Network),
                SpecModifier::SetNamespace(NamespaceKind::Ipc, Some(PathBuf::from("/proc/7/ns/ipc"))),
            ],
        );
        assert!(!d.namespaces.contains_key(&NamespaceKind::Network));
        assert_eq!(
            d.namespaces[&NamespaceKind::Ipc],
            Some(PathBuf::from("/proc/7/ns/ipc"))
        );
    }

    #[test]
    fn test_group_add_dedups() {
        let mut d = draft();
        apply_all(
            &mut d,
            vec![
                SpecModifier::AddGroups(vec![10, 20]),
                SpecModifier::AddGroups(vec![20, 30]),
            ],
        );
        assert_eq!(d.user.additional_gids, vec![10, 20, 30]);
    }
}
