//! `--user` and `--group-add` resolution against the image's `/etc/passwd`
//! and `/etc/group`.

use std::path::Path;

use cdbox_core::error::{BoxError, Result};

use super::draft::DraftUser;

#[derive(Debug, Clone, PartialEq, Eq)]
struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GroupEntry {
    name: String,
    gid: u32,
    members: Vec<String>,
}

fn read_lines(rootfs: &Path, file: &str) -> String {
    std::fs::read_to_string(rootfs.join(file.trim_start_matches('/'))).unwrap_or_default()
}

fn parse_passwd(content: &str) -> Vec<PasswdEntry> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let fields: Vec<&str> = l.split(':').collect();
            if fields.len() < 4 {
                return None;
            }
            Some(PasswdEntry {
                name: fields[0].to_string(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
            })
        })
        .collect()
}

fn parse_group(content: &str) -> Vec<GroupEntry> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let fields: Vec<&str> = l.split(':').collect();
            if fields.len() < 3 {
                return None;
            }
            let members = fields
                .get(3)
                .map(|m| {
                    m.split(',')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Some(GroupEntry {
                name: fields[0].to_string(),
                gid: fields[2].parse().ok()?,
                members,
            })
        })
        .collect()
}

/// User database of a root filesystem.
pub struct UserDb {
    passwd: Vec<PasswdEntry>,
    groups: Vec<GroupEntry>,
}

impl UserDb {
    pub fn load(rootfs: &Path) -> Self {
        Self {
            passwd: parse_passwd(&read_lines(rootfs, "/etc/passwd")),
            groups: parse_group(&read_lines(rootfs, "/etc/group")),
        }
    }

    fn group_gid(&self, group: &str) -> Result<u32> {
        if let Ok(gid) = group.parse::<u32>() {
            return Ok(gid);
        }
        self.groups
            .iter()
            .find(|g| g.name == group)
            .map(|g| g.gid)
            .ok_or_else(|| BoxError::invalid(format!("unable to find group {group}: no matching entries in group file")))
    }

    /// Resolve `uid[:gid]` / `name[:group]`. An empty spec is root.
    pub fn resolve(&self, spec: &str) -> Result<DraftUser> {
        if spec.is_empty() {
            return Ok(DraftUser::default());
        }
        let (user, group) = match spec.split_once(':') {
            Some((u, g)) => (u, Some(g)),
            None => (spec, None),
        };
        let mut resolved = if let Ok(uid) = user.parse::<u32>() {
            let entry = self.passwd.iter().find(|p| p.uid == uid);
            DraftUser {
                uid,
                gid: entry.map(|e| e.gid).unwrap_or(0),
                additional_gids: Vec::new(),
                username: None,
            }
        } else {
            let entry = self.passwd.iter().find(|p| p.name == user).ok_or_else(|| {
                BoxError::invalid(format!(
                    "unable to find user {user}: no matching entries in passwd file"
                ))
            })?;
            let mut additional: Vec<u32> = self
                .groups
                .iter()
                .filter(|g| g.members.iter().any(|m| m == user) && g.gid != entry.gid)
                .map(|g| g.gid)
                .collect();
            additional.dedup();
            DraftUser {
                uid: entry.uid,
                gid: entry.gid,
                additional_gids: additional,
                username: Some(entry.name.clone()),
            }
        };
        if let Some(group) = group.filter(|g| !g.is_empty()) {
            resolved.gid = self.group_gid(group)?;
        }
        Ok(resolved)
    }

    /// Resolve `--group-add` values.
    pub fn group_ids(&self, groups: &[String]) -> Result<Vec<u32>> {
        groups.iter().map(|g| self.group_gid(g)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rootfs() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(
            dir.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\nnginx:x:101:101:nginx:/var/cache/nginx:/sbin/nologin\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("etc/group"),
            "root:x:0:\nnginx:x:101:\nwww:x:33:nginx\naudio:x:29:nginx,root\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_resolve_by_name_collects_groups() {
        let dir = rootfs();
        let db = UserDb::load(dir.path());
        let user = db.resolve("nginx").unwrap();
        assert_eq!((user.uid, user.gid), (101, 101));
        assert_eq!(user.additional_gids, vec![33, 29]);
        assert_eq!(user.username.as_deref(), Some("nginx"));
    }

    #[test]
    fn test_numeric_user_resets_groups() {
        let dir = rootfs();
        let db = UserDb::load(dir.path());
        let user = db.resolve("101").unwrap();
        assert_eq!((user.uid, user.gid), (101, 101));
        assert!(user.additional_gids.is_empty());
        let user = db.resolve("1234:www").unwrap();
        assert_eq!((user.uid, user.gid), (1234, 33));
    }

    #[test]
    fn test_unknown_user_fails() {
        let dir = rootfs();
        let db = UserDb::load(dir.path());
        assert!(db.resolve("postgres").is_err());
        assert!(db.resolve("0:nogroup").is_err());
    }

    #[test]
    fn test_group_add() {
        let dir = rootfs();
        let db = UserDb::load(dir.path());
        assert_eq!(db.group_ids(&["audio".into(), "4242".into()]).unwrap(), vec![29, 4242]);
        assert!(db.group_ids(&["video".into()]).is_err());
    }

    #[test]
    fn test_missing_files_fall_back_to_root() {
        let dir = TempDir::new().unwrap();
        let db = UserDb::load(dir.path());
        assert_eq!(db.resolve("").unwrap(), DraftUser::default());
        assert_eq!(db.resolve("1000").unwrap().gid, 0);
    }
}
