//! Container name reservations.
//!
//! A name is held by a file `names/<ns>/<name>` containing the owning ID,
//! created exclusively so two processes cannot take the same name. Names
//! reserved by an in-flight create in this process are also tracked in
//! memory until the create commits or rolls back.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use cdbox_core::config::validate_name;
use cdbox_core::error::{BoxError, Result};
use parking_lot::Mutex;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "bold", "calm", "cool", "dark", "fast", "glad", "keen", "kind", "loud", "mild", "neat",
    "pale", "pure", "rare", "safe", "slim", "soft", "tall", "tiny", "vast", "warm", "wise",
    "agile", "brave", "eager", "happy", "lucid", "noble", "quick", "sharp", "vivid", "jolly",
];

const NOUNS: &[&str] = &[
    "turing", "hopper", "lovelace", "dijkstra", "knuth", "ritchie", "thompson", "torvalds",
    "wozniak", "cerf", "berners", "mccarthy", "backus", "kay", "lamport", "hoare", "church",
    "neumann", "shannon", "boole", "babbage", "hamilton", "liskov", "wing", "rivest", "shamir",
    "diffie", "hellman", "pike", "kernighan", "stroustrup", "goldberg",
];

/// Random Docker-style `adjective_noun` name.
pub fn generate_name() -> String {
    let mut rng = rand::thread_rng();
    let adj = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    format!("{adj}_{noun}")
}

#[derive(Debug)]
pub struct NameStore {
    dir: PathBuf,
    pending: Mutex<HashMap<String, String>>,
}

impl NameStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// ID holding `name`, if any.
    pub fn owner(&self, name: &str) -> Option<String> {
        if let Some(id) = self.pending.lock().get(name) {
            return Some(id.clone());
        }
        std::fs::read_to_string(self.path(name))
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Reserve `name` for `id`. Fails with `AlreadyExists` when taken.
    pub fn reserve(&self, name: &str, id: &str) -> Result<()> {
        validate_name("container", name)?;
        let mut pending = self.pending.lock();
        if let Some(owner) = pending.get(name) {
            return Err(taken(name, owner));
        }
        std::fs::create_dir_all(&self.dir)?;
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path(name));
        match file {
            Ok(mut f) => f.write_all(id.as_bytes())?,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let owner = std::fs::read_to_string(self.path(name)).unwrap_or_default();
                return Err(taken(name, owner.trim()));
            }
            Err(e) => return Err(e.into()),
        }
        pending.insert(name.to_string(), id.to_string());
        Ok(())
    }

    /// Reserve a generated name, retrying on collisions.
    pub fn reserve_generated(&self, id: &str) -> Result<String> {
        for _ in 0..16 {
            let name = generate_name();
            match self.reserve(&name, id) {
                Ok(()) => return Ok(name),
                Err(BoxError::AlreadyExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        let name = format!("{}_{}", generate_name(), &id[..id.len().min(6)]);
        self.reserve(&name, id)?;
        Ok(name)
    }

    /// The create that reserved `name` succeeded.
    pub fn commit(&self, name: &str) {
        self.pending.lock().remove(name);
    }

    /// Drop the reservation if it still belongs to `id`.
    pub fn release(&self, name: &str, id: &str) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.get(name).is_some_and(|owner| owner == id) {
            pending.remove(name);
        }
        let path = self.path(name);
        match std::fs::read_to_string(&path) {
            Ok(owner) if owner.trim() == id => remove_file(&path),
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Move `id` from `old` to `new`.
    pub fn rename(&self, old: &str, new: &str, id: &str) -> Result<()> {
        self.reserve(new, id)?;
        self.commit(new);
        self.release(old, id)
    }
}

fn remove_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn taken(name: &str, owner: &str) -> BoxError {
    BoxError::AlreadyExists(format!(
        "the container name \"/{name}\" is already in use by container {owner:?}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reserve_conflict_and_release() {
        let dir = TempDir::new().unwrap();
        let names = NameStore::new(dir.path());
        names.reserve("web", "aaa").unwrap();
        assert!(matches!(names.reserve("web", "bbb"), Err(BoxError::AlreadyExists(_))));
        assert_eq!(names.owner("web").as_deref(), Some("aaa"));

        // A release by another ID leaves the reservation alone.
        names.release("web", "bbb").unwrap();
        assert_eq!(names.owner("web").as_deref(), Some("aaa"));

        names.release("web", "aaa").unwrap();
        assert!(names.owner("web").is_none());
        names.reserve("web", "bbb").unwrap();
    }

    #[test]
    fn test_committed_name_survives_new_store() {
        let dir = TempDir::new().unwrap();
        let names = NameStore::new(dir.path());
        names.reserve("db", "aaa").unwrap();
        names.commit("db");
        let other = NameStore::new(dir.path());
        assert!(other.reserve("db", "ccc").is_err());
    }

    #[test]
    fn test_rename() {
        let dir = TempDir::new().unwrap();
        let names = NameStore::new(dir.path());
        names.reserve("old", "aaa").unwrap();
        names.commit("old");
        names.rename("old", "new", "aaa").unwrap();
        assert!(names.owner("old").is_none());
        assert_eq!(names.owner("new").as_deref(), Some("aaa"));
    }

    #[test]
    fn test_generated_names() {
        let dir = TempDir::new().unwrap();
        let names = NameStore::new(dir.path());
        let name = names.reserve_generated("aaa").unwrap();
        let (adj, noun) = name.split_once('_').unwrap();
        assert!(ADJECTIVES.contains(&adj));
        assert!(NOUNS.contains(&noun));
        assert!(names.reserve("in valid", "x").is_err());
    }
}
