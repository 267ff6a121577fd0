//! CNI config-list store.
//!
//! User networks are `<root>/<name>.conflist` files. Each carries a small
//! integer ID and its labels under cdbox-specific top-level keys, which CNI
//! plugins ignore. The default `bridge` network is synthesized in memory and
//! listed together with the `host` and `none` pseudo-networks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use cdbox_core::config::{validate_name, DataStore};
use cdbox_core::error::{BoxError, Result};
use cdbox_core::network::{allocate_subnet, Ipam, DEFAULT_NETWORK, DEFAULT_SUBNET};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::fs::{read_json, write_json};

pub const CNI_VERSION: &str = "1.0.0";
const KEY_ID: &str = "cdbox/networkID";
const KEY_LABELS: &str = "cdbox/labels";
const KEY_OPTIONS: &str = "cdbox/options";
const CONFLIST_EXT: &str = "conflist";

/// Filter keys accepted by `network ls` / `network prune`.
pub const FILTER_KEYS: &[&str] = &["name", "label", "driver", "id"];

/// Options of `network create`.
#[derive(Debug, Clone, Default)]
pub struct NetworkCreate {
    pub name: String,
    /// `bridge` (default), `macvlan` or `ipvlan`.
    pub driver: String,
    pub subnet: Option<String>,
    pub gateway: Option<Ipv4Addr>,
    pub ip_range: Option<String>,
    pub options: BTreeMap<String, String>,
    pub labels: HashMap<String, String>,
}

/// A network as listed and inspected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkInfo {
    pub name: String,
    /// `None` for pseudo-networks without a CNI config.
    #[serde(rename = "ID")]
    pub id: Option<u32>,
    pub driver: String,
    pub subnet: Option<String>,
    pub gateway: Option<String>,
    pub ip_range: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Backing file; `None` for synthesized networks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// The CNI config list handed to the plugins (`Null` for host/none).
    #[serde(skip)]
    pub conflist: Value,
}

impl NetworkInfo {
    /// Whether containers attach to this network through CNI.
    pub fn uses_cni(&self) -> bool {
        !self.conflist.is_null()
    }

    /// Whether this network is one of the built-in ones.
    pub fn is_builtin(&self) -> bool {
        self.file.is_none()
    }

    /// IPAM view of the network's subnet.
    pub fn ipam(&self) -> Result<Option<Ipam>> {
        let Some(subnet) = &self.subnet else {
            return Ok(None);
        };
        let mut ipam = Ipam::new(subnet)?;
        if let Some(gw) = &self.gateway {
            let gw: Ipv4Addr = gw
                .parse()
                .map_err(|_| BoxError::invalid(format!("invalid gateway {gw:?}")))?;
            ipam = ipam.with_gateway(gw)?;
        }
        if let Some(range) = &self.ip_range {
            ipam = ipam.with_range(range)?;
        }
        Ok(Some(ipam))
    }

    fn from_conflist(conflist: Value, file: Option<PathBuf>) -> Result<Self> {
        let name = conflist["name"]
            .as_str()
            .ok_or_else(|| BoxError::SerializationError("conflist has no name".to_string()))?
            .to_string();
        let id = conflist[KEY_ID].as_u64().map(|v| v as u32);
        let labels: HashMap<String, String> =
            serde_json::from_value(conflist[KEY_LABELS].clone()).unwrap_or_default();
        let options: BTreeMap<String, String> =
            serde_json::from_value(conflist[KEY_OPTIONS].clone()).unwrap_or_default();
        let main = &conflist["plugins"][0];
        let driver = main["type"].as_str().unwrap_or("bridge").to_string();
        let range = &main["ipam"]["ranges"][0][0];
        let str_of = |v: &Value| v.as_str().map(str::to_string);
        Ok(Self {
            name,
            id,
            driver,
            subnet: str_of(&range["subnet"]),
            gateway: str_of(&range["gateway"]),
            ip_range: str_of(&range["cdboxIPRange"]),
            labels,
            options,
            file,
            conflist,
        })
    }
}

#[derive(Debug)]
pub struct NetworkStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl NetworkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn open(data: &DataStore) -> Self {
        Self::new(data.networks_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{CONFLIST_EXT}"))
    }

    fn load_files(&self) -> Result<Vec<NetworkInfo>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CONFLIST_EXT) {
                continue;
            }
            let Some(conflist) = read_json::<Value>(&path)? else { continue };
            match NetworkInfo::from_conflist(conflist, Some(path.clone())) {
                Ok(info) => out.push(info),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping bad conflist"),
            }
        }
        out.sort_by_key(|n| (n.id.unwrap_or(u32::MAX), n.name.clone()));
        Ok(out)
    }

    /// The synthesized default bridge network.
    pub fn default_bridge() -> NetworkInfo {
        let ipam = Ipam::new(DEFAULT_SUBNET).ok();
        let (subnet, gateway) = match &ipam {
            Some(i) => (i.cidr(), i.gateway().to_string()),
            None => (DEFAULT_SUBNET.to_string(), "10.4.0.1".to_string()),
        };
        let conflist = build_conflist(
            DEFAULT_NETWORK,
            0,
            "bridge",
            &subnet,
            &gateway,
            None,
            &BTreeMap::new(),
            &HashMap::new(),
        );
        NetworkInfo {
            name: DEFAULT_NETWORK.to_string(),
            id: Some(0),
            driver: "bridge".to_string(),
            subnet: Some(subnet),
            gateway: Some(gateway),
            ip_range: None,
            labels: HashMap::new(),
            options: BTreeMap::new(),
            file: None,
            conflist,
        }
    }

    fn pseudo(name: &str) -> NetworkInfo {
        NetworkInfo {
            name: name.to_string(),
            id: None,
            driver: name.to_string(),
            subnet: None,
            gateway: None,
            ip_range: None,
            labels: HashMap::new(),
            options: BTreeMap::new(),
            file: None,
            conflist: Value::Null,
        }
    }

    /// Every network: user networks by ID, then `bridge`, `host`, `none`.
    pub fn list(&self) -> Result<Vec<NetworkInfo>> {
        let mut out = self.load_files()?;
        out.push(Self::default_bridge());
        out.push(Self::pseudo("host"));
        out.push(Self::pseudo("none"));
        Ok(out)
    }

    /// Look up a network by name (`default` is an alias of `bridge`).
    pub fn get(&self, name: &str) -> Result<NetworkInfo> {
        match name {
            "bridge" | "default" => return Ok(Self::default_bridge()),
            "host" | "none" => return Ok(Self::pseudo(name)),
            _ => {}
        }
        if validate_name("network", name).is_err() {
            return Err(BoxError::not_found("network", name));
        }
        let path = self.path(name);
        let conflist: Value =
            read_json(&path)?.ok_or_else(|| BoxError::not_found("network", name))?;
        NetworkInfo::from_conflist(conflist, Some(path))
    }

    pub fn create(&self, req: NetworkCreate) -> Result<NetworkInfo> {
        validate_name("network", &req.name)?;
        if matches!(req.name.as_str(), "bridge" | "default" | "host" | "none") {
            return Err(BoxError::invalid(format!(
                "network name {:?} is reserved",
                req.name
            )));
        }
        let driver = if req.driver.is_empty() {
            "bridge".to_string()
        } else {
            req.driver.clone()
        };
        if !matches!(driver.as_str(), "bridge" | "macvlan" | "ipvlan") {
            return Err(BoxError::invalid(format!(
                "unsupported network driver {driver:?} (expected bridge, macvlan or ipvlan)"
            )));
        }

        let _guard = self.write_lock.lock();
        let path = self.path(&req.name);
        if path.exists() {
            return Err(BoxError::AlreadyExists(format!("network {:?}", req.name)));
        }
        let existing = self.load_files()?;

        let mut used = Vec::new();
        for net in existing.iter().chain(std::iter::once(&Self::default_bridge())) {
            if let Some(ipam) = net.ipam()? {
                used.push(ipam);
            }
        }
        let mut ipam = match &req.subnet {
            Some(subnet) => {
                let ipam = Ipam::new(subnet)?;
                if let Some(clash) = used.iter().find(|u| u.overlaps(&ipam)) {
                    return Err(BoxError::invalid(format!(
                        "subnet {} overlaps with existing subnet {}",
                        ipam.cidr(),
                        clash.cidr()
                    )));
                }
                ipam
            }
            None => {
                if req.gateway.is_some() || req.ip_range.is_some() {
                    return Err(BoxError::invalid("--gateway and --ip-range require --subnet"));
                }
                allocate_subnet(&used)?
            }
        };
        if let Some(gw) = req.gateway {
            ipam = ipam.with_gateway(gw)?;
        }
        if let Some(range) = &req.ip_range {
            ipam = ipam.with_range(range)?;
        }

        let id = existing.iter().filter_map(|n| n.id).max().unwrap_or(0) + 1;
        let conflist = build_conflist(
            &req.name,
            id,
            &driver,
            &ipam.cidr(),
            &ipam.gateway().to_string(),
            ipam.range_cidr().as_deref(),
            &req.options,
            &req.labels,
        );
        write_json(&path, &conflist)?;
        tracing::debug!(network = %req.name, id, subnet = %ipam.cidr(), "network created");
        NetworkInfo::from_conflist(conflist, Some(path))
    }

    /// Delete a user network. `in_use` holds names referenced by live containers.
    pub fn remove(&self, name: &str, in_use: &HashSet<String>) -> Result<()> {
        let info = self.get(name)?;
        if info.is_builtin() {
            return Err(BoxError::Precondition(format!(
                "{name} is a pre-defined network and cannot be removed"
            )));
        }
        if in_use.contains(&info.name) {
            return Err(BoxError::Precondition(format!(
                "network {name} is in use by a container"
            )));
        }
        let _guard = self.write_lock.lock();
        if let Some(file) = &info.file {
            std::fs::remove_file(file)?;
        }
        tracing::debug!(network = name, "network removed");
        Ok(())
    }

    /// Remove every user network not in `in_use`; returns the removed names.
    pub fn prune(&self, in_use: &HashSet<String>) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for net in self.load_files()? {
            if in_use.contains(&net.name) {
                continue;
            }
            match self.remove(&net.name, in_use) {
                Ok(()) => removed.push(net.name),
                Err(e) => tracing::warn!(network = %net.name, error = %e, "failed to prune network"),
            }
        }
        Ok(removed)
    }
}

#[allow(clippy::too_many_arguments)]
fn build_conflist(
    name: &str,
    id: u32,
    driver: &str,
    subnet: &str,
    gateway: &str,
    ip_range: Option<&str>,
    options: &BTreeMap<String, String>,
    labels: &HashMap<String, String>,
) -> Value {
    let mut range = json!({ "subnet": subnet, "gateway": gateway });
    if let Some(r) = ip_range {
        range["cdboxIPRange"] = json!(r);
        if let Ok(ipam) = Ipam::new(r) {
            // A fresh Ipam puts its gateway at network + 1.
            range["rangeStart"] = json!(ipam.gateway().to_string());
            range["rangeEnd"] = json!(Ipv4Addr::from(u32::from(ipam.broadcast()) - 1).to_string());
        }
    }
    let ipam = json!({
        "type": "host-local",
        "ranges": [[range]],
        "routes": [{ "dst": "0.0.0.0/0" }],
    });
    let mtu = options
        .get("mtu")
        .or_else(|| options.get("com.docker.network.driver.mtu"))
        .and_then(|m| m.parse::<u32>().ok());

    let mut main = match driver {
        "macvlan" | "ipvlan" => {
            let mut p = json!({ "type": driver, "ipam": ipam });
            if let Some(parent) = options.get("parent") {
                p["master"] = json!(parent);
            }
            if let Some(mode) = options.get(&format!("{driver}_mode")).or_else(|| options.get("mode")) {
                p["mode"] = json!(mode);
            }
            p
        }
        _ => {
            let bridge = options
                .get("com.docker.network.bridge.name")
                .cloned()
                .unwrap_or_else(|| format!("cdbox{id}"));
            json!({
                "type": "bridge",
                "bridge": bridge,
                "isGateway": true,
                "ipMasq": true,
                "hairpinMode": true,
                "ipam": ipam,
            })
        }
    };
    if let Some(mtu) = mtu {
        main["mtu"] = json!(mtu);
    }

    let mut plugins = vec![main];
    if driver == "bridge" {
        plugins.push(json!({ "type": "portmap", "capabilities": { "portMappings": true } }));
        plugins.push(json!({ "type": "firewall" }));
        plugins.push(json!({ "type": "tuning" }));
    }

    json!({
        "cniVersion": CNI_VERSION,
        "name": name,
        KEY_ID: id,
        KEY_LABELS: labels,
        KEY_OPTIONS: options,
        "plugins": plugins,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, NetworkStore) {
        let dir = TempDir::new().unwrap();
        let store = NetworkStore::new(dir.path().join("networks"));
        (dir, store)
    }

    fn req(name: &str) -> NetworkCreate {
        NetworkCreate {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_list_has_pseudo_networks() {
        let (_dir, store) = temp_store();
        let names: Vec<_> = store.list().unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["bridge", "host", "none"]);
    }

    #[test]
    fn test_create_assigns_ids_and_subnets() {
        let (_dir, store) = temp_store();
        let a = store.create(req("front")).unwrap();
        let b = store.create(req("back")).unwrap();
        assert_eq!(a.id, Some(1));
        assert_eq!(b.id, Some(2));
        assert_eq!(a.subnet.as_deref(), Some("10.4.1.0/24"));
        assert_eq!(b.subnet.as_deref(), Some("10.4.2.0/24"));
        assert!(store.root().join("front.conflist").exists());

        let conflist = &store.get("front").unwrap().conflist;
        assert_eq!(conflist["cniVersion"], CNI_VERSION);
        assert_eq!(conflist["plugins"][0]["type"], "bridge");
        assert_eq!(conflist["plugins"][0]["bridge"], "cdbox1");
        assert_eq!(conflist["plugins"][1]["type"], "portmap");
    }

    #[test]
    fn test_create_with_explicit_subnet() {
        let (_dir, store) = temp_store();
        let mut r = req("lab");
        r.subnet = Some("192.168.50.0/24".to_string());
        r.gateway = Some("192.168.50.254".parse().unwrap());
        r.ip_range = Some("192.168.50.128/25".to_string());
        r.labels.insert("env".to_string(), "lab".to_string());
        let info = store.create(r).unwrap();
        assert_eq!(info.gateway.as_deref(), Some("192.168.50.254"));
        assert_eq!(info.ip_range.as_deref(), Some("192.168.50.128/25"));
        assert_eq!(info.labels["env"], "lab");
        let range = &info.conflist["plugins"][0]["ipam"]["ranges"][0][0];
        assert_eq!(range["rangeStart"], "192.168.50.129");
        assert_eq!(range["rangeEnd"], "192.168.50.254");
    }

    #[test]
    fn test_create_rejects_overlap_and_duplicates() {
        let (_dir, store) = temp_store();
        let mut r = req("a");
        r.subnet = Some("10.4.0.0/16".to_string());
        assert!(store.create(r).is_err());
        store.create(req("a")).unwrap();
        assert!(matches!(
            store.create(req("a")).unwrap_err(),
            BoxError::AlreadyExists(_)
        ));
        assert!(store.create(req("host")).is_err());
    }

    #[test]
    fn test_remove_checks_usage() {
        let (_dir, store) = temp_store();
        store.create(req("front")).unwrap();
        let in_use = HashSet::from(["front".to_string()]);
        assert!(matches!(
            store.remove("front", &in_use).unwrap_err(),
            BoxError::Precondition(_)
        ));
        assert!(store.remove("bridge", &HashSet::new()).is_err());
        store.remove("front", &HashSet::new()).unwrap();
        assert!(store.get("front").unwrap_err().is_not_found());
    }

    #[test]
    fn test_prune_keeps_used() {
        let (_dir, store) = temp_store();
        store.create(req("a")).unwrap();
        store.create(req("b")).unwrap();
        let removed = store.prune(&HashSet::from(["b".to_string()])).unwrap();
        assert_eq!(removed, vec!["a".to_string()]);
        assert!(store.get("b").is_ok());
    }

    #[test]
    fn test_default_alias() {
        let (_dir, store) = temp_store();
        let net = store.get("default").unwrap();
        assert_eq!(net.name, "bridge");
        assert!(net.uses_cni());
        assert!(!store.get("host").unwrap().uses_cni());
    }
}
