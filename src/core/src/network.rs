//! Network value types and IP address management.
//!
//! The network store persists CNI config lists; this module holds the
//! pieces every layer shares: the `--network` mode, subnet math and the
//! sequential IPAM used for static-IP validation and subnet allocation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{BoxError, Result};

/// Name of the default bridge network.
pub const DEFAULT_NETWORK: &str = "bridge";

/// Subnet of the default bridge network.
pub const DEFAULT_SUBNET: &str = "10.4.0.0/24";

/// Pseudo-networks that are always listed and never file-backed.
pub const PSEUDO_NETWORKS: &[&str] = &["host", "none", "bridge"];

/// One `--network` value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Default CNI bridge network.
    Bridge,
    /// Share the host network namespace.
    Host,
    /// Loopback only.
    None,
    /// Join another container's network namespace.
    Container(String),
    /// A user-defined CNI network.
    Named(String),
}

impl NetworkMode {
    /// Whether this mode attaches through CNI.
    pub fn uses_cni(&self) -> bool {
        matches!(self, Self::Bridge | Self::Named(_))
    }

    /// Network name as stored in the `networks` label.
    pub fn network_name(&self) -> String {
        match self {
            Self::Bridge => DEFAULT_NETWORK.to_string(),
            Self::Host => "host".to_string(),
            Self::None => "none".to_string(),
            Self::Container(id) => format!("container:{id}"),
            Self::Named(name) => name.clone(),
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.network_name())
    }
}

impl FromStr for NetworkMode {
    type Err = BoxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Err(BoxError::invalid("empty network name")),
            "bridge" | "default" => Ok(Self::Bridge),
            "host" => Ok(Self::Host),
            "none" => Ok(Self::None),
            other => match other.strip_prefix("container:") {
                Some("") => Err(BoxError::invalid("network container: requires a container")),
                Some(id) => Ok(Self::Container(id.to_string())),
                None => Ok(Self::Named(other.to_string())),
            },
        }
    }
}

/// Sequential IPAM for an IPv4 subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipam {
    /// Network address (e.g., 10.4.0.0).
    network: Ipv4Addr,
    prefix_len: u8,
    gateway: Ipv4Addr,
    /// Optional allocation range inside the subnet.
    range: Option<(Ipv4Addr, u8)>,
}

impl Ipam {
    /// Create a new IPAM from a CIDR string (e.g., "10.88.0.0/24").
    ///
    /// Host bits in the address are masked off; the gateway is network + 1.
    pub fn new(cidr: &str) -> Result<Self> {
        let (network, prefix_len) = parse_cidr(cidr)?;
        if prefix_len > 30 {
            return Err(BoxError::invalid(format!(
                "prefix length {} too large (max 30 for usable hosts)",
                prefix_len
            )));
        }
        let gateway = Ipv4Addr::from(u32::from(network) + 1);
        Ok(Self {
            network,
            prefix_len,
            gateway,
            range: None,
        })
    }

    /// Override the gateway; it must lie inside the subnet.
    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Result<Self> {
        if !self.contains(&gateway) {
            return Err(BoxError::invalid(format!(
                "gateway {} is not in subnet {}",
                gateway,
                self.cidr()
            )));
        }
        self.gateway = gateway;
        Ok(self)
    }

    /// Restrict allocation to a sub-range (`--ip-range`).
    pub fn with_range(mut self, cidr: &str) -> Result<Self> {
        let (net, len) = parse_cidr(cidr)?;
        if len < self.prefix_len || !self.contains(&net) {
            return Err(BoxError::invalid(format!(
                "ip-range {} is not within subnet {}",
                cidr,
                self.cidr()
            )));
        }
        self.range = Some((net, len));
        Ok(self)
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// Subnet CIDR string.
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.network, self.prefix_len)
    }

    pub fn range_cidr(&self) -> Option<String> {
        self.range.map(|(net, len)| format!("{}/{}", net, len))
    }

    /// Calculate the broadcast address.
    pub fn broadcast(&self) -> Ipv4Addr {
        broadcast_of(self.network, self.prefix_len)
    }

    /// Whether `ip` lies inside the subnet.
    pub fn contains(&self, ip: &Ipv4Addr) -> bool {
        u32::from(*ip) & mask(self.prefix_len) == u32::from(self.network)
    }

    /// Whether two subnets share any address.
    pub fn overlaps(&self, other: &Ipam) -> bool {
        let shorter = self.prefix_len.min(other.prefix_len);
        u32::from(self.network) & mask(shorter) == u32::from(other.network) & mask(shorter)
    }

    /// Total number of usable host addresses (excluding network, gateway, broadcast).
    pub fn capacity(&self) -> u32 {
        let host_bits = 32 - self.prefix_len as u32;
        let total = (1u32 << host_bits) - 1;
        total.saturating_sub(2)
    }

    /// Allocate the next available IP, given a set of already-used IPs.
    pub fn allocate(&self, used: &[Ipv4Addr]) -> Result<Ipv4Addr> {
        let (start, end) = match self.range {
            Some((net, len)) => (u32::from(net), u32::from(broadcast_of(net, len))),
            None => (u32::from(self.network), u32::from(self.broadcast())),
        };
        let network_u32 = u32::from(self.network);
        let broadcast_u32 = u32::from(self.broadcast());
        let gateway_u32 = u32::from(self.gateway);

        let mut candidate = start.max(network_u32 + 1);
        while candidate <= end && candidate < broadcast_u32 {
            if candidate != gateway_u32 {
                let ip = Ipv4Addr::from(candidate);
                if !used.contains(&ip) {
                    return Ok(ip);
                }
            }
            candidate += 1;
        }

        Err(BoxError::runtime(
            "ipam",
            format!("no available IP addresses in subnet {}", self.cidr()),
        ))
    }

    /// Check that a requested static IP is usable.
    pub fn validate_static(&self, ip: &Ipv4Addr) -> Result<()> {
        if !self.contains(ip) || *ip == self.network || *ip == self.broadcast() || *ip == self.gateway
        {
            return Err(BoxError::invalid(format!(
                "IP address {} is not usable in subnet {}",
                ip,
                self.cidr()
            )));
        }
        Ok(())
    }

    /// Generate a deterministic MAC address from an IPv4 address.
    /// Uses the locally-administered prefix 02:42.
    pub fn mac_from_ip(ip: &Ipv4Addr) -> String {
        let octets = ip.octets();
        format!(
            "02:42:{:02x}:{:02x}:{:02x}:{:02x}",
            octets[0], octets[1], octets[2], octets[3]
        )
    }
}

/// Pick the first free /24 from the `10.4.<n>.0/24` pool, skipping `used`.
pub fn allocate_subnet(used: &[Ipam]) -> Result<Ipam> {
    for third in 1..=255u8 {
        let candidate = Ipam::new(&format!("10.4.{third}.0/24"))?;
        if !used.iter().any(|u| u.overlaps(&candidate)) {
            return Ok(candidate);
        }
    }
    Err(BoxError::runtime(
        "network create",
        "no free subnet left in pool 10.4.0.0/16",
    ))
}

/// Validate a MAC address string (`xx:xx:xx:xx:xx:xx`).
pub fn validate_mac(mac: &str) -> Result<()> {
    let parts: Vec<&str> = mac.split(':').collect();
    let ok = parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()));
    if ok {
        Ok(())
    } else {
        Err(BoxError::invalid(format!("invalid MAC address {mac:?}")))
    }
}

fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, len) = cidr
        .split_once('/')
        .ok_or_else(|| BoxError::invalid(format!("invalid CIDR notation: {}", cidr)))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|e| BoxError::invalid(format!("invalid network address '{}': {}", addr, e)))?;
    let prefix_len: u8 = len
        .parse()
        .map_err(|e| BoxError::invalid(format!("invalid prefix length '{}': {}", len, e)))?;
    if prefix_len > 32 {
        return Err(BoxError::invalid(format!("invalid prefix length {}", prefix_len)));
    }
    Ok((Ipv4Addr::from(u32::from(addr) & mask(prefix_len)), prefix_len))
}

fn mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len as u32)
    }
}

fn broadcast_of(network: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(network) | !mask(prefix_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_mode_parse() {
        assert_eq!("bridge".parse::<NetworkMode>().unwrap(), NetworkMode::Bridge);
        assert_eq!("host".parse::<NetworkMode>().unwrap(), NetworkMode::Host);
        assert_eq!("none".parse::<NetworkMode>().unwrap(), NetworkMode::None);
        assert_eq!(
            "container:web".parse::<NetworkMode>().unwrap(),
            NetworkMode::Container("web".to_string())
        );
        assert_eq!(
            "backend".parse::<NetworkMode>().unwrap(),
            NetworkMode::Named("backend".to_string())
        );
        assert!("container:".parse::<NetworkMode>().is_err());
        assert!(NetworkMode::Bridge.uses_cni());
        assert!(!NetworkMode::Host.uses_cni());
    }

    #[test]
    fn test_ipam_new_valid() {
        let ipam = Ipam::new("10.88.0.0/24").unwrap();
        assert_eq!(ipam.gateway(), Ipv4Addr::new(10, 88, 0, 1));
        assert_eq!(ipam.cidr(), "10.88.0.0/24");
    }

    #[test]
    fn test_ipam_masks_host_bits() {
        let ipam = Ipam::new("10.88.0.77/24").unwrap();
        assert_eq!(ipam.cidr(), "10.88.0.0/24");
    }

    #[test]
    fn test_ipam_invalid_cidr() {
        assert!(Ipam::new("10.88.0.0").is_err());
        assert!(Ipam::new("not-an-ip/24").is_err());
        assert!(Ipam::new("10.88.0.0/33").is_err());
        assert!(Ipam::new("10.88.0.0/31").is_err());
    }

    #[test]
    fn test_ipam_broadcast_and_capacity() {
        let ipam = Ipam::new("10.88.0.0/24").unwrap();
        assert_eq!(ipam.broadcast(), Ipv4Addr::new(10, 88, 0, 255));
        assert_eq!(ipam.capacity(), 253);
        let ipam16 = Ipam::new("172.20.0.0/16").unwrap();
        assert_eq!(ipam16.broadcast(), Ipv4Addr::new(172, 20, 255, 255));
    }

    #[test]
    fn test_ipam_allocate_sequential() {
        let ipam = Ipam::new("10.88.0.0/24").unwrap();
        let ip1 = ipam.allocate(&[]).unwrap();
        let ip2 = ipam.allocate(&[ip1]).unwrap();
        assert_eq!(ip1, Ipv4Addr::new(10, 88, 0, 2));
        assert_eq!(ip2, Ipv4Addr::new(10, 88, 0, 3));
    }

    #[test]
    fn test_ipam_allocate_exhausted() {
        let ipam = Ipam::new("10.88.0.0/30").unwrap();
        let ip1 = ipam.allocate(&[]).unwrap();
        assert_eq!(ip1, Ipv4Addr::new(10, 88, 0, 2));
        assert!(ipam.allocate(&[ip1]).is_err());
    }

    #[test]
    fn test_ipam_range_and_gateway() {
        let ipam = Ipam::new("10.5.0.0/16")
            .unwrap()
            .with_gateway(Ipv4Addr::new(10, 5, 0, 254))
            .unwrap()
            .with_range("10.5.3.0/24")
            .unwrap();
        assert_eq!(ipam.allocate(&[]).unwrap(), Ipv4Addr::new(10, 5, 3, 0));
        assert!(Ipam::new("10.5.0.0/16")
            .unwrap()
            .with_gateway(Ipv4Addr::new(10, 6, 0, 1))
            .is_err());
        assert!(Ipam::new("10.5.0.0/16").unwrap().with_range("10.6.0.0/24").is_err());
    }

    #[test]
    fn test_validate_static() {
        let ipam = Ipam::new("10.4.0.0/24").unwrap();
        assert!(ipam.validate_static(&Ipv4Addr::new(10, 4, 0, 10)).is_ok());
        assert!(ipam.validate_static(&Ipv4Addr::new(10, 4, 0, 1)).is_err());
        assert!(ipam.validate_static(&Ipv4Addr::new(10, 4, 0, 255)).is_err());
        assert!(ipam.validate_static(&Ipv4Addr::new(10, 5, 0, 10)).is_err());
    }

    #[test]
    fn test_overlaps_and_subnet_pool() {
        let a = Ipam::new("10.4.0.0/24").unwrap();
        let b = Ipam::new("10.4.0.0/16").unwrap();
        let c = Ipam::new("10.4.1.0/24").unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));

        let picked = allocate_subnet(&[a.clone(), c]).unwrap();
        assert_eq!(picked.cidr(), "10.4.2.0/24");
        assert!(allocate_subnet(&[b]).is_err());
    }

    #[test]
    fn test_ipam_mac_from_ip() {
        let ip = Ipv4Addr::new(10, 88, 0, 2);
        assert_eq!(Ipam::mac_from_ip(&ip), "02:42:0a:58:00:02");
        assert!(validate_mac("02:42:0a:58:00:02").is_ok());
        assert!(validate_mac("02:42:0a:58:00").is_err());
        assert!(validate_mac("zz:42:0a:58:00:02").is_err());
    }
}
