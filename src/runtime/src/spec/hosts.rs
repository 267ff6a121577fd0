//! Generated `/etc/hosts`, `/etc/resolv.conf` and `/etc/hostname`.

use std::net::IpAddr;

use cdbox_core::error::{BoxError, Result};

/// Value of `--add-host` that resolves to the host gateway.
pub const HOST_GATEWAY: &str = "host-gateway";

const FALLBACK_NAMESERVERS: &[&str] = &["8.8.8.8", "8.8.4.4"];

/// Parse `--add-host name:ip` values into `(name, ip)` pairs.
pub fn parse_extra_hosts(items: &[String], host_gateway: Option<IpAddr>) -> Result<Vec<(String, String)>> {
    items
        .iter()
        .map(|item| {
            let (name, ip) = item
                .split_once(':')
                .or_else(|| item.split_once('='))
                .ok_or_else(|| BoxError::invalid(format!("invalid add-host {item:?}: expected name:ip")))?;
            if name.is_empty() {
                return Err(BoxError::invalid(format!("invalid add-host {item:?}: empty host name")));
            }
            let ip = if ip == HOST_GATEWAY {
                host_gateway
                    .ok_or_else(|| {
                        BoxError::invalid("unable to derive the IP value for host-gateway")
                    })?
                    .to_string()
            } else {
                let ip = ip.trim_start_matches('[').trim_end_matches(']');
                ip.parse::<IpAddr>()
                    .map_err(|_| BoxError::invalid(format!("invalid IP address in add-host {item:?}")))?
                    .to_string()
            };
            Ok((name.to_string(), ip))
        })
        .collect()
}

/// `/etc/hosts` before the container's own address is known.
pub fn hosts_file(extra: &[(String, String)]) -> String {
    let mut out = String::from(
        "127.0.0.1\tlocalhost localhost.localdomain\n::1\tlocalhost localhost.localdomain\n",
    );
    for (name, ip) in extra {
        out.push_str(&format!("{ip}\t{name}\n"));
    }
    out
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Resolv {
    nameservers: Vec<String>,
    search: Vec<String>,
    options: Vec<String>,
}

fn parse_resolv(content: &str) -> Resolv {
    let mut r = Resolv::default();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("nameserver") => r.nameservers.extend(fields.next().map(str::to_string)),
            Some("search") | Some("domain") => r.search = fields.map(str::to_string).collect(),
            Some("options") => r.options.extend(fields.map(str::to_string)),
            _ => {}
        }
    }
    r
}

fn is_loopback(ns: &str) -> bool {
    ns.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

/// `/etc/resolv.conf` for a container.
///
/// Flags override the matching part of the host file. With a private network
/// namespace, loopback nameservers are unreachable and are dropped; when none
/// remain, public fallbacks are used.
pub fn resolv_conf(
    host: &str,
    dns: &[String],
    search: &[String],
    options: &[String],
    host_network: bool,
) -> Result<String> {
    for ns in dns {
        ns.parse::<IpAddr>()
            .map_err(|_| BoxError::invalid(format!("invalid DNS server {ns:?}")))?;
    }
    let mut r = parse_resolv(host);
    if !dns.is_empty() {
        r.nameservers = dns.to_vec();
    }
    if !search.is_empty() {
        r.search = search.iter().filter(|s| s.as_str() != ".").cloned().collect();
    }
    if !options.is_empty() {
        r.options = options.to_vec();
    }
    if !host_network {
        r.nameservers.retain(|ns| !is_loopback(ns));
        if r.nameservers.is_empty() {
            r.nameservers = FALLBACK_NAMESERVERS.iter().map(|s| s.to_string()).collect();
        }
    }

    let mut out = String::new();
    if !r.search.is_empty() {
        out.push_str(&format!("search {}\n", r.search.join(" ")));
    }
    for ns in &r.nameservers {
        out.push_str(&format!("nameserver {ns}\n"));
    }
    if !r.options.is_empty() {
        out.push_str(&format!("options {}\n", r.options.join(" ")));
    }
    Ok(out)
}

/// Validate a hostname as an RFC 1123 name.
pub fn validate_hostname(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if valid {
        Ok(())
    } else {
        Err(BoxError::invalid(format!("invalid hostname {name:?}")))
    }
}
