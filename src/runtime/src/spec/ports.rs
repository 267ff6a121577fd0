//! `--publish` and `--expose` parsing.

use cdbox_core::container::PortMapping;
use cdbox_core::error::{BoxError, Result};

const PROTOCOLS: &[&str] = &["tcp", "udp", "sctp"];

fn parse_range(s: &str, what: &str, raw: &str) -> Result<(u16, u16)> {
    let bad = || BoxError::invalid(format!("invalid {what} port {s:?} in {raw:?}"));
    let (start, end) = match s.split_once('-') {
        Some((a, b)) => (a.parse::<u16>().map_err(|_| bad())?, b.parse::<u16>().map_err(|_| bad())?),
        None => {
            let p = s.parse::<u16>().map_err(|_| bad())?;
            (p, p)
        }
    };
    if end < start || (what == "container" && start == 0) {
        return Err(bad());
    }
    Ok((start, end))
}

fn split_proto<'a>(s: &'a str, raw: &str) -> Result<(&'a str, String)> {
    match s.rsplit_once('/') {
        Some((rest, proto)) => {
            let proto = proto.to_lowercase();
            if !PROTOCOLS.contains(&proto.as_str()) {
                return Err(BoxError::invalid(format!("invalid protocol {proto:?} in {raw:?}")));
            }
            Ok((rest, proto))
        }
        None => Ok((s, "tcp".to_string())),
    }
}

/// Split `[ip:][host:]container` where ip may be bracketed IPv6.
fn split_publish(spec: &str) -> Result<(String, String, String)> {
    if let Some(rest) = spec.strip_prefix('[') {
        let (ip, rest) = rest
            .split_once("]:")
            .ok_or_else(|| BoxError::invalid(format!("invalid publish spec {spec:?}")))?;
        let (host, container) = rest
            .split_once(':')
            .ok_or_else(|| BoxError::invalid(format!("invalid publish spec {spec:?}")))?;
        return Ok((ip.to_string(), host.to_string(), container.to_string()));
    }
    let parts: Vec<&str> = spec.split(':').collect();
    match parts.as_slice() {
        [container] => Ok((String::new(), String::new(), container.to_string())),
        [host, container] => Ok((String::new(), host.to_string(), container.to_string())),
        [ip, host, container] => Ok((ip.to_string(), host.to_string(), container.to_string())),
        _ => Err(BoxError::invalid(format!("invalid publish spec {spec:?}"))),
    }
}

/// Expand one `-p` value into mappings. A host port of 0 asks for allocation.
pub fn parse_publish(spec: &str) -> Result<Vec<PortMapping>> {
    let (ip, host, container) = split_publish(spec)?;
    let (container, protocol) = split_proto(&container, spec)?;
    let host_ip = if ip.is_empty() {
        "0.0.0.0".to_string()
    } else {
        ip.parse::<std::net::IpAddr>()
            .map_err(|_| BoxError::invalid(format!("invalid host IP {ip:?} in {spec:?}")))?;
        ip
    };
    let (c_start, c_end) = parse_range(container, "container", spec)?;
    let mapping = |host_port: u16, container_port: u16| PortMapping {
        host_ip: host_ip.clone(),
        host_port,
        container_port,
        protocol: protocol.clone(),
    };

    if host.is_empty() {
        return Ok((c_start..=c_end).map(|c| mapping(0, c)).collect());
    }
    let (h_start, h_end) = parse_range(&host, "host", spec)?;
    let host_len = h_end - h_start;
    let container_len = c_end - c_start;
    if container_len == 0 {
        return Ok(vec![mapping(h_start, c_start)]);
    }
    if host_len != container_len {
        return Err(BoxError::invalid(format!(
            "invalid ranges specified for container and host ports in {spec:?}: lengths differ"
        )));
    }
    Ok((0..=container_len)
        .map(|i| mapping(h_start + i, c_start + i))
        .collect())
}

/// Expand one `--expose` value (or image `EXPOSE` entry) into `port/proto` keys.
pub fn parse_expose(spec: &str) -> Result<Vec<String>> {
    let (ports, protocol) = split_proto(spec, spec)?;
    let (start, end) = parse_range(ports, "container", spec)?;
    Ok((start..=end).map(|p| format!("{p}/{protocol}")).collect())
}
