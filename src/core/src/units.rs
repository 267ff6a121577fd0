//! Human-readable size and duration parsing.

use std::time::Duration;

use crate::error::{BoxError, Result};

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;
const TB: u64 = 1024 * GB;

/// Parse a size like "512", "64k", "10m", "1.5g", "2tb" into bytes.
///
/// Suffixes are case-insensitive and binary (1k = 1024). No suffix means bytes.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        return Err(BoxError::invalid("empty size value"));
    }

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix("tb").or_else(|| s.strip_suffix('t')) {
        (n, TB)
    } else if let Some(n) = s.strip_suffix("gb").or_else(|| s.strip_suffix('g')) {
        (n, GB)
    } else if let Some(n) = s.strip_suffix("mb").or_else(|| s.strip_suffix('m')) {
        (n, MB)
    } else if let Some(n) = s.strip_suffix("kb").or_else(|| s.strip_suffix('k')) {
        (n, KB)
    } else if let Some(n) = s.strip_suffix('b') {
        (n, 1)
    } else {
        (s.as_str(), 1)
    };

    if let Ok(n) = num_str.parse::<u64>() {
        return n
            .checked_mul(multiplier)
            .ok_or_else(|| BoxError::invalid(format!("size too large: {s}")));
    }
    let f: f64 = num_str
        .parse()
        .map_err(|_| BoxError::invalid(format!("invalid size value: {s}")))?;
    if !f.is_finite() || f < 0.0 {
        return Err(BoxError::invalid(format!("invalid size value: {s}")));
    }
    Ok((f * multiplier as f64) as u64)
}

/// Parse a Go-style duration: "300ms", "10s", "1m30s", "2h". A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(BoxError::invalid("empty duration"));
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| BoxError::invalid(format!("missing unit in duration {s:?}")))?;
        if digits == 0 {
            return Err(BoxError::invalid(format!("invalid duration {s:?}")));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| BoxError::invalid(format!("invalid duration {s:?}")))?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_secs = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            other => {
                return Err(BoxError::invalid(format!(
                    "unknown unit {other:?} in duration {s:?}"
                )))
            }
        };
        total += Duration::from_secs_f64(value * unit_secs);
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Format bytes as a human-readable string ("1.5 MB").
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("10m").unwrap(), 10 * MB);
        assert_eq!(parse_size("10MB").unwrap(), 10 * MB);
        assert_eq!(parse_size("1g").unwrap(), GB);
        assert_eq!(parse_size("512k").unwrap(), 512 * KB);
        assert_eq!(parse_size("1.5k").unwrap(), 1536);
        assert_eq!(parse_size("0").unwrap(), 0);
        assert!(parse_size("abc").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("42m").unwrap(), Duration::from_secs(42 * 60));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("m").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(10 * MB), "10.0 MB");
    }
}
