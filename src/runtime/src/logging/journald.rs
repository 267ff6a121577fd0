//! journald driver over the native journal socket, and `journalctl` for reading.

use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::process::Stdio;

use cdbox_core::error::{BoxError, Result};
use cdbox_core::log::{LogEntry, LogStream};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::LogSink;

pub const JOURNAL_SOCKET: &str = "/run/systemd/journal/socket";

/// Fields attached to every entry of one container.
#[derive(Debug, Clone)]
pub struct JournalFields {
    pub identifier: String,
    pub container_id: String,
    pub container_name: String,
}

pub struct JournaldSink {
    socket: UnixDatagram,
    target: PathBuf,
    fields: JournalFields,
}

impl JournaldSink {
    pub fn connect(fields: JournalFields) -> Result<Self> {
        let socket = UnixDatagram::unbound()?;
        Ok(Self {
            socket,
            target: PathBuf::from(JOURNAL_SOCKET),
            fields,
        })
    }
}

/// Encode one entry in the journal native protocol.
pub fn encode(fields: &JournalFields, entry: &LogEntry) -> Vec<u8> {
    let message = entry.log.strip_suffix('\n').unwrap_or(&entry.log);
    let priority = match entry.stream {
        LogStream::Stdout => "6",
        LogStream::Stderr => "3",
    };
    let short = cdbox_core::container::short_id(&fields.container_id);
    let mut buf = Vec::with_capacity(message.len() + 256);
    for (key, value) in [
        ("MESSAGE", message),
        ("PRIORITY", priority),
        ("SYSLOG_IDENTIFIER", fields.identifier.as_str()),
        ("CONTAINER_ID", short),
        ("CONTAINER_ID_FULL", fields.container_id.as_str()),
        ("CONTAINER_NAME", fields.container_name.as_str()),
        ("CONTAINER_TAG", fields.identifier.as_str()),
    ] {
        if value.contains('\n') {
            buf.extend_from_slice(key.as_bytes());
            buf.push(b'\n');
            buf.extend_from_slice(&(value.len() as u64).to_le_bytes());
            buf.extend_from_slice(value.as_bytes());
            buf.push(b'\n');
        } else {
            buf.extend_from_slice(key.as_bytes());
            buf.push(b'=');
            buf.extend_from_slice(value.as_bytes());
            buf.push(b'\n');
        }
    }
    buf
}

impl LogSink for JournaldSink {
    fn write(&mut self, entry: &LogEntry) -> Result<()> {
        let datagram = encode(&self.fields, entry);
        self.socket
            .send_to(&datagram, &self.target)
            .map_err(|e| BoxError::runtime("journald", e))?;
        Ok(())
    }
}

/// Arguments for reading a container's entries back with `journalctl`.
pub fn journalctl_args(
    identifier: &str,
    follow: bool,
    tail: Option<usize>,
    since: Option<chrono::DateTime<chrono::Utc>>,
    until: Option<chrono::DateTime<chrono::Utc>>,
) -> Vec<String> {
    let fmt = |t: chrono::DateTime<chrono::Utc>| {
        t.with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    };
    let mut args = vec![
        "--no-pager".to_string(),
        "-o".to_string(),
        "json".to_string(),
        format!("SYSLOG_IDENTIFIER={identifier}"),
    ];
    if follow {
        args.push("--follow".to_string());
    }
    if let Some(n) = tail {
        args.push("--lines".to_string());
        args.push(n.to_string());
    }
    if let Some(t) = since {
        args.push("--since".to_string());
        args.push(fmt(t));
    }
    if let Some(t) = until {
        args.push("--until".to_string());
        args.push(fmt(t));
    }
    args
}

/// Turn one `journalctl -o json` line into an entry.
pub fn parse_journal_line(line: &str) -> Option<LogEntry> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let message = match &value["MESSAGE"] {
        serde_json::Value::String(s) => s.clone(),
        // Non-UTF-8 messages come back as byte arrays.
        serde_json::Value::Array(bytes) => {
            let raw: Vec<u8> = bytes.iter().filter_map(|b| b.as_u64().map(|b| b as u8)).collect();
            String::from_utf8_lossy(&raw).into_owned()
        }
        _ => return None,
    };
    let stream = if value["PRIORITY"].as_str() == Some("3") {
        LogStream::Stderr
    } else {
        LogStream::Stdout
    };
    let micros: i64 = value["__REALTIME_TIMESTAMP"].as_str()?.parse().ok()?;
    let time = chrono::DateTime::<chrono::Utc>::from_timestamp_micros(micros)?;
    Some(LogEntry {
        log: format!("{message}\n"),
        stream,
        time: time.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
    })
}

/// Stream entries from `journalctl` into `emit` until it exits.
pub async fn read(
    args: Vec<String>,
    mut emit: impl FnMut(&LogEntry) -> Result<()> + Send,
) -> Result<()> {
    let mut child = Command::new("journalctl")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BoxError::runtime("logs", format!("failed to run journalctl: {e}")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BoxError::runtime("logs", "journalctl stdout unavailable"))?;
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(entry) = parse_journal_line(&line) {
            emit(&entry)?;
        }
    }
    let status = child.wait().await?;
    if !status.success() {
        return Err(BoxError::runtime(
            "logs",
            format!("journalctl exited with {}", status.code().unwrap_or(-1)),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> JournalFields {
        JournalFields {
            identifier: "abcdef123456".to_string(),
            container_id: format!("abcdef123456{}", "0".repeat(52)),
            container_name: "web".to_string(),
        }
    }

    #[test]
    fn test_encode_simple_fields() {
        let entry = LogEntry::now(LogStream::Stderr, "boom\n");
        let raw = String::from_utf8(encode(&fields(), &entry)).unwrap();
        assert!(raw.starts_with("MESSAGE=boom\n"));
        assert!(raw.contains("PRIORITY=3\n"));
        assert!(raw.contains("SYSLOG_IDENTIFIER=abcdef123456\n"));
        assert!(raw.contains("CONTAINER_NAME=web\n"));
    }

    #[test]
    fn test_encode_multiline_uses_length_prefix() {
        let entry = LogEntry::now(LogStream::Stdout, "a\nb\n");
        let raw = encode(&fields(), &entry);
        assert!(raw.starts_with(b"MESSAGE\n"));
        assert_eq!(&raw[8..16], &3u64.to_le_bytes());
        assert_eq!(&raw[16..20], b"a\nb\n");
    }

    #[test]
    fn test_parse_journal_line() {
        let line = r#"{"MESSAGE":"hi","PRIORITY":"6","__REALTIME_TIMESTAMP":"1700000000000000"}"#;
        let entry = parse_journal_line(line).unwrap();
        assert_eq!(entry.log, "hi\n");
        assert_eq!(entry.stream, LogStream::Stdout);
        assert!(entry.time.starts_with("2023-11-14T22:13:20"));
    }

    #[test]
    fn test_journalctl_args() {
        let args = journalctl_args("web", true, Some(5), None, None);
        assert_eq!(
            args,
            ["--no-pager", "-o", "json", "SYSLOG_IDENTIFIER=web", "--follow", "--lines", "5"]
        );
    }
}
