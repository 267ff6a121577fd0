//! fluentd driver: Fluent Forward protocol (message mode) over TCP or a unix socket.
//!
//! Each entry goes out as the msgpack array `[tag, time, record]`.

use std::io::Write;
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use cdbox_core::error::{BoxError, Result};
use cdbox_core::log::{LogConfig, LogEntry};

use super::LogSink;

const DEFAULT_ADDRESS: &str = "localhost:24224";
const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RETRIES: u32 = 10;

/// Where the fluentd daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FluentdAddress {
    Tcp(String),
    Unix(String),
}

impl FluentdAddress {
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        let raw = raw.unwrap_or(DEFAULT_ADDRESS);
        if let Some(path) = raw.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(BoxError::invalid("fluentd-address unix:// needs a path"));
            }
            return Ok(Self::Unix(path.to_string()));
        }
        let hostport = raw.strip_prefix("tcp://").unwrap_or(raw);
        if hostport.is_empty() {
            return Ok(Self::Tcp(DEFAULT_ADDRESS.to_string()));
        }
        if hostport.contains(':') {
            Ok(Self::Tcp(hostport.to_string()))
        } else {
            Ok(Self::Tcp(format!("{hostport}:24224")))
        }
    }
}

enum Conn {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Conn {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Conn::Tcp(s) => s.write_all(buf),
            Conn::Unix(s) => s.write_all(buf),
        }
    }
}

pub struct FluentdSink {
    address: FluentdAddress,
    tag: String,
    container_id: String,
    container_name: String,
    /// Drop entries instead of failing when the daemon is unreachable.
    async_mode: bool,
    retry_wait: Duration,
    max_retries: u32,
    conn: Option<Conn>,
}

impl FluentdSink {
    pub fn new(config: &LogConfig, container_id: &str, container_name: &str) -> Result<Self> {
        let address = FluentdAddress::parse(config.opts.get("fluentd-address").map(String::as_str))?;
        let retry_wait = match config.opts.get("fluentd-retry-wait") {
            Some(raw) => cdbox_core::units::parse_duration(raw)?,
            None => DEFAULT_RETRY_WAIT,
        };
        let max_retries = match config.opts.get("fluentd-max-retries") {
            Some(raw) => raw
                .parse()
                .map_err(|_| BoxError::invalid(format!("invalid fluentd-max-retries {raw:?}")))?,
            None => DEFAULT_MAX_RETRIES,
        };
        Ok(Self {
            address,
            tag: config.tag(container_id, container_name),
            container_id: container_id.to_string(),
            container_name: container_name.to_string(),
            async_mode: config.opts.get("fluentd-async").map(|v| v == "true").unwrap_or(false),
            retry_wait,
            max_retries,
            conn: None,
        })
    }

    fn connect(&self) -> std::io::Result<Conn> {
        match &self.address {
            FluentdAddress::Tcp(addr) => TcpStream::connect(addr).map(Conn::Tcp),
            FluentdAddress::Unix(path) => UnixStream::connect(path).map(Conn::Unix),
        }
    }

    fn send(&mut self, buf: &[u8]) -> std::io::Result<()> {
        let mut attempt = 0;
        loop {
            if self.conn.is_none() {
                match self.connect() {
                    Ok(c) => self.conn = Some(c),
                    Err(e) => {
                        attempt += 1;
                        if attempt > self.max_retries || self.async_mode {
                            return Err(e);
                        }
                        std::thread::sleep(self.retry_wait);
                        continue;
                    }
                }
            }
            let Some(conn) = self.conn.as_mut() else { continue };
            match conn.write_all(buf) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.conn = None;
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(e);
                    }
                }
            }
        }
    }
}

impl LogSink for FluentdSink {
    fn write(&mut self, entry: &LogEntry) -> Result<()> {
        let time = entry.timestamp().map(|t| t.timestamp()).unwrap_or(0).max(0) as u64;
        let message = entry.log.strip_suffix('\n').unwrap_or(&entry.log);
        let record = [
            ("container_id", self.container_id.as_str()),
            ("container_name", self.container_name.as_str()),
            ("source", if entry.stream == cdbox_core::log::LogStream::Stderr { "stderr" } else { "stdout" }),
            ("log", message),
        ];
        let buf = encode_message(&self.tag, time, &record);
        match self.send(&buf) {
            Ok(()) => Ok(()),
            Err(e) if self.async_mode => {
                tracing::debug!(error = %e, "fluentd unreachable, dropping entry");
                Ok(())
            }
            Err(e) => Err(BoxError::runtime("fluentd", e)),
        }
    }
}

/// `[tag, time, {k: v, ...}]` in msgpack.
pub fn encode_message(tag: &str, time: u64, record: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + record.iter().map(|(k, v)| k.len() + v.len() + 10).sum::<usize>());
    buf.push(0x93);
    write_str(&mut buf, tag);
    write_uint(&mut buf, time);
    write_map_len(&mut buf, record.len());
    for (key, value) in record {
        write_str(&mut buf, key);
        write_str(&mut buf, value);
    }
    buf
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    let len = s.len();
    if len < 32 {
        buf.push(0xa0 | len as u8);
    } else if len <= u8::MAX as usize {
        buf.push(0xd9);
        buf.push(len as u8);
    } else if len <= u16::MAX as usize {
        buf.push(0xda);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(0xdb);
        buf.extend_from_slice(&(len as u32).to_be_bytes());
    }
    buf.extend_from_slice(s.as_bytes());
}

fn write_uint(buf: &mut Vec<u8>, n: u64) {
    if n < 128 {
        buf.push(n as u8);
    } else if n <= u32::MAX as u64 {
        buf.push(0xce);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(0xcf);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

fn write_map_len(buf: &mut Vec<u8>, len: usize) {
    if len < 16 {
        buf.push(0x80 | len as u8);
    } else {
        buf.push(0xde);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixListener;
    use tempfile::TempDir;

    #[test]
    fn test_address_parse() {
        assert_eq!(
            FluentdAddress::parse(None).unwrap(),
            FluentdAddress::Tcp("localhost:24224".to_string())
        );
        assert_eq!(
            FluentdAddress::parse(Some("tcp://10.0.0.5")).unwrap(),
            FluentdAddress::Tcp("10.0.0.5:24224".to_string())
        );
        assert_eq!(
            FluentdAddress::parse(Some("unix:///run/fluent.sock")).unwrap(),
            FluentdAddress::Unix("/run/fluent.sock".to_string())
        );
        assert!(FluentdAddress::parse(Some("unix://")).is_err());
    }

    #[test]
    fn test_encode_message_layout() {
        let buf = encode_message("app", 1_700_000_000, &[("log", "hi")]);
        assert_eq!(buf[0], 0x93);
        assert_eq!(&buf[1..5], &[0xa3, b'a', b'p', b'p']);
        assert_eq!(buf[5], 0xce);
        assert_eq!(&buf[6..10], &1_700_000_000u32.to_be_bytes());
        assert_eq!(buf[10], 0x81);
        assert_eq!(&buf[11..], &[0xa3, b'l', b'o', b'g', 0xa2, b'h', b'i']);
    }

    #[test]
    fn test_long_string_header() {
        let mut buf = Vec::new();
        write_str(&mut buf, &"x".repeat(40));
        assert_eq!(&buf[..2], &[0xd9, 40]);
        let mut buf = Vec::new();
        write_str(&mut buf, &"x".repeat(300));
        assert_eq!(&buf[..3], &[0xda, 0x01, 0x2c]);
    }

    #[test]
    fn test_sink_sends_over_unix_socket() {
        let dir = TempDir::new().unwrap();
        let sock = dir.path().join("fluent.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        let handle = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            conn.read_to_end(&mut buf).unwrap();
            buf
        });

        let config = LogConfig::from_flags(
            Some("fluentd"),
            &[format!("fluentd-address=unix://{}", sock.display()), "tag=web".to_string()],
        )
        .unwrap();
        let mut sink = FluentdSink::new(&config, &"a".repeat(64), "web").unwrap();
        sink.write(&LogEntry::now(cdbox_core::log::LogStream::Stdout, "hello\n")).unwrap();
        drop(sink);

        let received = handle.join().unwrap();
        assert_eq!(received[0], 0x93);
        assert_eq!(&received[1..5], &[0xa3, b'w', b'e', b'b']);
        assert!(received.windows(5).any(|w| w == b"hello"));
    }
}
