//! Attaching to a running container and the detach key sequence.

use cdbox_core::error::{BoxError, Result};

use super::ContainerManager;
use crate::client::AttachStream;

pub const DEFAULT_DETACH_KEYS: &str = "ctrl-p,ctrl-q";

/// A parsed detach sequence such as `ctrl-p,ctrl-q`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachKeys(Vec<u8>);

impl Default for DetachKeys {
    fn default() -> Self {
        Self(vec![0x10, 0x11])
    }
}

impl DetachKeys {
    /// Parse `a`..`z` and `ctrl-<a..z|@|[|\|]|^|_>` items. An empty string
    /// disables detaching.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Ok(Self(Vec::new()));
        }
        let mut keys = Vec::new();
        for item in raw.split(',') {
            let bad = || BoxError::invalid(format!("invalid detach keys {raw:?}: unknown key {item:?}"));
            let key = match item.strip_prefix("ctrl-") {
                Some(rest) if rest.len() == 1 => {
                    let c = rest.as_bytes()[0];
                    match c {
                        b'a'..=b'z' => c - b'a' + 1,
                        b'@' => 0,
                        b'[' => 27,
                        b'\\' => 28,
                        b']' => 29,
                        b'^' => 30,
                        b'_' => 31,
                        _ => return Err(bad()),
                    }
                }
                Some(_) => return Err(bad()),
                None if item.len() == 1 => item.as_bytes()[0],
                None => return Err(bad()),
            };
            keys.push(key);
        }
        Ok(Self(keys))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn scanner(&self) -> DetachScanner {
        DetachScanner {
            keys: self.0.clone(),
            matched: 0,
        }
    }
}

/// Finds the detach sequence in a stdin byte stream.
///
/// Bytes that might start the sequence are held back until the sequence
/// either completes or breaks, then forwarded.
#[derive(Debug)]
pub struct DetachScanner {
    keys: Vec<u8>,
    matched: usize,
}

/// Outcome of feeding one chunk.
#[derive(Debug, PartialEq, Eq)]
pub struct Scanned {
    /// Bytes to pass to the container.
    pub forward: Vec<u8>,
    pub detached: bool,
}

impl DetachScanner {
    pub fn feed(&mut self, chunk: &[u8]) -> Scanned {
        let mut forward = Vec::with_capacity(chunk.len());
        if self.keys.is_empty() {
            forward.extend_from_slice(chunk);
            return Scanned {
                forward,
                detached: false,
            };
        }
        for &b in chunk {
            if b == self.keys[self.matched] {
                self.matched += 1;
                if self.matched == self.keys.len() {
                    self.matched = 0;
                    return Scanned {
                        forward,
                        detached: true,
                    };
                }
                continue;
            }
            // Release the held prefix, then retry this byte as a new start.
            forward.extend_from_slice(&self.keys[..self.matched]);
            self.matched = 0;
            if b == self.keys[0] {
                self.matched = 1;
                if self.keys.len() == 1 {
                    self.matched = 0;
                    return Scanned {
                        forward,
                        detached: true,
                    };
                }
            } else {
                forward.push(b);
            }
        }
        Scanned {
            forward,
            detached: false,
        }
    }
}

impl ContainerManager {
    /// Connect to the stdio of a running container.
    pub async fn attach(&self, token: &str) -> Result<AttachStream> {
        let container = self.find(token).await?;
        if !container.status().is_live() {
            return Err(BoxError::Precondition(format!(
                "you cannot attach to a stopped container {}, start it first",
                container.name()
            )));
        }
        self.services().tasks.attach(container.id()).await
    }
}
