//! Random identifiers.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// `n` random bytes as lowercase hex.
pub fn random_hex(n: usize) -> String {
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// A fresh 256-bit container ID.
pub fn generate_id() -> String {
    random_hex(32)
}

/// Whether `s` looks like a full 64-hex ID.
pub fn is_full_id(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Lowercase hex sha256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id() {
        let a = generate_id();
        let b = generate_id();
        assert_eq!(a.len(), 64);
        assert!(is_full_id(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn test_is_full_id() {
        assert!(!is_full_id("abc"));
        assert!(!is_full_id(&"Z".repeat(64)));
        assert!(!is_full_id(&"A".repeat(64)));
    }
}
