// hasher.rs — Hashing utilities: unkeyed SHA-256 and keyed HMAC-SHA256.
//
// Two distinct uses, two distinct primitives. Unkeyed SHA-256 (`hash_bytes`,
// `hash_str`, `hash_file`) is for content-identity hashing where no secret
// is involved — config snapshots, file fingerprints. The audit hash chain
// uses keyed HMAC-SHA256 (`keyed_hash`) instead: an unkeyed hash chain can
// be recomputed and extended by anyone with write access to the log file,
// which defeats tamper detection the moment an attacker controls the host.
// Keying the chain by a per-installation secret loaded from the host
// keychain means a forged or replayed entry is detectable even by someone
// who can write arbitrary bytes to the log file, as long as they don't
// also have the secret.

use std::path::Path;

use ring::hmac;
use sha2::{Digest, Sha256};

use crate::error::AuditError;

/// Hash arbitrary bytes, returning a lowercase hex-encoded SHA-256 string.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Hash a UTF-8 string, returning a lowercase hex-encoded SHA-256 string.
pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Hash the contents of a file on disk.
pub fn hash_file(path: &Path) -> Result<String, AuditError> {
    let data = std::fs::read(path).map_err(|source| AuditError::HashFileFailed {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(hash_bytes(&data))
}

/// The per-installation key the audit hash chain is keyed by. Wraps
/// `ring::hmac::Key` so the raw secret bytes never need to leave this
/// module once loaded.
pub struct ChainKey(hmac::Key);

impl ChainKey {
    /// Derive a chain key from raw secret bytes (loaded by the caller from
    /// the host keychain / secret store — this module has no opinion on
    /// where the bytes come from).
    pub fn from_secret_bytes(secret: &[u8]) -> Self {
        Self(hmac::Key::new(hmac::HMAC_SHA256, secret))
    }

    /// Load the per-installation secret from a file path — the host
    /// keychain surfaced to this process as a read-only file, matching the
    /// egress config's own host-mounted-file convention. The secret bytes
    /// are read once at startup and never written back to the log.
    pub fn load_from_file(path: &Path) -> Result<Self, AuditError> {
        let bytes = std::fs::read(path).map_err(|e| AuditError::KeyLoadFailed(e.to_string()))?;
        if bytes.is_empty() {
            return Err(AuditError::KeyLoadFailed(format!("{} is empty", path.display())));
        }
        Ok(Self::from_secret_bytes(&bytes))
    }

    /// Compute the keyed hash chaining `event_bytes` (the event's
    /// canonical serialization with `self_hash` cleared) to `prev_hash`
    /// (the previous line's `self_hash`, or empty for the first event
    /// after a rotation checkpoint).
    pub fn chain_hash(&self, event_bytes: &[u8], prev_hash: Option<&str>) -> String {
        let mut message = Vec::with_capacity(event_bytes.len() + 64);
        message.extend_from_slice(prev_hash.unwrap_or("").as_bytes());
        message.extend_from_slice(event_bytes);
        let tag = hmac::sign(&self.0, &message);
        hex_encode(tag.as_ref())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_determinism() {
        let input = b"hello world";
        assert_eq!(hash_bytes(input), hash_bytes(input));
    }

    #[test]
    fn hash_uniqueness() {
        assert_ne!(hash_bytes(b"hello"), hash_bytes(b"world"));
    }

    #[test]
    fn hash_is_hex_encoded_sha256() {
        let hash = hash_str("test");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn hash_known_value() {
        let hash = hash_str("");
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn chain_hash_is_deterministic_for_same_key() {
        let key = ChainKey::from_secret_bytes(b"installation-secret");
        let h1 = key.chain_hash(b"event-bytes", Some("prevhash"));
        let h2 = key.chain_hash(b"event-bytes", Some("prevhash"));
        assert_eq!(h1, h2);
    }

    #[test]
    fn chain_hash_differs_by_key() {
        let key_a = ChainKey::from_secret_bytes(b"secret-a");
        let key_b = ChainKey::from_secret_bytes(b"secret-b");
        let h_a = key_a.chain_hash(b"event-bytes", None);
        let h_b = key_b.chain_hash(b"event-bytes", None);
        assert_ne!(h_a, h_b);
    }

    #[test]
    fn chain_hash_differs_when_prev_hash_differs() {
        let key = ChainKey::from_secret_bytes(b"installation-secret");
        let h1 = key.chain_hash(b"event-bytes", Some("hash-a"));
        let h2 = key.chain_hash(b"event-bytes", Some("hash-b"));
        assert_ne!(h1, h2);
    }

    #[test]
    fn chain_hash_is_64_hex_chars() {
        let key = ChainKey::from_secret_bytes(b"installation-secret");
        let h = key.chain_hash(b"event-bytes", None);
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
