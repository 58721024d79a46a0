//! BLAKE3 content digests and key derivation.
//!
//! Provides:
//! - [`Digest`], the 32-byte content address used for chunks and files
//! - Incremental hashing for streamed file content
//! - HKDF-like key derivation functions
//! - Context-specific KDF

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// A BLAKE3 content digest.
///
/// Ordering is lexicographic over the raw bytes, which the merge engine
/// relies on as a deterministic tie-break.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Digest of the empty byte string.
    pub const EMPTY: Digest = Digest([
        0xaf, 0x13, 0x49, 0xb9, 0xf5, 0xf9, 0xa1, 0xa6, 0xa0, 0x40, 0x4d, 0xea, 0x36, 0xdc, 0xc9,
        0x49, 0x9b, 0xcb, 0x25, 0xc9, 0xad, 0xc1, 0x12, 0xb7, 0xcc, 0x9a, 0x93, 0xca, 0xe4, 0x1f,
        0x32, 0x62,
    ]);

    /// Digest `data`.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self(hash(data))
    }

    /// Wrap raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lowercase hex encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First four bytes as hex, for log lines and conflict-copy names.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Check `data` hashes to this digest.
    #[must_use]
    pub fn matches(&self, data: &[u8]) -> bool {
        Self::of(data) == *self
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl FromStr for Digest {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl From<blake3::Hash> for Digest {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

/// Incremental BLAKE3 hasher for streamed content.
pub struct StreamHasher {
    hasher: blake3::Hasher,
    total_len: u64,
}

impl StreamHasher {
    /// Create a new hasher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
            total_len: 0,
        }
    }

    /// Update with more data.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.total_len += data.len() as u64;
    }

    /// Get total bytes hashed so far.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    /// Finalize and return the digest.
    #[must_use]
    pub fn finalize(&self) -> Digest {
        self.hasher.finalize().into()
    }
}

impl Default for StreamHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// BLAKE3 Key Derivation Function with context.
pub struct Kdf {
    context: &'static str,
}

impl Kdf {
    /// Create a KDF with a specific context string.
    #[must_use]
    pub fn new(context: &'static str) -> Self {
        Self { context }
    }

    /// Derive output from input key material.
    pub fn derive(&self, ikm: &[u8], output: &mut [u8]) {
        let mut hasher = blake3::Hasher::new_derive_key(self.context);
        hasher.update(ikm);
        hasher.finalize_xof().fill(output);
    }

    /// Derive a 32-byte key.
    #[must_use]
    pub fn derive_key(&self, ikm: &[u8]) -> [u8; 32] {
        let mut output = [0u8; 32];
        self.derive(ikm, &mut output);
        output
    }
}

/// HKDF-Extract: Extract a pseudorandom key from input key material.
///
/// Corresponds to HKDF-Extract from RFC 5869, but using BLAKE3.
#[must_use]
pub fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> [u8; 32] {
    if salt.is_empty() {
        hash(ikm)
    } else {
        let salt_hash = hash(salt);
        let mut hasher = blake3::Hasher::new_keyed(&salt_hash);
        hasher.update(ikm);
        *hasher.finalize().as_bytes()
    }
}

/// HKDF-Expand: Expand a pseudorandom key into arbitrary-length output.
pub fn hkdf_expand(prk: &[u8; 32], info: &[u8], output: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_keyed(prk);
    hasher.update(info);
    hasher.finalize_xof().fill(output);
}

/// HKDF: Combined extract-then-expand.
pub fn hkdf(salt: &[u8], ikm: &[u8], info: &[u8], output: &mut [u8]) {
    let prk = hkdf_extract(salt, ikm);
    hkdf_expand(&prk, info, output);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_digest_constant() {
        assert_eq!(Digest::of(b""), Digest::EMPTY);
    }

    #[test]
    fn test_digest_hex_roundtrip() {
        let d = Digest::of(b"hello");
        let parsed: Digest = d.to_hex().parse().unwrap();
        assert_eq!(d, parsed);
        assert_eq!(d.short().len(), 8);
        assert!(d.matches(b"hello"));
        assert!(!d.matches(b"hellO"));
    }

    #[test]
    fn test_digest_ordering_is_bytewise() {
        let a = Digest::from_bytes([0u8; 32]);
        let mut high = [0u8; 32];
        high[0] = 1;
        let b = Digest::from_bytes(high);
        assert!(a < b);
    }

    #[test]
    fn test_stream_hasher_matches_oneshot() {
        let mut hasher = StreamHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.total_len(), 11);
        assert_eq!(hasher.finalize(), Digest::of(b"hello world"));
    }

    #[test]
    fn test_kdf_context_separation() {
        let ikm = b"input key material";
        let k1 = Kdf::new("tessera test a").derive_key(ikm);
        let k2 = Kdf::new("tessera test b").derive_key(ikm);
        assert_ne!(k1, k2);
        assert_eq!(k1, Kdf::new("tessera test a").derive_key(ikm));
    }

    #[test]
    fn test_hkdf_salt_changes_output() {
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        hkdf(b"salt-1", b"ikm", b"info", &mut a);
        hkdf(b"salt-2", b"ikm", b"info", &mut b);
        assert_ne!(a, b);
    }
}
