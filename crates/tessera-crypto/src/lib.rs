//! # Tessera Crypto
//!
//! Cryptographic primitives for the Tessera synchronization protocol.
//!
//! This crate provides:
//! - BLAKE3 content digests used as chunk addresses
//! - `XChaCha20-Poly1305` AEAD with counter nonces for session traffic
//! - Ed25519 device identities (the public key is the replica id)
//! - A mutually authenticated, versioned peer handshake
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 (ephemeral) | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | Hash / Digest | BLAKE3 | 128-bit collision |
//! | KDF | HKDF-BLAKE3 | 128-bit |
//! | Signatures | Ed25519 | 128-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod error;
pub mod handshake;
pub mod hash;
pub mod identity;

pub use error::CryptoError;
pub use handshake::{Handshake, HandshakeOutcome, Hello, PROTOCOL_VERSION, Role, TrustPolicy};
pub use hash::Digest;
pub use identity::{DeviceKey, FolderId, PeerId};

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 key size
pub const XCHACHA_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// BLAKE3 output size
pub const BLAKE3_OUTPUT_SIZE: usize = 32;

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// Session keys derived from a completed handshake.
#[derive(zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Key for sending data
    pub send_key: [u8; 32],
    /// Key for receiving data
    pub recv_key: [u8; 32],
    /// Salt mixed into every counter nonce
    pub nonce_salt: [u8; 16],
}

impl SessionKeys {
    /// Short identifier for log correlation; both ends compute the same value.
    #[must_use]
    pub fn session_tag(&self) -> [u8; 8] {
        let hash = blake3::hash(&self.nonce_salt);
        let mut tag = [0u8; 8];
        tag.copy_from_slice(&hash.as_bytes()[..8]);
        tag
    }
}
