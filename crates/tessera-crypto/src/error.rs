//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Handshake failed
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Peer speaks an incompatible protocol version
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch {
        /// Our protocol version
        local: u16,
        /// Version announced by the peer
        remote: u16,
    },

    /// Peer asked for a folder we are not syncing with it
    #[error("folder mismatch")]
    FolderMismatch,

    /// Peer identity is not the expected or trusted one
    #[error("untrusted peer {0}")]
    UntrustedPeer(String),

    /// Invalid state for operation
    #[error("invalid state for operation")]
    InvalidState,

    /// Invalid message format
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Nonce overflow (counter exhausted)
    #[error("nonce counter exhausted, rekey required")]
    NonceOverflow,

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Invalid key material (corrupted or wrong format)
    #[error("invalid key material")]
    InvalidKeyMaterial,

    /// Reading or writing a key file failed
    #[error("key file error: {0}")]
    KeyFile(#[from] std::io::Error),
}
