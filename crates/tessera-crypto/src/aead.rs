//! `XChaCha20-Poly1305` AEAD encryption for session traffic.
//!
//! Every frame after the handshake is sealed with [`SessionCrypto`], which
//! derives nonces from a per-direction message counter. Sessions run over a
//! reliable ordered stream, so the receiver expects counters strictly in
//! sequence and any gap, replay or reorder fails authentication.

use crate::{CryptoError, SessionKeys};
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{Aead, KeyInit, Payload},
};
use rand_core::{CryptoRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits).
pub const NONCE_SIZE: usize = 24;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce (24 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a nonce from a counter value.
    ///
    /// The counter is placed in the first 8 bytes (little-endian),
    /// the remaining 16 bytes carry the session salt.
    #[must_use]
    pub fn from_counter(counter: u64, salt: &[u8; 16]) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        bytes[..8].copy_from_slice(&counter.to_le_bytes());
        bytes[8..].copy_from_slice(salt);
        Self(bytes)
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    fn as_generic(&self) -> &chacha20poly1305::XNonce {
        chacha20poly1305::XNonce::from_slice(&self.0)
    }
}

/// AEAD encryption key (32 bytes). Zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if slice length is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_SIZE] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: slice.len(),
                })?;
        Ok(Self(bytes))
    }

    /// Generate a random key.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Encrypt plaintext with associated data.
    ///
    /// Returns ciphertext with appended authentication tag.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn encrypt(
        &self,
        nonce: &Nonce,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new((&self.0).into());
        cipher
            .encrypt(
                nonce.as_generic(),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt ciphertext (tag appended) with associated data.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` on authentication failure.
    pub fn decrypt(
        &self,
        nonce: &Nonce,
        ciphertext_and_tag: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext_and_tag.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let cipher = XChaCha20Poly1305::new((&self.0).into());
        cipher
            .decrypt(
                nonce.as_generic(),
                Payload {
                    msg: ciphertext_and_tag,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Session encryption state for post-handshake communication.
///
/// Manages nonce counters and keys for bidirectional encrypted communication.
#[derive(ZeroizeOnDrop)]
pub struct SessionCrypto {
    send_key: AeadKey,
    recv_key: AeadKey,
    #[zeroize(skip)]
    nonce_salt: [u8; 16],
    #[zeroize(skip)]
    send_counter: u64,
    #[zeroize(skip)]
    recv_counter: u64,
    #[zeroize(skip)]
    max_counter: u64,
}

impl SessionCrypto {
    /// Create session state from derived keys.
    #[must_use]
    pub fn new(keys: &SessionKeys) -> Self {
        Self {
            send_key: AeadKey::new(keys.send_key),
            recv_key: AeadKey::new(keys.recv_key),
            nonce_salt: keys.nonce_salt,
            send_counter: 0,
            recv_counter: 0,
            max_counter: u64::MAX - 1,
        }
    }

    /// Seal the next outgoing message.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::NonceOverflow` if the send counter is exhausted.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.send_counter >= self.max_counter {
            return Err(CryptoError::NonceOverflow);
        }
        let nonce = Nonce::from_counter(self.send_counter, &self.nonce_salt);
        let aad = self.send_counter.to_be_bytes();
        let sealed = self.send_key.encrypt(&nonce, plaintext, &aad)?;
        self.send_counter += 1;
        Ok(sealed)
    }

    /// Open the next incoming message.
    ///
    /// The receive counter only advances on success, but a failed open is
    /// fatal for the session anyway.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` on tampering, replay or reorder.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.recv_counter >= self.max_counter {
            return Err(CryptoError::NonceOverflow);
        }
        let nonce = Nonce::from_counter(self.recv_counter, &self.nonce_salt);
        let aad = self.recv_counter.to_be_bytes();
        let plain = self.recv_key.decrypt(&nonce, ciphertext, &aad)?;
        self.recv_counter += 1;
        Ok(plain)
    }

    /// Messages sealed so far.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.send_counter
    }

    /// Messages opened so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.recv_counter
    }

    /// Split into independent sending and receiving halves.
    #[must_use]
    pub fn split(self) -> (SendHalf, RecvHalf) {
        (
            SendHalf {
                key: self.send_key.clone(),
                salt: self.nonce_salt,
                counter: self.send_counter,
            },
            RecvHalf {
                key: self.recv_key.clone(),
                salt: self.nonce_salt,
                counter: self.recv_counter,
            },
        )
    }
}

/// Sending half of a split [`SessionCrypto`], owned by a writer task.
#[derive(ZeroizeOnDrop)]
pub struct SendHalf {
    key: AeadKey,
    #[zeroize(skip)]
    salt: [u8; 16],
    #[zeroize(skip)]
    counter: u64,
}

impl SendHalf {
    /// Seal the next outgoing message.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::NonceOverflow` when the counter is exhausted.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.counter == u64::MAX {
            return Err(CryptoError::NonceOverflow);
        }
        let nonce = Nonce::from_counter(self.counter, &self.salt);
        let sealed = self
            .key
            .encrypt(&nonce, plaintext, &self.counter.to_be_bytes())?;
        self.counter += 1;
        Ok(sealed)
    }
}

/// Receiving half of a split [`SessionCrypto`], owned by a reader task.
#[derive(ZeroizeOnDrop)]
pub struct RecvHalf {
    key: AeadKey,
    #[zeroize(skip)]
    salt: [u8; 16],
    #[zeroize(skip)]
    counter: u64,
}

impl RecvHalf {
    /// Open the next incoming message.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` on tampering, replay or reorder.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.counter == u64::MAX {
            return Err(CryptoError::NonceOverflow);
        }
        let nonce = Nonce::from_counter(self.counter, &self.salt);
        let plain = self
            .key
            .decrypt(&nonce, ciphertext, &self.counter.to_be_bytes())?;
        self.counter += 1;
        Ok(plain)
    }
}
