//! Device identity.
//!
//! Every device holds one long-term Ed25519 key. Its public half is the
//! [`PeerId`], which doubles as the replica id in version vectors and as the
//! fingerprint peers pin in their trusted sets.
//!
//! The key is persisted as the hex-encoded 32-byte seed.
//!
//! Folders are named by a [`FolderId`] shared by every replica of the folder,
//! usually derived from a folder secret so it can be handed out as text.

use crate::CryptoError;
use crate::hash::Kdf;
use ed25519_dalek::{Signer, Verifier};
use rand_core::{CryptoRng, OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Public identity of a device (Ed25519 verifying key bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Wrap raw key bytes. The bytes are not validated as a curve point
    /// until [`PeerId::verify`] is called.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First four bytes as hex, used in logs and conflict-copy names.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Verify `signature` over `message` against this identity.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the id is not a valid
    /// point, or [`CryptoError::InvalidSignature`] if verification fails.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let sig = ed25519_dalek::Signature::from_slice(signature)
            .map_err(|_| CryptoError::InvalidSignature)?;
        key.verify(message, &sig)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self(bytes))
    }
}

/// Identifier shared by all replicas of one folder.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderId([u8; 32]);

impl FolderId {
    /// Wrap raw id bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the id from a folder secret.
    #[must_use]
    pub fn from_secret(secret: &str) -> Self {
        Self(Kdf::new("tessera folder id v1").derive_key(secret.as_bytes()))
    }

    /// Raw id bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lowercase hex encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First four bytes as hex, for logs.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FolderId({})", self.short())
    }
}

impl FromStr for FolderId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes).map_err(|_| CryptoError::InvalidKeyMaterial)?;
        Ok(Self(bytes))
    }
}

/// Long-term device signing key.
pub struct DeviceKey {
    inner: ed25519_dalek::SigningKey,
}

impl DeviceKey {
    /// Generate a fresh identity.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::generate(rng),
        }
    }

    /// Rebuild from a 32-byte seed.
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    /// Public identity of this key.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        PeerId(self.inner.verifying_key().to_bytes())
    }

    /// Sign a message.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.inner.sign(message).to_bytes()
    }

    /// Load a key file.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyFile`] on I/O failure and
    /// [`CryptoError::InvalidKeyMaterial`] if the contents are not a hex seed.
    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let text = Zeroizing::new(fs::read_to_string(path)?);
        let mut seed = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(text.trim(), seed.as_mut_slice())
            .map_err(|_| CryptoError::InvalidKeyMaterial)?;
        Ok(Self::from_seed(&seed))
    }

    /// Write the key file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyFile`] on I/O failure.
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = Zeroizing::new(hex::encode(self.inner.to_bytes()));
        fs::write(path, text.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Load the key at `path`, generating and saving a new one if absent.
    ///
    /// # Errors
    ///
    /// Propagates [`DeviceKey::load`] and [`DeviceKey::save`] failures.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            Self::load(path)
        } else {
            let key = Self::generate(&mut OsRng);
            key.save(path)?;
            Ok(key)
        }
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKey")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let key = DeviceKey::generate(&mut OsRng);
        let sig = key.sign(b"message");
        assert!(key.peer_id().verify(b"message", &sig).is_ok());
        assert!(key.peer_id().verify(b"messagf", &sig).is_err());
    }

    #[test]
    fn test_wrong_identity_rejected() {
        let a = DeviceKey::generate(&mut OsRng);
        let b = DeviceKey::generate(&mut OsRng);
        let sig = a.sign(b"message");
        assert!(matches!(
            b.peer_id().verify(b"message", &sig),
            Err(CryptoError::InvalidSignature)
        ));
    }

    #[test]
    fn test_peer_id_parse() {
        let key = DeviceKey::from_seed(&[7u8; 32]);
        let id = key.peer_id();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("zz".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_folder_id_from_secret() {
        let a = FolderId::from_secret("correct horse");
        assert_eq!(a, FolderId::from_secret("correct horse"));
        assert_ne!(a, FolderId::from_secret("battery staple"));
        assert_eq!(a.to_hex().parse::<FolderId>().unwrap(), a);
    }

    #[test]
    fn test_key_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("device.key");
        let key = DeviceKey::load_or_generate(&path).unwrap();
        let again = DeviceKey::load_or_generate(&path).unwrap();
        assert_eq!(key.peer_id(), again.peer_id());
    }

    #[test]
    fn test_corrupt_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.key");
        fs::write(&path, "not hex").unwrap();
        assert!(matches!(
            DeviceKey::load(&path),
            Err(CryptoError::InvalidKeyMaterial)
        ));
    }
}
