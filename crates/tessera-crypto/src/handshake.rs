//! Mutually authenticated peer handshake.
//!
//! The exchange is sans-IO; the transport layer moves the bytes.
//!
//! ```text
//! Initiator                                   Responder
//!   Hello{version, folder, eph_i, id_i, n_i} ->
//!                 <- Hello{version, folder, eph_r, id_r, n_r}
//!   keys = HKDF(salt = H(hello_i || hello_r), ikm = DH(eph_i, eph_r))
//!   seal(Auth{sig_i(transcript || 'I')}) ->
//!                 <- seal(Auth{sig_r(transcript || 'R')})
//! ```
//!
//! Each side proves possession of its identity key by signing the transcript,
//! which binds both ephemeral keys. A version or folder mismatch fails before
//! any keys are derived.

use crate::aead::SessionCrypto;
use crate::hash::{hash, hkdf};
use crate::identity::{DeviceKey, FolderId, PeerId};
use crate::{CryptoError, SessionKeys};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Wire protocol version carried in every [`Hello`].
pub const PROTOCOL_VERSION: u16 = 1;

const TRANSCRIPT_CONTEXT: &[u8] = b"tessera handshake v1";
const KEY_INFO: &[u8] = b"tessera session keys v1";

/// Which side of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection
    Initiator,
    /// Accepted the connection
    Responder,
}

impl Role {
    fn tag(self) -> u8 {
        match self {
            Role::Initiator => b'I',
            Role::Responder => b'R',
        }
    }

    fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

/// Which remote identities are acceptable.
#[derive(Debug, Clone)]
pub enum TrustPolicy {
    /// We dialed a specific peer and nobody else will do.
    Expect(PeerId),
    /// Accept any listed peer; an empty list accepts any authenticated peer.
    AnyOf(Vec<PeerId>),
}

impl TrustPolicy {
    fn permits(&self, peer: &PeerId) -> bool {
        match self {
            TrustPolicy::Expect(expected) => expected == peer,
            TrustPolicy::AnyOf(list) => list.is_empty() || list.contains(peer),
        }
    }
}

/// First (plaintext) handshake message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version of the sender
    pub version: u16,
    /// Folder the session is for
    pub folder_id: FolderId,
    /// Ephemeral X25519 public key
    pub ephemeral: [u8; 32],
    /// Long-term identity of the sender
    pub identity: PeerId,
    /// Fresh randomness
    pub nonce: [u8; 16],
}

impl Hello {
    /// Encode for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidMessage`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        bincode::serialize(self).map_err(|e| CryptoError::InvalidMessage(e.to_string()))
    }

    /// Decode from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidMessage`] for malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        bincode::deserialize(bytes).map_err(|e| CryptoError::InvalidMessage(e.to_string()))
    }
}

/// Handshake state for one connection.
pub struct Handshake<'a> {
    role: Role,
    identity: &'a DeviceKey,
    trust: TrustPolicy,
    ephemeral: Option<x25519_dalek::EphemeralSecret>,
    local_hello: Hello,
    local_bytes: Vec<u8>,
    remote: Option<(Hello, Vec<u8>)>,
}

/// Result of key agreement, waiting for the remote's identity proof.
pub struct HandshakeOutcome {
    role: Role,
    transcript: [u8; 32],
    remote: PeerId,
    keys: SessionKeys,
}

impl<'a> Handshake<'a> {
    /// Start a handshake for `folder_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidMessage`] if the hello cannot be encoded.
    pub fn new<R: RngCore + CryptoRng>(
        role: Role,
        identity: &'a DeviceKey,
        folder_id: FolderId,
        trust: TrustPolicy,
        rng: &mut R,
    ) -> Result<Self, CryptoError> {
        let ephemeral = x25519_dalek::EphemeralSecret::random_from_rng(&mut *rng);
        let mut nonce = [0u8; 16];
        rng.fill_bytes(&mut nonce);
        let local_hello = Hello {
            version: PROTOCOL_VERSION,
            folder_id,
            ephemeral: x25519_dalek::PublicKey::from(&ephemeral).to_bytes(),
            identity: identity.peer_id(),
            nonce,
        };
        let local_bytes = local_hello.to_bytes()?;
        Ok(Self {
            role,
            identity,
            trust,
            ephemeral: Some(ephemeral),
            local_hello,
            local_bytes,
            remote: None,
        })
    }

    /// Our hello, ready to send.
    #[must_use]
    pub fn hello_bytes(&self) -> &[u8] {
        &self.local_bytes
    }

    /// Our hello.
    #[must_use]
    pub fn local_hello(&self) -> &Hello {
        &self.local_hello
    }

    /// Process the peer's hello.
    ///
    /// Checks version, folder and trust before any key material is derived.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::VersionMismatch`] for a different protocol version
    /// - [`CryptoError::FolderMismatch`] for a different folder
    /// - [`CryptoError::UntrustedPeer`] when the trust policy rejects the peer
    /// - [`CryptoError::InvalidMessage`] for malformed bytes
    pub fn read_hello(&mut self, bytes: &[u8]) -> Result<&Hello, CryptoError> {
        if self.remote.is_some() {
            return Err(CryptoError::InvalidState);
        }
        let hello = Hello::from_bytes(bytes)?;
        if hello.version != PROTOCOL_VERSION {
            return Err(CryptoError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: hello.version,
            });
        }
        if hello.folder_id != self.local_hello.folder_id {
            return Err(CryptoError::FolderMismatch);
        }
        if hello.identity == self.local_hello.identity {
            return Err(CryptoError::HandshakeFailed("connected to self".into()));
        }
        if !self.trust.permits(&hello.identity) {
            return Err(CryptoError::UntrustedPeer(hello.identity.short()));
        }
        self.remote = Some((hello, bytes.to_vec()));
        match &self.remote {
            Some((hello, _)) => Ok(hello),
            None => Err(CryptoError::InvalidState),
        }
    }

    /// Derive session keys once both hellos are known.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] if called before
    /// [`Handshake::read_hello`] or twice, and
    /// [`CryptoError::HandshakeFailed`] for a non-contributory DH result.
    pub fn agree(mut self) -> Result<HandshakeOutcome, CryptoError> {
        let (remote, remote_bytes) = self.remote.take().ok_or(CryptoError::InvalidState)?;
        let ephemeral = self.ephemeral.take().ok_or(CryptoError::InvalidState)?;

        let (first, second) = match self.role {
            Role::Initiator => (&self.local_bytes, &remote_bytes),
            Role::Responder => (&remote_bytes, &self.local_bytes),
        };
        let mut transcript_input =
            Vec::with_capacity(TRANSCRIPT_CONTEXT.len() + first.len() + second.len() + 8);
        transcript_input.extend_from_slice(TRANSCRIPT_CONTEXT);
        transcript_input.extend_from_slice(&(first.len() as u32).to_be_bytes());
        transcript_input.extend_from_slice(first);
        transcript_input.extend_from_slice(&(second.len() as u32).to_be_bytes());
        transcript_input.extend_from_slice(second);
        let transcript = hash(&transcript_input);

        let peer_public = x25519_dalek::PublicKey::from(remote.ephemeral);
        let shared = ephemeral.diffie_hellman(&peer_public);
        if !shared.was_contributory() {
            return Err(CryptoError::HandshakeFailed(
                "non-contributory key exchange".into(),
            ));
        }

        let mut okm = Zeroizing::new([0u8; 80]);
        hkdf(&transcript, shared.as_bytes(), KEY_INFO, okm.as_mut_slice());
        let mut i2r = [0u8; 32];
        let mut r2i = [0u8; 32];
        let mut nonce_salt = [0u8; 16];
        i2r.copy_from_slice(&okm[..32]);
        r2i.copy_from_slice(&okm[32..64]);
        nonce_salt.copy_from_slice(&okm[64..80]);
        let (send_key, recv_key) = match self.role {
            Role::Initiator => (i2r, r2i),
            Role::Responder => (r2i, i2r),
        };

        Ok(HandshakeOutcome {
            role: self.role,
            transcript,
            remote: remote.identity,
            keys: SessionKeys {
                send_key,
                recv_key,
                nonce_salt,
            },
        })
    }

    /// Our identity key.
    #[must_use]
    pub fn identity(&self) -> &DeviceKey {
        self.identity
    }
}

impl HandshakeOutcome {
    /// Claimed remote identity (proven only after [`Self::verify_auth`]).
    #[must_use]
    pub fn remote(&self) -> PeerId {
        self.remote
    }

    /// Our role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Session encryption state.
    #[must_use]
    pub fn session_crypto(&self) -> SessionCrypto {
        SessionCrypto::new(&self.keys)
    }

    /// Short tag both ends agree on, for logs.
    #[must_use]
    pub fn session_tag(&self) -> [u8; 8] {
        self.keys.session_tag()
    }

    /// Our identity proof, to be sent sealed.
    #[must_use]
    pub fn auth_proof(&self, identity: &DeviceKey) -> Vec<u8> {
        identity.sign(&self.signed_message(self.role)).to_vec()
    }

    /// Check the remote's identity proof.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the proof does not match
    /// the claimed identity and transcript.
    pub fn verify_auth(&self, proof: &[u8]) -> Result<PeerId, CryptoError> {
        self.remote
            .verify(&self.signed_message(self.role.peer()), proof)?;
        Ok(self.remote)
    }

    fn signed_message(&self, signer: Role) -> [u8; 33] {
        let mut message = [0u8; 33];
        message[..32].copy_from_slice(&self.transcript);
        message[32] = signer.tag();
        message
    }
}
