//! Message encoding for the Tessera wire protocol.
//!
//! After the handshake every frame on the wire is the AEAD ciphertext of
//! `tag || payload`, where `tag` is a [`MessageTag`] byte and `payload` is
//! the bincode encoding of the message body. The length prefix and sealing
//! happen in the session layer; this module only maps between [`Message`]
//! values and plaintext bytes.

use crate::error::FrameError;
use crate::state::Entry;
use crate::vector::VersionVector;
use serde::{Deserialize, Serialize};
use tessera_crypto::Digest;
use tessera_crypto::aead::TAG_SIZE;
use tessera_transport::MAX_FRAME_SIZE;

/// Largest number of entries sent in one metadata announcement.
pub const MAX_ENTRIES_PER_ANNOUNCE: usize = 1000;

/// Largest number of digests sent in one `Have` message.
pub const MAX_DIGESTS_PER_HAVE: usize = 4096;

/// Largest plaintext (`tag || payload`) that still fits one frame once sealed.
pub const MAX_MESSAGE_SIZE: usize = MAX_FRAME_SIZE - TAG_SIZE;

// Tag byte plus the bincode length prefix of the entry list.
const ANNOUNCE_OVERHEAD: u64 = 1 + 8;

/// Message tag bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTag {
    /// Reserved (invalid)
    Reserved = 0x00,
    /// Folder entries and vector
    MetadataAnnounce = 0x01,
    /// Ask for a chunk by digest
    ChunkRequest = 0x02,
    /// Chunk bytes, or a miss
    ChunkResponse = 0x03,
    /// Keepalive / RTT measurement
    Ping = 0x04,
    /// Reply to PING
    Pong = 0x05,
    /// Chunks the sender can serve
    Have = 0x06,
    /// Session termination
    Close = 0x07,
}

impl TryFrom<u8> for MessageTag {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Err(FrameError::ReservedTag),
            0x01 => Ok(Self::MetadataAnnounce),
            0x02 => Ok(Self::ChunkRequest),
            0x03 => Ok(Self::ChunkResponse),
            0x04 => Ok(Self::Ping),
            0x05 => Ok(Self::Pong),
            0x06 => Ok(Self::Have),
            0x07 => Ok(Self::Close),
            0x08..=0x0F => Err(FrameError::ReservedTag),
            _ => Err(FrameError::InvalidTag(value)),
        }
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Some or all of the sender's entries for the session folder, plus its
    /// folder vector.
    MetadataAnnounce {
        /// Sender's folder vector
        vector: VersionVector,
        /// Entries, at most [`MAX_ENTRIES_PER_ANNOUNCE`]
        entries: Vec<Entry>,
    },
    /// Request for one chunk
    ChunkRequest {
        /// Correlates the response
        id: u64,
        /// Wanted chunk
        digest: Digest,
    },
    /// Answer to a [`Message::ChunkRequest`]
    ChunkResponse {
        /// Request id being answered
        id: u64,
        /// Requested chunk
        digest: Digest,
        /// Chunk bytes, `None` when the sender cannot serve it
        data: Option<Vec<u8>>,
    },
    /// Keepalive
    Ping {
        /// Echoed in the pong
        nonce: u64,
    },
    /// Keepalive reply
    Pong {
        /// Nonce of the ping
        nonce: u64,
    },
    /// Chunks the sender holds and will serve
    Have {
        /// Available digests
        digests: Vec<Digest>,
    },
    /// Graceful close
    Close {
        /// Human-readable reason
        reason: String,
    },
}

#[derive(Serialize, Deserialize)]
struct AnnounceBody {
    vector: VersionVector,
    entries: Vec<Entry>,
}

#[derive(Serialize, Deserialize)]
struct ResponseBody {
    id: u64,
    digest: Digest,
    data: Option<Vec<u8>>,
}

impl Message {
    /// Tag byte of this message.
    #[must_use]
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::MetadataAnnounce { .. } => MessageTag::MetadataAnnounce,
            Message::ChunkRequest { .. } => MessageTag::ChunkRequest,
            Message::ChunkResponse { .. } => MessageTag::ChunkResponse,
            Message::Ping { .. } => MessageTag::Ping,
            Message::Pong { .. } => MessageTag::Pong,
            Message::Have { .. } => MessageTag::Have,
            Message::Close { .. } => MessageTag::Close,
        }
    }

    /// Encode to plaintext bytes (`tag || payload`).
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Malformed`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let payload = match self {
            Message::MetadataAnnounce { vector, entries } => bincode::serialize(&AnnounceBody {
                vector: vector.clone(),
                entries: entries.clone(),
            }),
            Message::ChunkRequest { id, digest } => bincode::serialize(&(id, digest)),
            Message::ChunkResponse { id, digest, data } => bincode::serialize(&ResponseBody {
                id: *id,
                digest: *digest,
                data: data.clone(),
            }),
            Message::Ping { nonce } | Message::Pong { nonce } => bincode::serialize(nonce),
            Message::Have { digests } => bincode::serialize(digests),
            Message::Close { reason } => bincode::serialize(reason),
        }
        .map_err(|e| FrameError::Malformed(e.to_string()))?;

        let mut buf = Vec::with_capacity(1 + payload.len());
        buf.push(self.tag() as u8);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode plaintext bytes.
    ///
    /// # Errors
    ///
    /// - [`FrameError::Empty`] for a zero-length buffer
    /// - [`FrameError::InvalidTag`]/[`FrameError::ReservedTag`] for bad tags
    /// - [`FrameError::Malformed`] if the payload does not decode
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (&tag, payload) = bytes.split_first().ok_or(FrameError::Empty)?;
        let tag = MessageTag::try_from(tag)?;
        let malformed = |e: bincode::Error| FrameError::Malformed(format!("{tag:?}: {e}"));

        let message = match tag {
            MessageTag::Reserved => return Err(FrameError::ReservedTag),
            MessageTag::MetadataAnnounce => {
                let body: AnnounceBody = bincode::deserialize(payload).map_err(malformed)?;
                Message::MetadataAnnounce {
                    vector: body.vector,
                    entries: body.entries,
                }
            }
            MessageTag::ChunkRequest => {
                let (id, digest) = bincode::deserialize(payload).map_err(malformed)?;
                Message::ChunkRequest { id, digest }
            }
            MessageTag::ChunkResponse => {
                let body: ResponseBody = bincode::deserialize(payload).map_err(malformed)?;
                Message::ChunkResponse {
                    id: body.id,
                    digest: body.digest,
                    data: body.data,
                }
            }
            MessageTag::Ping => Message::Ping {
                nonce: bincode::deserialize(payload).map_err(malformed)?,
            },
            MessageTag::Pong => Message::Pong {
                nonce: bincode::deserialize(payload).map_err(malformed)?,
            },
            MessageTag::Have => Message::Have {
                digests: bincode::deserialize(payload).map_err(malformed)?,
            },
            MessageTag::Close => Message::Close {
                reason: bincode::deserialize(payload).map_err(malformed)?,
            },
        };
        Ok(message)
    }

    /// Split a full folder snapshot into announcements that each hold at
    /// most [`MAX_ENTRIES_PER_ANNOUNCE`] entries and encode to at most
    /// [`MAX_MESSAGE_SIZE`] bytes. An entry too large to fit any
    /// announcement on its own is left out with a warning. An empty folder
    /// still yields one announcement carrying the vector.
    #[must_use]
    pub fn announce_batches<'a, I>(vector: &VersionVector, entries: I) -> Vec<Message>
    where
        I: IntoIterator<Item = &'a Entry>,
    {
        Self::announce_batches_within(vector, entries, MAX_MESSAGE_SIZE as u64)
    }

    fn announce_batches_within<'a, I>(vector: &VersionVector, entries: I, limit: u64) -> Vec<Message>
    where
        I: IntoIterator<Item = &'a Entry>,
    {
        let base = ANNOUNCE_OVERHEAD.saturating_add(encoded_size(vector));
        let mut batches = Vec::new();
        let mut current = Vec::new();
        let mut size = base;
        for entry in entries {
            let entry_size = encoded_size(entry);
            if base.saturating_add(entry_size) > limit {
                tracing::warn!(
                    "not announcing {}: entry of {} bytes exceeds the frame limit",
                    entry.path,
                    entry_size
                );
                continue;
            }
            if current.len() == MAX_ENTRIES_PER_ANNOUNCE || size.saturating_add(entry_size) > limit {
                batches.push(Message::MetadataAnnounce {
                    vector: vector.clone(),
                    entries: std::mem::take(&mut current),
                });
                size = base;
            }
            current.push(entry.clone());
            size = size.saturating_add(entry_size);
        }
        if !current.is_empty() || batches.is_empty() {
            batches.push(Message::MetadataAnnounce {
                vector: vector.clone(),
                entries: current,
            });
        }
        batches
    }

    /// Split a digest list into `Have` messages of bounded size.
    #[must_use]
    pub fn have_batches(digests: Vec<Digest>) -> Vec<Message> {
        digests
            .chunks(MAX_DIGESTS_PER_HAVE)
            .map(|chunk| Message::Have {
                digests: chunk.to_vec(),
            })
            .collect()
    }
}

fn encoded_size<T: Serialize>(value: &T) -> u64 {
    bincode::serialized_size(value).unwrap_or(u64::MAX)
}
