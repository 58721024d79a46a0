//! Error types for the Tessera core protocol.

use thiserror::Error;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Frame parsing error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Session error
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Metadata store error
    #[error("metadata error: {0}")]
    Meta(#[from] MetaError),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] tessera_crypto::CryptoError),
}

/// Frame-level errors
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame carried no tag byte
    #[error("empty frame")]
    Empty,

    /// Invalid message tag byte
    #[error("invalid message tag: 0x{0:02X}")]
    InvalidTag(u8),

    /// Reserved message tag used
    #[error("reserved message tag used")]
    ReservedTag,

    /// Payload does not decode for its tag
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Session-level errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Invalid state transition
    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidState {
        /// Current state
        from: crate::session::SessionState,
        /// Requested state
        to: crate::session::SessionState,
    },

    /// Handshake rejected or failed
    #[error("handshake failed: {0}")]
    Handshake(#[from] tessera_crypto::CryptoError),

    /// No folder with the requested id is shared here
    #[error("unknown folder {0}")]
    UnknownFolder(String),

    /// Peer broke the protocol
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Underlying stream failed
    #[error("transport error: {0}")]
    Transport(#[from] tessera_transport::TransportError),

    /// No traffic within the allowed time
    #[error("session timed out")]
    Timeout,

    /// Connection closed by peer
    #[error("connection closed: {0}")]
    Closed(String),
}

impl From<FrameError> for SessionError {
    fn from(err: FrameError) -> Self {
        SessionError::Protocol(err.to_string())
    }
}

/// Metadata store errors
#[derive(Debug, Error)]
pub enum MetaError {
    /// SQLite failure
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Stored row does not decode
    #[error("corrupt record {key}: {reason}")]
    Corrupt {
        /// Row key
        key: String,
        /// Decoder message
        reason: String,
    },

    /// Database belongs to another folder
    #[error("database belongs to folder {found}, expected {expected}")]
    FolderMismatch {
        /// Folder the caller opened
        expected: String,
        /// Folder recorded in the file
        found: String,
    },

    /// Filesystem failure around the database file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
