//! Error types for the Node API
//!
//! Errors are categorized to drive retry logic and to map onto the
//! synchronization error taxonomy reported through [`crate::node::SyncEvent`].
//!
//! # Error Categories
//!
//! - **Transient**: temporary failures that may succeed on retry (network
//!   timeouts, refused connections, a peer missing a chunk). All but
//!   timeouts are retried with backoff; a timed-out operation is left to
//!   the next discovery round.
//! - Everything else will not succeed without intervention (invalid config,
//!   corrupt database, unknown folder, a peer that fails authentication)
//!
//! # Example
//!
//! ```no_run
//! use tessera_core::node::{ErrorKind, NodeError};
//!
//! fn handle_error(err: &NodeError) {
//!     if err.kind() == ErrorKind::Persistence {
//!         eprintln!("folder is degraded: {err}");
//!     } else if err.should_retry() {
//!         eprintln!("will retry: {err}");
//!     }
//! }
//! ```

use crate::error::{MetaError, SessionError};
use std::borrow::Cow;
use tessera_crypto::FolderId;
use thiserror::Error;

/// Which part of the sync taxonomy an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Content did not hash to its digest
    Integrity,
    /// Metadata could not be read or written; the folder is degraded
    Persistence,
    /// A peer broke the protocol; its session is dropped
    Protocol,
    /// A chunk could not be fetched; retried with backoff
    Transfer,
    /// Local filesystem trouble
    Io,
    /// Rejected configuration
    Config,
}

/// Errors that can occur in Node operations
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    // ============ Transport Errors ============
    /// Failed to bind the listener
    #[error("Transport initialization failed: {0}")]
    TransportInit(Cow<'static, str>),

    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    // ============ Session Errors ============
    /// Handshake or authentication failed
    #[error("Handshake failed: {0}")]
    Handshake(Cow<'static, str>),

    /// Peer violated the wire protocol
    #[error("Protocol error: {0}")]
    Protocol(Cow<'static, str>),

    /// Session limit reached
    #[error("Too many sessions (limit {0})")]
    TooManySessions(usize),

    // ============ Data Errors ============
    /// Content failed digest verification
    #[error("Integrity error: {0}")]
    Integrity(Cow<'static, str>),

    /// Metadata store failure
    #[error("Persistence error: {0}")]
    Persistence(Cow<'static, str>),

    /// Chunk could not be obtained
    #[error("Transfer error: {0}")]
    Transfer(Cow<'static, str>),

    /// Filesystem error
    #[error("File I/O error: {0}")]
    Io(Cow<'static, str>),

    // ============ Folder Errors ============
    /// Folder is not configured on this node
    #[error("Folder not found: {0}")]
    FolderNotFound(FolderId),

    /// Folder already configured
    #[error("Folder already exists: {0}")]
    FolderExists(FolderId),

    // ============ Configuration Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    // ============ Operational Errors ============
    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Background task panicked or was cancelled
    #[error("Task join error: {0}")]
    TaskJoin(Cow<'static, str>),

    /// Channel send/receive error
    #[error("Channel error: {0}")]
    Channel(Cow<'static, str>),
}

impl NodeError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::Timeout(_)
                | NodeError::Transport(_)
                | NodeError::Transfer(_)
                | NodeError::Channel(_)
                | NodeError::TooManySessions(_)
        )
    }

    /// Returns true if this error should trigger a retry with exponential backoff
    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.is_transient() && !matches!(self, NodeError::Timeout(_))
    }

    /// Taxonomy bucket, as reported in error events
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::Integrity(_) => ErrorKind::Integrity,
            NodeError::Persistence(_) => ErrorKind::Persistence,
            NodeError::Handshake(_) | NodeError::Protocol(_) => ErrorKind::Protocol,
            NodeError::Transfer(_)
            | NodeError::Transport(_)
            | NodeError::Timeout(_)
            | NodeError::TooManySessions(_) => ErrorKind::Transfer,
            NodeError::Io(_) | NodeError::TaskJoin(_) | NodeError::Channel(_) => ErrorKind::Io,
            NodeError::TransportInit(_)
            | NodeError::InvalidConfig(_)
            | NodeError::FolderNotFound(_)
            | NodeError::FolderExists(_) => ErrorKind::Config,
        }
    }

    /// Create a transport error with static context (zero allocation)
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        NodeError::Transport(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        NodeError::Timeout(Cow::Borrowed(context))
    }

    /// Create an invalid config error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        NodeError::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create a channel error with static context (zero allocation)
    #[must_use]
    pub const fn channel(context: &'static str) -> Self {
        NodeError::Channel(Cow::Borrowed(context))
    }
}

impl From<MetaError> for NodeError {
    fn from(err: MetaError) -> Self {
        NodeError::Persistence(Cow::Owned(err.to_string()))
    }
}

impl From<SessionError> for NodeError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Handshake(e) => NodeError::Handshake(Cow::Owned(e.to_string())),
            SessionError::Transport(e) => NodeError::Transport(Cow::Owned(e.to_string())),
            SessionError::Timeout => NodeError::timeout("session"),
            other => NodeError::Protocol(Cow::Owned(other.to_string())),
        }
    }
}

impl From<tessera_files::FilesError> for NodeError {
    fn from(err: tessera_files::FilesError) -> Self {
        match err {
            tessera_files::FilesError::Integrity { .. } => {
                NodeError::Integrity(Cow::Owned(err.to_string()))
            }
            tessera_files::FilesError::NotFound(_) => NodeError::Transfer(Cow::Owned(err.to_string())),
            tessera_files::FilesError::IgnorePattern { .. }
            | tessera_files::FilesError::ChunkerConfig(_) => {
                NodeError::InvalidConfig(Cow::Owned(err.to_string()))
            }
            _ => NodeError::Io(Cow::Owned(err.to_string())),
        }
    }
}

impl From<tessera_transport::TransportError> for NodeError {
    fn from(err: tessera_transport::TransportError) -> Self {
        NodeError::Transport(Cow::Owned(err.to_string()))
    }
}

impl From<tessera_crypto::CryptoError> for NodeError {
    fn from(err: tessera_crypto::CryptoError) -> Self {
        NodeError::Handshake(Cow::Owned(err.to_string()))
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(Cow::Owned(err.to_string()))
    }
}

impl From<tokio::task::JoinError> for NodeError {
    fn from(err: tokio::task::JoinError) -> Self {
        NodeError::TaskJoin(Cow::Owned(err.to_string()))
    }
}

/// Result type for Node operations
pub type Result<T> = std::result::Result<T, NodeError>;
