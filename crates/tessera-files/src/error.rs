//! File engine errors.

use std::path::PathBuf;
use tessera_crypto::Digest;
use thiserror::Error;

/// Errors from chunking, storage, indexing and materialization.
#[derive(Debug, Error)]
pub enum FilesError {
    /// I/O failure on a specific path
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Stored or received bytes do not hash to the expected digest
    #[error("integrity error: expected {expected}, got {actual}")]
    Integrity {
        /// Digest the content should have
        expected: Digest,
        /// Digest the content actually has
        actual: Digest,
    },

    /// Chunk is not in the store
    #[error("chunk not found: {0}")]
    NotFound(Digest),

    /// Path escapes the folder root or is otherwise unusable
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Ignore pattern could not be compiled
    #[error("invalid ignore pattern {pattern}: {reason}")]
    IgnorePattern {
        /// Offending pattern
        pattern: String,
        /// Why it was rejected
        reason: String,
    },

    /// Chunker configuration is inconsistent
    #[error("invalid chunker config: {0}")]
    ChunkerConfig(&'static str),

    /// Filesystem watcher failure
    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),
}

impl FilesError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this is a missing-file condition (races with deletion).
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            Self::NotFound(_) => true,
            _ => false,
        }
    }
}

/// Result type for file engine operations.
pub type Result<T> = std::result::Result<T, FilesError>;

/// Attach a path to `io::Result` errors.
pub(crate) trait IoContext<T> {
    fn at(self, path: &std::path::Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| FilesError::io(path, e))
    }
}
