//! Transport trait abstraction.
//!
//! Sessions need a reliable, ordered byte stream in each direction. The
//! [`Transport`] trait hides how that stream is obtained so the session layer
//! can run over TCP in production and over anything else in tests.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("transport is closed")]
    Closed,

    /// Address binding failed
    #[error("failed to bind to address: {0}")]
    BindFailed(String),

    /// Connection failed
    #[error("connection to {addr} failed: {reason}")]
    ConnectionFailed {
        /// Remote address
        addr: SocketAddr,
        /// Why
        reason: String,
    },

    /// Operation did not finish in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Frame length prefix exceeds the limit
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Announced size
        size: usize,
        /// Allowed maximum
        max: usize,
    },
}

impl TransportError {
    /// Whether retrying later could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionFailed { .. } | Self::Timeout(_)
        )
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// An established stream plus where it leads.
pub struct Connection {
    /// The byte stream
    pub stream: Box<dyn AsyncStream>,
    /// Remote address
    pub peer_addr: SocketAddr,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// Async stream transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a stream to `addr`.
    ///
    /// # Errors
    /// Returns `TransportError` if the connection cannot be established
    async fn connect(&self, addr: SocketAddr) -> TransportResult<Connection>;

    /// Wait for the next inbound stream.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` after [`Transport::close`]
    async fn accept(&self) -> TransportResult<Connection>;

    /// Get the local address this transport is bound to.
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Stop accepting. Established connections are unaffected.
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Get transport statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Outbound connections established
    pub connections_opened: u64,
    /// Inbound connections accepted
    pub connections_accepted: u64,
    /// Outbound attempts that failed
    pub connect_failures: u64,
}

/// Lock-free counters behind [`TransportStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    opened: AtomicU64,
    accepted: AtomicU64,
    failures: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_open(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            connections_opened: self.opened.load(Ordering::Relaxed),
            connections_accepted: self.accepted.load(Ordering::Relaxed),
            connect_failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
