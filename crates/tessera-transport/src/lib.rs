//! # Tessera Transport
//!
//! Network transport layer for the Tessera synchronization protocol.
//!
//! This crate provides:
//! - The [`Transport`] trait over reliable, ordered byte streams
//! - A TCP implementation
//! - Length-prefixed frame I/O with a hard size limit

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod framed;
pub mod tcp;
pub mod transport;

pub use framed::{MAX_FRAME_SIZE, read_frame, write_frame};
pub use tcp::TcpTransport;
pub use transport::{
    AsyncStream, Connection, Transport, TransportError, TransportResult, TransportStats,
};
