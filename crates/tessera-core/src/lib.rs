//! # Tessera Core
//!
//! Synchronization engine for Tessera, a peer-to-peer folder sync system.
//!
//! This crate provides:
//! - Version vectors and the per-path merge engine
//! - Durable folder metadata (SQLite)
//! - Wire message encoding
//! - Session state machine
//! - The [`node::Node`] orchestrator that runs everything
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Folder state                           │
//! │      (entries per path, version vectors, conflict copies)       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                            Sessions                             │
//! │   (authenticated, encrypted channel to one peer per folder)     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                            Messages                             │
//! │        (announce, have, chunk request/response, ping)           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod merge;
pub mod meta_store;
pub mod node;
pub mod session;
pub mod state;
pub mod vector;

pub use error::{Error, FrameError, MetaError, SessionError};
pub use frame::{MAX_DIGESTS_PER_HAVE, MAX_ENTRIES_PER_ANNOUNCE, MAX_MESSAGE_SIZE, Message, MessageTag};
pub use merge::{ConflictCopy, MergeEngine, MergeOutcome, Resolution, TieBreak, conflict_path};
pub use meta_store::MetaStore;
pub use node::{Node, NodeConfig, NodeError, SyncEvent};
pub use session::{Session, SessionConfig, SessionState, SessionStats};
pub use state::{Entry, EntryKind, FolderState, LocalChange, Version};
pub use vector::{Causality, VersionVector};
