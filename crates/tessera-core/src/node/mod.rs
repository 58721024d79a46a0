//! Node orchestration layer for Tessera
//!
//! This module provides the high-level Node API that ties the components
//! together:
//! - Authenticated sessions (handshake via tessera-crypto)
//! - TCP transport (tessera-transport)
//! - Peer discovery (multicast and static peers via tessera-discovery)
//! - Indexing, chunk storage and materialization (tessera-files)
//! - One sync controller per shared folder
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Node API                          │
//! │    (folders, status, events, static peers, shutdown)    │
//! ├──────────────────────┬──────────────────────────────────┤
//! │  SyncController ×N   │  accept / discovery / redial     │
//! │  (one per folder)    │  loops                           │
//! ├──────────────────────┴──────────────────────────────────┤
//! │  Sessions  │  Scheduler  │  Merge  │  MetaStore          │
//! ├─────────────────────────────────────────────────────────┤
//! │  Crypto    │  Transport  │  Discovery  │  Files          │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tessera_core::node::{FolderConfig, Node, NodeConfig, SyncEvent};
//! use tessera_crypto::{DeviceKey, FolderId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::new("/tmp/tessera");
//!     let node = Node::start(config, DeviceKey::generate(&mut rand::thread_rng())).await?;
//!
//!     let folder = FolderId::from_secret("shared-notes");
//!     node.add_folder(FolderConfig::new(folder, "/tmp/notes")).await?;
//!
//!     let mut events = node.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         if let SyncEvent::FileUpdated { path, .. } = event {
//!             println!("updated {path}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
#[allow(clippy::module_inception)]
pub mod node;
pub mod peer;
pub mod scheduler;

pub(crate) mod controller;
pub(crate) mod session;

pub use config::{DiscoverySettings, FolderConfig, NodeConfig, RetryConfig, TransferConfig};
pub use error::{ErrorKind, NodeError, Result};
pub use events::{ControllerState, FolderStatus, SyncEvent};
pub use node::Node;
pub use peer::PeerPerformance;
pub use scheduler::{SchedulerStats, TransferScheduler};
