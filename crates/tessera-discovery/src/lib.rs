//! # Tessera Discovery
//!
//! Peer discovery layer for the Tessera synchronization protocol.
//!
//! This crate provides:
//! - A per-folder peer table with TTL expiry
//! - LAN discovery through periodic UDP multicast announcements
//! - Static rendezvous peers from configuration
//! - A [`DiscoveryManager`] that runs all of the above as background tasks
//!   and publishes [`DiscoveryEvent`]s
//!
//! ## Example
//!
//! ```rust,no_run
//! use tessera_crypto::{FolderId, PeerId};
//! use tessera_discovery::{DiscoveryConfig, DiscoveryManager};
//!
//! # async fn run() -> Result<(), tessera_discovery::DiscoveryError> {
//! let config = DiscoveryConfig::new(PeerId::from_bytes([1u8; 32]), 22000);
//! let manager = DiscoveryManager::new(config);
//! let mut events = manager.subscribe();
//! manager.start().await?;
//! manager.add_folder(FolderId::from_secret("photos")).await;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod manager;
pub mod multicast;
pub mod peer_table;

pub use manager::{
    DiscoveryConfig, DiscoveryError, DiscoveryEvent, DiscoveryManager, DiscoveryState,
};
pub use multicast::{Announce, DEFAULT_MULTICAST_GROUP, MulticastConfig};
pub use peer_table::{DiscoveredPeer, DiscoverySource, Observation, PeerKey, PeerTable};
