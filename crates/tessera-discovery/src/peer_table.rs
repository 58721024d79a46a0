//! Live peer set per folder.
//!
//! Multicast peers are keyed by identity and expire when their announcements
//! stop. Static peers are keyed by address (their identity is only learned
//! during the handshake) and never expire.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tessera_crypto::{FolderId, PeerId};

/// Where a peer record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoverySource {
    /// LAN multicast announcement
    Multicast,
    /// Configured rendezvous address
    Static,
}

/// Identity of a table entry within one folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerKey {
    /// Announced identity
    Id(PeerId),
    /// Address only, identity unknown until connected
    Addr(SocketAddr),
}

/// A reachable peer for a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    /// Folder the peer shares
    pub folder_id: FolderId,
    /// Peer identity, when announced
    pub peer_id: Option<PeerId>,
    /// Last known endpoint
    pub addr: SocketAddr,
    /// Discovery source
    pub source: DiscoverySource,
    /// Last time the peer was heard from
    pub last_seen: Instant,
}

impl DiscoveredPeer {
    /// Table key for this peer.
    #[must_use]
    pub fn key(&self) -> PeerKey {
        match self.peer_id {
            Some(id) => PeerKey::Id(id),
            None => PeerKey::Addr(self.addr),
        }
    }
}

/// What [`PeerTable::observe`] did with a sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First sighting
    Joined,
    /// Known peer seen at a different address
    Moved,
    /// Known peer, same address; only the timestamp changed
    Refreshed,
}

/// Peer records for all registered folders.
#[derive(Debug)]
pub struct PeerTable {
    ttl: Duration,
    entries: HashMap<(FolderId, PeerKey), DiscoveredPeer>,
}

impl PeerTable {
    /// Create an empty table whose multicast entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Record a sighting.
    pub fn observe(&mut self, peer: DiscoveredPeer) -> Observation {
        let key = (peer.folder_id, peer.key());
        match self.entries.get_mut(&key) {
            Some(existing) => {
                existing.last_seen = existing.last_seen.max(peer.last_seen);
                if existing.addr == peer.addr {
                    Observation::Refreshed
                } else {
                    existing.addr = peer.addr;
                    Observation::Moved
                }
            }
            None => {
                self.entries.insert(key, peer);
                Observation::Joined
            }
        }
    }

    /// Drop multicast entries not refreshed within the TTL and return them.
    pub fn expire(&mut self, now: Instant) -> Vec<DiscoveredPeer> {
        let ttl = self.ttl;
        let stale: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, p)| {
                p.source == DiscoverySource::Multicast && now.saturating_duration_since(p.last_seen) > ttl
            })
            .map(|(k, _)| *k)
            .collect();
        stale
            .into_iter()
            .filter_map(|k| self.entries.remove(&k))
            .collect()
    }

    /// Forget every peer of `folder_id` and return what was removed.
    pub fn remove_folder(&mut self, folder_id: &FolderId) -> Vec<DiscoveredPeer> {
        let keys: Vec<_> = self
            .entries
            .keys()
            .filter(|(f, _)| f == folder_id)
            .copied()
            .collect();
        keys.into_iter()
            .filter_map(|k| self.entries.remove(&k))
            .collect()
    }

    /// Peers currently known for `folder_id`, most recently seen first.
    #[must_use]
    pub fn peers(&self, folder_id: &FolderId) -> Vec<DiscoveredPeer> {
        let mut peers: Vec<_> = self
            .entries
            .iter()
            .filter(|((f, _), _)| f == folder_id)
            .map(|(_, p)| p.clone())
            .collect();
        peers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        peers
    }

    /// Number of entries across all folders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(n: u8) -> FolderId {
        FolderId::from_bytes([n; 32])
    }

    fn multicast_peer(f: u8, id: u8, port: u16, at: Instant) -> DiscoveredPeer {
        DiscoveredPeer {
            folder_id: folder(f),
            peer_id: Some(PeerId::from_bytes([id; 32])),
            addr: SocketAddr::from(([192, 168, 1, id], port)),
            source: DiscoverySource::Multicast,
            last_seen: at,
        }
    }

    #[test]
    fn test_observe_join_refresh_move() {
        let now = Instant::now();
        let mut table = PeerTable::new(Duration::from_secs(60));
        assert_eq!(table.observe(multicast_peer(1, 2, 22000, now)), Observation::Joined);
        assert_eq!(
            table.observe(multicast_peer(1, 2, 22000, now + Duration::from_secs(1))),
            Observation::Refreshed
        );
        assert_eq!(
            table.observe(multicast_peer(1, 2, 22001, now + Duration::from_secs(2))),
            Observation::Moved
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.peers(&folder(1))[0].addr.port(), 22001);
    }

    #[test]
    fn test_same_peer_distinct_folders() {
        let now = Instant::now();
        let mut table = PeerTable::new(Duration::from_secs(60));
        table.observe(multicast_peer(1, 2, 22000, now));
        table.observe(multicast_peer(3, 2, 22000, now));
        assert_eq!(table.len(), 2);
        assert_eq!(table.peers(&folder(1)).len(), 1);
        assert_eq!(table.remove_folder(&folder(1)).len(), 1);
        assert!(table.peers(&folder(1)).is_empty());
        assert_eq!(table.peers(&folder(3)).len(), 1);
    }

    #[test]
    fn test_expiry_spares_static_peers() {
        let now = Instant::now();
        let mut table = PeerTable::new(Duration::from_secs(10));
        table.observe(multicast_peer(1, 2, 22000, now));
        table.observe(DiscoveredPeer {
            folder_id: folder(1),
            peer_id: None,
            addr: "10.0.0.1:22000".parse().unwrap(),
            source: DiscoverySource::Static,
            last_seen: now,
        });

        assert!(table.expire(now + Duration::from_secs(5)).is_empty());
        let gone = table.expire(now + Duration::from_secs(11));
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].source, DiscoverySource::Multicast);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_refresh_postpones_expiry() {
        let now = Instant::now();
        let mut table = PeerTable::new(Duration::from_secs(10));
        table.observe(multicast_peer(1, 2, 22000, now));
        table.observe(multicast_peer(1, 2, 22000, now + Duration::from_secs(8)));
        assert!(table.expire(now + Duration::from_secs(15)).is_empty());
    }
}
