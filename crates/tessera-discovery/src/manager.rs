//! Discovery Manager
//!
//! Runs the discovery sources as background tasks and keeps the shared peer
//! table current:
//!
//! 1. Multicast announcer: one datagram per registered folder per interval
//! 2. Multicast listener: sightings from other nodes on the LAN
//! 3. Static refresher: re-publishes configured rendezvous peers so callers
//!    can redial them after a disconnect
//! 4. Sweeper: expires multicast peers that went quiet
//!
//! Consumers follow changes through [`DiscoveryManager::subscribe`].

use crate::multicast::{self, Announce, MAX_ANNOUNCE_SIZE, MulticastConfig};
use crate::peer_table::{DiscoveredPeer, DiscoverySource, Observation, PeerTable};
use std::collections::BTreeSet;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_crypto::{FolderId, PeerId};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;

/// Discovery manager errors
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Multicast socket could not be set up
    #[error("multicast socket error: {0}")]
    Socket(#[from] io::Error),

    /// Malformed or foreign announcement
    #[error("invalid announcement: {0}")]
    Codec(String),

    /// `start` called while already running
    #[error("discovery is already running")]
    AlreadyRunning,
}

/// Discovery manager configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Our identity, used to drop our own announcements
    pub local_peer: PeerId,
    /// TCP port advertised to other nodes
    pub listen_port: u16,
    /// Multicast settings; `None` disables LAN discovery
    pub multicast: Option<MulticastConfig>,
    /// Rendezvous addresses tried for every folder
    pub static_peers: Vec<SocketAddr>,
    /// How often static peers are re-published
    pub static_interval: Duration,
    /// How long a multicast peer survives without a new announcement
    pub peer_ttl: Duration,
    /// How often expired peers are swept
    pub sweep_interval: Duration,
}

impl DiscoveryConfig {
    /// Create configuration with multicast enabled and default timings
    #[must_use]
    pub fn new(local_peer: PeerId, listen_port: u16) -> Self {
        Self {
            local_peer,
            listen_port,
            multicast: Some(MulticastConfig::default()),
            static_peers: Vec::new(),
            static_interval: Duration::from_secs(60),
            peer_ttl: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(10),
        }
    }

    /// Add a static rendezvous peer
    pub fn add_static_peer(&mut self, addr: SocketAddr) {
        if !self.static_peers.contains(&addr) {
            self.static_peers.push(addr);
        }
    }

    /// Turn LAN discovery off
    #[must_use]
    pub fn without_multicast(mut self) -> Self {
        self.multicast = None;
        self
    }
}

/// Change in the set of reachable peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A peer became reachable, moved, or a static peer was re-published
    PeerJoined(DiscoveredPeer),
    /// A peer expired or its folder was unregistered
    PeerLeft(DiscoveredPeer),
}

/// Discovery manager state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Not started
    Stopped,
    /// Binding sockets and spawning tasks
    Starting,
    /// Background tasks running
    Running,
    /// Shutting down
    Stopping,
}

struct Shared {
    local_peer: PeerId,
    listen_port: u16,
    static_peers: RwLock<Vec<SocketAddr>>,
    table: RwLock<PeerTable>,
    folders: RwLock<BTreeSet<FolderId>>,
    events: broadcast::Sender<DiscoveryEvent>,
    announce_now: Notify,
}

impl Shared {
    async fn observe(&self, peer: DiscoveredPeer) {
        if !self.folders.read().await.contains(&peer.folder_id) {
            return;
        }
        let observation = self.table.write().await.observe(peer.clone());
        match observation {
            Observation::Joined | Observation::Moved => {
                tracing::debug!(
                    "peer {} for folder {} at {} ({:?})",
                    peer.peer_id.map_or_else(|| "?".to_string(), |p| p.short()),
                    peer.folder_id.short(),
                    peer.addr,
                    observation
                );
                let _ = self.events.send(DiscoveryEvent::PeerJoined(peer));
            }
            Observation::Refreshed => {}
        }
    }

    fn static_peer(folder_id: FolderId, addr: SocketAddr) -> DiscoveredPeer {
        DiscoveredPeer {
            folder_id,
            peer_id: None,
            addr,
            source: DiscoverySource::Static,
            last_seen: Instant::now(),
        }
    }

    async fn republish_static(&self) {
        let folders: Vec<_> = self.folders.read().await.iter().copied().collect();
        let statics = self.static_peers.read().await.clone();
        for folder_id in folders {
            for addr in &statics {
                let peer = Self::static_peer(folder_id, *addr);
                self.table.write().await.observe(peer.clone());
                let _ = self.events.send(DiscoveryEvent::PeerJoined(peer));
            }
        }
    }

    async fn sweep(&self) {
        let expired = self.table.write().await.expire(Instant::now());
        for peer in expired {
            tracing::debug!("peer at {} expired for folder {}", peer.addr, peer.folder_id.short());
            let _ = self.events.send(DiscoveryEvent::PeerLeft(peer));
        }
    }
}

/// Discovery manager
pub struct DiscoveryManager {
    config: DiscoveryConfig,
    shared: Arc<Shared>,
    state: Arc<RwLock<DiscoveryState>>,
    cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryManager {
    /// Create a stopped manager
    #[must_use]
    pub fn new(config: DiscoveryConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            local_peer: config.local_peer,
            listen_port: config.listen_port,
            static_peers: RwLock::new(config.static_peers.clone()),
            table: RwLock::new(PeerTable::new(config.peer_ttl)),
            folders: RwLock::new(BTreeSet::new()),
            events,
            announce_now: Notify::new(),
        });
        Self {
            config,
            shared,
            state: Arc::new(RwLock::new(DiscoveryState::Stopped)),
            cancel: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the background tasks.
    ///
    /// A multicast socket that cannot be opened is logged and LAN discovery
    /// is skipped; static peers keep working.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::AlreadyRunning`] if already started.
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        {
            let mut state = self.state.write().await;
            if *state != DiscoveryState::Stopped {
                return Err(DiscoveryError::AlreadyRunning);
            }
            *state = DiscoveryState::Starting;
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock().await = cancel.clone();
        let mut tasks = self.tasks.lock().await;

        if let Some(mc) = &self.config.multicast {
            match multicast::bind(mc) {
                Ok(socket) => {
                    tracing::info!("multicast discovery on {}", mc.group);
                    let socket = Arc::new(socket);
                    tasks.push(tokio::spawn(announce_loop(
                        self.shared.clone(),
                        socket.clone(),
                        mc.group,
                        mc.interval,
                        cancel.clone(),
                    )));
                    tasks.push(tokio::spawn(listen_loop(
                        self.shared.clone(),
                        socket,
                        cancel.clone(),
                    )));
                }
                Err(e) => {
                    tracing::warn!("multicast discovery unavailable: {}", e);
                }
            }
        }

        tasks.push(tokio::spawn(maintenance_loop(
            self.shared.clone(),
            self.config.static_interval,
            self.config.sweep_interval,
            cancel,
        )));

        *self.state.write().await = DiscoveryState::Running;
        Ok(())
    }

    /// Start tracking a folder. Static peers are published for it at once
    /// and the next multicast announcement is sent immediately.
    pub async fn add_folder(&self, folder_id: FolderId) {
        if !self.shared.folders.write().await.insert(folder_id) {
            return;
        }
        tracing::debug!("discovery tracking folder {}", folder_id.short());
        let statics = self.shared.static_peers.read().await.clone();
        for addr in statics {
            self.shared
                .observe(Shared::static_peer(folder_id, addr))
                .await;
        }
        self.shared.announce_now.notify_one();
    }

    /// Stop tracking a folder; its peers are reported as left.
    pub async fn remove_folder(&self, folder_id: &FolderId) {
        if !self.shared.folders.write().await.remove(folder_id) {
            return;
        }
        let removed = self.shared.table.write().await.remove_folder(folder_id);
        for peer in removed {
            let _ = self.shared.events.send(DiscoveryEvent::PeerLeft(peer));
        }
    }

    /// Add a rendezvous address at runtime and publish it for every folder.
    pub async fn add_static_peer(&self, addr: SocketAddr) {
        {
            let mut statics = self.shared.static_peers.write().await;
            if statics.contains(&addr) {
                return;
            }
            statics.push(addr);
        }
        let folders: Vec<_> = self.shared.folders.read().await.iter().copied().collect();
        for folder_id in folders {
            self.shared
                .observe(Shared::static_peer(folder_id, addr))
                .await;
        }
    }

    /// Feed a sighting from outside the built-in sources.
    pub async fn observe(&self, peer: DiscoveredPeer) {
        self.shared.observe(peer).await;
    }

    /// Subscribe to peer changes
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.shared.events.subscribe()
    }

    /// Peers currently known for a folder
    pub async fn peers(&self, folder_id: &FolderId) -> Vec<DiscoveredPeer> {
        self.shared.table.read().await.peers(folder_id)
    }

    /// Shutdown the discovery manager and wait for its tasks
    pub async fn shutdown(&self) {
        *self.state.write().await = DiscoveryState::Stopping;
        self.cancel.lock().await.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        *self.state.write().await = DiscoveryState::Stopped;
    }

    /// Get current manager state
    pub async fn state(&self) -> DiscoveryState {
        *self.state.read().await
    }

    /// Our identity
    #[must_use]
    pub fn local_peer(&self) -> PeerId {
        self.config.local_peer
    }
}

async fn announce_loop(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    group: SocketAddrV4,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            () = shared.announce_now.notified() => {}
        }
        let folders: Vec<_> = shared.folders.read().await.iter().copied().collect();
        for folder_id in folders {
            let bytes = match Announce::new(folder_id, shared.local_peer, shared.listen_port)
                .to_bytes()
            {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("cannot encode announcement: {}", e);
                    continue;
                }
            };
            if let Err(e) = socket.send_to(&bytes, SocketAddr::V4(group)).await {
                tracing::debug!("multicast send failed: {}", e);
            }
        }
    }
}

async fn listen_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    let mut buf = [0u8; MAX_ANNOUNCE_SIZE];
    loop {
        let (len, source) = tokio::select! {
            () = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    tracing::debug!("multicast receive failed: {}", e);
                    continue;
                }
            },
        };
        if let Some((announce, addr)) = multicast::interpret(&buf[..len], source, &shared.local_peer)
        {
            shared
                .observe(DiscoveredPeer {
                    folder_id: announce.folder_id,
                    peer_id: Some(announce.peer_id),
                    addr,
                    source: DiscoverySource::Multicast,
                    last_seen: Instant::now(),
                })
                .await;
        }
    }
}

async fn maintenance_loop(
    shared: Arc<Shared>,
    static_interval: Duration,
    sweep_interval: Duration,
    cancel: CancellationToken,
) {
    let mut statics = tokio::time::interval(static_interval);
    let mut sweeps = tokio::time::interval(sweep_interval);
    // Both intervals fire immediately; static peers were just published by
    // add_folder, so skip the first round.
    statics.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = statics.tick() => shared.republish_static().await,
            _ = sweeps.tick() => shared.sweep().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DiscoveryConfig {
        DiscoveryConfig::new(PeerId::from_bytes([1u8; 32]), 22000).without_multicast()
    }

    fn sighting(folder_id: FolderId, id: u8) -> DiscoveredPeer {
        DiscoveredPeer {
            folder_id,
            peer_id: Some(PeerId::from_bytes([id; 32])),
            addr: SocketAddr::from(([127, 0, 0, 1], 22000 + u16::from(id))),
            source: DiscoverySource::Multicast,
            last_seen: Instant::now(),
        }
    }

    #[test]
    fn test_discovery_config_builders() {
        let mut config = DiscoveryConfig::new(PeerId::from_bytes([1u8; 32]), 22000);
        assert!(config.multicast.is_some());
        config.add_static_peer("10.0.0.1:22000".parse().unwrap());
        config.add_static_peer("10.0.0.1:22000".parse().unwrap());
        assert_eq!(config.static_peers.len(), 1);
        assert!(config.without_multicast().multicast.is_none());
    }

    #[tokio::test]
    async fn test_discovery_manager_state_transitions() {
        let manager = DiscoveryManager::new(config());
        assert_eq!(manager.state().await, DiscoveryState::Stopped);
        manager.start().await.unwrap();
        assert_eq!(manager.state().await, DiscoveryState::Running);
        assert!(matches!(
            manager.start().await,
            Err(DiscoveryError::AlreadyRunning)
        ));
        manager.shutdown().await;
        assert_eq!(manager.state().await, DiscoveryState::Stopped);
        manager.start().await.unwrap();
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_static_peers_published_on_add_folder() {
        let mut config = config();
        config.add_static_peer("10.0.0.1:22000".parse().unwrap());
        let manager = DiscoveryManager::new(config);
        let mut events = manager.subscribe();
        let folder = FolderId::from_bytes([7u8; 32]);
        manager.add_folder(folder).await;

        match events.recv().await.unwrap() {
            DiscoveryEvent::PeerJoined(peer) => {
                assert_eq!(peer.folder_id, folder);
                assert_eq!(peer.source, DiscoverySource::Static);
                assert!(peer.peer_id.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(manager.peers(&folder).await.len(), 1);
    }

    #[tokio::test]
    async fn test_sightings_for_unknown_folders_ignored() {
        let manager = DiscoveryManager::new(config());
        let mut events = manager.subscribe();
        let known = FolderId::from_bytes([7u8; 32]);
        let unknown = FolderId::from_bytes([8u8; 32]);
        manager.add_folder(known).await;

        manager.observe(sighting(unknown, 2)).await;
        manager.observe(sighting(known, 3)).await;
        manager.observe(sighting(known, 3)).await;

        match events.recv().await.unwrap() {
            DiscoveryEvent::PeerJoined(peer) => assert_eq!(peer.folder_id, known),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.try_recv().is_err());
        assert!(manager.peers(&unknown).await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_folder_reports_left() {
        let manager = DiscoveryManager::new(config());
        let folder = FolderId::from_bytes([7u8; 32]);
        manager.add_folder(folder).await;
        manager.observe(sighting(folder, 2)).await;
        let mut events = manager.subscribe();
        manager.remove_folder(&folder).await;
        assert!(matches!(
            events.recv().await.unwrap(),
            DiscoveryEvent::PeerLeft(_)
        ));
        assert!(manager.peers(&folder).await.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_expires_quiet_peers() {
        let mut config = config();
        config.peer_ttl = Duration::from_millis(50);
        config.sweep_interval = Duration::from_millis(20);
        let manager = DiscoveryManager::new(config);
        let folder = FolderId::from_bytes([7u8; 32]);
        manager.add_folder(folder).await;
        let mut events = manager.subscribe();
        manager.start().await.unwrap();
        manager.observe(sighting(folder, 2)).await;

        let left = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(DiscoveryEvent::PeerLeft(peer)) = events.recv().await {
                    return peer;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(left.peer_id, Some(PeerId::from_bytes([2u8; 32])));
        manager.shutdown().await;
    }
}
