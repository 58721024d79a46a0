//! Node implementation - top-level synchronization orchestrator
//!
//! A [`Node`] owns the device identity, the shared chunk store, the TCP
//! listener and the discovery manager, and runs one
//! [`SyncController`](super::controller) per shared folder. Background tasks
//! accept inbound sessions, dial peers reported by discovery, and redial
//! peers whose sessions dropped.
//!
//! # Example
//!
//! ```no_run
//! use tessera_core::node::{FolderConfig, Node, NodeConfig};
//! use tessera_crypto::{DeviceKey, FolderId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = NodeConfig::new("/var/lib/tessera");
//!     config
//!         .folders
//!         .push(FolderConfig::new(FolderId::from_secret("photos"), "/home/me/Photos"));
//!     let identity = DeviceKey::load_or_generate(&config.identity_file)?;
//!
//!     let node = Node::start(config, identity).await?;
//!     let mut events = node.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

use crate::meta_store::MetaStore;
use crate::node::config::{FolderConfig, NodeConfig, RetryConfig};
use crate::node::controller::{self, Command, ControllerParams, FolderHandle, Redial};
use crate::node::error::{NodeError, Result};
use crate::node::events::{FolderStatus, SyncEvent};
use crate::node::session;
use crate::state::FolderState;
use dashmap::DashMap;
use std::borrow::Cow;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tessera_crypto::{DeviceKey, FolderId, PeerId, TrustPolicy};
use tessera_discovery::{
    DiscoveredPeer, DiscoveryConfig, DiscoveryEvent, DiscoveryManager, DiscoverySource,
};
use tessera_files::ChunkStore;
use tessera_transport::{Connection, TcpTransport, Transport, TransportError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, Semaphore, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 1024;

/// Inner node state (shared across clones)
struct NodeInner {
    config: NodeConfig,
    identity: DeviceKey,
    store: Arc<ChunkStore>,
    transport: TcpTransport,
    listen_addr: SocketAddr,
    discovery: DiscoveryManager,
    folders: DashMap<FolderId, FolderHandle>,
    /// One permit per open session
    sessions: Arc<Semaphore>,
    events: broadcast::Sender<SyncEvent>,
    redial: mpsc::UnboundedSender<Redial>,
    /// Dial loops currently running
    dialing: DashMap<(FolderId, SocketAddr), ()>,
    /// Identities learned by dialing an address
    known_addrs: DashMap<SocketAddr, PeerId>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Tessera node
///
/// Cheap to clone; all clones drive the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Bind the listener, start discovery and every configured folder.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidConfig`] for a rejected configuration,
    /// [`NodeError::TransportInit`] if the listener cannot be bound, and the
    /// errors of [`Node::add_folder`] for the configured folders.
    pub async fn start(config: NodeConfig, identity: DeviceKey) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        let store = Arc::new(ChunkStore::open(config.chunk_dir())?);

        let transport = TcpTransport::bind(config.listen_addr)
            .await
            .map_err(|e| NodeError::TransportInit(Cow::Owned(e.to_string())))?;
        let listen_addr = transport.local_addr()?;

        let local = identity.peer_id();
        let mut discovery_config = DiscoveryConfig::new(local, listen_addr.port());
        discovery_config.multicast = config.discovery.multicast_config();
        discovery_config.static_interval = config.discovery.static_interval;
        discovery_config.peer_ttl = config.discovery.peer_ttl;
        for addr in &config.discovery.static_peers {
            discovery_config.add_static_peer(*addr);
        }
        let discovery = DiscoveryManager::new(discovery_config);
        let discovered = discovery.subscribe();

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (redial, redial_rx) = mpsc::unbounded_channel();
        let folders = config.folders.clone();

        let inner = Arc::new(NodeInner {
            sessions: Arc::new(Semaphore::new(config.session.max_sessions)),
            config,
            identity,
            store,
            transport,
            listen_addr,
            discovery,
            folders: DashMap::new(),
            events,
            redial,
            dialing: DashMap::new(),
            known_addrs: DashMap::new(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        inner
            .discovery
            .start()
            .await
            .map_err(|e| NodeError::TransportInit(Cow::Owned(e.to_string())))?;

        {
            let mut tasks = inner.tasks.lock().await;
            tasks.push(tokio::spawn(accept_loop(Arc::clone(&inner))));
            tasks.push(tokio::spawn(discovery_loop(Arc::clone(&inner), discovered)));
            tasks.push(tokio::spawn(redial_loop(Arc::clone(&inner), redial_rx)));
        }

        let node = Self { inner };
        tracing::info!(
            "node {} listening on {}",
            node.peer_id().short(),
            node.listen_addr()
        );
        for folder in folders {
            node.add_folder(folder).await?;
        }
        Ok(node)
    }

    /// Our identity
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.inner.identity.peer_id()
    }

    /// Address the listener is bound to
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        self.inner.listen_addr
    }

    /// Subscribe to synchronization events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Share a folder: open its metadata, start its controller, and announce
    /// it to discovery.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::FolderExists`] if the folder is already shared,
    /// [`NodeError::Persistence`] if its database cannot be opened, and
    /// [`NodeError::InvalidConfig`] for a rejected folder configuration.
    pub async fn add_folder(&self, folder: FolderConfig) -> Result<()> {
        folder.validate()?;
        let folder_id = folder.id;
        if self.inner.folders.contains_key(&folder_id) {
            return Err(NodeError::FolderExists(folder_id));
        }

        let db = self.inner.config.folder_db(&folder_id);
        let local = self.peer_id();
        let meta = tokio::task::spawn_blocking(move || MetaStore::open(&db, folder_id, local))
            .await??;

        let handle = controller::spawn(ControllerParams {
            folder,
            local,
            meta,
            store: Arc::clone(&self.inner.store),
            chunker: self.inner.config.chunker.clone(),
            transfer: self.inner.config.transfer.clone(),
            session: self.inner.config.session.clone(),
            events: self.inner.events.clone(),
            redial: self.inner.redial.clone(),
            cancel: self.inner.cancel.child_token(),
        })?;

        match self.inner.folders.entry(folder_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                handle.cancel.cancel();
                return Err(NodeError::FolderExists(folder_id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle);
            }
        }
        self.inner.discovery.add_folder(folder_id).await;
        tracing::info!("sharing folder {}", folder_id.short());
        Ok(())
    }

    /// Stop sharing a folder, delete its metadata, and drop chunks no other
    /// folder references.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::FolderNotFound`] for an unknown folder and
    /// [`NodeError::Persistence`] if the database cannot be removed.
    pub async fn remove_folder(&self, folder_id: &FolderId) -> Result<()> {
        let (_, handle) = self
            .inner
            .folders
            .remove(folder_id)
            .ok_or(NodeError::FolderNotFound(*folder_id))?;
        self.inner.discovery.remove_folder(folder_id).await;

        handle.cancel.cancel();
        let meta = handle.task.await?;
        tokio::task::spawn_blocking(move || meta.purge()).await??;

        let live: HashSet<_> = self
            .inner
            .folders
            .iter()
            .flat_map(|f| f.snapshot.borrow().referenced_digests())
            .collect();
        let store = Arc::clone(&self.inner.store);
        let stats = tokio::task::spawn_blocking(move || store.gc(&live)).await??;
        tracing::info!(
            "removed folder {}; reclaimed {} chunks ({} bytes)",
            folder_id.short(),
            stats.removed,
            stats.bytes_freed
        );
        Ok(())
    }

    /// Folders currently shared
    #[must_use]
    pub fn folders(&self) -> Vec<FolderId> {
        self.inner.folders.iter().map(|f| *f.key()).collect()
    }

    /// Current status of a folder
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::FolderNotFound`] for an unknown folder.
    pub fn folder_status(&self, folder_id: &FolderId) -> Result<FolderStatus> {
        self.inner
            .folders
            .get(folder_id)
            .map(|f| f.status.borrow().clone())
            .ok_or(NodeError::FolderNotFound(*folder_id))
    }

    /// Read-only snapshot of a folder's recorded state
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::FolderNotFound`] for an unknown folder.
    pub fn folder_state(&self, folder_id: &FolderId) -> Result<Arc<FolderState>> {
        self.inner
            .folders
            .get(folder_id)
            .map(|f| Arc::clone(&f.snapshot.borrow()))
            .ok_or(NodeError::FolderNotFound(*folder_id))
    }

    /// Peers with an active session for a folder
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::FolderNotFound`] for an unknown folder.
    pub fn connected_peers(&self, folder_id: &FolderId) -> Result<Vec<PeerId>> {
        self.inner
            .folders
            .get(folder_id)
            .map(|f| f.peers.iter().map(|p| *p.key()).collect())
            .ok_or(NodeError::FolderNotFound(*folder_id))
    }

    /// Ask a folder to rescan its root now
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::FolderNotFound`] for an unknown folder and
    /// [`NodeError::Channel`] if its controller has stopped.
    pub async fn rescan(&self, folder_id: &FolderId) -> Result<()> {
        let commands = self
            .inner
            .folders
            .get(folder_id)
            .map(|f| f.commands.clone())
            .ok_or(NodeError::FolderNotFound(*folder_id))?;
        commands
            .send(Command::Rescan)
            .await
            .map_err(|_| NodeError::channel("folder controller stopped"))
    }

    /// Add a rendezvous peer at runtime; it is dialed for every folder.
    pub async fn add_static_peer(&self, addr: SocketAddr) {
        self.inner.discovery.add_static_peer(addr).await;
    }

    /// Stop everything. Controllers finish their current metadata write
    /// before their databases close.
    pub async fn shutdown(&self) {
        tracing::info!("node {} shutting down", self.peer_id().short());
        self.inner.cancel.cancel();
        self.inner.discovery.shutdown().await;
        if let Err(e) = self.inner.transport.close().await {
            tracing::debug!("closing listener: {}", e);
        }

        let ids: Vec<FolderId> = self.folders();
        for id in ids {
            if let Some((_, handle)) = self.inner.folders.remove(&id) {
                handle.cancel.cancel();
                if let Err(e) = handle.task.await {
                    tracing::warn!("folder {} did not stop cleanly: {}", id.short(), e);
                }
            }
        }

        let tasks: Vec<_> = self.inner.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("peer_id", &self.peer_id())
            .field("listen_addr", &self.inner.listen_addr)
            .field("folders", &self.inner.folders.len())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------
// Background tasks
// ----------------------------------------------------------------------

async fn accept_loop(inner: Arc<NodeInner>) {
    loop {
        let accepted = tokio::select! {
            () = inner.cancel.cancelled() => break,
            accepted = inner.transport.accept() => accepted,
        };
        match accepted {
            Ok(conn) => {
                tokio::spawn(handle_inbound(Arc::clone(&inner), conn));
            }
            Err(TransportError::Closed) => break,
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    tracing::debug!("accept loop stopped");
}

async fn handle_inbound(inner: Arc<NodeInner>, mut conn: Connection) {
    let addr = conn.peer_addr;
    let Ok(permit) = Arc::clone(&inner.sessions).try_acquire_owned() else {
        tracing::warn!(
            "refusing {}: {}",
            addr,
            NodeError::TooManySessions(inner.config.session.max_sessions)
        );
        return;
    };

    let config = &inner.config.session;
    let (hello, bytes) = match session::read_hello(&mut conn.stream, config.handshake_timeout).await {
        Ok(hello) => hello,
        Err(e) => {
            tracing::debug!("bad hello from {}: {}", addr, e);
            return;
        }
    };
    let folder_id = hello.folder_id;
    let Some((trust, ctx)) = inner.folders.get(&folder_id).map(|f| {
        (
            TrustPolicy::AnyOf(f.config.trusted_peers.clone()),
            f.session_context(),
        )
    }) else {
        tracing::debug!("{} asked for unshared folder {}", addr, folder_id.short());
        return;
    };

    match session::accept(conn, &bytes, &inner.identity, folder_id, trust, config).await {
        Ok(auth) if auth.peer() == inner.identity.peer_id() => {
            tracing::debug!("dropping loopback session from {}", addr);
        }
        Ok(auth) => session::run(auth, ctx, permit).await,
        Err(e) => {
            tracing::warn!("inbound handshake from {} failed: {}", addr, e);
            report(&inner, folder_id, &NodeError::from(e));
        }
    }
}

async fn discovery_loop(inner: Arc<NodeInner>, mut discovered: broadcast::Receiver<DiscoveryEvent>) {
    loop {
        let event = tokio::select! {
            () = inner.cancel.cancelled() => break,
            event = discovered.recv() => event,
        };
        match event {
            Ok(DiscoveryEvent::PeerJoined(peer)) => on_discovered(&inner, &peer),
            Ok(DiscoveryEvent::PeerLeft(peer)) => {
                tracing::debug!(
                    "discovery lost {} for folder {}",
                    peer.addr,
                    peer.folder_id.short()
                );
            }
            Err(RecvError::Lagged(n)) => {
                tracing::warn!("discovery events lagged, {} skipped", n);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn on_discovered(inner: &Arc<NodeInner>, peer: &DiscoveredPeer) {
    let local = inner.identity.peer_id();
    let Some(trusted) = inner
        .folders
        .get(&peer.folder_id)
        .map(|f| f.config.trusted_peers.clone())
    else {
        return;
    };

    match peer.peer_id {
        Some(id) => {
            if id == local {
                return;
            }
            // Both ends see each other's announcements; only the smaller
            // id dials so they do not race.
            if peer.source == DiscoverySource::Multicast && local > id {
                return;
            }
            if !trusted.is_empty() && !trusted.contains(&id) {
                tracing::debug!("ignoring untrusted peer {}", id.short());
                return;
            }
        }
        None => {
            if inner.known_addrs.get(&peer.addr).is_some_and(|p| *p == local) {
                return;
            }
        }
    }
    spawn_dial(inner, peer.folder_id, peer.addr, peer.peer_id, None);
}

async fn redial_loop(inner: Arc<NodeInner>, mut requests: mpsc::UnboundedReceiver<Redial>) {
    loop {
        let request = tokio::select! {
            () = inner.cancel.cancelled() => break,
            request = requests.recv() => request,
        };
        let Some(request) = request else {
            break;
        };
        let delay = inner.config.reconnect.backoff_duration(0);
        spawn_dial(
            &inner,
            request.folder_id,
            request.addr,
            Some(request.peer),
            Some(delay),
        );
    }
}

fn spawn_dial(
    inner: &Arc<NodeInner>,
    folder_id: FolderId,
    addr: SocketAddr,
    expected: Option<PeerId>,
    delay: Option<Duration>,
) {
    if inner.dialing.insert((folder_id, addr), ()).is_some() {
        return;
    }
    tokio::spawn(dial_loop(Arc::clone(inner), folder_id, addr, expected, delay));
}

/// Dial until a session is up, the peer connects on its own, or the retry
/// budget runs out.
async fn dial_loop(
    inner: Arc<NodeInner>,
    folder_id: FolderId,
    addr: SocketAddr,
    expected: Option<PeerId>,
    mut delay: Option<Duration>,
) {
    let retry = inner.config.reconnect.clone();
    let mut attempt = 0u32;
    loop {
        if let Some(wait) = delay.take() {
            tokio::select! {
                () = inner.cancel.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }
        }
        if !needs_dial(&inner, folder_id, addr, expected) {
            break;
        }
        let Err(e) = dial_once(&inner, folder_id, addr, expected).await else {
            break;
        };
        if matches!(e, NodeError::Handshake(_)) {
            report(&inner, folder_id, &e);
        }
        match after_failure(&e, attempt, &retry) {
            Some(wait) => {
                tracing::debug!("dial {} failed ({}), retrying in {:?}", addr, e, wait);
                attempt += 1;
                delay = Some(wait);
            }
            None => {
                tracing::warn!(
                    "giving up on {} after {} attempts: {}",
                    addr,
                    attempt.saturating_add(1),
                    e
                );
                break;
            }
        }
    }
    inner.dialing.remove(&(folder_id, addr));
}

/// Backoff before the next dial, or `None` when the failure is not worth
/// repeating or the budget is spent. Discovery dials the peer again later.
fn after_failure(err: &NodeError, attempt: u32, retry: &RetryConfig) -> Option<Duration> {
    (err.should_retry() && attempt < retry.max_retries).then(|| retry.backoff_duration(attempt))
}

fn needs_dial(inner: &NodeInner, folder_id: FolderId, addr: SocketAddr, expected: Option<PeerId>) -> bool {
    if inner.cancel.is_cancelled() {
        return false;
    }
    let Some(folder) = inner.folders.get(&folder_id) else {
        return false;
    };
    let peer = expected.or_else(|| inner.known_addrs.get(&addr).map(|p| *p));
    match peer {
        Some(peer) => !folder.is_connected(&peer),
        None => !folder.is_connected_to(&addr),
    }
}

async fn dial_once(
    inner: &Arc<NodeInner>,
    folder_id: FolderId,
    addr: SocketAddr,
    expected: Option<PeerId>,
) -> Result<()> {
    let permit = Arc::clone(&inner.sessions)
        .try_acquire_owned()
        .map_err(|_| NodeError::TooManySessions(inner.config.session.max_sessions))?;
    let (trusted, ctx) = inner
        .folders
        .get(&folder_id)
        .map(|f| (f.config.trusted_peers.clone(), f.session_context()))
        .ok_or(NodeError::FolderNotFound(folder_id))?;
    let trust = match expected {
        Some(peer) => TrustPolicy::Expect(peer),
        None => TrustPolicy::AnyOf(trusted),
    };

    let conn = inner.transport.connect(addr).await?;
    let auth = session::dial(conn, &inner.identity, folder_id, trust, &inner.config.session).await?;
    inner.known_addrs.insert(addr, auth.peer());
    if auth.peer() == inner.identity.peer_id() {
        tracing::debug!("{} is this node, not dialing it again", auth.addr());
        return Ok(());
    }
    tokio::spawn(session::run(auth, ctx, permit));
    Ok(())
}

fn report(inner: &NodeInner, folder_id: FolderId, err: &NodeError) {
    let _ = inner.events.send(SyncEvent::Error {
        folder_id: Some(folder_id),
        kind: err.kind(),
        message: err.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::events::ControllerState;

    #[test]
    fn test_after_failure_follows_error_class() {
        let retry = RetryConfig {
            max_retries: 2,
            jitter: false,
            ..RetryConfig::default()
        };
        let refused = NodeError::transport("connection refused");
        assert_eq!(after_failure(&refused, 0, &retry), Some(retry.backoff_duration(0)));
        assert_eq!(after_failure(&refused, 1, &retry), Some(retry.backoff_duration(1)));
        assert_eq!(after_failure(&refused, 2, &retry), None);

        assert!(after_failure(&NodeError::TooManySessions(4), 0, &retry).is_some());
        assert_eq!(after_failure(&NodeError::Protocol("unknown folder".into()), 0, &retry), None);
        assert_eq!(after_failure(&NodeError::Handshake("untrusted peer".into()), 0, &retry), None);
        assert_eq!(after_failure(&NodeError::timeout("handshake"), 0, &retry), None);
    }

    fn config(dir: &std::path::Path) -> NodeConfig {
        let mut config = NodeConfig::new(dir.join("data"));
        config.listen_addr = "127.0.0.1:0".parse().unwrap();
        config.discovery.multicast = false;
        config
    }

    #[tokio::test]
    async fn test_start_and_folder_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::start(config(dir.path()), DeviceKey::from_seed(&[3u8; 32]))
            .await
            .unwrap();
        assert_ne!(node.listen_addr().port(), 0);
        assert!(node.folders().is_empty());

        let folder_id = FolderId::from_bytes([9u8; 32]);
        let mut folder = FolderConfig::new(folder_id, dir.path().join("share"));
        folder.watch = false;
        node.add_folder(folder.clone()).await.unwrap();
        assert!(matches!(
            node.add_folder(folder).await,
            Err(NodeError::FolderExists(_))
        ));

        let status = node.folder_status(&folder_id).unwrap();
        assert_eq!(status.folder_id, folder_id);
        assert_ne!(status.state, ControllerState::Degraded);
        assert!(node.connected_peers(&folder_id).unwrap().is_empty());
        node.rescan(&folder_id).await.unwrap();

        let db = dir.path().join("data").join("folders").join(format!("{}.db", folder_id.to_hex()));
        assert!(db.exists());
        node.remove_folder(&folder_id).await.unwrap();
        assert!(!db.exists());
        assert!(matches!(
            node.folder_status(&folder_id),
            Err(NodeError::FolderNotFound(_))
        ));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.transfer.max_in_flight = 0;
        let err = Node::start(config, DeviceKey::from_seed(&[3u8; 32]))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidConfig(_)));
    }
}
