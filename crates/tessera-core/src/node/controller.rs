//! Per-folder synchronization controller.
//!
//! One [`SyncController`] task runs per shared folder and is the only writer
//! of that folder's [`MetaStore`]. It reacts to four inputs:
//!
//! - local changes (watcher notifications and the periodic rescan timer)
//! - session events (peer metadata, `Have` lists, chunk completions)
//! - a transfer tick (timeouts, dispatch, materialization)
//! - commands from the [`crate::node::Node`]
//!
//! Remote winners are not recorded when merged. They wait in `pending` until
//! every chunk they need is in the store and they have been written to disk;
//! only then are they recorded and announced. A recorded entry therefore
//! always describes what is on this replica's disk, and peers may fetch its
//! chunks from us.

use crate::frame::Message;
use crate::merge::{ConflictCopy, MergeEngine, Resolution};
use crate::meta_store::MetaStore;
use crate::error::MetaError;
use crate::node::config::{FolderConfig, TransferConfig};
use crate::node::error::{NodeError, Result};
use crate::node::events::{ControllerState, FolderStatus, SyncEvent};
use crate::node::scheduler::{FailureOutcome, TransferScheduler};
use crate::node::session::{SessionContext, SessionEvent, SessionHandle, replaces};
use crate::session::SessionConfig;
use crate::state::{Entry, EntryKind, FolderState, LocalChange};
use crate::vector::VersionVector;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tessera_crypto::{Digest, FolderId, PeerId};
use tessera_files::{
    ChangeEvent, ChunkStore, ChunkerConfig, FileManifest, FilesError, FolderIndexer,
    FolderWatcher, IgnoreList, Materializer,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Transfer bookkeeping period.
const TICK: Duration = Duration::from_millis(250);

/// Quiet time after a watcher notification before rescanning.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(200);

const SESSION_EVENT_QUEUE: usize = 1024;

/// Requests from the node to a controller.
#[derive(Debug)]
pub(crate) enum Command {
    Rescan,
}

/// Ask the node to dial a peer again after its session dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Redial {
    pub(crate) folder_id: FolderId,
    pub(crate) addr: SocketAddr,
    pub(crate) peer: PeerId,
}

/// Everything a controller is built from.
pub(crate) struct ControllerParams {
    pub(crate) folder: FolderConfig,
    pub(crate) local: PeerId,
    pub(crate) meta: MetaStore,
    pub(crate) store: Arc<ChunkStore>,
    pub(crate) chunker: ChunkerConfig,
    pub(crate) transfer: TransferConfig,
    pub(crate) session: SessionConfig,
    pub(crate) events: broadcast::Sender<SyncEvent>,
    pub(crate) redial: mpsc::UnboundedSender<Redial>,
    pub(crate) cancel: CancellationToken,
}

/// Node-side view of a running controller.
pub(crate) struct FolderHandle {
    pub(crate) config: FolderConfig,
    pub(crate) snapshot: watch::Receiver<Arc<FolderState>>,
    pub(crate) status: watch::Receiver<FolderStatus>,
    pub(crate) commands: mpsc::Sender<Command>,
    /// Peers with an active session and their endpoints
    pub(crate) peers: Arc<DashMap<PeerId, SocketAddr>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) task: JoinHandle<MetaStore>,
    session_events: mpsc::Sender<SessionEvent>,
    session_config: SessionConfig,
    store: Arc<ChunkStore>,
}

impl FolderHandle {
    /// Context for a new session of this folder
    pub(crate) fn session_context(&self) -> SessionContext {
        SessionContext {
            folder_id: self.config.id,
            config: self.session_config.clone(),
            store: Arc::clone(&self.store),
            snapshot: self.snapshot.clone(),
            events: self.session_events.clone(),
            cancel: self.cancel.child_token(),
        }
    }

    /// Whether a session to `peer` is up
    pub(crate) fn is_connected(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    /// Whether a session to `addr` is up
    pub(crate) fn is_connected_to(&self, addr: &SocketAddr) -> bool {
        self.peers.iter().any(|p| p.value() == addr)
    }
}

/// Build a controller and spawn it.
///
/// # Errors
///
/// Returns [`NodeError::InvalidConfig`] for bad ignore patterns or chunker
/// parameters and [`NodeError::Io`] if the folder root cannot be created.
pub(crate) fn spawn(params: ControllerParams) -> Result<FolderHandle> {
    let ControllerParams {
        folder,
        local,
        meta,
        store,
        chunker,
        transfer,
        session,
        events,
        redial,
        cancel,
    } = params;

    std::fs::create_dir_all(&folder.root)?;
    let ignore = IgnoreList::load(&folder.root, &folder.ignore_patterns)?;
    let indexer = FolderIndexer::new(&folder.root, chunker, ignore)?;
    let materializer =
        Materializer::new(&folder.root, folder.archive).with_max_age(folder.archive_max_age);

    let (watch_tx, watch_rx) = mpsc::channel(1);
    let watcher = if folder.watch {
        match FolderWatcher::start(&folder.root, watch_tx) {
            Ok(w) => Some(w),
            Err(e) => {
                tracing::warn!(
                    "cannot watch {}, relying on periodic rescans: {}",
                    folder.root.display(),
                    e
                );
                None
            }
        }
    } else {
        None
    };

    let initial = Arc::new(meta.state().clone());
    let (snapshot_tx, snapshot_rx) = watch::channel(initial);
    let (status_tx, status_rx) = watch::channel(FolderStatus::new(folder.id));
    let (session_tx, session_rx) = mpsc::channel(SESSION_EVENT_QUEUE);
    let (command_tx, command_rx) = mpsc::channel(16);
    let peers = Arc::new(DashMap::new());

    let controller = SyncController {
        folder: folder.clone(),
        local,
        meta,
        merge: MergeEngine::new(folder.tie_break),
        indexer: Arc::new(indexer),
        materializer,
        store: Arc::clone(&store),
        scheduler: TransferScheduler::new(transfer),
        sessions: HashMap::new(),
        peers: Arc::clone(&peers),
        remote_vectors: HashMap::new(),
        pending: BTreeMap::new(),
        pending_copies: BTreeMap::new(),
        deferred: BTreeSet::new(),
        state: ControllerState::Idle,
        degraded: false,
        last_progress: 0,
        snapshot: snapshot_tx,
        status: status_tx,
        events,
        redial,
        _watcher: watcher,
    };

    let inputs = Inputs {
        sessions: session_rx,
        commands: command_rx,
        watcher: watch_rx,
        cancel: cancel.clone(),
    };
    let task = tokio::spawn(controller.run(inputs));

    Ok(FolderHandle {
        config: folder,
        snapshot: snapshot_rx,
        status: status_rx,
        commands: command_tx,
        peers,
        cancel,
        task,
        session_events: session_tx,
        session_config: session,
        store,
    })
}

struct Inputs {
    sessions: mpsc::Receiver<SessionEvent>,
    commands: mpsc::Receiver<Command>,
    watcher: mpsc::Receiver<()>,
    cancel: CancellationToken,
}

/// Rescan deadline for watcher notifications. The first notification
/// arms it; later ones before it fires fold into the same rescan.
#[derive(Debug, Default)]
struct Debounce {
    deadline: Option<tokio::time::Instant>,
}

impl Debounce {
    fn notify(&mut self, now: tokio::time::Instant) {
        self.deadline.get_or_insert(now + WATCH_DEBOUNCE);
    }

    fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// When to rescan; only meaningful while armed.
    fn deadline(&self) -> tokio::time::Instant {
        self.deadline.unwrap_or_else(tokio::time::Instant::now)
    }

    fn clear(&mut self) {
        self.deadline = None;
    }
}

/// Result of writing one entry to disk.
enum Applied {
    Written(FileManifest),
    Deleted,
    /// Disk no longer matches the last index; wait for a rescan
    Deferred,
}

/// The per-folder state machine.
struct SyncController {
    folder: FolderConfig,
    local: PeerId,
    meta: MetaStore,
    merge: MergeEngine,
    indexer: Arc<FolderIndexer>,
    materializer: Materializer,
    store: Arc<ChunkStore>,
    scheduler: TransferScheduler,
    sessions: HashMap<PeerId, SessionHandle>,
    peers: Arc<DashMap<PeerId, SocketAddr>>,
    /// Highest folder vector each peer has announced
    remote_vectors: HashMap<PeerId, VersionVector>,
    /// Merged remote winners not yet on disk, by path
    pending: BTreeMap<String, Entry>,
    /// Conflict copies to create, by conflict path
    pending_copies: BTreeMap<String, ConflictCopy>,
    /// Paths changed on disk since the last scan
    deferred: BTreeSet<String>,
    state: ControllerState,
    degraded: bool,
    last_progress: u64,
    snapshot: watch::Sender<Arc<FolderState>>,
    status: watch::Sender<FolderStatus>,
    events: broadcast::Sender<SyncEvent>,
    redial: mpsc::UnboundedSender<Redial>,
    _watcher: Option<FolderWatcher>,
}

impl SyncController {
    async fn run(mut self, mut inputs: Inputs) -> MetaStore {
        tracing::info!(
            "folder {} started at {} with {} entries",
            self.folder.id.short(),
            self.folder.root.display(),
            self.meta.state().len()
        );
        self.rescan().await;
        self.sweep_archive().await;

        let period = self.folder.rescan_interval;
        let mut rescan_timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        rescan_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut debounce = Debounce::default();

        loop {
            tokio::select! {
                () = inputs.cancel.cancelled() => break,
                Some(event) = inputs.sessions.recv() => self.on_session_event(event).await,
                Some(command) = inputs.commands.recv() => match command {
                    Command::Rescan => self.rescan().await,
                },
                Some(()) = inputs.watcher.recv() => debounce.notify(tokio::time::Instant::now()),
                () = tokio::time::sleep_until(debounce.deadline()), if debounce.is_armed() => {
                    debounce.clear();
                    self.rescan().await;
                }
                _ = rescan_timer.tick() => {
                    self.rescan().await;
                    self.sweep_archive().await;
                }
                _ = tick.tick() => self.on_tick().await,
            }
            self.publish_status();
        }

        for handle in self.sessions.values() {
            handle.close("folder stopped");
        }
        self.peers.clear();
        tracing::info!("folder {} stopped", self.folder.id.short());
        self.meta
    }

    // ------------------------------------------------------------------
    // Session traffic
    // ------------------------------------------------------------------

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Up(handle) => self.on_session_up(handle),
            SessionEvent::Down {
                peer,
                session_id,
                reason,
                protocol_error,
            } => self.on_session_down(peer, session_id, &reason, protocol_error),
            SessionEvent::Metadata {
                peer,
                session_id,
                vector,
                entries,
            } => {
                if !self.is_current(&peer, session_id) {
                    return;
                }
                self.on_metadata(peer, vector, entries).await;
            }
            SessionEvent::Have {
                peer,
                session_id,
                digests,
            } => {
                if self.is_current(&peer, session_id) {
                    self.scheduler.add_sources(peer, digests);
                    self.dispatch();
                }
            }
            SessionEvent::ChunkStored {
                peer,
                request_id,
                digest,
                bytes,
            } => {
                tracing::trace!(
                    "chunk {} ({} bytes, request {}) from {}",
                    digest.short(),
                    bytes,
                    request_id,
                    peer.short()
                );
                self.scheduler.complete(&digest, &peer, bytes, Instant::now());
                self.dispatch();
                if self.scheduler.stats().wanted == 0 {
                    self.process_pending().await;
                }
            }
            SessionEvent::ChunkFailed {
                peer,
                request_id,
                digest,
                integrity,
            } => {
                if integrity {
                    self.report(&NodeError::Integrity(
                        format!("{} sent corrupt chunk {}", peer.short(), digest.short()).into(),
                    ));
                }
                if self.scheduler.fail(&digest, request_id, Instant::now())
                    == FailureOutcome::Unavailable
                {
                    self.emit(SyncEvent::ChunkUnavailable {
                        folder_id: self.folder.id,
                        digest,
                    });
                }
                self.dispatch();
            }
            SessionEvent::Pong { peer, rtt } => self.scheduler.record_rtt(&peer, rtt),
        }
    }

    fn is_current(&self, peer: &PeerId, session_id: u64) -> bool {
        self.sessions
            .get(peer)
            .is_some_and(|s| s.session_id == session_id)
    }

    fn on_session_up(&mut self, handle: SessionHandle) {
        if let Some(existing) = self.sessions.get(&handle.peer) {
            if !replaces(existing, &handle) {
                tracing::debug!(
                    "keeping existing session with {}, closing duplicate",
                    handle.peer.short()
                );
                handle.close("duplicate session");
                return;
            }
            tracing::debug!("session with {} replaced", handle.peer.short());
            existing.close("duplicate session");
            self.scheduler.peer_disconnected(&handle.peer);
        }

        let peer = handle.peer;
        tracing::info!(
            "folder {}: peer {} connected from {}",
            self.folder.id.short(),
            peer.short(),
            handle.addr
        );
        self.peers.insert(peer, handle.addr);
        self.scheduler.peer_connected(peer);
        self.emit(SyncEvent::PeerJoined {
            folder_id: self.folder.id,
            peer_id: peer,
            addr: handle.addr,
        });
        self.send_full_state(&handle);
        self.sessions.insert(peer, handle);
        self.update_state();
    }

    fn on_session_down(&mut self, peer: PeerId, session_id: u64, reason: &str, protocol_error: bool) {
        if !self.is_current(&peer, session_id) {
            return;
        }
        let Some(handle) = self.sessions.remove(&peer) else {
            return;
        };
        self.peers.remove(&peer);
        self.scheduler.peer_disconnected(&peer);
        self.remote_vectors.remove(&peer);
        tracing::info!(
            "folder {}: peer {} disconnected: {}",
            self.folder.id.short(),
            peer.short(),
            reason
        );
        self.emit(SyncEvent::PeerLeft {
            folder_id: self.folder.id,
            peer_id: peer,
            reason: reason.to_string(),
        });
        if protocol_error {
            self.report(&NodeError::Protocol(
                format!("{}: {}", peer.short(), reason).into(),
            ));
        }
        // Whoever dialed redials; the other side waits.
        if handle.initiator == self.local {
            let _ = self.redial.send(Redial {
                folder_id: self.folder.id,
                addr: handle.addr,
                peer,
            });
        }
        self.update_state();
    }

    /// Send our whole index and chunk list to a new session.
    fn send_full_state(&self, handle: &SessionHandle) {
        let state = self.meta.state();
        let mut messages = Message::announce_batches(state.vector(), state.entries());
        let mut digests: Vec<Digest> = state.referenced_digests().into_iter().collect();
        digests.sort_unstable();
        messages.extend(Message::have_batches(digests));

        let sender = handle.sender();
        let peer = handle.peer;
        tokio::spawn(async move {
            for message in messages {
                if sender.send(message).await.is_err() {
                    tracing::debug!("session with {} ended during index exchange", peer.short());
                    return;
                }
            }
        });
    }

    async fn on_metadata(&mut self, peer: PeerId, vector: VersionVector, entries: Vec<Entry>) {
        self.set_state(ControllerState::Exchanging);
        let known = self.remote_vectors.entry(peer).or_default();
        known.join(&vector);
        let behind = !self.meta.state().vector().descends(known);
        if self.degraded {
            return;
        }
        tracing::debug!(
            "folder {}: {} entries from {}{}",
            self.folder.id.short(),
            entries.len(),
            peer.short(),
            if behind { " (peer has news)" } else { "" }
        );

        // A peer only announces what it has on disk, so it can serve it.
        let sources: Vec<Digest> = entries
            .iter()
            .filter_map(Entry::manifest)
            .flat_map(|m| m.digests())
            .collect();
        self.scheduler.add_sources(peer, sources);

        self.set_state(ControllerState::Merging);
        self.merge_entries(entries);
        self.process_pending().await;
        self.update_state();
    }

    // ------------------------------------------------------------------
    // Merging
    // ------------------------------------------------------------------

    /// Merge remote entries against pending or recorded state.
    fn merge_entries(&mut self, entries: Vec<Entry>) {
        let mut accepted = Vec::new();
        for remote in entries {
            if !self.acceptable(&remote) {
                continue;
            }
            let is_pending = self.pending.contains_key(&remote.path);
            let outcome = {
                let effective = self
                    .pending
                    .get(&remote.path)
                    .or_else(|| self.meta.state().get(&remote.path));
                self.merge.merge(effective, &remote)
            };
            match outcome.resolution {
                Resolution::Ignore => {}
                Resolution::TakeRemote(entry) => {
                    self.pending.insert(entry.path.clone(), entry);
                }
                Resolution::KeepLocal(entry) if is_pending => {
                    self.pending.insert(entry.path.clone(), entry);
                }
                Resolution::KeepLocal(entry) => accepted.push(entry),
            }
            for copy in outcome.conflicts {
                tracing::info!(
                    "folder {}: concurrent edits of {}",
                    self.folder.id.short(),
                    copy.original
                );
                self.pending_copies.insert(copy.manifest.path.clone(), copy);
            }
        }
        if !accepted.is_empty() {
            self.record(&accepted);
        }
    }

    fn acceptable(&self, entry: &Entry) -> bool {
        if let Err(e) = tessera_files::path::validate(&entry.path) {
            tracing::warn!("dropping remote entry: {}", e);
            return false;
        }
        if tessera_files::path::is_system(&entry.path) {
            tracing::warn!("dropping remote entry for system path {}", entry.path);
            return false;
        }
        if let Some(m) = entry.manifest() {
            if m.path != entry.path || !m.is_consistent() {
                tracing::warn!("dropping inconsistent manifest for {}", entry.path);
                return false;
            }
        }
        true
    }

    /// Merge everything pending again against recorded state.
    fn remerge_pending(&mut self) {
        let pending: Vec<Entry> = std::mem::take(&mut self.pending).into_values().collect();
        self.merge_entries(pending);
    }

    // ------------------------------------------------------------------
    // Materialization
    // ------------------------------------------------------------------

    /// Request missing chunks and write whatever is complete.
    async fn process_pending(&mut self) {
        if self.degraded || (self.pending.is_empty() && self.pending_copies.is_empty()) {
            self.forget_unneeded();
            return;
        }

        let mut ready_copies = Vec::new();
        let mut ready = Vec::new();
        let mut needed = HashSet::new();
        for (path, copy) in &self.pending_copies {
            let missing = self.store.has_all(copy.manifest.chunks.iter().map(|c| &c.digest));
            if missing.is_empty() {
                if !self.deferred.contains(path) {
                    ready_copies.push(path.clone());
                }
            } else {
                needed.extend(missing);
            }
        }
        for (path, entry) in &self.pending {
            let missing = match entry.manifest() {
                Some(m) => self.store.has_all(m.chunks.iter().map(|c| &c.digest)),
                None => BTreeSet::new(),
            };
            if missing.is_empty() {
                if !self.deferred.contains(path) {
                    ready.push(path.clone());
                }
            } else {
                needed.extend(missing);
            }
        }

        for digest in &needed {
            if self.scheduler.want(*digest) {
                tracing::trace!("want chunk {}", digest.short());
            }
        }
        self.forget_except(&needed);
        self.dispatch();

        if ready_copies.is_empty() && ready.is_empty() {
            return;
        }
        self.set_state(ControllerState::Materializing);
        // Copies first: a losing local version must be saved before the
        // winner overwrites its path.
        for path in ready_copies {
            self.write_conflict_copy(&path).await;
        }
        for path in ready {
            self.write_pending(&path).await;
        }
        self.update_state();
    }

    fn forget_unneeded(&mut self) {
        self.forget_except(&HashSet::new());
    }

    fn forget_except(&mut self, needed: &HashSet<Digest>) {
        let stale: Vec<Digest> = self
            .scheduler
            .wanted()
            .filter(|d| !needed.contains(d))
            .copied()
            .collect();
        for digest in stale {
            self.scheduler.forget(&digest);
        }
    }

    async fn write_pending(&mut self, path: &str) {
        let Some(entry) = self.pending.get(path).cloned() else {
            return;
        };
        let recorded = self
            .meta
            .state()
            .get(path)
            .and_then(Entry::manifest)
            .cloned();

        let materializer = self.materializer.clone();
        let store = Arc::clone(&self.store);
        match apply_to_disk(materializer, store, entry.clone(), recorded).await {
            Ok(Applied::Written(written)) => {
                self.pending.remove(path);
                let entry = Entry {
                    kind: EntryKind::File(written),
                    ..entry
                };
                if self.record(std::slice::from_ref(&entry)) {
                    self.emit(SyncEvent::FileUpdated {
                        folder_id: self.folder.id,
                        path: path.to_string(),
                        deleted: false,
                    });
                }
            }
            Ok(Applied::Deleted) => {
                self.pending.remove(path);
                if self.record(std::slice::from_ref(&entry)) {
                    self.emit(SyncEvent::FileUpdated {
                        folder_id: self.folder.id,
                        path: path.to_string(),
                        deleted: true,
                    });
                }
            }
            Ok(Applied::Deferred) => self.defer(path),
            Err(e) => self.materialize_failed(path, e),
        }
    }

    async fn write_conflict_copy(&mut self, path: &str) {
        let Some(copy) = self.pending_copies.get(path).cloned() else {
            return;
        };
        let recorded = self
            .meta
            .state()
            .get(path)
            .and_then(Entry::manifest)
            .cloned();

        if recorded
            .as_ref()
            .is_some_and(|m| m.same_content(&copy.manifest))
        {
            // A peer already created the same copy and we have it.
            self.pending_copies.remove(path);
            self.conflict_detected(&copy);
            return;
        }

        let job = Entry::file(copy.manifest.clone(), VersionVector::new(), 0, self.local);
        let materializer = self.materializer.clone();
        let store = Arc::clone(&self.store);
        match apply_to_disk(materializer, store, job, recorded).await {
            Ok(Applied::Written(written)) => {
                self.pending_copies.remove(path);
                match self.meta.record_local(vec![LocalChange::Upsert(written)], now_ms()) {
                    Ok(entries) => {
                        self.publish_snapshot();
                        self.announce(&entries);
                        self.conflict_detected(&copy);
                    }
                    Err(e) => self.degrade(e),
                }
            }
            Ok(Applied::Deleted) => {
                self.pending_copies.remove(path);
            }
            Ok(Applied::Deferred) => self.defer(path),
            Err(e) => self.materialize_failed(path, e),
        }
    }

    fn conflict_detected(&self, copy: &ConflictCopy) {
        self.emit(SyncEvent::ConflictDetected {
            folder_id: self.folder.id,
            path: copy.original.clone(),
            conflict_path: copy.manifest.path.clone(),
            winner_origin: copy.winner_origin,
            loser_origin: copy.loser_origin,
        });
    }

    fn defer(&mut self, path: &str) {
        tracing::info!(
            "folder {}: {} changed locally, deferring until rescan",
            self.folder.id.short(),
            path
        );
        self.deferred.insert(path.to_string());
    }

    fn materialize_failed(&mut self, path: &str, err: FilesError) {
        match &err {
            FilesError::Integrity { expected, .. } => {
                // The stored copy rotted; drop it and fetch it again.
                if let Err(e) = self.store.remove(expected) {
                    tracing::warn!("cannot remove corrupt chunk {}: {}", expected.short(), e);
                }
                self.report(&NodeError::from(err));
            }
            FilesError::NotFound(digest) => {
                tracing::debug!("chunk {} vanished before {} was written", digest.short(), path);
            }
            _ => {
                tracing::warn!("cannot write {}: {}", path, err);
                self.deferred.insert(path.to_string());
                self.report(&NodeError::from(err));
            }
        }
    }

    // ------------------------------------------------------------------
    // Local changes
    // ------------------------------------------------------------------

    async fn sweep_archive(&mut self) {
        let materializer = self.materializer.clone();
        match tokio::task::spawn_blocking(move || materializer.sweep_archive()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(
                "folder {}: archive sweep failed: {}",
                self.folder.id.short(),
                e
            ),
            Err(e) => tracing::warn!("folder {}: archive sweep panicked: {}", self.folder.id.short(), e),
        }
    }

    async fn rescan(&mut self) {
        if self.degraded {
            return;
        }
        self.set_state(ControllerState::Scanning);
        let previous = self.meta.state().live_manifests();
        let indexer = Arc::clone(&self.indexer);
        let store = Arc::clone(&self.store);
        let report = match tokio::task::spawn_blocking(move || indexer.scan(&previous, &store)).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                tracing::warn!("scan of {} failed: {}", self.folder.root.display(), e);
                self.report(&NodeError::from(e));
                self.update_state();
                return;
            }
            Err(e) => {
                self.report(&NodeError::from(e));
                self.update_state();
                return;
            }
        };
        for (path, reason) in &report.skipped {
            tracing::debug!("skipped {}: {}", path, reason);
        }
        tracing::debug!(
            "folder {}: scanned {} files, hashed {} ({} bytes), {} changes",
            self.folder.id.short(),
            report.scanned,
            report.hashed,
            report.bytes_hashed,
            report.events.len()
        );

        if !report.refreshed.is_empty() {
            if let Err(e) = self.meta.refresh(&report.refreshed) {
                self.degrade(e);
                return;
            }
        }

        let mut changes = Vec::new();
        for event in report.events {
            match event {
                ChangeEvent::Created(m) | ChangeEvent::Modified(m) => {
                    changes.push(LocalChange::Upsert(m));
                }
                ChangeEvent::Deleted(path) => changes.push(LocalChange::Delete(path)),
                ChangeEvent::Renamed { from, manifest } => {
                    changes.push(LocalChange::Delete(from));
                    changes.push(LocalChange::Upsert(manifest));
                }
            }
        }
        if !changes.is_empty() {
            match self.meta.record_local(changes, now_ms()) {
                Ok(entries) => {
                    tracing::info!(
                        "folder {}: recorded {} local changes",
                        self.folder.id.short(),
                        entries.len()
                    );
                    self.publish_snapshot();
                    self.announce(&entries);
                }
                Err(e) => {
                    self.degrade(e);
                    return;
                }
            }
        } else if !report.refreshed.is_empty() {
            self.publish_snapshot();
        }

        self.deferred.clear();
        self.remerge_pending();
        self.process_pending().await;
        self.update_state();
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    async fn on_tick(&mut self) {
        let now = Instant::now();
        for digest in self.scheduler.expire(now) {
            self.emit(SyncEvent::ChunkUnavailable {
                folder_id: self.folder.id,
                digest,
            });
        }
        self.dispatch();
        self.process_pending().await;

        let stats = self.scheduler.stats();
        if stats.completed != self.last_progress {
            self.last_progress = stats.completed;
            self.emit(SyncEvent::TransferProgress {
                folder_id: self.folder.id,
                completed: stats.completed,
                remaining: stats.wanted,
                bytes: stats.bytes,
            });
        }
        self.update_state();
    }

    /// Send the requests the scheduler has ready.
    fn dispatch(&mut self) {
        let now = Instant::now();
        for request in self.scheduler.next_requests(now) {
            let sent = self.sessions.get(&request.peer).is_some_and(|s| {
                s.send(Message::ChunkRequest {
                    id: request.request_id,
                    digest: request.digest,
                })
            });
            if !sent {
                self.scheduler.fail(&request.digest, request.request_id, now);
            }
        }
    }

    /// Persist merged or materialized entries and tell peers.
    fn record(&mut self, entries: &[Entry]) -> bool {
        match self.meta.apply(entries) {
            Ok(()) => {
                self.publish_snapshot();
                self.announce(entries);
                true
            }
            Err(e) => {
                self.degrade(e);
                false
            }
        }
    }

    fn announce(&self, entries: &[Entry]) {
        if self.sessions.is_empty() || entries.is_empty() {
            return;
        }
        let vector = self.meta.state().vector();
        let mut messages = Message::announce_batches(vector, entries);
        let mut digests: Vec<Digest> = entries
            .iter()
            .filter_map(Entry::manifest)
            .flat_map(|m| m.digests())
            .collect();
        digests.sort_unstable();
        digests.dedup();
        messages.extend(Message::have_batches(digests));

        for handle in self.sessions.values() {
            for message in &messages {
                if !handle.send(message.clone()) {
                    break;
                }
            }
        }
    }

    fn degrade(&mut self, err: MetaError) {
        tracing::error!(
            "folder {}: metadata store failed, halting sync: {}",
            self.folder.id.short(),
            err
        );
        self.degraded = true;
        self.report(&NodeError::from(err));
        self.set_state(ControllerState::Degraded);
    }

    fn report(&self, err: &NodeError) {
        self.emit(SyncEvent::Error {
            folder_id: Some(self.folder.id),
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: ControllerState) {
        if self.degraded && state != ControllerState::Degraded {
            return;
        }
        if self.state != state {
            tracing::debug!(
                "folder {}: {:?} -> {:?}",
                self.folder.id.short(),
                self.state,
                state
            );
            self.state = state;
            self.emit(SyncEvent::FolderStateChanged {
                folder_id: self.folder.id,
                state,
            });
        }
    }

    /// Settle on the state implied by outstanding work.
    fn update_state(&mut self) {
        let stats = self.scheduler.stats();
        let state = if self.sessions.is_empty() {
            ControllerState::Discovering
        } else if stats.wanted > stats.unavailable {
            ControllerState::Transferring
        } else if !self.pending.is_empty() || !self.pending_copies.is_empty() {
            ControllerState::Materializing
        } else {
            ControllerState::Idle
        };
        self.set_state(state);
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(Arc::new(self.meta.state().clone()));
    }

    fn publish_status(&self) {
        let state = self.meta.state();
        let stats = self.scheduler.stats();
        let status = FolderStatus {
            folder_id: self.folder.id,
            state: self.state,
            entries: state.len(),
            files: state.entries().filter(|e| !e.is_tombstone()).count(),
            peers: self.sessions.len(),
            pending: self.pending.len() + self.pending_copies.len(),
            wanted_chunks: stats.wanted,
            unavailable_chunks: stats.unavailable,
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// Write or delete `entry` on disk, provided the disk still holds
/// `recorded` (the last indexed manifest, `None` for absent).
async fn apply_to_disk(
    materializer: Materializer,
    store: Arc<ChunkStore>,
    entry: Entry,
    recorded: Option<FileManifest>,
) -> std::result::Result<Applied, FilesError> {
    let root = materializer.archive_dir();
    let job = tokio::task::spawn_blocking(move || {
        if !materializer.matches_disk(&entry.path, recorded.as_ref())? {
            return Ok(Applied::Deferred);
        }
        match entry.manifest() {
            Some(manifest) => materializer.write_file(manifest, &store).map(Applied::Written),
            None => materializer.delete_file(&entry.path).map(|_| Applied::Deleted),
        }
    });
    match job.await {
        Ok(result) => result,
        Err(e) => Err(FilesError::io(root, std::io::Error::other(e.to_string()))),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
