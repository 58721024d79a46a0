//! Session driver: handshake and message pumps for one peer session.
//!
//! A session is established by [`dial`] (initiator) or [`accept`]
//! (responder), then driven by [`run`], which splits the stream and the
//! session keys into a reader task and a writer task:
//!
//! ```text
//!            ┌──────────── SessionHandle.outbound ───────────┐
//!            │                                               ▼
//!  SyncController ◄── SessionEvent ── reader ◄── socket ── writer ──► socket
//!                                       │  ▲                 ▲
//!                                       │  └─ ChunkStore     │
//!                                       └── Pong / ChunkResponse
//! ```
//!
//! Chunk requests are served by the reader straight from the shared
//! [`ChunkStore`], restricted to chunks the folder snapshot references.
//! Received chunks are verified and stored before the controller hears of
//! them.

use crate::error::SessionError;
use crate::frame::Message;
use crate::session::{Session, SessionConfig, SessionState};
use crate::state::{Entry, FolderState};
use crate::vector::VersionVector;
use dashmap::DashMap;
use rand_core::OsRng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tessera_crypto::aead::{RecvHalf, SendHalf, SessionCrypto};
use tessera_crypto::{DeviceKey, Digest, FolderId, Handshake, Hello, PeerId, Role, TrustPolicy};
use tessera_files::{ChunkStore, FilesError};
use tessera_transport::{AsyncStream, Connection, MAX_FRAME_SIZE, read_frame, write_frame};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, OwnedSemaphorePermit, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Largest plaintext handshake frame accepted.
const HANDSHAKE_FRAME_LIMIT: usize = 4096;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

type Stream = Box<dyn AsyncStream>;

/// Session after a successful handshake, before its pumps start.
pub(crate) struct Authenticated {
    stream: Stream,
    addr: SocketAddr,
    peer: PeerId,
    initiator: PeerId,
    crypto: SessionCrypto,
    session: Session,
    tag: [u8; 8],
}

impl Authenticated {
    /// Proven remote identity
    pub(crate) fn peer(&self) -> PeerId {
        self.peer
    }

    /// Remote endpoint
    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Controller-side handle of a running session.
#[derive(Debug, Clone)]
pub(crate) struct SessionHandle {
    pub(crate) peer: PeerId,
    pub(crate) session_id: u64,
    pub(crate) addr: SocketAddr,
    /// Identity of the side that dialed
    pub(crate) initiator: PeerId,
    pub(crate) tag: [u8; 8],
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Queue a message without waiting. A session whose queue is full is
    /// too slow to keep up and gets dropped; it will redial and resync.
    pub(crate) fn send(&self, message: Message) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    "outbound queue to {} full, dropping session",
                    self.peer.short()
                );
                self.cancel.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Sender for bulk transfers that may wait for queue space
    pub(crate) fn sender(&self) -> mpsc::Sender<Message> {
        self.outbound.clone()
    }

    /// Ask the peer to close, or cut the session if that cannot be queued.
    pub(crate) fn close(&self, reason: &str) {
        let message = Message::Close {
            reason: reason.to_string(),
        };
        if self.outbound.try_send(message).is_err() {
            self.cancel.cancel();
        }
    }
}

/// Of two sessions to the same peer, whether `incoming` replaces `existing`.
///
/// The session dialed by the smaller peer id wins, so both ends pick the
/// same one; between sessions dialed by the same side the newer one wins.
pub(crate) fn replaces(existing: &SessionHandle, incoming: &SessionHandle) -> bool {
    incoming.initiator <= existing.initiator
}

/// What sessions report to their folder controller.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Up(SessionHandle),
    Down {
        peer: PeerId,
        session_id: u64,
        reason: String,
        protocol_error: bool,
    },
    Metadata {
        peer: PeerId,
        session_id: u64,
        vector: VersionVector,
        entries: Vec<Entry>,
    },
    Have {
        peer: PeerId,
        session_id: u64,
        digests: Vec<Digest>,
    },
    ChunkStored {
        peer: PeerId,
        request_id: u64,
        digest: Digest,
        bytes: u64,
    },
    ChunkFailed {
        peer: PeerId,
        request_id: u64,
        digest: Digest,
        integrity: bool,
    },
    Pong {
        peer: PeerId,
        rtt: Duration,
    },
}

/// Everything a running session needs from its folder.
pub(crate) struct SessionContext {
    pub(crate) folder_id: FolderId,
    pub(crate) config: SessionConfig,
    pub(crate) store: Arc<ChunkStore>,
    pub(crate) snapshot: watch::Receiver<Arc<FolderState>>,
    pub(crate) events: mpsc::Sender<SessionEvent>,
    pub(crate) cancel: CancellationToken,
}

/// Run the initiator side of the handshake on a fresh connection.
///
/// # Errors
///
/// Returns [`SessionError::Handshake`] if the peer is not the one `trust`
/// expects, speaks another version, or fails authentication, and
/// [`SessionError::Timeout`] if the exchange takes too long.
pub(crate) async fn dial(
    conn: Connection,
    identity: &DeviceKey,
    folder_id: FolderId,
    trust: TrustPolicy,
    config: &SessionConfig,
) -> Result<Authenticated, SessionError> {
    let Connection {
        mut stream,
        peer_addr,
    } = conn;
    let mut session = Session::new(config.clone());
    session.transition_to(SessionState::Handshaking)?;

    let (peer, crypto, tag) = tokio::time::timeout(
        config.handshake_timeout,
        initiator_exchange(&mut stream, identity, folder_id, trust),
    )
    .await
    .map_err(|_| SessionError::Timeout)??;

    session.transition_to(SessionState::Authenticated)?;
    tracing::debug!(
        "session {} with {} at {} authenticated (initiator)",
        hex::encode(tag),
        peer.short(),
        peer_addr
    );
    Ok(Authenticated {
        stream,
        addr: peer_addr,
        peer,
        initiator: identity.peer_id(),
        crypto,
        session,
        tag,
    })
}

/// Read the initiator's hello so the caller can see which folder it wants.
///
/// # Errors
///
/// Returns [`SessionError::Handshake`] for a malformed hello and
/// [`SessionError::Timeout`] if nothing arrives in time.
pub(crate) async fn read_hello(
    stream: &mut Stream,
    timeout: Duration,
) -> Result<(Hello, Vec<u8>), SessionError> {
    let bytes = tokio::time::timeout(timeout, read_handshake_frame(stream))
        .await
        .map_err(|_| SessionError::Timeout)??;
    let hello = Hello::from_bytes(&bytes)?;
    Ok((hello, bytes))
}

/// Run the responder side, given the hello already read by [`read_hello`].
///
/// The initiator is checked against `trust` before anything is sent back.
///
/// # Errors
///
/// As for [`dial`].
pub(crate) async fn accept(
    conn: Connection,
    hello: &[u8],
    identity: &DeviceKey,
    folder_id: FolderId,
    trust: TrustPolicy,
    config: &SessionConfig,
) -> Result<Authenticated, SessionError> {
    let Connection {
        mut stream,
        peer_addr,
    } = conn;
    let mut session = Session::new(config.clone());
    session.transition_to(SessionState::Handshaking)?;

    let (peer, crypto, tag) = tokio::time::timeout(
        config.handshake_timeout,
        responder_exchange(&mut stream, hello, identity, folder_id, trust),
    )
    .await
    .map_err(|_| SessionError::Timeout)??;

    session.transition_to(SessionState::Authenticated)?;
    tracing::debug!(
        "session {} with {} at {} authenticated (responder)",
        hex::encode(tag),
        peer.short(),
        peer_addr
    );
    Ok(Authenticated {
        stream,
        addr: peer_addr,
        peer,
        initiator: peer,
        crypto,
        session,
        tag,
    })
}

async fn initiator_exchange(
    stream: &mut Stream,
    identity: &DeviceKey,
    folder_id: FolderId,
    trust: TrustPolicy,
) -> Result<(PeerId, SessionCrypto, [u8; 8]), SessionError> {
    let mut handshake = Handshake::new(Role::Initiator, identity, folder_id, trust, &mut OsRng)?;
    write_frame(stream, handshake.hello_bytes()).await?;
    let reply = read_handshake_frame(stream).await?;
    handshake.read_hello(&reply)?;
    authenticate(stream, handshake, identity).await
}

async fn responder_exchange(
    stream: &mut Stream,
    hello: &[u8],
    identity: &DeviceKey,
    folder_id: FolderId,
    trust: TrustPolicy,
) -> Result<(PeerId, SessionCrypto, [u8; 8]), SessionError> {
    let mut handshake = Handshake::new(Role::Responder, identity, folder_id, trust, &mut OsRng)?;
    handshake.read_hello(hello)?;
    write_frame(stream, handshake.hello_bytes()).await?;
    authenticate(stream, handshake, identity).await
}

/// Agree on keys, then swap sealed identity proofs.
async fn authenticate(
    stream: &mut Stream,
    handshake: Handshake<'_>,
    identity: &DeviceKey,
) -> Result<(PeerId, SessionCrypto, [u8; 8]), SessionError> {
    let outcome = handshake.agree()?;
    let mut crypto = outcome.session_crypto();
    let proof = crypto.seal(&outcome.auth_proof(identity))?;
    write_frame(stream, &proof).await?;

    let sealed = read_handshake_frame(stream).await?;
    let remote_proof = crypto.open(&sealed)?;
    let peer = outcome.verify_auth(&remote_proof)?;
    Ok((peer, crypto, outcome.session_tag()))
}

async fn read_handshake_frame(stream: &mut Stream) -> Result<Vec<u8>, SessionError> {
    read_frame(stream, HANDSHAKE_FRAME_LIMIT)
        .await?
        .ok_or_else(|| SessionError::Closed("end of stream during handshake".into()))
}

/// Drive an authenticated session until it ends, then report `Down`.
///
/// `permit` holds the session's slot in the node-wide limit.
pub(crate) async fn run(auth: Authenticated, ctx: SessionContext, permit: OwnedSemaphorePermit) {
    let Authenticated {
        stream,
        addr,
        peer,
        initiator,
        crypto,
        mut session,
        tag,
    } = auth;
    let session_id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
    if let Err(e) = session.transition_to(SessionState::Active) {
        tracing::error!("session {}: {}", hex::encode(tag), e);
        return;
    }
    let session = Arc::new(Mutex::new(session));

    let (seal, open) = crypto.split();
    let (reader, writer) = tokio::io::split(stream);
    let (outbound, outbound_rx) = mpsc::channel(ctx.config.outbound_queue);
    let cancel = ctx.cancel.child_token();
    let handle = SessionHandle {
        peer,
        session_id,
        addr,
        initiator,
        tag,
        outbound: outbound.clone(),
        cancel: cancel.clone(),
    };
    if ctx.events.send(SessionEvent::Up(handle)).await.is_err() {
        return;
    }

    let started = Instant::now();
    let requested: Arc<DashMap<u64, Digest>> = Arc::new(DashMap::new());
    let pumps = Pumps {
        ctx: &ctx,
        peer,
        session_id,
        session: Arc::clone(&session),
        requested,
        started,
    };

    let outcome = tokio::select! {
        r = pumps.read(reader, open, outbound) => r,
        r = pumps.write(writer, seal, outbound_rx, cancel) => r,
    };

    let (reason, protocol_error) = match outcome {
        Ok(reason) => (reason, false),
        Err(e) => {
            let protocol = matches!(e, SessionError::Protocol(_) | SessionError::Handshake(_));
            if protocol {
                tracing::warn!("session with {} failed: {}", peer.short(), e);
            } else {
                tracing::debug!("session with {} ended: {}", peer.short(), e);
            }
            (e.to_string(), protocol)
        }
    };

    {
        let mut session = session.lock().await;
        let _ = session.transition_to(SessionState::Closing);
        let _ = session.transition_to(SessionState::Closed);
        let stats = session.stats();
        tracing::info!(
            "session {} with {} closed after {} in / {} out messages: {}",
            hex::encode(tag),
            peer.short(),
            stats.messages_received,
            stats.messages_sent,
            reason
        );
    }
    drop(permit);
    let _ = ctx
        .events
        .send(SessionEvent::Down {
            peer,
            session_id,
            reason,
            protocol_error,
        })
        .await;
}

/// State shared by the two pumps of one session.
struct Pumps<'a> {
    ctx: &'a SessionContext,
    peer: PeerId,
    session_id: u64,
    session: Arc<Mutex<Session>>,
    /// Outstanding chunk requests, request id to digest
    requested: Arc<DashMap<u64, Digest>>,
    started: Instant,
}

impl Pumps<'_> {
    async fn write(
        &self,
        mut writer: WriteHalf<Stream>,
        mut seal: SendHalf,
        mut outbound: mpsc::Receiver<Message>,
        cancel: CancellationToken,
    ) -> Result<String, SessionError> {
        let period = (self.ctx.config.ping_interval / 2).max(Duration::from_millis(100));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => {
                    let close = Message::Close { reason: "shutting down".into() };
                    let _ = self.send(&mut writer, &mut seal, &close).await;
                    return Ok("cancelled".into());
                }
                next = outbound.recv() => match next {
                    Some(message) => message,
                    None => return Ok("controller stopped".into()),
                },
                _ = ticker.tick() => {
                    if !self.session.lock().await.needs_ping(Instant::now()) {
                        continue;
                    }
                    Message::Ping { nonce: self.elapsed_micros() }
                }
            };

            if let Message::ChunkRequest { id, digest } = &message {
                self.requested.insert(*id, *digest);
            }
            self.send(&mut writer, &mut seal, &message).await?;
            if let Message::Close { reason } = message {
                return Ok(format!("closed locally: {reason}"));
            }
        }
    }

    async fn send(
        &self,
        writer: &mut WriteHalf<Stream>,
        seal: &mut SendHalf,
        message: &Message,
    ) -> Result<(), SessionError> {
        let sealed = seal.seal(&message.encode()?)?;
        write_frame(writer, &sealed).await?;
        self.session.lock().await.record_sent(sealed.len());
        tracing::trace!("-> {} {:?}", self.peer.short(), message.tag());
        Ok(())
    }

    async fn read(
        &self,
        mut reader: ReadHalf<Stream>,
        mut open: RecvHalf,
        outbound: mpsc::Sender<Message>,
    ) -> Result<String, SessionError> {
        let idle = self.ctx.config.idle_timeout;
        loop {
            let frame = tokio::time::timeout(idle, read_frame(&mut reader, MAX_FRAME_SIZE))
                .await
                .map_err(|_| SessionError::Timeout)??;
            let Some(sealed) = frame else {
                return Err(SessionError::Closed("end of stream".into()));
            };
            let plain = open
                .open(&sealed)
                .map_err(|e| SessionError::Protocol(e.to_string()))?;
            self.session.lock().await.record_received(sealed.len());

            let message = Message::decode(&plain)?;
            tracing::trace!("<- {} {:?}", self.peer.short(), message.tag());
            match message {
                Message::MetadataAnnounce { vector, entries } => {
                    self.forward(SessionEvent::Metadata {
                        peer: self.peer,
                        session_id: self.session_id,
                        vector,
                        entries,
                    })
                    .await?;
                }
                Message::Have { digests } => {
                    self.forward(SessionEvent::Have {
                        peer: self.peer,
                        session_id: self.session_id,
                        digests,
                    })
                    .await?;
                }
                Message::ChunkRequest { id, digest } => {
                    let data = self.serve(digest).await;
                    reply(&outbound, Message::ChunkResponse { id, digest, data }).await?;
                }
                Message::ChunkResponse { id, digest, data } => {
                    match self.requested.remove(&id) {
                        Some((_, expected)) if expected == digest => {}
                        _ => {
                            return Err(SessionError::Protocol(format!(
                                "unsolicited chunk response {id}"
                            )));
                        }
                    }
                    let event = self.receive(id, digest, data).await;
                    self.forward(event).await?;
                }
                Message::Ping { nonce } => reply(&outbound, Message::Pong { nonce }).await?,
                Message::Pong { nonce } => {
                    let rtt = self
                        .started
                        .elapsed()
                        .saturating_sub(Duration::from_micros(nonce));
                    self.forward(SessionEvent::Pong {
                        peer: self.peer,
                        rtt,
                    })
                    .await?;
                }
                Message::Close { reason } => return Ok(format!("closed by peer: {reason}")),
            }
        }
    }

    /// Chunk bytes for a request, if this folder may hand them out.
    async fn serve(&self, digest: Digest) -> Option<Vec<u8>> {
        let referenced = self.ctx.snapshot.borrow().references(&digest);
        if !referenced {
            tracing::debug!(
                "{} asked for unreferenced chunk {}",
                self.peer.short(),
                digest.short()
            );
            return None;
        }
        let store = Arc::clone(&self.ctx.store);
        match tokio::task::spawn_blocking(move || store.get(&digest)).await {
            Ok(Ok(bytes)) => Some(bytes),
            Ok(Err(e)) => {
                tracing::warn!("cannot serve chunk {}: {}", digest.short(), e);
                None
            }
            Err(e) => {
                tracing::warn!("chunk read task failed: {}", e);
                None
            }
        }
    }

    /// Verify and store a response; the resulting event for the controller.
    async fn receive(&self, request_id: u64, digest: Digest, data: Option<Vec<u8>>) -> SessionEvent {
        let failed = |integrity| SessionEvent::ChunkFailed {
            peer: self.peer,
            request_id,
            digest,
            integrity,
        };
        let Some(bytes) = data else {
            return failed(false);
        };
        let len = bytes.len() as u64;
        let store = Arc::clone(&self.ctx.store);
        match tokio::task::spawn_blocking(move || store.put_verified(&digest, &bytes)).await {
            Ok(Ok(())) => SessionEvent::ChunkStored {
                peer: self.peer,
                request_id,
                digest,
                bytes: len,
            },
            Ok(Err(FilesError::Integrity { actual, .. })) => {
                tracing::warn!(
                    "{} sent corrupt chunk {} (hashes to {})",
                    self.peer.short(),
                    digest.short(),
                    actual.short()
                );
                failed(true)
            }
            Ok(Err(e)) => {
                tracing::warn!("storing chunk {} failed: {}", digest.short(), e);
                failed(false)
            }
            Err(e) => {
                tracing::warn!("chunk write task failed: {}", e);
                failed(false)
            }
        }
    }

    async fn forward(&self, event: SessionEvent) -> Result<(), SessionError> {
        self.ctx
            .events
            .send(event)
            .await
            .map_err(|_| SessionError::Closed(format!("folder {} stopped", self.ctx.folder_id.short())))
    }

    fn elapsed_micros(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

async fn reply(outbound: &mpsc::Sender<Message>, message: Message) -> Result<(), SessionError> {
    outbound
        .send(message)
        .await
        .map_err(|_| SessionError::Closed("writer stopped".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LocalChange;
    use tessera_files::{ChunkRef, FileManifest};
    use tokio::sync::Semaphore;

    const FOLDER: FolderId = FolderId::from_bytes([7u8; 32]);

    fn key(n: u8) -> DeviceKey {
        DeviceKey::from_seed(&[n; 32])
    }

    fn pipe() -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Connection {
                stream: Box::new(a),
                peer_addr: "127.0.0.1:1000".parse().unwrap(),
            },
            Connection {
                stream: Box::new(b),
                peer_addr: "127.0.0.1:2000".parse().unwrap(),
            },
        )
    }

    async fn establish(
        alice: &DeviceKey,
        bob: &DeviceKey,
        bob_trust: TrustPolicy,
    ) -> (
        Result<Authenticated, SessionError>,
        Result<Authenticated, SessionError>,
    ) {
        let (left, mut right) = pipe();
        let config = SessionConfig::default();
        let trust = TrustPolicy::Expect(bob.peer_id());
        tokio::join!(dial(left, alice, FOLDER, trust, &config), async {
            let (hello, bytes) = read_hello(&mut right.stream, config.handshake_timeout).await?;
            assert_eq!(hello.folder_id, FOLDER);
            accept(right, &bytes, bob, FOLDER, bob_trust, &config).await
        })
    }

    #[tokio::test]
    async fn test_handshake_authenticates_both_sides() {
        let (alice, bob) = (key(1), key(2));
        let (a, b) = establish(&alice, &bob, TrustPolicy::AnyOf(vec![])).await;
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.peer(), bob.peer_id());
        assert_eq!(b.peer(), alice.peer_id());
        assert_eq!(a.initiator, alice.peer_id());
        assert_eq!(b.initiator, alice.peer_id());
        assert_eq!(a.tag, b.tag);
        assert_eq!(a.session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_untrusted_initiator_rejected() {
        let (alice, bob) = (key(1), key(2));
        let only_carol = TrustPolicy::AnyOf(vec![key(3).peer_id()]);
        let (a, b) = establish(&alice, &bob, only_carol).await;
        assert!(matches!(b, Err(SessionError::Handshake(_))));
        assert!(a.is_err());
    }

    #[test]
    fn test_duplicate_resolution_is_symmetric() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = |initiator: u8, id: u64| SessionHandle {
            peer: PeerId::from_bytes([9u8; 32]),
            session_id: id,
            addr: "127.0.0.1:1".parse().unwrap(),
            initiator: PeerId::from_bytes([initiator; 32]),
            tag: [0u8; 8],
            outbound: tx.clone(),
            cancel: CancellationToken::new(),
        };
        let from_low = handle(1, 1);
        let from_high = handle(2, 2);
        assert!(replaces(&from_high, &from_low));
        assert!(!replaces(&from_low, &from_high));
        assert!(replaces(&handle(1, 1), &handle(1, 3)));
    }

    struct Side {
        events: mpsc::Receiver<SessionEvent>,
        _snapshot: watch::Sender<Arc<FolderState>>,
        _dir: tempfile::TempDir,
        store: Arc<ChunkStore>,
    }

    fn side(
        auth: Authenticated,
        state: FolderState,
        permits: &Arc<Semaphore>,
    ) -> Side {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ChunkStore::open(dir.path().join("chunks")).unwrap());
        let (snapshot_tx, snapshot) = watch::channel(Arc::new(state));
        let (events_tx, events) = mpsc::channel(64);
        let ctx = SessionContext {
            folder_id: FOLDER,
            config: SessionConfig::default(),
            store: Arc::clone(&store),
            snapshot,
            events: events_tx,
            cancel: CancellationToken::new(),
        };
        let permit = Arc::clone(permits).try_acquire_owned().unwrap();
        tokio::spawn(run(auth, ctx, permit));
        Side {
            events,
            _snapshot: snapshot_tx,
            _dir: dir,
            store,
        }
    }

    #[tokio::test]
    async fn test_chunk_request_served_and_verified() {
        let (alice, bob) = (key(1), key(2));
        let (a, b) = establish(&alice, &bob, TrustPolicy::AnyOf(vec![])).await;
        let permits = Arc::new(Semaphore::new(4));

        let content = b"chunk served over an encrypted session".to_vec();
        let digest = Digest::of(&content);
        let manifest = FileManifest::new(
            "doc.txt".into(),
            1,
            0o644,
            vec![ChunkRef {
                digest,
                size: content.len() as u32,
            }],
        );
        let mut bob_state = FolderState::new(FOLDER);
        let mut vector = VersionVector::new();
        let entry = bob_state.prepare_local(
            bob.peer_id(),
            LocalChange::Upsert(manifest),
            1,
            &mut vector,
        );
        bob_state.put(entry);

        let mut alice_side = side(a.unwrap(), FolderState::new(FOLDER), &permits);
        let bob_side = side(b.unwrap(), bob_state, &permits);
        bob_side.store.put(&content).unwrap();

        let SessionEvent::Up(handle) = alice_side.events.recv().await.unwrap() else {
            panic!("expected Up");
        };
        assert_eq!(handle.peer, bob.peer_id());
        assert!(handle.send(Message::ChunkRequest { id: 1, digest }));
        let unknown = Digest::of(b"not shared");
        assert!(handle.send(Message::ChunkRequest {
            id: 2,
            digest: unknown
        }));

        match alice_side.events.recv().await.unwrap() {
            SessionEvent::ChunkStored {
                request_id, bytes, ..
            } => {
                assert_eq!(request_id, 1);
                assert_eq!(bytes, content.len() as u64);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(alice_side.store.get(&digest).unwrap(), content);

        match alice_side.events.recv().await.unwrap() {
            SessionEvent::ChunkFailed {
                request_id,
                integrity,
                ..
            } => {
                assert_eq!(request_id, 2);
                assert!(!integrity);
            }
            other => panic!("unexpected {other:?}"),
        }

        handle.close("test done");
        match alice_side.events.recv().await.unwrap() {
            SessionEvent::Down { reason, protocol_error, .. } => {
                assert!(reason.contains("test done"));
                assert!(!protocol_error);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(permits.available_permits(), 3);
    }
}
