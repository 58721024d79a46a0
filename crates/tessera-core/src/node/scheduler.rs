//! Chunk transfer scheduling.
//!
//! The scheduler decides which wanted chunk to request from which connected
//! peer. It is a plain state machine driven by the folder controller: the
//! controller feeds it wants, `Have` announcements, completions, failures
//! and clock ticks, and sends whatever [`TransferScheduler::next_requests`]
//! hands back.
//!
//! Limits: at most `max_in_flight` outstanding requests per folder and at
//! most each peer's effective concurrency per peer. A failed or timed-out
//! request is retried after exponential backoff, preferably on a peer not
//! tried yet; after `max_retries` failures the chunk is `Unavailable` until
//! a new source shows up or it is wanted again.

use crate::node::config::TransferConfig;
use crate::node::peer::PeerPerformance;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tessera_crypto::{Digest, PeerId};

/// Where a transfer task stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for a source with capacity
    Queued,
    /// Requested from `peer`
    InFlight {
        /// Peer asked
        peer: PeerId,
        /// Correlates the response
        request_id: u64,
        /// When the request went out
        since: Instant,
    },
    /// Last attempt failed; waiting out the backoff
    Failed,
    /// Retries exhausted
    Unavailable,
}

/// A pending request for one chunk
#[derive(Debug, Clone)]
pub struct TransferTask {
    /// Wanted chunk
    pub digest: Digest,
    /// Current state
    pub state: TaskState,
    /// Failed attempts so far
    pub attempts: u32,
    /// Peers already asked
    pub tried: HashSet<PeerId>,
    /// Backoff deadline
    pub not_before: Option<Instant>,
}

impl TransferTask {
    fn new(digest: Digest) -> Self {
        Self {
            digest,
            state: TaskState::Queued,
            attempts: 0,
            tried: HashSet::new(),
            not_before: None,
        }
    }

    fn ready(&self, now: Instant) -> bool {
        match self.state {
            TaskState::Queued => true,
            TaskState::Failed => self.not_before.is_none_or(|t| now >= t),
            TaskState::InFlight { .. } | TaskState::Unavailable => false,
        }
    }
}

/// A request the controller should send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedRequest {
    /// Peer to ask
    pub peer: PeerId,
    /// Chunk to ask for
    pub digest: Digest,
    /// Request id to put on the wire
    pub request_id: u64,
}

/// Result of reporting a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Will be retried after `Duration`
    Retry(Duration),
    /// Retries exhausted
    Unavailable,
    /// No such request was outstanding
    Stale,
}

/// Counters for progress reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks not yet done, unavailable ones included
    pub wanted: usize,
    /// Requests outstanding
    pub in_flight: usize,
    /// Tasks given up on
    pub unavailable: usize,
    /// Chunks fetched since creation
    pub completed: u64,
    /// Bytes fetched since creation
    pub bytes: u64,
}

/// Per-folder transfer scheduler
#[derive(Debug)]
pub struct TransferScheduler {
    config: TransferConfig,
    tasks: HashMap<Digest, TransferTask>,
    peers: HashMap<PeerId, PeerPerformance>,
    availability: HashMap<PeerId, HashSet<Digest>>,
    next_request_id: u64,
    in_flight: usize,
    completed: u64,
    bytes: u64,
}

impl TransferScheduler {
    /// Create an empty scheduler
    #[must_use]
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            tasks: HashMap::new(),
            peers: HashMap::new(),
            availability: HashMap::new(),
            next_request_id: 1,
            in_flight: 0,
            completed: 0,
            bytes: 0,
        }
    }

    /// Ask for a chunk. Returns `true` if it was not wanted before.
    /// Re-wanting an unavailable chunk gives it a fresh set of retries.
    pub fn want(&mut self, digest: Digest) -> bool {
        match self.tasks.get_mut(&digest) {
            Some(task) => {
                if task.state == TaskState::Unavailable {
                    *task = TransferTask::new(digest);
                }
                false
            }
            None => {
                self.tasks.insert(digest, TransferTask::new(digest));
                true
            }
        }
    }

    /// Stop wanting a chunk, e.g. because the entry needing it was superseded.
    pub fn forget(&mut self, digest: &Digest) {
        if let Some(task) = self.tasks.remove(digest) {
            if let TaskState::InFlight { peer, .. } = task.state {
                self.release(&peer);
            }
        }
    }

    /// Whether the chunk is wanted
    #[must_use]
    pub fn is_wanted(&self, digest: &Digest) -> bool {
        self.tasks.contains_key(digest)
    }

    /// Every chunk currently wanted, unavailable ones included
    pub fn wanted(&self) -> impl Iterator<Item = &Digest> {
        self.tasks.keys()
    }

    /// A session to `peer` became active
    pub fn peer_connected(&mut self, peer: PeerId) {
        let limit = self.config.max_in_flight_per_peer;
        self.peers
            .entry(peer)
            .or_insert_with(|| PeerPerformance::new(peer, limit));
        self.availability.entry(peer).or_default();
    }

    /// The session to `peer` ended; its requests go back to the queue
    /// without counting as failures.
    pub fn peer_disconnected(&mut self, peer: &PeerId) {
        self.availability.remove(peer);
        let mut released = 0;
        for task in self.tasks.values_mut() {
            if matches!(task.state, TaskState::InFlight { peer: p, .. } if p == *peer) {
                task.state = TaskState::Queued;
                released += 1;
            }
        }
        self.in_flight -= released;
        if let Some(perf) = self.peers.get_mut(peer) {
            perf.in_flight = 0;
        }
    }

    /// Record that `peer` can serve `digests`.
    ///
    /// Unavailable chunks served by the new source are queued again.
    pub fn add_sources<I: IntoIterator<Item = Digest>>(&mut self, peer: PeerId, digests: I) {
        let Some(known) = self.availability.get_mut(&peer) else {
            return;
        };
        for digest in digests {
            if known.insert(digest) {
                if let Some(task) = self.tasks.get_mut(&digest) {
                    if task.state == TaskState::Unavailable {
                        tracing::debug!("chunk {} has a new source {}", digest.short(), peer.short());
                        *task = TransferTask::new(digest);
                    }
                }
            }
        }
    }

    /// Update a peer's RTT estimate
    pub fn record_rtt(&mut self, peer: &PeerId, rtt: Duration) {
        if let Some(perf) = self.peers.get_mut(peer) {
            perf.update_rtt(rtt);
        }
    }

    /// Pick requests to send now, best-scoring peers first.
    pub fn next_requests(&mut self, now: Instant) -> Vec<PlannedRequest> {
        let mut planned = Vec::new();
        if self.in_flight >= self.config.max_in_flight {
            return planned;
        }

        let mut ready: Vec<Digest> = self
            .tasks
            .values()
            .filter(|t| t.ready(now))
            .map(|t| t.digest)
            .collect();
        // Stable order keeps scheduling reproducible
        ready.sort_unstable();

        for digest in ready {
            if self.in_flight >= self.config.max_in_flight {
                break;
            }
            let Some(peer) = self.pick_peer(&digest) else {
                continue;
            };
            let request_id = self.next_request_id;
            self.next_request_id += 1;
            if let Some(task) = self.tasks.get_mut(&digest) {
                task.state = TaskState::InFlight {
                    peer,
                    request_id,
                    since: now,
                };
                task.tried.insert(peer);
            }
            if let Some(perf) = self.peers.get_mut(&peer) {
                perf.record_assignment();
            }
            self.in_flight += 1;
            planned.push(PlannedRequest {
                peer,
                digest,
                request_id,
            });
        }
        planned
    }

    fn pick_peer(&self, digest: &Digest) -> Option<PeerId> {
        let task = self.tasks.get(digest)?;
        self.availability
            .iter()
            .filter(|(_, have)| have.contains(digest))
            .filter_map(|(peer, _)| self.peers.get(peer))
            .filter(|perf| perf.has_capacity())
            .max_by(|a, b| {
                let fresh_a = !task.tried.contains(&a.peer_id);
                let fresh_b = !task.tried.contains(&b.peer_id);
                fresh_a
                    .cmp(&fresh_b)
                    .then_with(|| a.performance_score().total_cmp(&b.performance_score()))
                    .then_with(|| b.peer_id.cmp(&a.peer_id))
            })
            .map(|perf| perf.peer_id)
    }

    /// A verified chunk arrived. Returns `false` if it was not wanted.
    pub fn complete(&mut self, digest: &Digest, peer: &PeerId, bytes: u64, now: Instant) -> bool {
        let Some(task) = self.tasks.remove(digest) else {
            return false;
        };
        if let TaskState::InFlight {
            peer: asked, since, ..
        } = task.state
        {
            self.in_flight -= 1;
            if let Some(perf) = self.peers.get_mut(&asked) {
                if asked == *peer {
                    perf.record_success(bytes, now.saturating_duration_since(since));
                } else {
                    perf.release();
                }
            }
        }
        self.completed += 1;
        self.bytes += bytes;
        true
    }

    /// The request `request_id` for `digest` failed at `peer` (miss,
    /// integrity failure or timeout).
    pub fn fail(&mut self, digest: &Digest, request_id: u64, now: Instant) -> FailureOutcome {
        let Some(task) = self.tasks.get_mut(digest) else {
            return FailureOutcome::Stale;
        };
        let TaskState::InFlight {
            peer,
            request_id: current,
            ..
        } = task.state
        else {
            return FailureOutcome::Stale;
        };
        if current != request_id {
            return FailureOutcome::Stale;
        }

        self.in_flight -= 1;
        if let Some(perf) = self.peers.get_mut(&peer) {
            perf.record_failure();
        }
        task.attempts += 1;
        if task.attempts > self.config.retry.max_retries {
            task.state = TaskState::Unavailable;
            task.not_before = None;
            tracing::warn!(
                "chunk {} unavailable after {} attempts",
                digest.short(),
                task.attempts
            );
            return FailureOutcome::Unavailable;
        }
        let backoff = self.config.retry.backoff_duration(task.attempts - 1);
        task.state = TaskState::Failed;
        task.not_before = Some(now + backoff);
        tracing::debug!(
            "chunk {} failed at {} (attempt {}), retry in {:?}",
            digest.short(),
            peer.short(),
            task.attempts,
            backoff
        );
        FailureOutcome::Retry(backoff)
    }

    /// Fail requests outstanding longer than the request timeout.
    /// Returns the chunks that became unavailable.
    pub fn expire(&mut self, now: Instant) -> Vec<Digest> {
        let timeout = self.config.request_timeout;
        let expired: Vec<(Digest, u64)> = self
            .tasks
            .values()
            .filter_map(|t| match t.state {
                TaskState::InFlight {
                    since, request_id, ..
                } if now.saturating_duration_since(since) >= timeout => Some((t.digest, request_id)),
                _ => None,
            })
            .collect();

        expired
            .into_iter()
            .filter(|(digest, request_id)| {
                tracing::debug!("request {} for {} timed out", request_id, digest.short());
                self.fail(digest, *request_id, now) == FailureOutcome::Unavailable
            })
            .map(|(digest, _)| digest)
            .collect()
    }

    /// Current task for `digest`
    #[must_use]
    pub fn task(&self, digest: &Digest) -> Option<&TransferTask> {
        self.tasks.get(digest)
    }

    /// Performance of `peer`
    #[must_use]
    pub fn peer(&self, peer: &PeerId) -> Option<&PeerPerformance> {
        self.peers.get(peer)
    }

    /// Progress counters
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            wanted: self.tasks.len(),
            in_flight: self.in_flight,
            unavailable: self
                .tasks
                .values()
                .filter(|t| t.state == TaskState::Unavailable)
                .count(),
            completed: self.completed,
            bytes: self.bytes,
        }
    }

    fn release(&mut self, peer: &PeerId) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if let Some(perf) = self.peers.get_mut(peer) {
            perf.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::config::RetryConfig;

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn config() -> TransferConfig {
        TransferConfig {
            max_in_flight_per_peer: 2,
            max_in_flight: 3,
            request_timeout: Duration::from_secs(5),
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(1),
                multiplier: 2.0,
                jitter: false,
            },
        }
    }

    fn digests(n: u8) -> Vec<Digest> {
        (0..n).map(|i| Digest::of(&[i])).collect()
    }

    #[test]
    fn test_no_source_no_request() {
        let mut s = TransferScheduler::new(config());
        s.want(Digest::of(b"x"));
        s.peer_connected(peer(1));
        assert!(s.next_requests(Instant::now()).is_empty());

        s.add_sources(peer(1), [Digest::of(b"x")]);
        let planned = s.next_requests(Instant::now());
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].peer, peer(1));
    }

    #[test]
    fn test_limits_respected() {
        let mut s = TransferScheduler::new(config());
        let wanted = digests(6);
        for d in &wanted {
            s.want(*d);
        }
        s.peer_connected(peer(1));
        s.peer_connected(peer(2));
        s.add_sources(peer(1), wanted.clone());
        s.add_sources(peer(2), wanted.clone());

        let planned = s.next_requests(Instant::now());
        assert_eq!(planned.len(), 3);
        let to_one = planned.iter().filter(|p| p.peer == peer(1)).count();
        assert!(to_one <= 2 && planned.len() - to_one <= 2);
        assert!(s.next_requests(Instant::now()).is_empty());
        assert_eq!(s.stats().in_flight, 3);
    }

    #[test]
    fn test_retry_prefers_other_peer() {
        let mut s = TransferScheduler::new(config());
        let d = Digest::of(b"chunk");
        s.want(d);
        s.peer_connected(peer(1));
        s.peer_connected(peer(2));
        s.add_sources(peer(1), [d]);
        s.add_sources(peer(2), [d]);

        let now = Instant::now();
        let first = s.next_requests(now)[0];
        assert_eq!(
            s.fail(&d, first.request_id, now),
            FailureOutcome::Retry(Duration::from_millis(100))
        );
        assert!(s.next_requests(now).is_empty(), "backoff not honoured");

        let later = now + Duration::from_millis(150);
        let second = s.next_requests(later)[0];
        assert_ne!(second.peer, first.peer);
        assert_eq!(s.fail(&d, first.request_id, later), FailureOutcome::Stale);
    }

    #[test]
    fn test_unavailable_after_retries_then_new_source() {
        let mut s = TransferScheduler::new(config());
        let d = Digest::of(b"rare");
        s.want(d);
        s.peer_connected(peer(1));
        s.add_sources(peer(1), [d]);

        let mut now = Instant::now();
        let mut outcome = FailureOutcome::Stale;
        for _ in 0..3 {
            let req = s.next_requests(now)[0];
            outcome = s.fail(&d, req.request_id, now);
            now += Duration::from_secs(2);
        }
        assert_eq!(outcome, FailureOutcome::Unavailable);
        assert_eq!(s.stats().unavailable, 1);
        assert!(s.next_requests(now).is_empty());

        s.peer_connected(peer(2));
        s.add_sources(peer(2), [d]);
        assert_eq!(s.task(&d).unwrap().state, TaskState::Queued);
        assert_eq!(s.next_requests(now)[0].peer, peer(2));
    }

    #[test]
    fn test_timeout_and_disconnect_requeue() {
        let mut s = TransferScheduler::new(config());
        let wanted = digests(2);
        for d in &wanted {
            s.want(*d);
        }
        s.peer_connected(peer(1));
        s.add_sources(peer(1), wanted.clone());
        let now = Instant::now();
        assert_eq!(s.next_requests(now).len(), 2);

        assert!(s.expire(now + Duration::from_secs(6)).is_empty());
        assert_eq!(s.task(&wanted[0]).unwrap().attempts, 1);
        assert_eq!(s.stats().in_flight, 0);

        // Two failures out of two: the peer is down to one slot.
        let again = s.next_requests(now + Duration::from_secs(7));
        assert_eq!(again.len(), 1);
        s.peer_disconnected(&peer(1));
        assert_eq!(s.stats().in_flight, 0);
        let requeued = s.task(&again[0].digest).unwrap();
        assert_eq!(requeued.state, TaskState::Queued);
        assert_eq!(requeued.attempts, 1);
    }

    #[test]
    fn test_complete_updates_stats() {
        let mut s = TransferScheduler::new(config());
        let d = Digest::of(b"done");
        s.want(d);
        s.peer_connected(peer(1));
        s.add_sources(peer(1), [d]);
        let now = Instant::now();
        s.next_requests(now);
        assert!(s.complete(&d, &peer(1), 4096, now + Duration::from_millis(20)));
        assert!(!s.complete(&d, &peer(1), 4096, now));
        let stats = s.stats();
        assert_eq!((stats.wanted, stats.in_flight, stats.completed, stats.bytes), (0, 0, 1, 4096));
        assert_eq!(s.peer(&peer(1)).unwrap().chunks_succeeded, 1);
    }
}
