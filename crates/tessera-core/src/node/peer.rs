//! Per-peer transfer performance.
//!
//! Scores feed peer selection in the transfer scheduler: reliable, fast,
//! close peers are asked first, and peers that keep failing are given fewer
//! concurrent requests.

use std::time::{Duration, Instant};
use tessera_crypto::PeerId;

/// Failure rate above which a peer's concurrency is halved.
pub const FAILURE_RATE_LIMIT: f64 = 0.2;

/// Peer performance metrics
#[derive(Debug, Clone)]
pub struct PeerPerformance {
    /// Peer ID
    pub peer_id: PeerId,

    /// Smoothed round-trip time in microseconds
    pub rtt_us: u64,

    /// Smoothed throughput in bytes per second
    pub throughput_bps: u64,

    /// Chunks received and verified
    pub chunks_succeeded: usize,

    /// Chunks missing, corrupt or timed out
    pub chunks_failed: usize,

    /// Last activity timestamp
    pub last_active: Instant,

    /// Requests currently outstanding
    pub in_flight: usize,

    /// Configured per-peer request limit
    pub max_concurrent: usize,
}

impl PeerPerformance {
    /// Create new peer performance tracker
    #[must_use]
    pub fn new(peer_id: PeerId, max_concurrent: usize) -> Self {
        Self {
            peer_id,
            rtt_us: 100_000,           // 100ms until measured
            throughput_bps: 1_000_000, // 1 MB/s until measured
            chunks_succeeded: 0,
            chunks_failed: 0,
            last_active: Instant::now(),
            in_flight: 0,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Calculate failure rate
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.chunks_succeeded + self.chunks_failed;
        if total == 0 {
            0.0
        } else {
            self.chunks_failed as f64 / total as f64
        }
    }

    /// Calculate reliability score (0.0 to 1.0)
    #[must_use]
    pub fn reliability_score(&self) -> f64 {
        1.0 - self.failure_rate()
    }

    /// Throughput normalized against 100 MB/s
    #[must_use]
    pub fn speed_score(&self) -> f64 {
        let max_bps = 100 * 1024 * 1024;
        (self.throughput_bps as f64 / f64::from(max_bps)).min(1.0)
    }

    /// RTT normalized against one second, lower is better
    #[must_use]
    pub fn latency_score(&self) -> f64 {
        let max_rtt = 1_000_000.0;
        1.0 - (self.rtt_us as f64 / max_rtt).min(1.0)
    }

    /// Calculate overall performance score
    #[must_use]
    pub fn performance_score(&self) -> f64 {
        0.4 * self.reliability_score() + 0.4 * self.speed_score() + 0.2 * self.latency_score()
    }

    /// Request limit after failure penalties
    #[must_use]
    pub fn effective_concurrency(&self) -> usize {
        if self.failure_rate() > FAILURE_RATE_LIMIT {
            (self.max_concurrent / 2).max(1)
        } else {
            self.max_concurrent
        }
    }

    /// Check if peer has capacity for more chunks
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.in_flight < self.effective_concurrency()
    }

    /// Update RTT measurement
    pub fn update_rtt(&mut self, rtt: Duration) {
        let rtt_us = u64::try_from(rtt.as_micros()).unwrap_or(u64::MAX);
        let alpha = 0.125;
        self.rtt_us = ((1.0 - alpha) * self.rtt_us as f64 + alpha * rtt_us as f64) as u64;
    }

    /// Update throughput measurement
    pub fn update_throughput(&mut self, bytes: u64, duration: Duration) {
        let secs = duration.as_secs_f64().max(1e-6);
        let bps = (bytes as f64 / secs) as u64;
        let alpha = 0.25;
        self.throughput_bps =
            ((1.0 - alpha) * self.throughput_bps as f64 + alpha * bps as f64) as u64;
    }

    /// Record chunk assignment
    pub fn record_assignment(&mut self) {
        self.in_flight += 1;
    }

    /// Record successful chunk
    pub fn record_success(&mut self, bytes: u64, elapsed: Duration) {
        self.chunks_succeeded += 1;
        self.last_active = Instant::now();
        self.in_flight = self.in_flight.saturating_sub(1);
        self.update_throughput(bytes, elapsed);
    }

    /// Record failed chunk
    pub fn record_failure(&mut self) {
        self.chunks_failed += 1;
        self.last_active = Instant::now();
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Release a slot without judging the peer (session dropped)
    pub fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perf() -> PeerPerformance {
        PeerPerformance::new(PeerId::from_bytes([1u8; 32]), 8)
    }

    #[test]
    fn test_failure_rate_halves_concurrency() {
        let mut p = perf();
        assert_eq!(p.effective_concurrency(), 8);
        for _ in 0..8 {
            p.record_success(1024, Duration::from_millis(10));
        }
        p.record_failure();
        assert!(p.failure_rate() <= FAILURE_RATE_LIMIT);
        assert_eq!(p.effective_concurrency(), 8);

        p.record_failure();
        p.record_failure();
        assert!(p.failure_rate() > FAILURE_RATE_LIMIT);
        assert_eq!(p.effective_concurrency(), 4);
    }

    #[test]
    fn test_concurrency_floor() {
        let mut p = PeerPerformance::new(PeerId::from_bytes([1u8; 32]), 1);
        p.record_failure();
        assert_eq!(p.effective_concurrency(), 1);
        p.record_assignment();
        assert!(!p.has_capacity());
    }

    #[test]
    fn test_scores_prefer_reliable_fast_peers() {
        let mut good = perf();
        let mut bad = perf();
        for _ in 0..4 {
            good.record_success(4 * 1024 * 1024, Duration::from_millis(50));
            bad.record_failure();
        }
        good.update_rtt(Duration::from_millis(5));
        bad.update_rtt(Duration::from_millis(500));
        assert!(good.performance_score() > bad.performance_score());
        assert!(good.latency_score() > bad.latency_score());
    }
}
