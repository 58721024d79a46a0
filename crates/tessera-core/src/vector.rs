//! Version vectors.
//!
//! A vector maps each replica id to the number of mutations that replica has
//! made. Vectors are partially ordered pointwise; two vectors where each has
//! a counter the other lacks are concurrent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_crypto::PeerId;

/// Causal relation between two vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// Same history
    Equal,
    /// Left has seen everything right has, and more
    Dominates,
    /// Right has seen everything left has, and more
    DominatedBy,
    /// Neither has seen all of the other
    Concurrent,
}

/// Replica id to mutation counter. Absent replicas count as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionVector(BTreeMap<PeerId, u64>);

impl VersionVector {
    /// Empty vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `replica`.
    #[must_use]
    pub fn get(&self, replica: &PeerId) -> u64 {
        self.0.get(replica).copied().unwrap_or(0)
    }

    /// Raise `replica`'s counter to at least `value`.
    pub fn observe(&mut self, replica: PeerId, value: u64) {
        if value == 0 {
            return;
        }
        let slot = self.0.entry(replica).or_insert(0);
        *slot = (*slot).max(value);
    }

    /// Bump `replica`'s counter and return the new value.
    pub fn increment(&mut self, replica: PeerId) -> u64 {
        let slot = self.0.entry(replica).or_insert(0);
        *slot = slot.saturating_add(1);
        *slot
    }

    /// Pointwise maximum, in place.
    pub fn join(&mut self, other: &VersionVector) {
        for (replica, &value) in &other.0 {
            self.observe(*replica, value);
        }
    }

    /// Pointwise maximum of two vectors.
    #[must_use]
    pub fn joined(&self, other: &VersionVector) -> VersionVector {
        let mut out = self.clone();
        out.join(other);
        out
    }

    /// Compare two vectors.
    #[must_use]
    pub fn compare(&self, other: &VersionVector) -> Causality {
        let mut ahead = false;
        let mut behind = false;
        for replica in self.0.keys().chain(other.0.keys()) {
            let (a, b) = (self.get(replica), other.get(replica));
            ahead |= a > b;
            behind |= a < b;
            if ahead && behind {
                return Causality::Concurrent;
            }
        }
        match (ahead, behind) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Dominates,
            (false, true) => Causality::DominatedBy,
            (true, true) => Causality::Concurrent,
        }
    }

    /// Strictly newer than `other`.
    #[must_use]
    pub fn dominates(&self, other: &VersionVector) -> bool {
        self.compare(other) == Causality::Dominates
    }

    /// Newer than or equal to `other`.
    #[must_use]
    pub fn descends(&self, other: &VersionVector) -> bool {
        matches!(
            self.compare(other),
            Causality::Dominates | Causality::Equal
        )
    }

    /// No counters recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Non-zero counters in replica order.
    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &u64)> {
        self.0.iter()
    }
}

impl FromIterator<(PeerId, u64)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (PeerId, u64)>>(iter: I) -> Self {
        let mut vector = Self::new();
        for (replica, value) in iter {
            vector.observe(replica, value);
        }
        vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn vv(pairs: &[(u8, u64)]) -> VersionVector {
        pairs.iter().map(|&(p, v)| (peer(p), v)).collect()
    }

    #[test]
    fn test_compare() {
        assert_eq!(vv(&[(1, 1)]).compare(&vv(&[(1, 1)])), Causality::Equal);
        assert_eq!(vv(&[(1, 2)]).compare(&vv(&[(1, 1)])), Causality::Dominates);
        assert_eq!(
            vv(&[(1, 1)]).compare(&vv(&[(1, 1), (2, 1)])),
            Causality::DominatedBy
        );
        assert_eq!(
            vv(&[(1, 2)]).compare(&vv(&[(1, 1), (2, 1)])),
            Causality::Concurrent
        );
        assert_eq!(VersionVector::new().compare(&vv(&[])), Causality::Equal);
    }

    #[test]
    fn test_zero_counters_ignored() {
        let mut a = vv(&[(1, 0)]);
        assert!(a.is_empty());
        assert_eq!(a, VersionVector::new());
        a.observe(peer(2), 3);
        a.observe(peer(2), 1);
        assert_eq!(a.get(&peer(2)), 3);
    }

    #[test]
    fn test_join_dominates_both() {
        let a = vv(&[(1, 2), (2, 1)]);
        let b = vv(&[(1, 1), (3, 4)]);
        let j = a.joined(&b);
        assert_eq!(j, vv(&[(1, 2), (2, 1), (3, 4)]));
        assert!(j.dominates(&a));
        assert!(j.dominates(&b));
        assert!(j.descends(&j));
    }

    #[test]
    fn test_increment() {
        let mut a = VersionVector::new();
        assert_eq!(a.increment(peer(1)), 1);
        assert_eq!(a.increment(peer(1)), 2);
        assert_eq!(a.get(&peer(1)), 2);
        assert_eq!(a.get(&peer(9)), 0);
    }
}
