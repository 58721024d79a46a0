//! Merge engine.
//!
//! Reconciles one remote entry against the local entry for the same path.
//!
//! | local vs remote | result |
//! |-----------------|--------|
//! | remote dominates | take remote |
//! | equal, or local dominates | ignore |
//! | concurrent | keep every version neither side has superseded |
//!
//! Among the surviving versions a file beats a tombstone, and files are
//! ordered by the tie-break. The winner is what the path shows; losers stay
//! on the entry as siblings until a later write supersedes them, and each
//! losing file is also kept as a conflict copy. Because the surviving set
//! is a union with superseded versions removed, replicas converge on the
//! same entry whatever order snapshots arrive in.

use crate::state::{Entry, EntryKind, Version};
use crate::vector::Causality;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tessera_crypto::{Digest, PeerId};
use tessera_files::FileManifest;
use tessera_files::path::split_extension;

/// How concurrent edits of the same file are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Later timestamp, then larger content digest, then larger origin id
    #[default]
    Timestamp,
    /// Larger content digest, then larger origin id, then later timestamp
    Digest,
}

/// What to do with the local entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Remote is stale or already known
    Ignore,
    /// Adopt this entry; the content at the path changes
    TakeRemote(Entry),
    /// Local content stays; record this entry (local with merged history)
    KeepLocal(Entry),
}

/// The losing side of a concurrent edit, to be kept under a new name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictCopy {
    /// Path the winner occupies
    pub original: String,
    /// Manifest of the losing content, already moved to the conflict path
    pub manifest: FileManifest,
    /// Replica that wrote the losing content
    pub loser_origin: PeerId,
    /// Replica that wrote the winning content
    pub winner_origin: PeerId,
    /// Whether the losing content came from the remote side
    pub from_remote: bool,
}

/// Result of merging one remote entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Action on the path
    pub resolution: Resolution,
    /// Conflict copies to create for content that lost at the path
    pub conflicts: Vec<ConflictCopy>,
}

impl MergeOutcome {
    fn plain(resolution: Resolution) -> Self {
        Self {
            resolution,
            conflicts: Vec::new(),
        }
    }
}

/// Deterministic per-path merge.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeEngine {
    tie_break: TieBreak,
}

impl MergeEngine {
    /// Engine with the given tie-break policy.
    #[must_use]
    pub fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }

    /// Tie-break in use.
    #[must_use]
    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Merge `remote` into the path currently holding `local`.
    #[must_use]
    pub fn merge(&self, local: Option<&Entry>, remote: &Entry) -> MergeOutcome {
        let Some(local) = local else {
            return MergeOutcome::plain(Resolution::TakeRemote(remote.clone()));
        };
        match remote.vector.compare(&local.vector) {
            Causality::Dominates => MergeOutcome::plain(Resolution::TakeRemote(remote.clone())),
            Causality::Equal | Causality::DominatedBy => MergeOutcome::plain(Resolution::Ignore),
            Causality::Concurrent => self.concurrent(local, remote),
        }
    }

    /// Entry the path ends up with after merging `remote`.
    #[must_use]
    pub fn resolve(&self, local: Option<&Entry>, remote: &Entry) -> Option<Entry> {
        match self.merge(local, remote).resolution {
            Resolution::Ignore => local.cloned(),
            Resolution::TakeRemote(e) | Resolution::KeepLocal(e) => Some(e),
        }
    }

    /// Merge a batch of remote entries into a path map, returning the
    /// conflict copies that should be created.
    pub fn merge_into(
        &self,
        entries: &mut BTreeMap<String, Entry>,
        remote: &[Entry],
    ) -> Vec<ConflictCopy> {
        let mut conflicts = Vec::new();
        for incoming in remote {
            let outcome = self.merge(entries.get(&incoming.path), incoming);
            match outcome.resolution {
                Resolution::Ignore => {}
                Resolution::TakeRemote(e) | Resolution::KeepLocal(e) => {
                    entries.insert(e.path.clone(), e);
                }
            }
            conflicts.extend(outcome.conflicts);
        }
        conflicts
    }

    fn concurrent(&self, local: &Entry, remote: &Entry) -> MergeOutcome {
        // Local copies first so a version known to both keeps local metadata.
        let mut known: Vec<Version> = Vec::new();
        for version in local.versions().into_iter().chain(remote.versions()) {
            if !known.iter().any(|k| k.dot() == version.dot()) {
                known.push(version);
            }
        }
        let mut live: Vec<Version> = known
            .iter()
            .filter(|v| !known.iter().any(|other| other.vector.dominates(&v.vector)))
            .cloned()
            .collect();
        live.sort_by_key(Version::dot);

        let mut best = 0;
        for i in 1..live.len() {
            if self.beats(&live[i], &live[best]) {
                best = i;
            }
        }
        let winner = live.remove(best);
        let siblings = live;

        // Versions that already lost somewhere have their copy on that replica.
        let lost_before = |v: &Version| {
            local
                .siblings
                .iter()
                .chain(&remote.siblings)
                .any(|s| s.dot() == v.dot())
        };
        let local_head = local.head().dot();
        let conflicts = match &winner.kind {
            EntryKind::File(won) => siblings
                .iter()
                .filter(|v| !lost_before(v))
                .filter_map(|v| match &v.kind {
                    EntryKind::File(lost) if !won.same_content(lost) => Some(ConflictCopy {
                        original: local.path.clone(),
                        manifest: lost.with_path(conflict_path(&local.path, &v.origin, &lost.root)),
                        loser_origin: v.origin,
                        winner_origin: winner.origin,
                        from_remote: v.dot() != local_head,
                    }),
                    _ => None,
                })
                .collect(),
            EntryKind::Tombstone => Vec::new(),
        };

        let keep_local = winner.dot() == local_head;
        let merged = Entry {
            path: local.path.clone(),
            kind: winner.kind,
            vector: local.vector.joined(&remote.vector),
            timestamp_ms: winner.timestamp_ms,
            origin: winner.origin,
            own_vector: Some(winner.vector),
            siblings,
        };
        let resolution = if keep_local {
            Resolution::KeepLocal(merged)
        } else {
            Resolution::TakeRemote(merged)
        };
        MergeOutcome {
            resolution,
            conflicts,
        }
    }

    /// Whether `a` wins over the concurrent `b`.
    fn beats(&self, a: &Version, b: &Version) -> bool {
        match (a.is_tombstone(), b.is_tombstone()) {
            (false, true) => return true,
            (true, false) => return false,
            _ => {}
        }
        let (ra, rb) = (a.content_root(), b.content_root());
        let order = match self.tie_break {
            TieBreak::Timestamp => a
                .timestamp_ms
                .cmp(&b.timestamp_ms)
                .then_with(|| ra.cmp(&rb))
                .then_with(|| a.dot().cmp(&b.dot())),
            TieBreak::Digest => ra
                .cmp(&rb)
                .then_with(|| a.dot().cmp(&b.dot()))
                .then_with(|| a.timestamp_ms.cmp(&b.timestamp_ms)),
        };
        order == Ordering::Greater
    }
}

/// Name for the losing copy of `path`:
/// `<stem>.sync-conflict-<origin8>-<digest8><.ext>`.
#[must_use]
pub fn conflict_path(path: &str, origin: &PeerId, root: &Digest) -> String {
    let (stem, ext) = split_extension(path);
    format!(
        "{stem}.sync-conflict-{}-{}{ext}",
        origin.short(),
        root.short()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::VersionVector;
    use std::collections::BTreeMap;
    use tessera_files::ChunkRef;

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn vv(pairs: &[(u8, u64)]) -> VersionVector {
        pairs.iter().map(|&(p, v)| (peer(p), v)).collect()
    }

    fn file(path: &str, content: &[u8], v: &[(u8, u64)], ts: u64, origin: u8) -> Entry {
        let manifest = FileManifest::new(
            path.to_string(),
            0,
            0o644,
            vec![ChunkRef {
                digest: Digest::of(content),
                size: content.len() as u32,
            }],
        );
        Entry::file(manifest, vv(v), ts, peer(origin))
    }

    fn tomb(path: &str, v: &[(u8, u64)], ts: u64, origin: u8) -> Entry {
        Entry::tombstone(path.to_string(), vv(v), ts, peer(origin))
    }

    #[test]
    fn test_absent_takes_remote() {
        let engine = MergeEngine::default();
        let remote = file("a.txt", b"hello", &[(1, 1)], 10, 1);
        assert_eq!(
            engine.merge(None, &remote).resolution,
            Resolution::TakeRemote(remote)
        );
    }

    #[test]
    fn test_dominance() {
        let engine = MergeEngine::default();
        let old = file("a", b"v1", &[(1, 1)], 10, 1);
        let new = file("a", b"v2", &[(1, 2)], 5, 1);
        assert_eq!(
            engine.merge(Some(&old), &new).resolution,
            Resolution::TakeRemote(new.clone())
        );
        assert_eq!(engine.merge(Some(&new), &old).resolution, Resolution::Ignore);
        assert_eq!(engine.merge(Some(&new), &new).resolution, Resolution::Ignore);
    }

    #[test]
    fn test_edit_beats_concurrent_delete() {
        let engine = MergeEngine::default();
        // Replica 1 deleted, replica 2 edited the version both had.
        let deleted = tomb("a.txt", &[(1, 2)], 100, 1);
        let edited = file("a.txt", b"world", &[(1, 1), (2, 1)], 50, 2);

        let at_1 = engine.resolve(Some(&deleted), &edited).unwrap();
        let at_2 = engine.resolve(Some(&edited), &deleted).unwrap();
        assert_eq!(at_1, at_2);
        assert_eq!(at_1.manifest(), edited.manifest());
        assert_eq!(at_1.vector, vv(&[(1, 2), (2, 1)]));
        assert_eq!(at_1.siblings, vec![deleted.head()]);

        assert!(matches!(
            engine.merge(Some(&deleted), &edited).resolution,
            Resolution::TakeRemote(_)
        ));
        let kept = engine.merge(Some(&edited), &deleted);
        assert!(matches!(kept.resolution, Resolution::KeepLocal(_)));
        assert!(kept.conflicts.is_empty());
    }

    #[test]
    fn test_delete_that_saw_the_edit_wins() {
        let engine = MergeEngine::default();
        let edited = file("a", b"x", &[(1, 1), (2, 1)], 50, 2);
        let deleted = tomb("a", &[(1, 2), (2, 1)], 10, 1);
        assert_eq!(
            engine.merge(Some(&edited), &deleted).resolution,
            Resolution::TakeRemote(deleted)
        );
    }

    #[test]
    fn test_concurrent_edits_keep_conflict_copy() {
        let engine = MergeEngine::default();
        let ours = file("notes.txt", b"ours", &[(1, 2)], 100, 1);
        let theirs = file("notes.txt", b"theirs", &[(1, 1), (2, 1)], 200, 2);

        let outcome = engine.merge(Some(&ours), &theirs);
        let Resolution::TakeRemote(merged) = outcome.resolution else {
            panic!("remote should win");
        };
        assert_eq!(merged.manifest(), theirs.manifest());
        assert_eq!(merged.vector, vv(&[(1, 2), (2, 1)]));
        assert_eq!(merged.own_vector, Some(theirs.vector.clone()));

        assert_eq!(outcome.conflicts.len(), 1);
        let conflict = &outcome.conflicts[0];
        assert!(!conflict.from_remote);
        assert_eq!(conflict.loser_origin, peer(1));
        assert_eq!(conflict.original, "notes.txt");
        assert_eq!(
            conflict.manifest.path,
            format!(
                "notes.sync-conflict-{}-{}.txt",
                peer(1).short(),
                Digest::of(b"ours").short()
            )
        );
        assert!(conflict.manifest.same_content(ours.manifest().unwrap()));
    }

    #[test]
    fn test_superseded_version_does_not_return() {
        // X wrote a version, Y overwrote it having seen it, Z edited
        // concurrently with both. Whatever order the two snapshots arrive
        // in, X's old content must not come back.
        let engine = MergeEngine::default();
        let old = file("a", b"local-old", &[(1, 1)], 900, 1);
        let overwrite = file("a", b"from-y", &[(1, 1), (2, 1)], 10, 2);
        let concurrent = file("a", b"from-z", &[(3, 1)], 20, 3);

        let mut first = BTreeMap::from([("a".to_string(), old.clone())]);
        engine.merge_into(&mut first, &[overwrite.clone()]);
        engine.merge_into(&mut first, &[concurrent.clone()]);

        let mut second = BTreeMap::from([("a".to_string(), old)]);
        engine.merge_into(&mut second, &[concurrent.clone()]);
        engine.merge_into(&mut second, &[overwrite.clone()]);

        assert_eq!(first, second);
        let entry = &first["a"];
        assert_eq!(entry.manifest(), concurrent.manifest());
        assert_eq!(entry.siblings, vec![overwrite.head()]);
    }

    #[test]
    fn test_earlier_loser_gets_no_second_copy() {
        let engine = MergeEngine::default();
        let a = file("a", b"one", &[(1, 1)], 10, 1);
        let b = file("a", b"two", &[(2, 1)], 20, 2);
        let c = file("a", b"three", &[(3, 1)], 30, 3);

        let merged = engine.resolve(Some(&a), &b).unwrap();
        let outcome = engine.merge(Some(&merged), &c);
        let copies: Vec<PeerId> = outcome.conflicts.iter().map(|c| c.loser_origin).collect();
        // a lost before and already has its copy; b loses now.
        assert_eq!(copies, vec![peer(2)]);
        assert!(!outcome.conflicts[0].from_remote);
    }

    #[test]
    fn test_local_write_clears_siblings() {
        let engine = MergeEngine::default();
        let a = file("a", b"one", &[(1, 1)], 10, 1);
        let b = file("a", b"two", &[(2, 1)], 20, 2);
        let merged = engine.resolve(Some(&a), &b).unwrap();
        assert!(merged.is_conflicted());

        let mut next = merged.vector.clone();
        next.observe(peer(1), 2);
        let edit = file("a", b"resolved", &[(1, 2), (2, 1)], 30, 1);
        assert_eq!(edit.vector, next);
        let after = engine.resolve(Some(&merged), &edit).unwrap();
        assert!(!after.is_conflicted());
        assert_eq!(after, edit);
    }

    #[test]
    fn test_concurrent_same_content_no_conflict() {
        let engine = MergeEngine::default();
        let a = file("a", b"same", &[(1, 1)], 100, 1);
        let b = file("a", b"same", &[(2, 1)], 200, 2);
        assert!(engine.merge(Some(&a), &b).conflicts.is_empty());
    }

    fn with_root(root: u8, ts: u64, origin: u8) -> Entry {
        let manifest = FileManifest::new(
            "a".to_string(),
            0,
            0o644,
            vec![ChunkRef {
                digest: Digest::from_bytes([root; 32]),
                size: 1,
            }],
        );
        Entry::file(manifest, vv(&[(origin, 1)]), ts, peer(origin))
    }

    #[test]
    fn test_tie_break_policies() {
        let late_small = with_root(0x10, 200, 1);
        let early_big = with_root(0x20, 100, 2);

        let by_time = MergeEngine::new(TieBreak::Timestamp);
        let winner = by_time.resolve(Some(&early_big), &late_small).unwrap();
        assert_eq!(winner.origin, peer(1));

        let by_digest = MergeEngine::new(TieBreak::Digest);
        let winner = by_digest.resolve(Some(&late_small), &early_big).unwrap();
        assert_eq!(winner.origin, peer(2));
    }

    #[test]
    fn test_equal_timestamps_fall_back_to_digest() {
        let small = with_root(0x10, 100, 2);
        let big = with_root(0x20, 100, 1);
        let engine = MergeEngine::default();
        assert_eq!(engine.resolve(Some(&small), &big).unwrap().origin, peer(1));
        assert_eq!(engine.resolve(Some(&big), &small).unwrap().origin, peer(1));
    }

    #[test]
    fn test_resolve_is_order_independent() {
        let engine = MergeEngine::default();
        let a = file("a", b"one", &[(1, 3)], 10, 1);
        let b = file("a", b"two", &[(1, 1), (2, 4)], 10, 2);
        assert_eq!(engine.resolve(Some(&a), &b), engine.resolve(Some(&b), &a));

        let t1 = tomb("a", &[(1, 2)], 10, 1);
        let t2 = tomb("a", &[(2, 2)], 20, 2);
        assert_eq!(engine.resolve(Some(&t1), &t2), engine.resolve(Some(&t2), &t1));
        assert!(engine.resolve(Some(&t1), &t2).unwrap().is_tombstone());
    }

    #[test]
    fn test_conflict_path_names() {
        let origin = peer(0xab);
        let root = Digest::from_bytes([0xcd; 32]);
        assert_eq!(
            conflict_path("docs/report.pdf", &origin, &root),
            "docs/report.sync-conflict-abababab-cdcdcdcd.pdf"
        );
        assert_eq!(
            conflict_path(".bashrc", &origin, &root),
            ".bashrc.sync-conflict-abababab-cdcdcdcd"
        );
    }
}
