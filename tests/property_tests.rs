//! Property-based tests for Tessera
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;
use tessera_core::{Entry, EntryKind, MergeEngine, TieBreak, VersionVector};
use tessera_crypto::{Digest, PeerId};
use tessera_files::{ChunkRef, FileManifest};

const A: PeerId = PeerId::from_bytes([0xA1; 32]);
const B: PeerId = PeerId::from_bytes([0xB2; 32]);

fn manifest(path: &str, content: &[u8]) -> FileManifest {
    let chunks = vec![ChunkRef {
        digest: Digest::of(content),
        size: content.len() as u32,
    }];
    FileManifest::new(path.to_string(), 0, 0o644, chunks)
}

/// File (Some) or tombstone (None) at `path`
fn entry(path: &str, content: Option<&[u8]>, vector: VersionVector, ts: u64, origin: PeerId) -> Entry {
    match content {
        Some(data) => Entry::file(manifest(path, data), vector, ts, origin),
        None => Entry::tombstone(path.to_string(), vector, ts, origin),
    }
}

fn tie_break() -> impl Strategy<Value = TieBreak> {
    prop_oneof![Just(TieBreak::Timestamp), Just(TieBreak::Digest)]
}

fn content() -> impl Strategy<Value = Option<Vec<u8>>> {
    prop::option::weighted(0.8, prop::collection::vec(any::<u8>(), 0..32))
}

// ============================================================================
// Chunking Properties
// ============================================================================

mod chunking_properties {
    use super::*;
    use tessera_files::{Chunker, ChunkerConfig};

    fn small_chunker() -> Chunker {
        Chunker::new(ChunkerConfig {
            min_size: 64,
            max_size: 1024,
            avg_bits: 8,
        })
        .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Concatenating the chunks reproduces the input byte for byte
        #[test]
        fn chunks_reassemble(data in prop::collection::vec(any::<u8>(), 0..16 * 1024)) {
            let chunker = small_chunker();
            let chunks: Vec<Vec<u8>> = chunker
                .chunks(data.as_slice())
                .collect::<Result<_, _>>()
                .unwrap();

            prop_assert_eq!(chunks.concat(), data.clone());
            let lengths: Vec<usize> = chunks.iter().map(Vec::len).collect();
            prop_assert_eq!(lengths, chunker.cut_points(&data));
        }

        /// Every chunk respects the size bounds; only the last may be short
        #[test]
        fn chunk_sizes_bounded(data in prop::collection::vec(any::<u8>(), 1..16 * 1024)) {
            let lengths = small_chunker().cut_points(&data);
            let (last, rest) = lengths.split_last().unwrap();
            prop_assert!(*last >= 1 && *last <= 1024);
            for len in rest {
                prop_assert!((64..=1024).contains(len), "chunk of {} bytes", len);
            }
        }

        /// Boundaries depend on content, so bytes after an edit cut the same
        #[test]
        fn boundaries_resynchronize(
            data in prop::collection::vec(any::<u8>(), 8 * 1024..16 * 1024),
            prefix in prop::collection::vec(any::<u8>(), 1..32),
        ) {
            let chunker = small_chunker();
            let original: Vec<Vec<u8>> = chunker.chunks(data.as_slice()).collect::<Result<_, _>>().unwrap();
            let mut edited_data = prefix;
            edited_data.extend_from_slice(&data);
            let edited: Vec<Vec<u8>> = chunker.chunks(edited_data.as_slice()).collect::<Result<_, _>>().unwrap();

            // Once one cut point lines up again every later chunk matches.
            let shared = original.iter().filter(|c| edited.contains(c)).count();
            prop_assert!(original.len() < 4 || shared > 0);
        }
    }
}

// ============================================================================
// Merge Properties
// ============================================================================

mod merge_properties {
    use super::*;
    use std::collections::BTreeMap;

    /// Two edits of one path that neither replica has seen from the other
    fn concurrent_pair() -> impl Strategy<Value = (Entry, Entry)> {
        (0u64..4, content(), content(), 0u64..1000, 0u64..1000).prop_map(
            |(base, left, right, ts_a, ts_b)| {
                let mut shared = VersionVector::new();
                shared.observe(A, base);
                shared.observe(B, base);
                let mut va = shared.clone();
                va.increment(A);
                let mut vb = shared;
                vb.increment(B);
                (
                    entry("doc.txt", left.as_deref(), va, ts_a, A),
                    entry("doc.txt", right.as_deref(), vb, ts_b, B),
                )
            },
        )
    }

    const PEERS: [PeerId; 3] = [A, B, PeerId::from_bytes([0xC3; 32])];

    #[derive(Debug, Clone)]
    enum Step {
        /// Replica writes new content (or deletes) at the path
        Write(usize, Option<Vec<u8>>, u64),
        /// Replica pulls the other replica's entry
        Sync { from: usize, to: usize },
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0usize..3, content(), 0u64..1000).prop_map(|(r, data, ts)| Step::Write(r, data, ts)),
            (0usize..3, 0usize..3).prop_map(|(from, to)| Step::Sync { from, to }),
        ]
    }

    /// Per-replica state for one path
    #[derive(Debug, Clone, Default)]
    struct Replica {
        counter: u64,
        entry: Option<Entry>,
    }

    fn run(steps: &[Step], engine: &MergeEngine) -> Vec<Replica> {
        let mut replicas = vec![Replica::default(); 3];
        for step in steps {
            match step {
                Step::Write(r, data, ts) => {
                    let id = PEERS[*r];
                    let replica = &mut replicas[*r];
                    replica.counter += 1;
                    let mut vector = replica
                        .entry
                        .as_ref()
                        .map(|e| e.vector.clone())
                        .unwrap_or_default();
                    vector.observe(id, replica.counter);
                    replica.entry = Some(entry("doc.txt", data.as_deref(), vector, *ts, id));
                }
                Step::Sync { from, to } => {
                    if from == to {
                        continue;
                    }
                    if let Some(remote) = replicas[*from].entry.clone() {
                        let local = replicas[*to].entry.take();
                        replicas[*to].entry = engine.resolve(local.as_ref(), &remote);
                    }
                }
            }
        }
        replicas
    }

    fn apply(engine: &MergeEngine, mut local: Option<Entry>, snapshots: &[&Option<Entry>]) -> Option<Entry> {
        for remote in snapshots.iter().filter_map(|s| s.as_ref()) {
            local = engine.resolve(local.as_ref(), remote);
        }
        local
    }

    proptest! {
        /// Replicas reach the same entry whichever update they see first
        #[test]
        fn merge_commutes((a, b) in concurrent_pair(), policy in tie_break()) {
            let engine = MergeEngine::new(policy);
            let at_a = engine.resolve(Some(&a), &b).unwrap();
            let at_b = engine.resolve(Some(&b), &a).unwrap();
            prop_assert_eq!(&at_a, &at_b);
            prop_assert!(at_a.vector.descends(&a.vector) && at_a.vector.descends(&b.vector));

            let copies = |outcome: tessera_core::MergeOutcome| {
                outcome.conflicts.into_iter().map(|c| c.manifest).collect::<Vec<_>>()
            };
            prop_assert_eq!(copies(engine.merge(Some(&a), &b)), copies(engine.merge(Some(&b), &a)));
        }

        /// Concurrent edits never lose content: whatever is not at the path
        /// is in the conflict copy
        #[test]
        fn conflicts_keep_both_contents((a, b) in concurrent_pair(), policy in tie_break()) {
            let outcome = MergeEngine::new(policy).merge(Some(&a), &b);
            let winner = MergeEngine::new(policy).resolve(Some(&a), &b).unwrap();
            if let (EntryKind::File(ma), EntryKind::File(mb)) = (&a.kind, &b.kind) {
                let kept = winner.manifest().unwrap();
                if ma.same_content(mb) {
                    prop_assert!(outcome.conflicts.is_empty());
                } else {
                    prop_assert_eq!(outcome.conflicts.len(), 1);
                    let copy = &outcome.conflicts[0];
                    let mut roots = vec![kept.root, copy.manifest.root];
                    roots.sort();
                    let mut expected = vec![ma.root, mb.root];
                    expected.sort();
                    prop_assert_eq!(roots, expected);
                    prop_assert_ne!(copy.manifest.path.as_str(), "doc.txt");
                }
            } else if !(a.is_tombstone() && b.is_tombstone()) {
                // A file always beats a concurrent delete.
                prop_assert!(!winner.is_tombstone());
                prop_assert!(outcome.conflicts.is_empty());
            }
        }

        /// With three replicas editing and syncing in any pattern, a replica
        /// ends up with the same entry whichever of two snapshots it
        /// applies first, even when one snapshot supersedes its own version
        #[test]
        fn merge_commutes_across_three_replicas(
            steps in prop::collection::vec(step(), 1..24),
            policy in tie_break(),
        ) {
            let engine = MergeEngine::new(policy);
            let replicas = run(&steps, &engine);
            let (local, a, b) = (&replicas[0].entry, &replicas[1].entry, &replicas[2].entry);

            let a_then_b = apply(&engine, local.clone(), &[a, b]);
            let b_then_a = apply(&engine, local.clone(), &[b, a]);
            prop_assert_eq!(&a_then_b, &b_then_a);

            // Every snapshot applied is fully absorbed.
            if let Some(merged) = &a_then_b {
                for seen in [local, a, b].into_iter().flatten() {
                    prop_assert!(merged.vector.descends(&seen.vector));
                }
            }
        }

        /// Applying the same snapshot twice changes nothing the second time
        #[test]
        fn merge_idempotent(
            local in prop::collection::btree_map("[a-e]", (content(), 0u64..3), 0..5),
            remote in prop::collection::btree_map("[a-e]", (content(), 0u64..3), 0..5),
            policy in tie_break(),
        ) {
            let build = |origin: PeerId, src: &BTreeMap<String, (Option<Vec<u8>>, u64)>| {
                src.iter()
                    .map(|(path, (data, n))| {
                        let mut v = VersionVector::new();
                        v.observe(origin, n + 1);
                        entry(path, data.as_deref(), v, *n, origin)
                    })
                    .collect::<Vec<_>>()
            };
            let mut entries: BTreeMap<String, Entry> = build(A, &local)
                .into_iter()
                .map(|e| (e.path.clone(), e))
                .collect();
            let snapshot = build(B, &remote);

            let engine = MergeEngine::new(policy);
            engine.merge_into(&mut entries, &snapshot);
            let once = entries.clone();
            let conflicts = engine.merge_into(&mut entries, &snapshot);
            prop_assert!(conflicts.is_empty());
            prop_assert_eq!(once, entries);
        }
    }
}

// ============================================================================
// Version Vector Properties
// ============================================================================

mod vector_properties {
    use super::*;

    #[derive(Debug, Clone)]
    enum Op {
        Increment,
        Observe(u64),
        Join(u64, u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Increment),
            (0u64..50).prop_map(Op::Observe),
            (0u64..50, 0u64..50).prop_map(|(a, b)| Op::Join(a, b)),
        ]
    }

    proptest! {
        /// The local counter never goes backwards and every local mutation
        /// moves it forward
        #[test]
        fn local_counter_monotonic(ops in prop::collection::vec(op(), 1..64)) {
            let mut vector = VersionVector::new();
            for op in ops {
                let before = vector.clone();
                match op {
                    Op::Increment => {
                        let n = vector.increment(A);
                        prop_assert_eq!(n, before.get(&A) + 1);
                        prop_assert!(vector.dominates(&before));
                    }
                    Op::Observe(n) => vector.observe(A, n),
                    Op::Join(a, b) => {
                        let mut other = VersionVector::new();
                        other.observe(A, a);
                        other.observe(B, b);
                        vector.join(&other);
                        prop_assert!(vector.descends(&other));
                    }
                }
                prop_assert!(vector.get(&A) >= before.get(&A));
                prop_assert!(vector.descends(&before));
            }
        }
    }
}

// ============================================================================
// Integrity Properties
// ============================================================================

mod integrity_properties {
    use super::*;
    use tessera_files::{ChunkStore, FilesError};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Flipping any byte of a stored chunk is caught on read
        #[test]
        fn corruption_detected(
            data in prop::collection::vec(any::<u8>(), 1..4096),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let dir = tempfile::tempdir().unwrap();
            let store = ChunkStore::open(dir.path()).unwrap();
            let digest = store.put(&data).unwrap();
            prop_assert_eq!(store.get(&digest).unwrap(), data.clone());

            let path = store.object_path(&digest);
            let mut bytes = std::fs::read(&path).unwrap();
            let i = index.index(bytes.len());
            bytes[i] ^= flip;
            std::fs::write(&path, &bytes).unwrap();

            let is_integrity = matches!(store.get(&digest), Err(FilesError::Integrity { .. }));
            prop_assert!(is_integrity);
        }

        /// Data that does not hash to the claimed digest is never stored
        #[test]
        fn unverified_data_rejected(
            data in prop::collection::vec(any::<u8>(), 1..1024),
            other in prop::collection::vec(any::<u8>(), 1..1024),
        ) {
            prop_assume!(data != other);
            let dir = tempfile::tempdir().unwrap();
            let store = ChunkStore::open(dir.path()).unwrap();
            let claimed = Digest::of(&data);
            let rejected = matches!(store.put_verified(&claimed, &other), Err(FilesError::Integrity { .. }));
            prop_assert!(rejected);
            prop_assert!(!store.contains(&claimed));
        }
    }
}
