//! File manifests.

use serde::{Deserialize, Serialize};
use tessera_crypto::Digest;
use tessera_crypto::hash::StreamHasher;

/// Reference to one chunk of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Content digest
    pub digest: Digest,
    /// Chunk length in bytes
    pub size: u32,
}

/// Everything needed to rebuild one file from the chunk store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    /// Normalized path relative to the folder root
    pub path: String,
    /// File size in bytes
    pub size: u64,
    /// Modification time, nanoseconds since the Unix epoch
    pub mtime_ns: i64,
    /// Unix permission bits
    pub mode: u32,
    /// Ordered chunk list
    pub chunks: Vec<ChunkRef>,
    /// Merkle root over chunk digests
    pub root: Digest,
}

impl FileManifest {
    /// Build a manifest, computing the root from `chunks`.
    #[must_use]
    pub fn new(path: String, mtime_ns: i64, mode: u32, chunks: Vec<ChunkRef>) -> Self {
        let size = chunks.iter().map(|c| u64::from(c.size)).sum();
        let root = merkle_root(chunks.iter().map(|c| c.digest));
        Self {
            path,
            size,
            mtime_ns,
            mode,
            chunks,
            root,
        }
    }

    /// Check internal consistency: sizes add up and the root matches.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let size: u64 = self.chunks.iter().map(|c| u64::from(c.size)).sum();
        size == self.size && merkle_root(self.chunks.iter().map(|c| c.digest)) == self.root
    }

    /// Same bytes, regardless of metadata.
    #[must_use]
    pub fn same_content(&self, other: &FileManifest) -> bool {
        self.size == other.size && self.root == other.root
    }

    /// Distinct chunk digests referenced by this file.
    pub fn digests(&self) -> impl Iterator<Item = Digest> + '_ {
        self.chunks.iter().map(|c| c.digest)
    }

    /// Same manifest under a different path.
    #[must_use]
    pub fn with_path(&self, path: String) -> Self {
        Self {
            path,
            ..self.clone()
        }
    }
}

/// Merkle root over chunk digests.
///
/// Pairs are hashed level by level and an odd node is promoted unchanged.
/// A single-chunk file's root is its chunk digest, and an empty file's root
/// is the digest of the empty string, so for small files the root equals the
/// plain content digest.
pub fn merkle_root<I: IntoIterator<Item = Digest>>(leaves: I) -> Digest {
    let mut level: Vec<Digest> = leaves.into_iter().collect();
    if level.is_empty() {
        return Digest::EMPTY;
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                if let [left, right] = pair {
                    let mut hasher = StreamHasher::new();
                    hasher.update(left.as_bytes());
                    hasher.update(right.as_bytes());
                    hasher.finalize()
                } else {
                    pair[0]
                }
            })
            .collect();
    }
    level[0]
}
