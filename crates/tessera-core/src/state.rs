//! Folder state: one entry per path plus the folder's version vector.

use crate::vector::VersionVector;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tessera_crypto::{Digest, FolderId, PeerId};
use tessera_files::FileManifest;

/// What a path currently holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// A regular file
    File(FileManifest),
    /// Deletion marker
    Tombstone,
}

/// One write of a path, identified by its origin and the origin's counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// File or tombstone written
    pub kind: EntryKind,
    /// Vector of the write itself
    pub vector: VersionVector,
    /// Wall-clock time of the write, milliseconds since the epoch
    pub timestamp_ms: u64,
    /// Replica that wrote it
    pub origin: PeerId,
}

impl Version {
    /// Unique id of the write: origin and its counter at the time.
    #[must_use]
    pub fn dot(&self) -> (PeerId, u64) {
        (self.origin, self.vector.get(&self.origin))
    }

    /// Content root; [`Digest::EMPTY`] for tombstones.
    #[must_use]
    pub fn content_root(&self) -> Digest {
        match &self.kind {
            EntryKind::File(m) => m.root,
            EntryKind::Tombstone => Digest::EMPTY,
        }
    }

    /// Whether this write deleted the path.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        matches!(self.kind, EntryKind::Tombstone)
    }
}

/// Versioned state of one path.
///
/// The top-level fields describe the version on disk. When concurrent
/// writes met and none has superseded the others yet, the losers stay in
/// `siblings` and `own_vector` holds the visible version's own vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Normalized relative path
    pub path: String,
    /// File or tombstone
    pub kind: EntryKind,
    /// Causal history of this path, siblings included
    pub vector: VersionVector,
    /// Wall-clock time of the mutation, milliseconds since the epoch
    pub timestamp_ms: u64,
    /// Replica that made the mutation
    pub origin: PeerId,
    /// Vector of the visible version when it differs from `vector`
    pub own_vector: Option<VersionVector>,
    /// Concurrent versions that lost the tie-break, ordered by dot
    pub siblings: Vec<Version>,
}

impl Entry {
    /// File entry.
    #[must_use]
    pub fn file(manifest: FileManifest, vector: VersionVector, timestamp_ms: u64, origin: PeerId) -> Self {
        Self {
            path: manifest.path.clone(),
            kind: EntryKind::File(manifest),
            vector,
            timestamp_ms,
            origin,
            own_vector: None,
            siblings: Vec::new(),
        }
    }

    /// Tombstone entry.
    #[must_use]
    pub fn tombstone(path: String, vector: VersionVector, timestamp_ms: u64, origin: PeerId) -> Self {
        Self {
            path,
            kind: EntryKind::Tombstone,
            vector,
            timestamp_ms,
            origin,
            own_vector: None,
            siblings: Vec::new(),
        }
    }

    /// Whether this is a deletion marker.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        matches!(self.kind, EntryKind::Tombstone)
    }

    /// Manifest, for file entries.
    #[must_use]
    pub fn manifest(&self) -> Option<&FileManifest> {
        match &self.kind {
            EntryKind::File(m) => Some(m),
            EntryKind::Tombstone => None,
        }
    }

    /// Content root; [`Digest::EMPTY`] for tombstones.
    #[must_use]
    pub fn content_root(&self) -> Digest {
        self.manifest().map_or(Digest::EMPTY, |m| m.root)
    }

    /// Whether `other` describes the same content and permissions.
    #[must_use]
    pub fn same_content(&self, other: &Entry) -> bool {
        match (&self.kind, &other.kind) {
            (EntryKind::File(a), EntryKind::File(b)) => a.same_content(b) && a.mode == b.mode,
            (EntryKind::Tombstone, EntryKind::Tombstone) => true,
            _ => false,
        }
    }

    /// The visible version.
    #[must_use]
    pub fn head(&self) -> Version {
        Version {
            kind: self.kind.clone(),
            vector: self.own_vector.clone().unwrap_or_else(|| self.vector.clone()),
            timestamp_ms: self.timestamp_ms,
            origin: self.origin,
        }
    }

    /// Every version not superseded: the visible one first, then siblings.
    #[must_use]
    pub fn versions(&self) -> Vec<Version> {
        let mut out = Vec::with_capacity(1 + self.siblings.len());
        out.push(self.head());
        out.extend(self.siblings.iter().cloned());
        out
    }

    /// Whether concurrent versions are still known.
    #[must_use]
    pub fn is_conflicted(&self) -> bool {
        !self.siblings.is_empty()
    }
}

/// A mutation observed on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    /// File created or modified
    Upsert(FileManifest),
    /// File removed
    Delete(String),
}

impl LocalChange {
    /// Path the change applies to.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            LocalChange::Upsert(m) => &m.path,
            LocalChange::Delete(p) => p,
        }
    }
}

/// All entries of one folder.
#[derive(Debug, Clone)]
pub struct FolderState {
    folder_id: FolderId,
    vector: VersionVector,
    entries: BTreeMap<String, Entry>,
    chunk_refs: HashMap<Digest, usize>,
}

impl FolderState {
    /// Empty state.
    #[must_use]
    pub fn new(folder_id: FolderId) -> Self {
        Self {
            folder_id,
            vector: VersionVector::new(),
            entries: BTreeMap::new(),
            chunk_refs: HashMap::new(),
        }
    }

    /// Rebuild from persisted parts.
    #[must_use]
    pub fn from_parts(folder_id: FolderId, vector: VersionVector, entries: Vec<Entry>) -> Self {
        let mut state = Self::new(folder_id);
        state.vector = vector;
        for entry in entries {
            state.put(entry);
        }
        state
    }

    /// Folder id.
    #[must_use]
    pub fn folder_id(&self) -> FolderId {
        self.folder_id
    }

    /// Folder vector.
    #[must_use]
    pub fn vector(&self) -> &VersionVector {
        &self.vector
    }

    /// Entry at `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    /// All entries in path order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// Number of entries, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No entries at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Manifests of existing files by path, as the indexer expects them.
    #[must_use]
    pub fn live_manifests(&self) -> BTreeMap<String, FileManifest> {
        self.entries
            .values()
            .filter_map(|e| e.manifest().map(|m| (e.path.clone(), m.clone())))
            .collect()
    }

    /// Whether any live file uses `digest`.
    #[must_use]
    pub fn references(&self, digest: &Digest) -> bool {
        self.chunk_refs.contains_key(digest)
    }

    /// Every digest referenced by a live file.
    #[must_use]
    pub fn referenced_digests(&self) -> HashSet<Digest> {
        self.chunk_refs.keys().copied().collect()
    }

    /// Insert or replace an entry and absorb its vector into the folder's.
    pub(crate) fn put(&mut self, entry: Entry) {
        self.vector.join(&entry.vector);
        if let Some(old) = self.entries.remove(&entry.path) {
            self.unref(&old);
        }
        if let Some(m) = entry.manifest() {
            for digest in m.digests() {
                *self.chunk_refs.entry(digest).or_insert(0) += 1;
            }
        }
        self.entries.insert(entry.path.clone(), entry);
    }

    /// Replace a file entry's manifest without touching its version.
    pub(crate) fn refresh(&mut self, manifest: FileManifest) -> bool {
        match self.entries.get(&manifest.path) {
            Some(entry) if !entry.is_tombstone() => {
                let updated = Entry {
                    kind: EntryKind::File(manifest),
                    ..entry.clone()
                };
                self.put(updated);
                true
            }
            _ => false,
        }
    }

    /// Entry a local change would produce, bumping the local counter in
    /// `folder_vector` (a working copy of [`FolderState::vector`]). Nothing
    /// is applied to the state.
    pub(crate) fn prepare_local(
        &self,
        local: PeerId,
        change: LocalChange,
        timestamp_ms: u64,
        folder_vector: &mut VersionVector,
    ) -> Entry {
        let counter = folder_vector.increment(local);
        let mut vector = self
            .entries
            .get(change.path())
            .map(|e| e.vector.clone())
            .unwrap_or_default();
        vector.observe(local, counter);
        match change {
            LocalChange::Upsert(manifest) => Entry::file(manifest, vector, timestamp_ms, local),
            LocalChange::Delete(path) => Entry::tombstone(path, vector, timestamp_ms, local),
        }
    }

    pub(crate) fn set_vector(&mut self, vector: VersionVector) {
        self.vector.join(&vector);
    }

    fn unref(&mut self, entry: &Entry) {
        if let Some(m) = entry.manifest() {
            for digest in m.digests() {
                if let Some(count) = self.chunk_refs.get_mut(&digest) {
                    *count -= 1;
                    if *count == 0 {
                        self.chunk_refs.remove(&digest);
                    }
                }
            }
        }
    }
}
