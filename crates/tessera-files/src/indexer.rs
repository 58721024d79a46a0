//! Folder scanning and change detection.
//!
//! A scan walks the folder, compares each file against the manifest recorded
//! for its path, and produces change events. Files whose size and mtime match
//! the recorded manifest are trusted without rehashing. Everything else is
//! chunked, each chunk is written to the [`ChunkStore`] so the content is
//! immediately servable to peers, and the new manifest is compared by root.
//!
//! A deleted path whose root matches a newly created path becomes a single
//! [`ChangeEvent::Renamed`].

use crate::chunker::{Chunker, ChunkerConfig};
use crate::error::{FilesError, IoContext, Result};
use crate::ignore::IgnoreList;
use crate::manifest::{ChunkRef, FileManifest};
use crate::store::ChunkStore;
use std::collections::{BTreeMap, HashSet};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

/// A local change found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// New path
    Created(FileManifest),
    /// Existing path with different content or permissions
    Modified(FileManifest),
    /// Path no longer present
    Deleted(String),
    /// Content moved from `from` to the manifest's path
    Renamed {
        /// Previous path
        from: String,
        /// Manifest at the new path
        manifest: FileManifest,
    },
}

impl ChangeEvent {
    /// Path the event is about (the new path for renames).
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            ChangeEvent::Created(m) | ChangeEvent::Modified(m) => &m.path,
            ChangeEvent::Deleted(p) => p,
            ChangeEvent::Renamed { manifest, .. } => &manifest.path,
        }
    }
}

/// Outcome of one scan.
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Changes relative to the previous manifests
    pub events: Vec<ChangeEvent>,
    /// Same content, new mtime; the recorded manifest should be refreshed
    /// without creating a new version
    pub refreshed: Vec<FileManifest>,
    /// Files examined
    pub scanned: usize,
    /// Files that had to be rehashed
    pub hashed: usize,
    /// Bytes read while hashing
    pub bytes_hashed: u64,
    /// Files skipped because of errors, with the reason
    pub skipped: Vec<(String, String)>,
}

impl ScanReport {
    /// Whether the scan found anything to record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.refreshed.is_empty()
    }
}

/// Indexes one folder root.
#[derive(Debug, Clone)]
pub struct FolderIndexer {
    root: PathBuf,
    chunker: Chunker,
    ignore: IgnoreList,
}

impl FolderIndexer {
    /// Create an indexer for `root`.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::ChunkerConfig`] for bad chunker parameters.
    pub fn new(root: impl Into<PathBuf>, chunker: ChunkerConfig, ignore: IgnoreList) -> Result<Self> {
        Ok(Self {
            root: root.into(),
            chunker: Chunker::new(chunker)?,
            ignore,
        })
    }

    /// Folder root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ignore rules in effect.
    #[must_use]
    pub fn ignore(&self) -> &IgnoreList {
        &self.ignore
    }

    /// Replace the ignore rules (after an ignore file changed).
    pub fn set_ignore(&mut self, ignore: IgnoreList) {
        self.ignore = ignore;
    }

    /// Scan the folder against `previous` (live manifests by path).
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Io`] if the root itself is unreadable. Per-file
    /// failures are collected in [`ScanReport::skipped`].
    pub fn scan(
        &self,
        previous: &BTreeMap<String, FileManifest>,
        store: &ChunkStore,
    ) -> Result<ScanReport> {
        std::fs::metadata(&self.root).at(&self.root)?;
        let mut report = ScanReport::default();
        let mut seen = HashSet::new();
        let mut created = Vec::new();
        // Subtrees the walk could not read. Their recorded files are not
        // reported as deleted.
        let mut unreadable: Vec<String> = Vec::new();
        let mut walk_incomplete = false;

        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.file_name() != crate::SYSTEM_DIR);
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                    tracing::warn!("scan: cannot read {}: {}", path, e);
                    match e.path().map(|p| crate::path::normalize(&self.root, p)) {
                        Some(Ok(rel)) => unreadable.push(rel),
                        _ => walk_incomplete = true,
                    }
                    report.skipped.push((path, e.to_string()));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = crate::path::normalize(&self.root, entry.path()) else {
                tracing::debug!("scan: skipping unrepresentable path {}", entry.path().display());
                continue;
            };
            if self.ignore.is_ignored(&rel) {
                continue;
            }
            report.scanned += 1;
            seen.insert(rel.clone());

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    report.skipped.push((rel, e.to_string()));
                    continue;
                }
            };
            let (mtime_ns, mode) = stat_fields(&metadata);
            let prior = previous.get(&rel);
            if let Some(prior) = prior {
                if prior.size == metadata.len()
                    && prior.mtime_ns == mtime_ns
                    && prior.mode == mode
                    && store.has_all(prior.chunks.iter().map(|c| &c.digest)).is_empty()
                {
                    continue;
                }
            }

            let manifest = match self.index_file(&rel, store) {
                Ok(m) => m,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    tracing::warn!("scan: failed to index {}: {}", rel, e);
                    report.skipped.push((rel, e.to_string()));
                    continue;
                }
            };
            report.hashed += 1;
            report.bytes_hashed += manifest.size;

            match prior {
                None => created.push(manifest),
                Some(prior) if prior.same_content(&manifest) && prior.mode == manifest.mode => {
                    report.refreshed.push(manifest);
                }
                Some(_) => report.events.push(ChangeEvent::Modified(manifest)),
            }
        }

        let mut deleted: Vec<&FileManifest> = if walk_incomplete {
            tracing::warn!("scan: walk of {} incomplete, not recording deletions", self.root.display());
            Vec::new()
        } else {
            previous
                .values()
                .filter(|m| !seen.contains(&m.path) && !self.ignore.is_ignored(&m.path))
                .filter(|m| !unreadable.iter().any(|dir| is_within(&m.path, dir)))
                .collect()
        };

        for manifest in created {
            let position = deleted.iter().position(|old| old.same_content(&manifest));
            let renamed_from = position.map(|i| deleted.swap_remove(i).path.clone());
            match renamed_from {
                Some(from) => {
                    tracing::debug!("scan: {} renamed to {}", from, manifest.path);
                    report.events.push(ChangeEvent::Renamed { from, manifest });
                }
                None => report.events.push(ChangeEvent::Created(manifest)),
            }
        }
        for old in deleted {
            report.events.push(ChangeEvent::Deleted(old.path.clone()));
        }

        if !report.events.is_empty() {
            tracing::info!(
                "scanned {}: {} files, {} rehashed, {} changes",
                self.root.display(),
                report.scanned,
                report.hashed,
                report.events.len()
            );
        }
        Ok(report)
    }

    /// Chunk one file into the store and return its manifest.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Io`] on read failure or [`FilesError::InvalidPath`]
    /// for an unsafe relative path.
    pub fn index_file(&self, rel: &str, store: &ChunkStore) -> Result<FileManifest> {
        let abs = crate::path::resolve(&self.root, rel)?;
        let before = std::fs::metadata(&abs).at(&abs)?;
        let mut chunks = Vec::new();
        for chunk in self.chunker.chunk_file(&abs)? {
            let bytes = chunk.at(&abs)?;
            let digest = store.put(&bytes)?;
            chunks.push(ChunkRef {
                digest,
                size: bytes.len() as u32,
            });
        }
        let after = std::fs::metadata(&abs).at(&abs)?;
        let (mtime_ns, mode) = stat_fields(&after);
        if stat_fields(&before).0 != mtime_ns || before.len() != after.len() {
            return Err(FilesError::io(
                &abs,
                std::io::Error::other("file changed while indexing"),
            ));
        }
        Ok(FileManifest::new(rel.to_string(), mtime_ns, mode, chunks))
    }
}

/// Whether relative path `path` is `dir` or lies below it.
fn is_within(path: &str, dir: &str) -> bool {
    path.strip_prefix(dir)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Modification time (ns since epoch) and permission bits of a file.
#[must_use]
pub fn stat_fields(metadata: &Metadata) -> (i64, u32) {
    let mtime_ns = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX));
    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o7777
    };
    #[cfg(not(unix))]
    let mode = if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    };
    (mtime_ns, mode)
}
