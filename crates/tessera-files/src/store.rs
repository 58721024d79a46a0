//! Content-addressed chunk storage.
//!
//! Objects live at `<root>/<first byte hex>/<digest hex>`. Writes go to a
//! temporary file in `<root>/tmp` and are renamed into place, so a reader
//! never sees a partial object and two writers racing on the same digest
//! both succeed with identical content.
//!
//! `ChunkStore` is `Sync` and holds no in-memory index; every operation is a
//! filesystem lookup, so any number of sessions can read and write
//! concurrently.

use crate::error::{FilesError, IoContext, Result};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_crypto::Digest;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Result of a garbage collection pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    /// Objects examined
    pub scanned: usize,
    /// Objects deleted
    pub removed: usize,
    /// Bytes reclaimed
    pub bytes_freed: u64,
}

/// On-disk chunk store keyed by BLAKE3 digest.
#[derive(Debug)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// Leftover temporary files from an interrupted run are removed.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Io`] if the directories cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let tmp = root.join("tmp");
        fs::create_dir_all(&tmp).at(&tmp)?;
        for entry in fs::read_dir(&tmp).at(&tmp)?.flatten() {
            let _ = fs::remove_file(entry.path());
        }
        Ok(Self { root })
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path an object is stored at.
    #[must_use]
    pub fn object_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.root.join(&hex[..2]).join(hex)
    }

    /// Store bytes, returning their digest. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Io`] on write failure.
    pub fn put(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = Digest::of(bytes);
        self.write_object(&digest, bytes)?;
        Ok(digest)
    }

    /// Store bytes received for `expected`, rejecting mismatches.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Integrity`] if the bytes hash differently, in
    /// which case nothing is written.
    pub fn put_verified(&self, expected: &Digest, bytes: &[u8]) -> Result<()> {
        let actual = Digest::of(bytes);
        if actual != *expected {
            return Err(FilesError::Integrity {
                expected: *expected,
                actual,
            });
        }
        self.write_object(expected, bytes)
    }

    fn write_object(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(digest);
        if path.exists() {
            return Ok(());
        }
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).at(dir)?;

        let tmp = self.root.join("tmp").join(format!(
            "{}.{}.{}",
            digest.short(),
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_data()?;
            fs::rename(&tmp, &path)
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(FilesError::io(&path, e));
        }
        tracing::trace!("stored chunk {} ({} bytes)", digest.short(), bytes.len());
        Ok(())
    }

    /// Read a chunk, verifying its digest.
    ///
    /// A corrupt object is deleted so the chunk can be fetched again.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::NotFound`] if absent and
    /// [`FilesError::Integrity`] if the stored bytes are corrupt.
    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.object_path(digest);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(FilesError::NotFound(*digest));
            }
            Err(e) => return Err(FilesError::io(&path, e)),
        };
        let actual = Digest::of(&bytes);
        if actual != *digest {
            tracing::warn!(
                "chunk {} failed verification (hashes to {}), discarding",
                digest.short(),
                actual.short()
            );
            let _ = fs::remove_file(&path);
            return Err(FilesError::Integrity {
                expected: *digest,
                actual,
            });
        }
        Ok(bytes)
    }

    /// Whether an object exists (without verifying it).
    #[must_use]
    pub fn contains(&self, digest: &Digest) -> bool {
        self.object_path(digest).is_file()
    }

    /// The subset of `digests` not present in the store.
    pub fn has_all<'a, I>(&self, digests: I) -> BTreeSet<Digest>
    where
        I: IntoIterator<Item = &'a Digest>,
    {
        digests
            .into_iter()
            .filter(|d| !self.contains(d))
            .copied()
            .collect()
    }

    /// Delete one object. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Io`] for failures other than absence.
    pub fn remove(&self, digest: &Digest) -> Result<bool> {
        let path = self.object_path(digest);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FilesError::io(&path, e)),
        }
    }

    /// Every digest currently stored.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Io`] if a fan-out directory cannot be listed.
    pub fn list(&self) -> Result<Vec<Digest>> {
        let mut out = Vec::new();
        for shard in fs::read_dir(&self.root).at(&self.root)?.flatten() {
            let shard_path = shard.path();
            let is_shard = shard
                .file_name()
                .to_str()
                .is_some_and(|n| n.len() == 2 && n.bytes().all(|b| b.is_ascii_hexdigit()));
            if !is_shard || !shard_path.is_dir() {
                continue;
            }
            for object in fs::read_dir(&shard_path).at(&shard_path)?.flatten() {
                if let Some(digest) = object
                    .file_name()
                    .to_str()
                    .and_then(|n| n.parse::<Digest>().ok())
                {
                    out.push(digest);
                }
            }
        }
        Ok(out)
    }

    /// Remove every object not in `live`.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Io`] if the store cannot be listed.
    pub fn gc(&self, live: &HashSet<Digest>) -> Result<GcStats> {
        let mut stats = GcStats::default();
        for digest in self.list()? {
            stats.scanned += 1;
            if live.contains(&digest) {
                continue;
            }
            let path = self.object_path(&digest);
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if self.remove(&digest)? {
                stats.removed += 1;
                stats.bytes_freed += size;
            }
        }
        tracing::info!(
            "chunk store gc: {} of {} objects removed, {} bytes freed",
            stats.removed,
            stats.scanned,
            stats.bytes_freed
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ChunkStore) {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::open(dir.path().join("chunks")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_get() {
        let (_dir, store) = store();
        let d = store.put(b"hello").unwrap();
        assert_eq!(d, Digest::of(b"hello"));
        assert_eq!(store.get(&d).unwrap(), b"hello");
    }

    #[test]
    fn test_put_is_idempotent() {
        let (_dir, store) = store();
        let a = store.put(b"same").unwrap();
        let b = store.put(b"same").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_chunk() {
        let (_dir, store) = store();
        let d = Digest::of(b"absent");
        assert!(matches!(store.get(&d), Err(FilesError::NotFound(x)) if x == d));
    }

    #[test]
    fn test_has_all_returns_missing_subset() {
        let (_dir, store) = store();
        let present = store.put(b"a").unwrap();
        let absent = Digest::of(b"b");
        let missing = store.has_all([&present, &absent]);
        assert_eq!(missing.into_iter().collect::<Vec<_>>(), vec![absent]);
    }

    #[test]
    fn test_corruption_detected_and_purged() {
        let (_dir, store) = store();
        let d = store.put(b"precious data").unwrap();
        let path = store.object_path(&d);
        let mut bytes = fs::read(&path).unwrap();
        bytes[3] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(store.get(&d), Err(FilesError::Integrity { .. })));
        assert!(!store.contains(&d));
    }

    #[test]
    fn test_put_verified_rejects_mismatch() {
        let (_dir, store) = store();
        let expected = Digest::of(b"right");
        assert!(matches!(
            store.put_verified(&expected, b"wrong"),
            Err(FilesError::Integrity { .. })
        ));
        assert!(!store.contains(&expected));
        store.put_verified(&expected, b"right").unwrap();
        assert!(store.contains(&expected));
    }

    #[test]
    fn test_gc_keeps_live() {
        let (_dir, store) = store();
        let keep = store.put(b"keep").unwrap();
        let drop = store.put(b"drop").unwrap();
        let live: HashSet<Digest> = [keep].into_iter().collect();
        let stats = store.gc(&live).unwrap();
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.bytes_freed, 4);
        assert!(store.contains(&keep));
        assert!(!store.contains(&drop));
    }

    #[test]
    fn test_concurrent_puts_same_digest() {
        let (_dir, store) = store();
        let store = std::sync::Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.put(&[42u8; 4096]).unwrap())
            })
            .collect();
        let digests: HashSet<Digest> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(digests.len(), 1);
        let d = digests.into_iter().next().unwrap();
        assert_eq!(store.get(&d).unwrap(), vec![42u8; 4096]);
    }
}
