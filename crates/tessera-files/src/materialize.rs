//! Writing manifests back to disk.
//!
//! Files are assembled from verified chunks into a temporary file inside the
//! folder's system directory and renamed over the destination, so other
//! programs never observe a half-written file. Replaced or deleted files can
//! be moved to `.tessera/archive/` instead of being discarded. Archived
//! copies keep their relative path with a `~yyyyMMdd-HHmmss` suffix (UTC)
//! before the extension, plus `-N` when several land in the same second.

use crate::error::{FilesError, IoContext, Result};
use crate::indexer::stat_fields;
use crate::manifest::FileManifest;
use crate::store::ChunkStore;
use crate::path::split_extension;
use crate::{SYSTEM_DIR, TEMP_PREFIX};
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, UNIX_EPOCH};
use walkdir::WalkDir;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
const STAMP_LEN: usize = 15;

/// What happens to a file that is about to be overwritten or deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveMode {
    /// Discard it
    #[default]
    None,
    /// Move it under `.tessera/archive/`; every archived copy is kept
    /// until it expires
    Trash,
    /// Like [`ArchiveMode::Trash`], but only the newest `keep` copies of
    /// each path are kept
    Timestamp {
        /// Copies kept per path; 0 keeps all
        keep: usize,
    },
}

/// Applies remote state to one folder root.
#[derive(Debug, Clone)]
pub struct Materializer {
    root: PathBuf,
    archive: ArchiveMode,
    max_age: Option<Duration>,
}

impl Materializer {
    /// Create a materializer for `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, archive: ArchiveMode) -> Self {
        Self {
            root: root.into(),
            archive,
            max_age: None,
        }
    }

    /// Expire archived copies older than `max_age` in
    /// [`Materializer::sweep_archive`]. `None` keeps them forever.
    #[must_use]
    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    /// Archive directory.
    #[must_use]
    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(SYSTEM_DIR).join("archive")
    }

    /// Check the disk still holds what was last indexed at `rel`.
    ///
    /// `expected == None` means the path should not exist. Size, mtime and
    /// permissions are compared; a mismatch means the user changed the file
    /// after the last scan and it must not be overwritten blindly.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::InvalidPath`] for an unsafe path and
    /// [`FilesError::Io`] for stat failures other than absence.
    pub fn matches_disk(&self, rel: &str, expected: Option<&FileManifest>) -> Result<bool> {
        let abs = crate::path::resolve(&self.root, rel)?;
        let metadata = match fs::symlink_metadata(&abs) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(expected.is_none()),
            Err(e) => return Err(FilesError::io(&abs, e)),
        };
        let Some(expected) = expected else {
            return Ok(false);
        };
        if !metadata.is_file() {
            return Ok(false);
        }
        let (mtime_ns, mode) = stat_fields(&metadata);
        Ok(metadata.len() == expected.size && mtime_ns == expected.mtime_ns && mode == expected.mode)
    }

    /// Write `manifest` to disk from chunks in `store`.
    ///
    /// Returns the manifest with `mtime_ns` and `mode` as the filesystem
    /// actually recorded them, so the next scan takes the fast path.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::NotFound`] or [`FilesError::Integrity`] if a
    /// chunk is missing or corrupt, and [`FilesError::Io`] on write failure.
    pub fn write_file(&self, manifest: &FileManifest, store: &ChunkStore) -> Result<FileManifest> {
        let abs = crate::path::resolve(&self.root, &manifest.path)?;
        if abs.is_dir() {
            return Err(FilesError::InvalidPath(format!(
                "{} is a directory",
                manifest.path
            )));
        }
        let tmp = self.temp_path(manifest)?;
        if let Err(e) = self.assemble(&tmp, manifest, store) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }

        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
        if abs.exists() {
            self.archive_existing(&manifest.path, &abs)?;
        }
        if let Err(e) = fs::rename(&tmp, &abs) {
            let _ = fs::remove_file(&tmp);
            return Err(FilesError::io(&abs, e));
        }

        let metadata = fs::metadata(&abs).at(&abs)?;
        let (mtime_ns, mode) = stat_fields(&metadata);
        tracing::debug!(
            "materialized {} ({} bytes, {} chunks)",
            manifest.path,
            manifest.size,
            manifest.chunks.len()
        );
        Ok(FileManifest {
            mtime_ns,
            mode,
            ..manifest.clone()
        })
    }

    fn temp_path(&self, manifest: &FileManifest) -> Result<PathBuf> {
        let dir = self.root.join(SYSTEM_DIR).join("tmp");
        fs::create_dir_all(&dir).at(&dir)?;
        Ok(dir.join(format!(
            "{}{}-{}",
            TEMP_PREFIX,
            manifest.root.short(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        )))
    }

    fn assemble(&self, tmp: &Path, manifest: &FileManifest, store: &ChunkStore) -> Result<()> {
        let mut file = fs::File::create(tmp).at(tmp)?;
        let mut written = 0u64;
        for chunk in &manifest.chunks {
            let bytes = store.get(&chunk.digest)?;
            if bytes.len() != chunk.size as usize {
                return Err(FilesError::Integrity {
                    expected: chunk.digest,
                    actual: tessera_crypto::Digest::of(&bytes),
                });
            }
            file.write_all(&bytes).at(tmp)?;
            written += bytes.len() as u64;
        }
        if written != manifest.size {
            return Err(FilesError::Integrity {
                expected: manifest.root,
                actual: tessera_crypto::Digest::EMPTY,
            });
        }
        file.sync_all().at(tmp)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if manifest.mode != 0 {
                fs::set_permissions(tmp, fs::Permissions::from_mode(manifest.mode)).at(tmp)?;
            }
        }
        if manifest.mtime_ns > 0 {
            let mtime = UNIX_EPOCH + Duration::from_nanos(manifest.mtime_ns as u64);
            file.set_modified(mtime).at(tmp)?;
        }
        Ok(())
    }

    /// Remove the file at `rel` (archiving it if configured). Returns whether
    /// anything was there. Emptied parent directories are removed.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Io`] if the file cannot be removed or archived.
    pub fn delete_file(&self, rel: &str) -> Result<bool> {
        let abs = crate::path::resolve(&self.root, rel)?;
        if !abs.is_file() {
            return Ok(false);
        }
        self.archive_existing(rel, &abs)?;
        if abs.exists() {
            fs::remove_file(&abs).at(&abs)?;
        }
        self.prune_empty_parents(&abs);
        tracing::debug!("deleted {}", rel);
        Ok(true)
    }

    fn archive_existing(&self, rel: &str, abs: &Path) -> Result<()> {
        let keep = match self.archive {
            ArchiveMode::None => return Ok(()),
            ArchiveMode::Trash => None,
            ArchiveMode::Timestamp { keep } => (keep > 0).then_some(keep),
        };
        let stamp = Utc::now().format(STAMP_FORMAT).to_string();
        let target = self.archive_target(rel, &stamp)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
        fs::rename(abs, &target).at(abs)?;
        tracing::debug!("archived {} to {}", rel, target.display());
        if let Some(keep) = keep {
            self.prune_versions(&target, keep)?;
        }
        Ok(())
    }

    /// First free `<stem>~<stamp>[-N]<ext>` name for `rel` in the archive.
    fn archive_target(&self, rel: &str, stamp: &str) -> Result<PathBuf> {
        let archive = self.archive_dir();
        let (stem, ext) = split_extension(rel);
        let mut n = 0u32;
        loop {
            let name = if n == 0 {
                format!("{stem}~{stamp}{ext}")
            } else {
                format!("{stem}~{stamp}-{n}{ext}")
            };
            let target = crate::path::resolve(&archive, &name)?;
            if fs::symlink_metadata(&target).is_err() {
                return Ok(target);
            }
            n += 1;
        }
    }

    /// Drop all but the newest `keep` copies of the path `archived` is a
    /// copy of.
    fn prune_versions(&self, archived: &Path, keep: usize) -> Result<()> {
        let (Some(dir), Some(name)) = (archived.parent(), archived.file_name()) else {
            return Ok(());
        };
        let Some((original, _)) = name.to_str().and_then(parse_archived) else {
            return Ok(());
        };
        let mut versions = Vec::new();
        for dirent in fs::read_dir(dir).at(dir)? {
            let dirent = dirent.at(dir)?;
            let Ok(candidate) = dirent.file_name().into_string() else {
                continue;
            };
            if let Some((of, at)) = parse_archived(&candidate) {
                if of == original {
                    versions.push((at, dirent.path()));
                }
            }
        }
        versions.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, stale) in versions.into_iter().skip(keep) {
            fs::remove_file(&stale).at(&stale)?;
            tracing::debug!("pruned archived {}", stale.display());
        }
        Ok(())
    }

    /// Remove archived copies older than the configured maximum age.
    /// Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Io`] if an expired copy cannot be removed.
    pub fn sweep_archive(&self) -> Result<usize> {
        self.sweep_archive_at(Utc::now().naive_utc())
    }

    fn sweep_archive_at(&self, now: NaiveDateTime) -> Result<usize> {
        let Some(max_age) = self.max_age else {
            return Ok(0);
        };
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return Ok(0);
        };
        let archive = self.archive_dir();
        if !archive.is_dir() {
            return Ok(0);
        }
        let mut removed = 0;
        for dirent in WalkDir::new(&archive).min_depth(1).contents_first(true) {
            let dirent = match dirent {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!("archive sweep: {}", e);
                    continue;
                }
            };
            let path = dirent.path();
            if dirent.file_type().is_dir() {
                // Only succeeds once the directory is empty.
                let _ = fs::remove_dir(path);
                continue;
            }
            let archived_at = dirent
                .file_name()
                .to_str()
                .and_then(parse_archived)
                .map(|(_, (at, _))| at);
            if archived_at.is_some_and(|at| now - at > max_age) {
                fs::remove_file(path).at(path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!("expired {} archived files in {}", removed, archive.display());
        }
        Ok(removed)
    }

    fn prune_empty_parents(&self, abs: &Path) {
        let mut dir = abs.parent();
        while let Some(d) = dir {
            if d == self.root || !d.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

/// Split an archived file name into the original name and its archive
/// time plus same-second counter.
fn parse_archived(name: &str) -> Option<(String, (NaiveDateTime, u32))> {
    let tilde = name.rfind('~')?;
    let (stem, rest) = (&name[..tilde], &name[tilde + 1..]);
    let stamp = rest.get(..STAMP_LEN)?;
    let at = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
    let rest = &rest[STAMP_LEN..];
    let (counter, ext) = match rest.strip_prefix('-') {
        Some(tail) => {
            let digits = tail.find('.').unwrap_or(tail.len());
            (tail[..digits].parse().ok()?, &tail[digits..])
        }
        None => (0, rest),
    };
    if !(ext.is_empty() || ext.starts_with('.')) {
        return None;
    }
    Some((format!("{stem}{ext}"), (at, counter)))
}
