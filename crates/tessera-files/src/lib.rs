//! # Tessera Files
//!
//! Local file engine for the Tessera synchronization core.
//!
//! This crate provides:
//! - Content-defined chunking with a Rabin rolling hash
//! - File manifests with a Merkle root over chunk digests
//! - A content-addressed, deduplicating [`ChunkStore`]
//! - Folder scanning with change detection and rename tracking
//! - Materialization of manifests back to disk, with optional archiving
//! - Ignore lists and filesystem change notification

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunker;
pub mod error;
pub mod ignore;
pub mod indexer;
pub mod manifest;
pub mod materialize;
pub mod path;
pub mod store;
pub mod watcher;

pub use chunker::{Chunker, ChunkerConfig};
pub use error::{FilesError, Result};
pub use ignore::IgnoreList;
pub use indexer::{ChangeEvent, FolderIndexer, ScanReport};
pub use manifest::{ChunkRef, FileManifest};
pub use materialize::{ArchiveMode, Materializer};
pub use store::ChunkStore;
pub use watcher::FolderWatcher;

/// Name of the per-folder system directory. Never synced.
pub const SYSTEM_DIR: &str = ".tessera";

/// Name of per-directory ignore files.
pub const IGNORE_FILE: &str = ".tesseraignore";

/// Prefix of in-progress temporary files.
pub const TEMP_PREFIX: &str = ".tessera-tmp-";

/// Default minimum chunk size (1 MiB)
pub const DEFAULT_MIN_CHUNK: usize = 1024 * 1024;

/// Default maximum chunk size (8 MiB)
pub const DEFAULT_MAX_CHUNK: usize = 8 * 1024 * 1024;

/// Default average chunk size exponent (2^20 bytes)
pub const DEFAULT_AVG_BITS: u32 = 20;
