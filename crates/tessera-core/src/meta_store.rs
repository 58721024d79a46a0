//! Durable folder metadata.
//!
//! One SQLite database per folder holds every entry (bincode-encoded, keyed
//! by path) and the folder vector. The store keeps the decoded
//! [`FolderState`] in memory and only updates it after a transaction
//! commits, so a failed write leaves both disk and memory as they were.

use crate::error::MetaError;
use crate::state::{Entry, FolderState, LocalChange};
use crate::vector::VersionVector;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::{Path, PathBuf};
use tessera_crypto::{FolderId, PeerId};
use tessera_files::FileManifest;

const SCHEMA_VERSION: i64 = 1;

/// Result type for metadata operations
pub type Result<T> = std::result::Result<T, MetaError>;

/// Persistent state of one folder. Single writer.
pub struct MetaStore {
    conn: Connection,
    path: Option<PathBuf>,
    local: PeerId,
    state: FolderState,
}

impl MetaStore {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError::FolderMismatch`] if the file belongs to another
    /// folder, and [`MetaError::Database`]/[`MetaError::Corrupt`] if it
    /// cannot be read.
    pub fn open(path: &Path, folder_id: FolderId, local: PeerId) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn, Some(path.to_path_buf()), folder_id, local)
    }

    /// Volatile store, for tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError::Database`] if SQLite cannot start.
    pub fn open_in_memory(folder_id: FolderId, local: PeerId) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None, folder_id, local)
    }

    fn init(conn: Connection, path: Option<PathBuf>, folder_id: FolderId, local: PeerId) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
               key TEXT PRIMARY KEY,
               value BLOB NOT NULL
             );
             CREATE TABLE IF NOT EXISTS entries (
               path TEXT PRIMARY KEY,
               entry BLOB NOT NULL
             );",
        )?;

        let stored: Option<Vec<u8>> = conn
            .query_row("SELECT value FROM meta WHERE key='folder_id'", [], |row| row.get(0))
            .optional()?;
        match stored {
            Some(bytes) if bytes.as_slice() != folder_id.as_bytes() => {
                return Err(MetaError::FolderMismatch {
                    expected: folder_id.to_hex(),
                    found: hex::encode(bytes),
                });
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT INTO meta(key, value) VALUES('folder_id', ?1)",
                    params![folder_id.as_bytes().as_slice()],
                )?;
                conn.execute(
                    "INSERT INTO meta(key, value) VALUES('schema', ?1)",
                    params![SCHEMA_VERSION.to_be_bytes().as_slice()],
                )?;
            }
        }

        let state = Self::load(&conn, folder_id)?;
        tracing::debug!(
            "opened metadata for folder {} ({} entries)",
            folder_id.short(),
            state.len()
        );
        Ok(Self {
            conn,
            path,
            local,
            state,
        })
    }

    fn load(conn: &Connection, folder_id: FolderId) -> Result<FolderState> {
        let vector = match conn
            .query_row("SELECT value FROM meta WHERE key='vector'", [], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?
        {
            Some(bytes) => decode::<VersionVector>("vector", &bytes)?,
            None => VersionVector::new(),
        };

        let mut stmt = conn.prepare("SELECT path, entry FROM entries")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (path, bytes) = row?;
            entries.push(decode::<Entry>(&path, &bytes)?);
        }
        Ok(FolderState::from_parts(folder_id, vector, entries))
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &FolderState {
        &self.state
    }

    /// Local replica id.
    #[must_use]
    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Database file, if persistent.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record local mutations in one transaction, each bumping the local
    /// counter. Returns the new entries in order.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`] if the transaction fails; nothing is applied.
    pub fn record_local(&mut self, changes: Vec<LocalChange>, timestamp_ms: u64) -> Result<Vec<Entry>> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        let mut folder_vector = self.state.vector().clone();
        let entries: Vec<Entry> = changes
            .into_iter()
            .map(|c| self.state.prepare_local(self.local, c, timestamp_ms, &mut folder_vector))
            .collect();

        let tx = self.conn.transaction()?;
        for entry in &entries {
            write_entry(&tx, entry)?;
        }
        write_vector(&tx, &folder_vector)?;
        tx.commit()?;

        for entry in &entries {
            self.state.put(entry.clone());
        }
        self.state.set_vector(folder_vector);
        Ok(entries)
    }

    /// Apply merged entries atomically and absorb their vectors.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`] if the transaction fails; nothing is applied.
    pub fn apply(&mut self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut folder_vector = self.state.vector().clone();
        for entry in entries {
            folder_vector.join(&entry.vector);
        }

        let tx = self.conn.transaction()?;
        for entry in entries {
            write_entry(&tx, entry)?;
        }
        write_vector(&tx, &folder_vector)?;
        tx.commit()?;

        for entry in entries {
            self.state.put(entry.clone());
        }
        self.state.set_vector(folder_vector);
        Ok(())
    }

    /// Update recorded manifests whose metadata changed without a content
    /// change (new mtime after a touch or a materialization). Versions are
    /// untouched. Returns how many entries were updated.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`] if the transaction fails; nothing is applied.
    pub fn refresh(&mut self, manifests: &[FileManifest]) -> Result<usize> {
        let mut updated = Vec::new();
        for manifest in manifests {
            if let Some(entry) = self.state.get(&manifest.path) {
                if entry.manifest().is_some_and(|m| m.same_content(manifest)) {
                    updated.push(Entry {
                        kind: crate::state::EntryKind::File(manifest.clone()),
                        ..entry.clone()
                    });
                }
            }
        }
        if updated.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        for entry in &updated {
            write_entry(&tx, entry)?;
        }
        tx.commit()?;
        for entry in &updated {
            if let Some(m) = entry.manifest() {
                self.state.refresh(m.clone());
            }
        }
        Ok(updated.len())
    }

    /// Close the database and delete its files.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`] if the database cannot be closed or removed.
    pub fn purge(self) -> Result<()> {
        let path = self.path.clone();
        self.conn.close().map_err(|(_, e)| MetaError::Database(e))?;
        if let Some(path) = path {
            for suffix in ["", "-wal", "-shm"] {
                let mut file = path.clone().into_os_string();
                file.push(suffix);
                match std::fs::remove_file(&file) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            tracing::info!("purged metadata database {}", path.display());
        }
        Ok(())
    }
}

impl std::fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStore")
            .field("path", &self.path)
            .field("entries", &self.state.len())
            .finish_non_exhaustive()
    }
}

fn write_entry(tx: &Transaction<'_>, entry: &Entry) -> Result<()> {
    let bytes = encode(&entry.path, entry)?;
    tx.execute(
        "INSERT INTO entries(path, entry) VALUES(?1, ?2)
         ON CONFLICT(path) DO UPDATE SET entry=excluded.entry",
        params![entry.path, bytes],
    )?;
    Ok(())
}

fn write_vector(tx: &Transaction<'_>, vector: &VersionVector) -> Result<()> {
    let bytes = encode("vector", vector)?;
    tx.execute(
        "INSERT INTO meta(key, value) VALUES('vector', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        params![bytes],
    )?;
    Ok(())
}

fn encode<T: serde::Serialize>(key: &str, value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| MetaError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| MetaError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
