//! Outward synchronization events and folder status.

use crate::node::error::ErrorKind;
use serde::Serialize;
use std::net::SocketAddr;
use tessera_crypto::{Digest, FolderId, PeerId};

/// What a folder's controller is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// Nothing to do
    Idle,
    /// Indexing local files
    Scanning,
    /// No session yet; waiting for discovery
    Discovering,
    /// Exchanging metadata with a peer
    Exchanging,
    /// Reconciling remote entries
    Merging,
    /// Fetching chunks
    Transferring,
    /// Writing files to disk
    Materializing,
    /// Metadata can no longer be persisted; sync is halted
    Degraded,
}

/// Point-in-time view of a folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderStatus {
    /// Folder
    pub folder_id: FolderId,
    /// Controller state
    pub state: ControllerState,
    /// Entries, tombstones included
    pub entries: usize,
    /// Live files
    pub files: usize,
    /// Connected peers
    pub peers: usize,
    /// Remote updates waiting for chunks or disk
    pub pending: usize,
    /// Chunks still wanted
    pub wanted_chunks: usize,
    /// Chunks given up on
    pub unavailable_chunks: usize,
}

impl FolderStatus {
    pub(crate) fn new(folder_id: FolderId) -> Self {
        Self {
            folder_id,
            state: ControllerState::Idle,
            entries: 0,
            files: 0,
            peers: 0,
            pending: 0,
            wanted_chunks: 0,
            unavailable_chunks: 0,
        }
    }

    /// Nothing pending and no chunk outstanding
    #[must_use]
    pub fn is_in_sync(&self) -> bool {
        self.pending == 0 && self.wanted_chunks == 0 && self.state != ControllerState::Degraded
    }
}

/// Events broadcast by a [`crate::node::Node`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A controller changed state
    FolderStateChanged {
        /// Folder
        folder_id: FolderId,
        /// New state
        state: ControllerState,
    },
    /// Session to a peer became active
    PeerJoined {
        /// Folder
        folder_id: FolderId,
        /// Remote identity
        peer_id: PeerId,
        /// Remote endpoint
        addr: SocketAddr,
    },
    /// Session to a peer ended
    PeerLeft {
        /// Folder
        folder_id: FolderId,
        /// Remote identity
        peer_id: PeerId,
        /// Why it ended
        reason: String,
    },
    /// Chunk transfer progress of a folder
    TransferProgress {
        /// Folder
        folder_id: FolderId,
        /// Chunks fetched so far
        completed: u64,
        /// Chunks still wanted
        remaining: usize,
        /// Bytes fetched so far
        bytes: u64,
    },
    /// Concurrent edits; the losing content was kept at `conflict_path`
    ConflictDetected {
        /// Folder
        folder_id: FolderId,
        /// Contested path
        path: String,
        /// Where the losing version lives
        conflict_path: String,
        /// Replica whose version kept the path
        winner_origin: PeerId,
        /// Replica whose version was moved aside
        loser_origin: PeerId,
    },
    /// A chunk exhausted its retries
    ChunkUnavailable {
        /// Folder
        folder_id: FolderId,
        /// Chunk
        digest: Digest,
    },
    /// A file was written or removed from remote state
    FileUpdated {
        /// Folder
        folder_id: FolderId,
        /// Path
        path: String,
        /// Whether the update removed the file
        deleted: bool,
    },
    /// Something failed; see `kind`
    Error {
        /// Folder, when the error is folder-scoped
        folder_id: Option<FolderId>,
        /// Taxonomy bucket
        kind: ErrorKind,
        /// Description
        message: String,
    },
}

impl SyncEvent {
    /// Folder the event concerns
    #[must_use]
    pub fn folder_id(&self) -> Option<FolderId> {
        match self {
            SyncEvent::FolderStateChanged { folder_id, .. }
            | SyncEvent::PeerJoined { folder_id, .. }
            | SyncEvent::PeerLeft { folder_id, .. }
            | SyncEvent::TransferProgress { folder_id, .. }
            | SyncEvent::ConflictDetected { folder_id, .. }
            | SyncEvent::ChunkUnavailable { folder_id, .. }
            | SyncEvent::FileUpdated { folder_id, .. } => Some(*folder_id),
            SyncEvent::Error { folder_id, .. } => *folder_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_in_sync() {
        let mut status = FolderStatus::new(FolderId::from_bytes([1u8; 32]));
        assert!(status.is_in_sync());
        status.wanted_chunks = 2;
        assert!(!status.is_in_sync());
        status.wanted_chunks = 0;
        status.state = ControllerState::Degraded;
        assert!(!status.is_in_sync());
    }

    #[test]
    fn test_event_folder_and_json() {
        let folder = FolderId::from_bytes([2u8; 32]);
        let event = SyncEvent::Error {
            folder_id: None,
            kind: ErrorKind::Protocol,
            message: "bad tag".into(),
        };
        assert_eq!(event.folder_id(), None);

        let event = SyncEvent::FolderStateChanged {
            folder_id: folder,
            state: ControllerState::Merging,
        };
        assert_eq!(event.folder_id(), Some(folder));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"folder_state_changed\""));
        assert!(json.contains("\"state\":\"merging\""));
    }
}
