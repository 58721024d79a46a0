//! End-to-end synchronization between two nodes on loopback.
//!
//! Each test starts two real nodes over TCP: the first listens, the second
//! knows it as a static peer. Multicast is off so tests do not see each
//! other.

use std::time::Duration;
use tessera_core::node::{ControllerState, SyncEvent};
use tessera_crypto::{Digest, FolderId};
use tessera_integration_tests::{SYNC_TIMEOUT, TestNode, init_tracing, wait_until, write};

/// Start the pair and wait until their sessions are up.
async fn pair(folder: FolderId, seed_files: &[(&str, &[u8])]) -> (TestNode, TestNode) {
    init_tracing();
    let first = TestNode::start(1, folder, &[], seed_files).await;
    let second = TestNode::start(2, folder, &[first.node.listen_addr()], &[]).await;
    assert!(
        wait_until(SYNC_TIMEOUT, || first.connected() && second.connected()).await,
        "nodes never connected"
    );
    (first, second)
}

async fn shutdown(nodes: (TestNode, TestNode)) {
    nodes.0.node.shutdown().await;
    nodes.1.node.shutdown().await;
}

// ============================================================================
// Basic sync
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_new_file_reaches_second_replica() {
    let folder = FolderId::from_secret("hello-sync");
    let (first, second) = pair(folder, &[("a.txt", b"hello")]).await;

    assert!(
        wait_until(SYNC_TIMEOUT, || {
            second.files().get("a.txt").map(Vec::as_slice) == Some(b"hello".as_slice())
        })
        .await,
        "a.txt never arrived: {:?}",
        second.files().keys().collect::<Vec<_>>()
    );

    let theirs = first.node.folder_state(&folder).unwrap();
    let ours = second.node.folder_state(&folder).unwrap();
    let theirs = theirs.get("a.txt").and_then(|e| e.manifest()).unwrap();
    let ours = ours.get("a.txt").and_then(|e| e.manifest()).unwrap();
    assert_eq!(ours.chunks.len(), 1);
    assert_eq!(ours.chunks[0].digest, Digest::of(b"hello"));
    assert_eq!(ours.chunks, theirs.chunks);
    assert_eq!(ours.root, theirs.root);

    assert!(
        wait_until(SYNC_TIMEOUT, || {
            second
                .node
                .folder_status(&folder)
                .is_ok_and(|s| s.is_in_sync() && s.state == ControllerState::Idle)
        })
        .await
    );
    shutdown((first, second)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_edits_and_deletes_propagate_both_ways() {
    let folder = FolderId::from_secret("two-way");
    let (first, second) = pair(folder, &[("docs/one.txt", b"one")]).await;
    assert!(wait_until(SYNC_TIMEOUT, || second.files().contains_key("docs/one.txt")).await);

    write(&second.root, "docs/two.txt", b"two");
    second.rescan().await;
    assert!(
        wait_until(SYNC_TIMEOUT, || {
            first.files().get("docs/two.txt").map(Vec::as_slice) == Some(b"two".as_slice())
        })
        .await
    );

    std::fs::remove_file(first.root.join("docs/one.txt")).unwrap();
    first.rescan().await;
    assert!(wait_until(SYNC_TIMEOUT, || !second.files().contains_key("docs/one.txt")).await);

    assert!(
        wait_until(SYNC_TIMEOUT, || {
            second
                .node
                .folder_state(&folder)
                .is_ok_and(|s| s.get("docs/one.txt").is_some_and(|e| e.is_tombstone()))
        })
        .await
    );
    assert_eq!(first.files(), second.files());
    shutdown((first, second)).await;
}

// ============================================================================
// Concurrent edits
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_edit_wins_over_concurrent_delete() {
    let folder = FolderId::from_secret("delete-vs-edit");
    let (first, second) = pair(folder, &[("a.txt", b"hello")]).await;
    assert!(wait_until(SYNC_TIMEOUT, || second.files().contains_key("a.txt")).await);

    std::fs::remove_file(first.root.join("a.txt")).unwrap();
    write(&second.root, "a.txt", b"world");
    tokio::join!(first.rescan(), second.rescan());

    let converged = |node: &TestNode| {
        let files = node.files();
        files.len() == 1 && files.get("a.txt").map(Vec::as_slice) == Some(b"world".as_slice())
    };
    assert!(
        wait_until(SYNC_TIMEOUT, || converged(&first) && converged(&second)).await,
        "first: {:?}, second: {:?}",
        first.files().keys().collect::<Vec<_>>(),
        second.files().keys().collect::<Vec<_>>()
    );

    // Settle, then make sure nothing brought the tombstone back.
    tokio::time::sleep(Duration::from_millis(500)).await;
    first.rescan().await;
    second.rescan().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(converged(&first) && converged(&second));
    shutdown((first, second)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_edits_keep_both_versions() {
    let folder = FolderId::from_secret("conflict");
    let (first, second) = pair(folder, &[("notes.md", b"base")]).await;
    assert!(wait_until(SYNC_TIMEOUT, || second.files().contains_key("notes.md")).await);
    let mut events = first.node.subscribe();

    write(&first.root, "notes.md", b"edited on first");
    write(&second.root, "notes.md", b"edited on second");
    tokio::join!(first.rescan(), second.rescan());

    let converged = || {
        let (a, b) = (first.files(), second.files());
        a == b && a.len() == 2
    };
    assert!(
        wait_until(SYNC_TIMEOUT, converged).await,
        "first: {:?}, second: {:?}",
        first.files().keys().collect::<Vec<_>>(),
        second.files().keys().collect::<Vec<_>>()
    );

    let files = first.files();
    let copy = files
        .keys()
        .find(|p| p.starts_with("notes.sync-conflict-") && p.ends_with(".md"))
        .expect("conflict copy present");
    let mut contents = vec![files["notes.md"].as_slice(), files[copy].as_slice()];
    contents.sort();
    assert_eq!(contents, vec![b"edited on first".as_slice(), b"edited on second".as_slice()]);

    let mut saw_conflict = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::ConflictDetected { path, conflict_path, .. } = event {
            assert_eq!(path, "notes.md");
            assert_eq!(&conflict_path, copy);
            saw_conflict = true;
        }
    }
    assert!(saw_conflict, "first node reported no conflict");
    shutdown((first, second)).await;
}

// ============================================================================
// Folder lifecycle
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_removed_folder_stops_syncing() {
    let folder = FolderId::from_secret("removal");
    let (first, second) = pair(folder, &[("keep.txt", b"kept")]).await;
    assert!(wait_until(SYNC_TIMEOUT, || second.files().contains_key("keep.txt")).await);

    second.node.remove_folder(&folder).await.unwrap();
    assert!(second.node.folders().is_empty());
    assert!(wait_until(SYNC_TIMEOUT, || !first.connected()).await);

    write(&first.root, "later.txt", b"not shared anymore");
    first.rescan().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!second.files().contains_key("later.txt"));
    // Files on disk are left alone.
    assert!(second.files().contains_key("keep.txt"));
    shutdown((first, second)).await;
}
