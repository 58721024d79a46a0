//! Helpers for driving real nodes in integration tests.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tessera_core::node::{FolderConfig, Node, NodeConfig};
use tessera_crypto::{DeviceKey, FolderId};

/// Upper bound for any convergence wait
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// A node with its own data directory and one shared folder root
pub struct TestNode {
    /// The running node
    pub node: Node,
    /// Root of the shared folder
    pub root: PathBuf,
    /// Shared folder
    pub folder: FolderId,
    _dir: TempDir,
}

impl TestNode {
    /// Start a node on loopback with multicast off, sharing `folder` and
    /// dialing `static_peers`. Files in `seed_files` are written before the
    /// node starts so its first scan picks them up.
    pub async fn start(
        seed: u8,
        folder: FolderId,
        static_peers: &[SocketAddr],
        seed_files: &[(&str, &[u8])],
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("share");
        std::fs::create_dir_all(&root).expect("create root");
        for (path, data) in seed_files {
            write(&root, path, data);
        }

        let config = test_config(dir.path(), folder, &root, static_peers);
        let node = Node::start(config, DeviceKey::from_seed(&[seed; 32]))
            .await
            .expect("node starts");
        Self {
            node,
            root,
            folder,
            _dir: dir,
        }
    }

    /// Ask the folder to pick up local edits now
    pub async fn rescan(&self) {
        self.node.rescan(&self.folder).await.expect("rescan");
    }

    /// Whether a session to any peer is up
    pub fn connected(&self) -> bool {
        self.node
            .connected_peers(&self.folder)
            .is_ok_and(|peers| !peers.is_empty())
    }

    /// Every synced file under the root, by relative path
    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        files_under(&self.root)
    }
}

/// Node configuration tuned for fast loopback tests
pub fn test_config(
    data: &Path,
    folder: FolderId,
    root: &Path,
    static_peers: &[SocketAddr],
) -> NodeConfig {
    let mut config = NodeConfig::new(data.join("data"));
    config.listen_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    config.discovery.multicast = false;
    config.discovery.static_peers = static_peers.to_vec();
    config.discovery.static_interval = Duration::from_secs(2);
    config.reconnect.initial_backoff = Duration::from_millis(100);
    config.reconnect.max_backoff = Duration::from_secs(1);
    config.session.ping_interval = Duration::from_secs(1);
    config.session.idle_timeout = Duration::from_secs(10);
    config.transfer.request_timeout = Duration::from_secs(5);
    config.transfer.retry.initial_backoff = Duration::from_millis(100);

    let mut shared = FolderConfig::new(folder, root);
    shared.watch = false;
    config.folders.push(shared);
    config
}

/// Write a file, creating parent directories
pub fn write(root: &Path, rel: &str, data: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent");
    }
    std::fs::write(path, data).expect("write file");
}

/// Regular files under `root`, skipping the `.tessera` system directory
pub fn files_under(root: &Path) -> BTreeMap<String, Vec<u8>> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.file_name() != tessera_files::SYSTEM_DIR)
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let rel = e.path().strip_prefix(root).ok()?.to_str()?.replace('\\', "/");
            let data = std::fs::read(e.path()).ok()?;
            Some((rel, data))
        })
        .collect()
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Install a test subscriber honoring `RUST_LOG`; repeated calls are fine
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
