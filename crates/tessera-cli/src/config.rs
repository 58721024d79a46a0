//! Configuration file for the `tessera` daemon.
//!
//! The file is TOML with a default for every field, so an empty file is a
//! valid configuration. [`Config::to_node_config`] turns it into the
//! library's [`NodeConfig`].

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tessera_core::TieBreak;
use tessera_core::node::{DiscoverySettings, FolderConfig, NodeConfig};
use tessera_crypto::{FolderId, PeerId};
use tessera_files::ArchiveMode;

/// Tessera configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Node configuration
    pub node: NodeSection,
    /// Discovery configuration
    pub discovery: DiscoverySection,
    /// Transfer configuration
    pub transfer: TransferSection,
    /// Session configuration
    pub session: SessionSection,
    /// Chunker configuration
    pub chunker: ChunkerSection,
    /// Logging configuration
    pub logging: LoggingSection,
    /// Shared folders
    pub folders: Vec<FolderSection>,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Chunk store and metadata databases
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Identity key file; defaults to `<data_dir>/identity.key`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    /// LAN multicast announcements
    #[serde(default = "default_true")]
    pub multicast: bool,
    /// Multicast group and port
    #[serde(default = "default_group")]
    pub group: String,
    /// Seconds between announcements
    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,
    /// Rendezvous peers (`host:port`)
    #[serde(default)]
    pub static_peers: Vec<String>,
    /// Seconds between static peer refreshes
    #[serde(default = "default_static_interval")]
    pub static_interval_secs: u64,
    /// Seconds a multicast sighting stays valid
    #[serde(default = "default_peer_ttl")]
    pub peer_ttl_secs: u64,
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSection {
    /// In-flight chunk requests per peer
    #[serde(default = "default_per_peer")]
    pub max_in_flight_per_peer: usize,
    /// In-flight chunk requests per folder
    #[serde(default = "default_in_flight")]
    pub max_in_flight: usize,
    /// Seconds before an unanswered request fails
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Attempts per chunk before it is reported unavailable
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// Open sessions across all folders
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Seconds of outbound silence before a ping
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Seconds of inbound silence before the session closes
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

/// Chunker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerSection {
    /// Smallest chunk in bytes
    #[serde(default = "default_min_chunk")]
    pub min_size: usize,
    /// Largest chunk in bytes
    #[serde(default = "default_max_chunk")]
    pub max_size: usize,
    /// Average chunk is about `2^avg_bits` bytes past `min_size`
    #[serde(default = "default_avg_bits")]
    pub avg_bits: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level or `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// One shared folder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderSection {
    /// Folder id (64 hex characters)
    pub id: String,
    /// Local directory
    pub root: PathBuf,
    /// Peer ids allowed to connect; empty trusts any authenticated peer
    #[serde(default)]
    pub trusted_peers: Vec<String>,
    /// Extra ignore globs
    #[serde(default)]
    pub ignore: Vec<String>,
    /// `timestamp` or `digest`
    #[serde(default)]
    pub tie_break: TieBreak,
    /// Seconds between full rescans
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_secs: u64,
    /// Rescan on filesystem notifications
    #[serde(default = "default_true")]
    pub watch: bool,
    /// `none`, `trash`, or `{ timestamp = { keep = N } }`
    #[serde(default)]
    pub archive: ArchiveMode,
    /// Days before archived files are removed; 0 keeps them
    #[serde(default)]
    pub archive_max_age_days: u64,
}

// Default values

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".tessera")
}

fn default_listen_addr() -> String {
    "0.0.0.0:22000".to_string()
}

fn default_true() -> bool {
    true
}

fn default_group() -> String {
    DiscoverySettings::default().group.to_string()
}

fn default_announce_interval() -> u64 {
    30
}

fn default_static_interval() -> u64 {
    60
}

fn default_peer_ttl() -> u64 {
    90
}

fn default_per_peer() -> usize {
    8
}

fn default_in_flight() -> usize {
    32
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    5
}

fn default_max_sessions() -> usize {
    64
}

fn default_ping_interval() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    90
}

fn default_min_chunk() -> usize {
    tessera_files::DEFAULT_MIN_CHUNK
}

fn default_max_chunk() -> usize {
    tessera_files::DEFAULT_MAX_CHUNK
}

fn default_avg_bits() -> u32 {
    tessera_files::DEFAULT_AVG_BITS
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rescan_interval() -> u64 {
    60
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            listen_addr: default_listen_addr(),
            identity_file: None,
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            multicast: true,
            group: default_group(),
            announce_interval_secs: default_announce_interval(),
            static_peers: Vec::new(),
            static_interval_secs: default_static_interval(),
            peer_ttl_secs: default_peer_ttl(),
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            max_in_flight_per_peer: default_per_peer(),
            max_in_flight: default_in_flight(),
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            ping_interval_secs: default_ping_interval(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for ChunkerSection {
    fn default() -> Self {
        Self {
            min_size: default_min_chunk(),
            max_size: default_max_chunk(),
            avg_bits: default_avg_bits(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("tessera/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Identity key file location
    #[must_use]
    pub fn identity_file(&self) -> PathBuf {
        self.node
            .identity_file
            .as_deref()
            .map_or_else(|| expand_home(&self.node.data_dir).join("identity.key"), expand_home)
    }

    /// Build the library configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for unparsable addresses or ids, unresolvable static
    /// peers, or values the library rejects.
    pub fn to_node_config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = NodeConfig::new(expand_home(&self.node.data_dir));
        config.identity_file = self.identity_file();
        config.listen_addr = self
            .node
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address {}", self.node.listen_addr))?;

        let discovery = &mut config.discovery;
        discovery.multicast = self.discovery.multicast;
        discovery.group = self
            .discovery
            .group
            .parse()
            .with_context(|| format!("invalid multicast group {}", self.discovery.group))?;
        discovery.announce_interval = Duration::from_secs(self.discovery.announce_interval_secs);
        discovery.static_interval = Duration::from_secs(self.discovery.static_interval_secs);
        discovery.peer_ttl = Duration::from_secs(self.discovery.peer_ttl_secs);
        for peer in &self.discovery.static_peers {
            discovery.static_peers.push(resolve(peer)?);
        }

        config.transfer.max_in_flight_per_peer = self.transfer.max_in_flight_per_peer;
        config.transfer.max_in_flight = self.transfer.max_in_flight;
        config.transfer.request_timeout = Duration::from_secs(self.transfer.request_timeout_secs);
        config.transfer.retry.max_retries = self.transfer.max_retries;

        config.session.max_sessions = self.session.max_sessions;
        config.session.ping_interval = Duration::from_secs(self.session.ping_interval_secs);
        config.session.idle_timeout = Duration::from_secs(self.session.idle_timeout_secs);

        config.chunker.min_size = self.chunker.min_size;
        config.chunker.max_size = self.chunker.max_size;
        config.chunker.avg_bits = self.chunker.avg_bits;

        for folder in &self.folders {
            config.folders.push(folder.to_folder_config()?);
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        let level = self.logging.level.to_lowercase();
        if !level.contains('=') && !valid_log_levels.contains(&level.as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }
        self.to_node_config().map(|_| ())
    }
}

impl FolderSection {
    fn to_folder_config(&self) -> anyhow::Result<FolderConfig> {
        let id: FolderId = self
            .id
            .parse()
            .with_context(|| format!("folder id '{}' is not 64 hex characters", self.id))?;
        let mut folder = FolderConfig::new(id, expand_home(&self.root));
        for peer in &self.trusted_peers {
            let peer: PeerId = peer
                .parse()
                .with_context(|| format!("trusted peer '{peer}' is not a peer id"))?;
            folder.trusted_peers.push(peer);
        }
        folder.ignore_patterns.clone_from(&self.ignore);
        folder.tie_break = self.tie_break;
        folder.rescan_interval = Duration::from_secs(self.rescan_interval_secs);
        folder.watch = self.watch;
        folder.archive = self.archive;
        folder.archive_max_age = (self.archive_max_age_days > 0)
            .then(|| Duration::from_secs(self.archive_max_age_days.saturating_mul(24 * 3600)));
        Ok(folder)
    }
}

/// Replace a leading `~` with the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().map_or_else(|| path.to_path_buf(), |home| home.join(rest)),
        Err(_) => path.to_path_buf(),
    }
}

fn resolve(peer: &str) -> anyhow::Result<SocketAddr> {
    peer.to_socket_addrs()
        .with_context(|| format!("static peer '{peer}' (expected host:port)"))?
        .next()
        .with_context(|| format!("static peer '{peer}' did not resolve"))
}
