//! Node configuration

use crate::merge::TieBreak;
use crate::node::error::{NodeError, Result};
use crate::session::SessionConfig;
use rand::Rng;
use std::borrow::Cow;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;
use tessera_crypto::{FolderId, PeerId};
use tessera_discovery::{DEFAULT_MULTICAST_GROUP, MulticastConfig};
use tessera_files::{ArchiveMode, ChunkerConfig};

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Holds `chunks/` and `folders/`
    pub data_dir: PathBuf,

    /// Listen address for incoming sessions
    pub listen_addr: SocketAddr,

    /// Hex Ed25519 seed; generated on first start when missing
    pub identity_file: PathBuf,

    /// Folders shared at startup
    pub folders: Vec<FolderConfig>,

    /// Discovery configuration
    pub discovery: DiscoverySettings,

    /// Transfer configuration
    pub transfer: TransferConfig,

    /// Session limits and timers
    pub session: SessionConfig,

    /// Chunk size parameters
    pub chunker: ChunkerConfig,

    /// Redial backoff for peers that dropped or refused
    pub reconnect: RetryConfig,
}

impl NodeConfig {
    /// Defaults rooted at `data_dir`
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            identity_file: data_dir.join("identity.key"),
            data_dir,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 22000)),
            folders: Vec::new(),
            discovery: DiscoverySettings::default(),
            transfer: TransferConfig::default(),
            session: SessionConfig::default(),
            chunker: ChunkerConfig::default(),
            reconnect: RetryConfig {
                max_retries: u32::MAX,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(60),
                multiplier: 2.0,
                jitter: true,
            },
        }
    }

    /// Shared chunk store location
    #[must_use]
    pub fn chunk_dir(&self) -> PathBuf {
        self.data_dir.join("chunks")
    }

    /// Metadata database of a folder
    #[must_use]
    pub fn folder_db(&self, folder_id: &FolderId) -> PathBuf {
        self.data_dir
            .join("folders")
            .join(format!("{}.db", folder_id.to_hex()))
    }

    /// Check every section, including each folder.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidConfig`] naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.chunker
            .validate()
            .map_err(|e| NodeError::InvalidConfig(Cow::Owned(e.to_string())))?;
        self.session.validate().map_err(NodeError::invalid_config)?;
        self.transfer.validate()?;
        self.discovery.validate()?;
        let mut seen = std::collections::HashSet::new();
        for folder in &self.folders {
            folder.validate()?;
            if !seen.insert(folder.id) {
                return Err(NodeError::FolderExists(folder.id));
            }
        }
        Ok(())
    }
}

/// One shared folder
#[derive(Debug, Clone)]
pub struct FolderConfig {
    /// Identifier shared by every replica
    pub id: FolderId,
    /// Local directory
    pub root: PathBuf,
    /// Peers allowed to connect; empty trusts any authenticated peer
    pub trusted_peers: Vec<PeerId>,
    /// Extra ignore globs
    pub ignore_patterns: Vec<String>,
    /// Concurrent-edit winner policy
    pub tie_break: TieBreak,
    /// Full rescan period
    pub rescan_interval: Duration,
    /// Trigger rescans from filesystem notifications
    pub watch: bool,
    /// What happens to replaced or deleted files
    pub archive: ArchiveMode,
    /// Age after which archived files are removed; `None` keeps them
    pub archive_max_age: Option<Duration>,
}

impl FolderConfig {
    /// Folder with default policies
    #[must_use]
    pub fn new(id: FolderId, root: impl Into<PathBuf>) -> Self {
        Self {
            id,
            root: root.into(),
            trusted_peers: Vec::new(),
            ignore_patterns: Vec::new(),
            tie_break: TieBreak::default(),
            rescan_interval: Duration::from_secs(60),
            watch: true,
            archive: ArchiveMode::None,
            archive_max_age: None,
        }
    }

    /// # Errors
    ///
    /// Returns [`NodeError::InvalidConfig`] for a relative root or a zero
    /// rescan interval.
    pub fn validate(&self) -> Result<()> {
        if !self.root.is_absolute() {
            return Err(NodeError::InvalidConfig(Cow::Owned(format!(
                "folder root {} must be absolute",
                self.root.display()
            ))));
        }
        if self.rescan_interval.is_zero() {
            return Err(NodeError::invalid_config("rescan_interval must be non-zero"));
        }
        Ok(())
    }
}

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// LAN multicast announcements
    pub multicast: bool,
    /// Multicast group and port
    pub group: SocketAddrV4,
    /// Announcement period
    pub announce_interval: Duration,
    /// Rendezvous peers dialed for every folder
    pub static_peers: Vec<SocketAddr>,
    /// Static peer refresh period
    pub static_interval: Duration,
    /// Lifetime of a multicast sighting
    pub peer_ttl: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            multicast: true,
            group: DEFAULT_MULTICAST_GROUP,
            announce_interval: Duration::from_secs(30),
            static_peers: Vec::new(),
            static_interval: Duration::from_secs(60),
            peer_ttl: Duration::from_secs(90),
        }
    }
}

impl DiscoverySettings {
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidConfig`] for a non-multicast group or a
    /// TTL shorter than the announce interval.
    pub fn validate(&self) -> Result<()> {
        if self.multicast && !self.group.ip().is_multicast() {
            return Err(NodeError::invalid_config("discovery group is not a multicast address"));
        }
        if self.peer_ttl <= self.announce_interval {
            return Err(NodeError::invalid_config(
                "peer_ttl must exceed announce_interval",
            ));
        }
        Ok(())
    }

    /// Multicast settings for the discovery manager, if enabled
    #[must_use]
    pub fn multicast_config(&self) -> Option<MulticastConfig> {
        self.multicast.then(|| MulticastConfig {
            group: self.group,
            interval: self.announce_interval,
            ..MulticastConfig::default()
        })
    }
}

/// Transfer configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// In-flight chunk requests per peer
    pub max_in_flight_per_peer: usize,
    /// In-flight chunk requests per folder
    pub max_in_flight: usize,
    /// A request unanswered for this long counts as failed
    pub request_timeout: Duration,
    /// Per-chunk retry policy
    pub retry: RetryConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_in_flight_per_peer: 8,
            max_in_flight: 32,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

impl TransferConfig {
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidConfig`] for zero limits or a per-peer
    /// limit above the global one.
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight_per_peer == 0 || self.max_in_flight == 0 {
            return Err(NodeError::invalid_config("transfer limits must be non-zero"));
        }
        if self.max_in_flight_per_peer > self.max_in_flight {
            return Err(NodeError::invalid_config(
                "max_in_flight_per_peer exceeds max_in_flight",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(NodeError::invalid_config("request_timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Retry configuration for exponential backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: u32,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Add up to 25% random jitter
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for attempt number
    #[must_use]
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_backoff.as_millis() as f64);

        let millis = if self.jitter {
            capped * (1.0 + rand::thread_rng().gen_range(0.0..0.25))
        } else {
            capped
        };

        Duration::from_millis(millis as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_calculation() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(config.backoff_duration(0).as_millis(), 100);
        assert_eq!(config.backoff_duration(1).as_millis(), 200);
        assert_eq!(config.backoff_duration(2).as_millis(), 400);
        assert_eq!(config.backoff_duration(10).as_millis(), 10_000);
        assert_eq!(config.backoff_duration(u32::MAX).as_millis(), 10_000);
    }

    #[test]
    fn test_retry_backoff_with_jitter() {
        let config = RetryConfig {
            jitter: true,
            initial_backoff: Duration::from_millis(1000),
            ..RetryConfig::default()
        };
        for _ in 0..20 {
            let ms = config.backoff_duration(0).as_millis();
            assert!((1000..1250).contains(&ms), "{ms}");
        }
    }

    #[test]
    fn test_node_config_validation() {
        let mut config = NodeConfig::new("/var/lib/tessera");
        assert!(config.validate().is_ok());
        assert!(config.folder_db(&FolderId::from_bytes([0xAA; 32])).ends_with(format!(
            "folders/{}.db",
            "aa".repeat(32)
        )));

        let folder = FolderConfig::new(FolderId::from_bytes([1u8; 32]), "/srv/docs");
        config.folders = vec![folder.clone(), folder];
        assert!(matches!(config.validate(), Err(NodeError::FolderExists(_))));

        config.folders = vec![FolderConfig::new(FolderId::from_bytes([1u8; 32]), "relative")];
        assert!(matches!(config.validate(), Err(NodeError::InvalidConfig(_))));
    }

    #[test]
    fn test_transfer_and_discovery_validation() {
        let transfer = TransferConfig {
            max_in_flight_per_peer: 64,
            max_in_flight: 8,
            ..TransferConfig::default()
        };
        assert!(transfer.validate().is_err());

        let discovery = DiscoverySettings {
            group: SocketAddrV4::new([10, 0, 0, 1].into(), 28914),
            ..DiscoverySettings::default()
        };
        assert!(discovery.validate().is_err());
        assert!(
            DiscoverySettings {
                multicast: false,
                ..discovery
            }
            .multicast_config()
            .is_none()
        );
    }
}
