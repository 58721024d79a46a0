//! LAN discovery over UDP multicast.
//!
//! Every node periodically sends one [`Announce`] per shared folder to the
//! multicast group. Receivers learn the sender's identity and listening port
//! from the datagram and its source IP from the socket.

use crate::manager::DiscoveryError;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tessera_crypto::{FolderId, PeerId, PROTOCOL_VERSION};
use tokio::net::UdpSocket;

/// Default multicast group and port.
pub const DEFAULT_MULTICAST_GROUP: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 192, 152, 144), 28914);

/// Largest datagram accepted from the group.
pub const MAX_ANNOUNCE_SIZE: usize = 512;

const ANNOUNCE_MAGIC: u32 = 0x7E55_E4A0;

/// Multicast settings.
#[derive(Debug, Clone)]
pub struct MulticastConfig {
    /// Group address and port
    pub group: SocketAddrV4,
    /// Time between announcements
    pub interval: Duration,
    /// Receive our own datagrams (needed when several nodes share a host)
    pub loopback: bool,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_MULTICAST_GROUP,
            interval: Duration::from_secs(30),
            loopback: true,
        }
    }
}

/// One announcement datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    magic: u32,
    /// Protocol version of the sender
    pub version: u16,
    /// Folder being shared
    pub folder_id: FolderId,
    /// Sender identity
    pub peer_id: PeerId,
    /// TCP port the sender accepts sessions on
    pub port: u16,
}

impl Announce {
    /// Build an announcement for the current protocol version.
    #[must_use]
    pub fn new(folder_id: FolderId, peer_id: PeerId, port: u16) -> Self {
        Self {
            magic: ANNOUNCE_MAGIC,
            version: PROTOCOL_VERSION,
            folder_id,
            peer_id,
            port,
        }
    }

    /// Encode for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Codec`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DiscoveryError> {
        bincode::serialize(self).map_err(|e| DiscoveryError::Codec(e.to_string()))
    }

    /// Decode and check magic and version.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Codec`] for foreign or malformed datagrams.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DiscoveryError> {
        let announce: Self =
            bincode::deserialize(bytes).map_err(|e| DiscoveryError::Codec(e.to_string()))?;
        if announce.magic != ANNOUNCE_MAGIC {
            return Err(DiscoveryError::Codec("bad magic".into()));
        }
        if announce.version != PROTOCOL_VERSION {
            return Err(DiscoveryError::Codec(format!(
                "unsupported version {}",
                announce.version
            )));
        }
        Ok(announce)
    }

    /// Where the sender accepts sessions, given the datagram's source.
    #[must_use]
    pub fn endpoint(&self, source: SocketAddr) -> SocketAddr {
        SocketAddr::new(source.ip(), self.port)
    }
}

/// Open a UDP socket joined to the group.
///
/// The socket is bound to the group port on all interfaces with address
/// reuse so several nodes on one host can listen at once.
///
/// # Errors
///
/// Returns the underlying I/O error if any socket option fails.
pub fn bind(config: &MulticastConfig) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.group.port());
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v4(config.group.ip(), &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(config.loopback)?;
    socket.set_multicast_ttl_v4(1)?;
    UdpSocket::from_std(socket.into())
}

/// Decode a received datagram, dropping our own and foreign traffic.
pub(crate) fn interpret(
    datagram: &[u8],
    source: SocketAddr,
    local: &PeerId,
) -> Option<(Announce, SocketAddr)> {
    match Announce::from_bytes(datagram) {
        Ok(announce) if announce.peer_id == *local => None,
        Ok(announce) => {
            let endpoint = announce.endpoint(source);
            Some((announce, endpoint))
        }
        Err(e) => {
            tracing::trace!("ignoring datagram from {}: {}", source, e);
            None
        }
    }
}
