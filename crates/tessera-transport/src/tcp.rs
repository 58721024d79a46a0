//! TCP transport.

use crate::transport::{
    Connection, StatsCounters, Transport, TransportError, TransportResult, TransportStats,
};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const LISTEN_BACKLOG: i32 = 128;

/// TCP listener plus outbound dialer.
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
    connect_timeout: Duration,
    closed: AtomicBool,
    close_notify: Notify,
    stats: StatsCounters,
}

impl TcpTransport {
    /// Bind a listener on `addr` (port 0 picks a free port).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] if the socket cannot be bound.
    pub async fn bind(addr: SocketAddr) -> TransportResult<Self> {
        let listener = Self::listen_socket(addr)
            .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        tracing::info!("TCP transport listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            stats: StatsCounters::default(),
        })
    }

    /// Override the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn listen_socket(addr: SocketAddr) -> std::io::Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        TcpListener::from_std(socket.into())
    }

    fn wrap(stream: TcpStream, peer_addr: SocketAddr) -> Connection {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed for {}: {}", peer_addr, e);
        }
        Connection {
            stream: Box::new(stream),
            peer_addr,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: SocketAddr) -> TransportResult<Connection> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                self.stats.record_open();
                tracing::debug!("connected to {}", addr);
                Ok(Self::wrap(stream, addr))
            }
            Ok(Err(e)) => {
                self.stats.record_failure();
                Err(TransportError::ConnectionFailed {
                    addr,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                self.stats.record_failure();
                Err(TransportError::Timeout(self.connect_timeout))
            }
        }
    }

    async fn accept(&self) -> TransportResult<Connection> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            result = self.listener.accept() => {
                let (stream, peer_addr) = result?;
                self.stats.record_accept();
                tracing::debug!("accepted connection from {}", peer_addr);
                Ok(Self::wrap(stream, peer_addr))
            }
            () = self.close_notify.notified() => Err(TransportError::Closed),
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.close_notify.notify_waiters();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_accept() {
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = transport.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let (client, server) = tokio::join!(transport.connect(addr), transport.accept());
        let mut client = client.unwrap();
        let mut server = server.unwrap();
        client.stream.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        server.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        let stats = transport.stats();
        assert_eq!(stats.connections_opened, 1);
        assert_eq!(stats.connections_accepted, 1);
    }

    #[tokio::test]
    async fn test_close_wakes_accept() {
        let transport = std::sync::Arc::new(
            TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap(),
        );
        let acceptor = {
            let t = transport.clone();
            tokio::spawn(async move { t.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.close().await.unwrap();
        let result = acceptor.await.unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        // Grab a free port, then release it so nothing listens there.
        let spare = TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let dead = spare.local_addr().unwrap();
        drop(spare);
        let result = transport.connect(dead).await;
        assert!(result.is_err());
        assert_eq!(transport.stats().connect_failures, 1);
    }
}
