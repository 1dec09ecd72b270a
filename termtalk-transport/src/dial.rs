//! Outbound connection seam.
//!
//! The joiner reaches the host through a [`Dialer`], so tests can hand it
//! an in-memory stream instead of a socket. [`Socks5Dialer`] routes the same
//! connection through a local Tor daemon.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

use crate::config::DEFAULT_CONNECT_TIMEOUT;
use crate::error::TransportError;

/// SOCKS5 port a local Tor daemon listens on by default.
pub const DEFAULT_TOR_PORT: u16 = 9050;

/// Something that can open a byte stream to an address.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Stream type produced by this dialer.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a stream to `addr` (`host:port`).
    async fn dial(&self, addr: &str) -> Result<Self::Stream, TransportError>;
}

/// Plain TCP dialer with a connect deadline.
#[derive(Debug, Clone, Copy)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    /// Dialer with a custom connect deadline.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self, addr: &str) -> Result<TcpStream, TransportError> {
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TransportError::ConnectionFailed(format!("{addr}: {e}"))),
            Err(_) => {
                return Err(TransportError::ConnectionFailed(format!(
                    "{addr}: timed out after {:?}",
                    self.connect_timeout
                )))
            }
        };
        stream.set_nodelay(true)?;
        tracing::debug!(%addr, "connected");
        Ok(stream)
    }
}

/// Dialer that tunnels through a SOCKS5 proxy.
///
/// The target host name goes to the proxy unresolved, so `.onion` addresses
/// work and no DNS lookup happens locally.
#[derive(Debug, Clone, Copy)]
pub struct Socks5Dialer {
    proxy: SocketAddr,
    connect_timeout: Duration,
}

impl Socks5Dialer {
    /// Dialer through the proxy at `proxy`.
    pub fn new(proxy: SocketAddr, connect_timeout: Duration) -> Self {
        Self {
            proxy,
            connect_timeout,
        }
    }

    /// Dialer through a Tor daemon on `127.0.0.1:port`.
    pub fn tor(port: u16, connect_timeout: Duration) -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), connect_timeout)
    }

    /// Proxy address.
    pub fn proxy(&self) -> SocketAddr {
        self.proxy
    }
}

#[async_trait]
impl Dialer for Socks5Dialer {
    type Stream = TcpStream;

    async fn dial(&self, addr: &str) -> Result<TcpStream, TransportError> {
        let proxy = self.proxy;
        let connect = Socks5Stream::connect(proxy, addr);
        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream.into_inner(),
            Ok(Err(e)) => {
                return Err(TransportError::ConnectionFailed(format!(
                    "{addr} via {proxy}: {e}"
                )))
            }
            Err(_) => {
                return Err(TransportError::ConnectionFailed(format!(
                    "{addr} via {proxy}: timed out after {:?}",
                    self.connect_timeout
                )))
            }
        };
        stream.set_nodelay(true)?;
        tracing::debug!(%addr, %proxy, "connected through proxy");
        Ok(stream)
    }
}
