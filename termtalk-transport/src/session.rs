//! Secure session API.
//!
//! A [`SecureSession`] owns one connection after a completed handshake and
//! moves text over it as sealed frames.
//!
//! # Security Invariants
//!
//! - `SecureSession` does not implement `Clone`
//! - Any error in `send_text()` or `recv()` terminates the session
//! - `burn(self)` consumes the session; key material is zeroized on drop
//! - Only inbound frames reset the idle timer

use std::time::Duration;

use termtalk_core::handshake::X25519;
use termtalk_core::{KeyAgreement, ProtocolError, Role, SecureChannel};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::config::{deadline_after, SessionConfig};
use crate::dial::Dialer;
use crate::error::TransportError;
use crate::handshake::perform_handshake;
use crate::link::{line_link, recv_line, send_line, LineLink};
use crate::message::Message;

/// An established, encrypted session with one peer.
pub struct SecureSession<S = TcpStream> {
    link: LineLink<S>,
    channel: SecureChannel,
    role: Role,
    fingerprint: String,
    idle_timeout: Duration,
    last_inbound: Instant,
    terminated: bool,
}

impl<S> SecureSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the handshake over `stream` and return the established session.
    ///
    /// # Errors
    ///
    /// `HandshakeTimeout` if the exchange does not finish within
    /// `config.handshake_timeout`, `HandshakeFailed` for a malformed or
    /// degenerate peer key, or the underlying I/O error.
    pub async fn establish(
        stream: S,
        role: Role,
        config: &SessionConfig,
    ) -> Result<Self, TransportError> {
        Self::establish_with::<X25519>(stream, role, config).await
    }

    /// Like [`establish`](Self::establish), over a chosen key-agreement
    /// primitive.
    pub async fn establish_with<K: KeyAgreement>(
        stream: S,
        role: Role,
        config: &SessionConfig,
    ) -> Result<Self, TransportError> {
        let mut link = line_link(stream, config.max_frame_len);
        let established =
            perform_handshake::<K, S>(&mut link, role, config.handshake_timeout).await?;

        tracing::debug!(?role, fingerprint = %established.fingerprint, "session established");

        Ok(Self {
            link,
            channel: SecureChannel::with_max_frame_len(established.key, config.max_frame_len),
            role,
            fingerprint: established.fingerprint,
            idle_timeout: config.idle_timeout,
            last_inbound: Instant::now(),
            terminated: false,
        })
    }

    /// Encrypt and send one text message.
    ///
    /// # Errors
    ///
    /// Empty or oversized text, a terminated session, or a write failure.
    /// Every error terminates the session.
    pub async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        if self.terminated {
            return Err(TransportError::SessionTerminated);
        }

        let result = self.send_text_inner(text).await;
        if result.is_err() {
            self.terminated = true;
        }
        result
    }

    /// Like [`send_text`](Self::send_text), but gives up at `deadline`.
    ///
    /// A peer that stops reading can stall a write indefinitely once the
    /// socket buffers fill. Passing [`idle_deadline`](Self::idle_deadline)
    /// bounds that stall by the same window as a silent read.
    ///
    /// # Errors
    ///
    /// `IdleTimeout` if the write has not finished by `deadline`, otherwise
    /// as for `send_text`. Every error terminates the session.
    pub async fn send_text_until(
        &mut self,
        text: &str,
        deadline: Instant,
    ) -> Result<(), TransportError> {
        if self.terminated {
            return Err(TransportError::SessionTerminated);
        }

        let result = match tokio::time::timeout_at(deadline, self.send_text_inner(text)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::IdleTimeout.into()),
        };
        if result.is_err() {
            self.terminated = true;
        }
        result
    }

    async fn send_text_inner(&mut self, text: &str) -> Result<(), TransportError> {
        let line = self.channel.encrypt_frame(text)?;
        send_line(&mut self.link, &line).await
    }

    /// Receive and authenticate the next message.
    ///
    /// Cancel-safe: a `recv()` dropped inside `select!` loses no data and
    /// does not terminate the session.
    ///
    /// # Errors
    ///
    /// `IdleTimeout` if nothing arrives within the idle window,
    /// `AuthenticationFailed` for a frame that does not verify,
    /// `FrameTooLarge` for an oversized line, `PeerDisconnected` on EOF.
    /// Every error terminates the session.
    pub async fn recv(&mut self) -> Result<Message, TransportError> {
        if self.terminated {
            return Err(TransportError::SessionTerminated);
        }

        let result = self.recv_inner().await;
        if result.is_err() {
            self.terminated = true;
        }
        result
    }

    async fn recv_inner(&mut self) -> Result<Message, TransportError> {
        let deadline = self.idle_deadline();
        let line = match tokio::time::timeout_at(deadline, recv_line(&mut self.link)).await {
            Ok(line) => line?,
            Err(_) => return Err(ProtocolError::IdleTimeout.into()),
        };
        self.last_inbound = Instant::now();

        let text = self.channel.decrypt_text(line.trim_end_matches('\r'))?;
        Ok(Message::new(text))
    }

    /// When the session times out unless another frame arrives.
    pub fn idle_deadline(&self) -> Instant {
        deadline_after(self.last_inbound, self.idle_timeout)
    }

    /// Session fingerprint for out-of-band comparison (16 hex characters).
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Our side of the handshake.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the session can still be used.
    pub fn is_active(&self) -> bool {
        !self.terminated
    }

    /// Shut down the write half and drop the session.
    pub async fn close(mut self) -> Result<(), TransportError> {
        self.terminated = true;
        self.link.get_mut().shutdown().await?;
        Ok(())
    }

    /// Immediate termination. Key material is zeroized as the session drops.
    pub fn burn(mut self) {
        self.terminated = true;
    }
}

impl<S> SecureSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Dial `addr` and establish a session as the initiator.
    pub async fn connect<D>(
        dialer: &D,
        addr: &str,
        config: &SessionConfig,
    ) -> Result<Self, TransportError>
    where
        D: Dialer<Stream = S>,
    {
        let stream = dialer.dial(addr).await?;
        Self::establish(stream, Role::Initiator, config).await
    }
}

impl<S> std::fmt::Debug for SecureSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("role", &self.role)
            .field("fingerprint", &self.fingerprint)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    async fn pair(config: SessionConfig) -> (SecureSession<DuplexStream>, SecureSession<DuplexStream>) {
        let (a, b) = duplex(128 * 1024);
        let (l, r) = tokio::join!(
            SecureSession::establish(a, Role::Initiator, &config),
            SecureSession::establish(b, Role::Responder, &config),
        );
        (l.unwrap(), r.unwrap())
    }

    #[tokio::test]
    async fn test_exchange_both_ways() {
        let (mut alice, mut bob) = pair(SessionConfig::default()).await;
        assert_eq!(alice.fingerprint(), bob.fingerprint());
        assert_eq!(alice.fingerprint().len(), 16);

        alice.send_text("hello bob").await.unwrap();
        assert_eq!(bob.recv().await.unwrap().as_str(), "hello bob");

        bob.send_text("hello alice").await.unwrap();
        assert_eq!(alice.recv().await.unwrap().as_str(), "hello alice");
    }

    #[tokio::test]
    async fn test_send_empty_terminates() {
        let (mut alice, _bob) = pair(SessionConfig::default()).await;
        let err = alice.send_text("").await.unwrap_err();
        assert_eq!(err.protocol(), Some(ProtocolError::EmptyPlaintext));
        assert!(!alice.is_active());
        assert!(matches!(
            alice.send_text("again").await,
            Err(TransportError::SessionTerminated)
        ));
    }

    #[tokio::test]
    async fn test_tampered_frame_terminates() {
        let (mut alice, mut bob) = pair(SessionConfig::default()).await;
        // Write a well-formed but unauthenticated frame underneath the session.
        let forged = termtalk_core::SealedFrame::new([0u8; 12], vec![0u8; 32]).encode();
        send_line(&mut alice.link, &forged).await.unwrap();

        let err = bob.recv().await.unwrap_err();
        assert_eq!(err.protocol(), Some(ProtocolError::AuthenticationFailed));
        assert!(!bob.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let config = SessionConfig::default().with_idle_timeout(Duration::from_secs(2));
        let (_alice, mut bob) = pair(config).await;

        let start = Instant::now();
        let err = bob.recv().await.unwrap_err();
        assert_eq!(err.protocol(), Some(ProtocolError::IdleTimeout));
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_does_not_reset_idle() {
        let config = SessionConfig::default().with_idle_timeout(Duration::from_secs(2));
        let (mut alice, mut bob) = pair(config).await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        bob.send_text("still here").await.unwrap();
        let _ = alice.recv().await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(1), bob.recv())
            .await
            .expect("idle deadline should fire before 1s")
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_unbounded_idle_timeout_does_not_overflow() {
        let config = SessionConfig::default().with_idle_timeout(Duration::from_secs(u64::MAX));
        let (mut alice, mut bob) = pair(config).await;
        assert!(bob.idle_deadline() > Instant::now());

        alice.send_text("no overflow").await.unwrap();
        assert_eq!(bob.recv().await.unwrap().as_str(), "no overflow");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_times_out_at_idle_deadline() {
        // A tiny pipe the peer never drains: the first large frame blocks.
        let config = SessionConfig::default().with_idle_timeout(Duration::from_secs(2));
        let (a, b) = duplex(1024);
        let (host, peer) = tokio::join!(
            SecureSession::establish(a, Role::Responder, &config),
            SecureSession::establish(b, Role::Initiator, &config),
        );
        let (mut host, _peer) = (host.unwrap(), peer.unwrap());

        let start = Instant::now();
        let big = "x".repeat(32 * 1024);
        let err = host
            .send_text_until(&big, host.idle_deadline())
            .await
            .unwrap_err();
        assert_eq!(err.protocol(), Some(ProtocolError::IdleTimeout));
        assert!(start.elapsed() <= Duration::from_secs(2));
        assert!(!host.is_active());
    }

    #[tokio::test]
    async fn test_recv_is_cancel_safe() {
        let (mut alice, mut bob) = pair(SessionConfig::default()).await;

        tokio::select! {
            _ = bob.recv() => panic!("nothing was sent"),
            _ = tokio::task::yield_now() => {}
        }
        assert!(bob.is_active());

        alice.send_text("after cancel").await.unwrap();
        assert_eq!(bob.recv().await.unwrap().as_str(), "after cancel");
    }

    #[tokio::test]
    async fn test_close_reaches_peer() {
        let (alice, mut bob) = pair(SessionConfig::default()).await;
        alice.close().await.unwrap();
        assert!(matches!(
            bob.recv().await,
            Err(TransportError::PeerDisconnected)
        ));
    }
}
