//! Drives the key exchange over a line link.
//!
//! Both roles write their public key line first and then read the peer's,
//! so neither side waits on the other before sending. The whole exchange
//! runs under one deadline.

use std::time::Duration;

use termtalk_core::{Handshake, KeyAgreement, ProtocolError, Role, SessionKey};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TransportError;
use crate::link::{recv_line, send_line, LineLink};

/// Output of a completed exchange.
pub(crate) struct Established {
    pub(crate) key: SessionKey,
    pub(crate) fingerprint: String,
}

/// Run the exchange with the given key-agreement primitive.
///
/// On any failure the handshake is moved to `Failed` and its key pair is
/// dropped before this returns.
pub(crate) async fn perform_handshake<K, S>(
    link: &mut LineLink<S>,
    role: Role,
    deadline: Duration,
) -> Result<Established, TransportError>
where
    K: KeyAgreement,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hs = Handshake::<K>::with_agreement(role);

    let outcome = tokio::time::timeout(deadline, exchange(&mut hs, link)).await;
    match outcome {
        Ok(Ok(established)) => Ok(established),
        Ok(Err(e)) => {
            hs.fail();
            tracing::debug!(?role, error = %e, "handshake failed");
            Err(e)
        }
        Err(_) => {
            hs.fail();
            tracing::debug!(?role, ?deadline, "handshake timed out");
            Err(ProtocolError::HandshakeTimeout.into())
        }
    }
}

async fn exchange<K, S>(
    hs: &mut Handshake<K>,
    link: &mut LineLink<S>,
) -> Result<Established, TransportError>
where
    K: KeyAgreement,
    S: AsyncRead + AsyncWrite + Unpin,
{
    hs.generate_keys()?;
    let ours = hs.public_key_line()?;
    send_line(link, &ours).await?;

    let theirs = match recv_line(link).await {
        Ok(line) => line,
        // A line longer than any frame is certainly not a key.
        Err(TransportError::Protocol(ProtocolError::FrameTooLarge)) => {
            return Err(ProtocolError::HandshakeFailed.into())
        }
        Err(e) => return Err(e),
    };
    hs.receive_peer_key(theirs.trim_end_matches('\r'))?;

    let key = hs.derive_session_key()?;
    let fingerprint = hs
        .fingerprint()
        .ok_or(TransportError::Protocol(ProtocolError::UnexpectedState))?;

    Ok(Established { key, fingerprint })
}
