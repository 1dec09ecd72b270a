//! Newline-delimited line transport over any byte stream.
//!
//! Handshake keys and sealed frames both travel as one line each. The
//! codec enforces the frame ceiling while buffering, so an oversized line
//! is refused before it is ever handed to the decoder.

use futures_util::{SinkExt, StreamExt};
use termtalk_core::frame::{max_line_len, ENCODED_PUBLIC_KEY_LEN};
use termtalk_core::ProtocolError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::error::TransportError;

/// A byte stream split into text lines.
pub(crate) type LineLink<S> = Framed<S, LinesCodec>;

/// Wrap `stream` with a codec bounded by `max_frame_len`.
pub(crate) fn line_link<S>(stream: S, max_frame_len: usize) -> LineLink<S>
where
    S: AsyncRead + AsyncWrite,
{
    let max_line = max_line_len(max_frame_len).max(ENCODED_PUBLIC_KEY_LEN);
    Framed::new(stream, LinesCodec::new_with_max_length(max_line))
}

/// Write one line and flush it.
pub(crate) async fn send_line<S>(link: &mut LineLink<S>, line: &str) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    link.send(line).await.map_err(map_codec_error)
}

/// Read the next line. A clean EOF is reported as `PeerDisconnected`.
pub(crate) async fn recv_line<S>(link: &mut LineLink<S>) -> Result<String, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match link.next().await {
        Some(Ok(line)) => Ok(line),
        Some(Err(e)) => Err(map_codec_error(e)),
        None => Err(TransportError::PeerDisconnected),
    }
}

fn map_codec_error(e: LinesCodecError) -> TransportError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => ProtocolError::FrameTooLarge.into(),
        LinesCodecError::Io(e) => TransportError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn test_lines_roundtrip() {
        let (a, b) = duplex(1024);
        let mut left = line_link(a, 256);
        let mut right = line_link(b, 256);

        send_line(&mut left, "first").await.unwrap();
        send_line(&mut left, "second").await.unwrap();
        assert_eq!(recv_line(&mut right).await.unwrap(), "first");
        assert_eq!(recv_line(&mut right).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_oversized_line_rejected() {
        let (mut a, b) = duplex(64 * 1024);
        let mut right = line_link(b, 64);

        let line = "A".repeat(max_line_len(64) + 1);
        a.write_all(line.as_bytes()).await.unwrap();
        a.write_all(b"\n").await.unwrap();

        let err = recv_line(&mut right).await.unwrap_err();
        assert_eq!(err.protocol(), Some(ProtocolError::FrameTooLarge));
    }

    #[tokio::test]
    async fn test_eof_is_disconnect() {
        let (a, b) = duplex(64);
        let mut right = line_link(b, 64);
        drop(a);
        assert!(matches!(
            recv_line(&mut right).await,
            Err(TransportError::PeerDisconnected)
        ));
    }
}
