//! Relay pumps shared by both roles
//!
//! Each session runs two independent pumps: TCP reads are encoded one
//! frame per read and sent as exactly one HTTP body chunk (so frames
//! from one session never interleave at the byte level), and incoming
//! HTTP body chunks are run through the frame decoder and written to
//! the TCP side in arrival order. A shared `CancellationToken` ties
//! the two directions together: whichever pump ends first cancels the
//! other, which drops both endpoints.

use bytes::Bytes;
use chunnel_proto::{encode_frame, FrameDecoder, TokenMatcher, TokenOutcome};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::HeaderMap;
use std::convert::Infallible;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{SessionError, SessionId};

/// One chunk of an outbound streaming HTTP body.
pub type BodyFrame = hyper::body::Frame<Bytes>;

/// Sender feeding an outbound streaming HTTP body. Each message
/// becomes one chunk on the wire.
pub type BodySender = mpsc::Sender<Result<BodyFrame, Infallible>>;

/// Read buffer size for the TCP side of a session.
pub const READ_BUF_SIZE: usize = 8192;

/// Bound on in-flight outbound chunks per session.
pub const BODY_CHANNEL_CAPACITY: usize = 32;

/// Whether the peer declared chunked transfer encoding.
pub fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get(hyper::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

/// Queue one chunk on the outbound body.
pub async fn send_chunk(tx: &BodySender, data: Bytes) -> Result<(), SessionError> {
    tx.send(Ok(BodyFrame::data(data)))
        .await
        .map_err(|_| SessionError::ChannelClosed)
}

/// TCP -> HTTP direction: encode each nonempty read as one frame.
///
/// Returns `Ok(())` on clean TCP EOF; dropping the sender afterwards
/// terminates the outbound chunked body.
pub async fn copy_tcp_to_body<R>(
    mut rd: R,
    tx: BodySender,
    session: SessionId,
    cancel: CancellationToken,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = rd.read(&mut buf) => match res {
                Ok(0) => {
                    debug!("TCP side closed (session {})", session);
                    return Ok(());
                }
                Ok(n) => {
                    trace!("Encoding {} bytes (session {})", n, session);
                    send_chunk(&tx, encode_frame(&buf[..n])).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// HTTP -> TCP direction: decode body chunks and write payloads.
///
/// `initial` carries surplus bytes the token matcher already pulled
/// off the stream. Returns `Ok(())` on clean body EOF.
pub async fn copy_body_to_tcp<W>(
    mut body: Incoming,
    mut wr: W,
    mut decoder: FrameDecoder,
    initial: Bytes,
    session: SessionId,
    cancel: CancellationToken,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    for payload in decoder.push(&initial)? {
        wr.write_all(&payload).await?;
    }
    if !initial.is_empty() {
        wr.flush().await?;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = body.frame() => match frame {
                Some(Ok(frame)) => {
                    let Some(data) = frame.data_ref() else {
                        // Trailers; nothing to relay.
                        continue;
                    };
                    trace!("Decoding {} bytes (session {})", data.len(), session);
                    for payload in decoder.push(data)? {
                        wr.write_all(&payload).await?;
                    }
                    wr.flush().await?;
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    debug!("HTTP stream ended (session {})", session);
                    return Ok(());
                }
            }
        }
    }
}

/// Drive the handshake phase on an incoming HTTP body.
///
/// Consumes exactly the expected token's bytes and returns whatever
/// surplus arrived with them. Stream end before the full token, or
/// any differing byte, fails the handshake.
pub async fn await_token(
    body: &mut Incoming,
    mut matcher: TokenMatcher,
    cancel: &CancellationToken,
) -> Result<Bytes, SessionError> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::ChannelClosed),
            frame = body.frame() => match frame {
                Some(Ok(frame)) => {
                    let Some(data) = frame.data_ref() else {
                        continue;
                    };
                    match matcher.feed(data) {
                        TokenOutcome::Matched { remainder } => return Ok(remainder),
                        TokenOutcome::Mismatch => return Err(SessionError::HandshakeFailed),
                        TokenOutcome::Pending => {}
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Err(SessionError::HandshakeFailed),
            }
        }
    }
}
