//! Bracket-delimited base64 frame codec
//!
//! Frames look like `[aGVsbG8=]` followed by a newline flush marker.
//! Newlines are stream-flush hints only and are stripped before
//! parsing. The decoder is deliberately strict: the protocol assumes a
//! well-behaved peer, so any bracket disorder is fatal for the session
//! rather than a resynchronization point.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("bad packet: frame stream desynchronized")]
    BadPacket,
}

/// Encode one payload as a single wire frame: `[` + base64 + `]` + `\n`.
///
/// The trailing newline makes the underlying chunked transport flush
/// the frame immediately instead of buffering it.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let encoded = BASE64.encode(payload);
    let mut buf = BytesMut::with_capacity(encoded.len() + 3);
    buf.put_u8(b'[');
    buf.put_slice(encoded.as_bytes());
    buf.put_u8(b']');
    buf.put_u8(b'\n');
    buf.freeze()
}

/// Incremental frame decoder over a per-session accumulator.
///
/// Input may be split at arbitrary byte boundaries; partial trailing
/// data is retained across calls. After the first [`CodecError`] the
/// decoder is poisoned and every further `push` fails with the same
/// error.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    poisoned: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly arrived bytes, returning the complete frames they
    /// unlocked, in arrival order. Empty payloads (`[]`) are valid on
    /// the wire but are never surfaced.
    pub fn push(&mut self, input: &[u8]) -> Result<Vec<Bytes>, CodecError> {
        if self.poisoned {
            return Err(CodecError::BadPacket);
        }

        // Newlines are flush markers, not frame content.
        self.buf.reserve(input.len());
        for &b in input {
            if b != b'\n' {
                self.buf.put_u8(b);
            }
        }

        let mut frames = Vec::new();
        loop {
            if self.buf.is_empty() {
                break;
            }
            // Any unconsumed prefix that is not an opening bracket means
            // the stream is desynchronized. This also covers a `]`
            // arriving before any `[`.
            if self.buf[0] != b'[' {
                self.poisoned = true;
                return Err(CodecError::BadPacket);
            }
            let Some(end) = self.buf.iter().position(|&b| b == b']') else {
                // No complete frame yet; keep the partial segment.
                break;
            };
            let payload = match BASE64.decode(&self.buf[1..end]) {
                Ok(payload) => payload,
                Err(_) => {
                    self.poisoned = true;
                    return Err(CodecError::BadPacket);
                }
            };
            let _ = self.buf.split_to(end + 1);
            if !payload.is_empty() {
                frames.push(Bytes::from(payload));
            }
        }

        Ok(frames)
    }

    /// Bytes retained waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}
