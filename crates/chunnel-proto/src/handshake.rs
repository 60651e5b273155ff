//! Fixed-token handshake
//!
//! Each role writes its raw token (not frame-encoded) as the very
//! first bytes of its chunked stream and verifies the peer's token
//! before honoring any data frames. Besides authenticating that both
//! ends speak the tunnel protocol, the exchange anchors the byte
//! offset at which frame-mode parsing begins.

use bytes::Bytes;

use crate::{DEFAULT_CLIENT_TOKEN, DEFAULT_SERVER_TOKEN};

/// The token pair configured identically on both peers.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Expected from the initiating (client) role.
    pub client: Bytes,
    /// Expected from the accepting (server) role.
    pub server: Bytes,
}

impl Handshake {
    pub fn new(client: impl Into<Bytes>, server: impl Into<Bytes>) -> Self {
        Self {
            client: client.into(),
            server: server.into(),
        }
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_TOKEN, DEFAULT_SERVER_TOKEN)
    }
}

/// Outcome of feeding bytes to a [`TokenMatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOutcome {
    /// Prefix matched so far; more bytes needed.
    Pending,
    /// Token fully consumed. Surplus bytes already belong to frame
    /// mode and must be handed to the frame decoder.
    Matched { remainder: Bytes },
    /// A byte differed. Comparison is exact in length and content.
    Mismatch,
}

/// Byte-for-byte matcher for the peer token at the head of a stream.
///
/// Tolerates the token arriving split across chunks: the matcher
/// consumes exactly the token's bytes and no more.
#[derive(Debug)]
pub struct TokenMatcher {
    expected: Bytes,
    matched: usize,
}

impl TokenMatcher {
    pub fn new(expected: Bytes) -> Self {
        Self {
            expected,
            matched: 0,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> TokenOutcome {
        let want = &self.expected[self.matched..];
        let n = want.len().min(chunk.len());
        if chunk[..n] != want[..n] {
            return TokenOutcome::Mismatch;
        }
        self.matched += n;
        if self.matched == self.expected.len() {
            TokenOutcome::Matched {
                remainder: Bytes::copy_from_slice(&chunk[n..]),
            }
        } else {
            TokenOutcome::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let mut matcher = TokenMatcher::new(Bytes::from_static(b"<"));
        assert_eq!(
            matcher.feed(b"<"),
            TokenOutcome::Matched {
                remainder: Bytes::new()
            }
        );
    }

    #[test]
    fn test_match_with_remainder() {
        let mut matcher = TokenMatcher::new(Bytes::from_static(b"<"));
        assert_eq!(
            matcher.feed(b"<[aGk=]"),
            TokenOutcome::Matched {
                remainder: Bytes::from_static(b"[aGk=]")
            }
        );
    }

    #[test]
    fn test_split_across_chunks() {
        let mut matcher = TokenMatcher::new(Bytes::from_static(b"secret"));
        assert_eq!(matcher.feed(b"sec"), TokenOutcome::Pending);
        assert_eq!(matcher.feed(b"r"), TokenOutcome::Pending);
        assert_eq!(
            matcher.feed(b"ettail"),
            TokenOutcome::Matched {
                remainder: Bytes::from_static(b"tail")
            }
        );
    }

    #[test]
    fn test_mismatch() {
        let mut matcher = TokenMatcher::new(Bytes::from_static(b"secret"));
        assert_eq!(matcher.feed(b"sex"), TokenOutcome::Mismatch);
    }

    #[test]
    fn test_mismatch_on_first_byte() {
        let mut matcher = TokenMatcher::new(Bytes::from_static(b"<"));
        assert_eq!(matcher.feed(b">"), TokenOutcome::Mismatch);
    }

    #[test]
    fn test_default_tokens() {
        let handshake = Handshake::default();
        assert_eq!(handshake.client, Bytes::from_static(b"<"));
        assert_eq!(handshake.server, Bytes::from_static(b">"));
    }
}
