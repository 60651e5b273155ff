//! Per-connection session lifecycle
//!
//! One session exists per accepted TCP connection (initiator) or per
//! accepted HTTP request (acceptor). Both roles drive the same state
//! machine and the same pair of relay pumps; the roles differ only in
//! when they connect their outbound endpoint and which side of the
//! handshake they verify.

pub mod relay;
pub mod session;

pub use relay::{
    copy_body_to_tcp, copy_tcp_to_body, is_chunked, send_chunk, BodyFrame, BodySender,
};
pub use session::{Session, SessionId, SessionIdGenerator, SessionState};

use chunnel_proto::CodecError;
use thiserror::Error;

/// Session-level errors. All of these are local to one session; the
/// listeners keep accepting regardless.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("HTTP protocol error: {0}")]
    Http(#[from] http::Error),

    #[error("peer did not use chunked transfer encoding")]
    NotChunked,

    #[error("handshake failed")]
    HandshakeFailed,

    #[error("{0}")]
    BadPacket(#[from] CodecError),

    /// The opposite direction of this session is already gone. This is
    /// ordinary teardown, not a fault.
    #[error("session channel closed")]
    ChannelClosed,
}

impl SessionError {
    /// Whether this error is part of normal teardown rather than a
    /// fault worth surfacing.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, SessionError::ChannelClosed)
    }
}
