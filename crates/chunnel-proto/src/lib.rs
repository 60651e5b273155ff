//! Tunnel Wire Protocol
//!
//! This crate defines the frame codec and handshake primitives for the
//! chunked-HTTP tunnel: arbitrary TCP bytes are carried as
//! `[` + base64 + `]` segments inside a chunked HTTP body, preceded by a
//! raw (unframed) handshake token exchange.

pub mod codec;
pub mod handshake;

pub use codec::{encode_frame, CodecError, FrameDecoder};
pub use handshake::{Handshake, TokenMatcher, TokenOutcome};

/// Default client-role handshake token.
pub const DEFAULT_CLIENT_TOKEN: &[u8] = b"<";

/// Default server-role handshake token.
pub const DEFAULT_SERVER_TOKEN: &[u8] = b">";
