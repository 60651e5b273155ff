//! Initiator role: TCP listener + outbound chunked HTTP client
//!
//! Accepts local TCP connections and forwards each one as a single
//! long-lived chunked `PUT` request to the remote acceptor.

mod server;

pub use server::{InitiatorConfig, InitiatorError, InitiatorServer, DEFAULT_BIND_ADDR};
