//! Acceptor role: chunked HTTP listener + backend TCP client
//!
//! Receives the initiator's long-lived chunked `PUT` requests, maps
//! the request path to a backend TCP service, and relays the tunneled
//! byte stream both ways.

mod server;

pub use server::{AcceptorConfig, AcceptorError, AcceptorServer, DEFAULT_BIND_ADDR};
