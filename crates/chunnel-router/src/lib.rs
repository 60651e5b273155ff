//! Request-path routing for the acceptor
//!
//! Maps HTTP request paths (exact string match) to backend TCP
//! addresses. The table is built once at startup and read-only at
//! session time; targets are kept as `host:port` strings so hostnames
//! resolve at connect time.

use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, trace};

/// Routing errors
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no route for path: {0}")]
    NotFound(String),

    #[error("invalid route spec: {0}")]
    InvalidSpec(String),

    #[error("invalid routes file: {0}")]
    InvalidFile(String),
}

/// Immutable path -> backend address table.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, String>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The out-of-the-box map: `/ssh` and `/web` to local services.
    pub fn defaults() -> Self {
        let mut table = Self::new();
        table.insert("/ssh", "127.0.0.1:22");
        table.insert("/web", "127.0.0.1:80");
        table
    }

    pub fn insert(&mut self, path: impl Into<String>, target: impl Into<String>) {
        let (path, target) = (path.into(), target.into());
        debug!("Registering route: {} -> {}", path, target);
        self.routes.insert(path, target);
    }

    /// Parse and register a `/path=host:port` spec.
    pub fn insert_spec(&mut self, spec: &str) -> Result<(), RouteError> {
        let (path, target) = spec
            .split_once('=')
            .ok_or_else(|| RouteError::InvalidSpec(spec.to_string()))?;
        if !path.starts_with('/') {
            return Err(RouteError::InvalidSpec(spec.to_string()));
        }
        let valid_port = target
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);
        if !valid_port {
            return Err(RouteError::InvalidSpec(spec.to_string()));
        }
        self.insert(path, target);
        Ok(())
    }

    /// Load a JSON object of `{"/path": "host:port"}` entries.
    pub fn from_json(json: &str) -> Result<Self, RouteError> {
        let map: HashMap<String, String> = serde_json::from_str(json)
            .map_err(|e| RouteError::InvalidFile(e.to_string()))?;
        let mut table = Self::new();
        for (path, target) in map {
            table.insert_spec(&format!("{}={}", path, target))?;
        }
        Ok(table)
    }

    /// Lookup the backend for a request path (exact match).
    pub fn lookup(&self, path: &str) -> Result<&str, RouteError> {
        trace!("Looking up route for {}", path);
        self.routes
            .get(path)
            .map(String::as_str)
            .ok_or_else(|| RouteError::NotFound(path.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let mut table = RouteTable::new();
        table.insert("/ssh", "127.0.0.1:22");

        assert_eq!(table.lookup("/ssh").unwrap(), "127.0.0.1:22");
        assert!(matches!(
            table.lookup("/web"),
            Err(RouteError::NotFound(_))
        ));
    }

    #[test]
    fn test_exact_match_only() {
        let mut table = RouteTable::new();
        table.insert("/ssh", "127.0.0.1:22");

        assert!(table.lookup("/ssh/").is_err());
        assert!(table.lookup("/SSH").is_err());
        assert!(table.lookup("/ssh2").is_err());
    }

    #[test]
    fn test_insert_spec() {
        let mut table = RouteTable::new();
        table.insert_spec("/db=localhost:5432").unwrap();
        assert_eq!(table.lookup("/db").unwrap(), "localhost:5432");

        assert!(table.insert_spec("no-equals").is_err());
        assert!(table.insert_spec("missing-slash=127.0.0.1:1").is_err());
        assert!(table.insert_spec("/bad=127.0.0.1").is_err());
        assert!(table.insert_spec("/bad=127.0.0.1:notaport").is_err());
    }

    #[test]
    fn test_from_json() {
        let table =
            RouteTable::from_json(r#"{"/ssh": "127.0.0.1:22", "/web": "127.0.0.1:80"}"#).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup("/web").unwrap(), "127.0.0.1:80");

        assert!(RouteTable::from_json("not json").is_err());
        assert!(RouteTable::from_json(r#"{"/x": "no-port"}"#).is_err());
    }

    #[test]
    fn test_defaults() {
        let table = RouteTable::defaults();
        assert_eq!(table.lookup("/ssh").unwrap(), "127.0.0.1:22");
        assert_eq!(table.lookup("/web").unwrap(), "127.0.0.1:80");
    }
}
