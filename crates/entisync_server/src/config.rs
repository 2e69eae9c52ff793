//! Server configuration.

use std::net::SocketAddr;

/// Configuration for the REST server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,
    /// Maximum accepted header block size in bytes.
    pub max_header_bytes: usize,
}

impl ServerConfig {
    /// Creates a configuration bound to `bind_addr`.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_body_bytes: 1024 * 1024,
            max_header_bytes: 16 * 1024,
        }
    }

    /// Sets the maximum request body size.
    #[must_use]
    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}
