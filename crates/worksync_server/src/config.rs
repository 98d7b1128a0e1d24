//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;
use worksync_protocol::DEFAULT_MAX_FRAME_LEN;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Broadcast events buffered per connection before the oldest is dropped.
    pub outbound_capacity: usize,
    /// Responses buffered per connection. Never subject to dropping.
    pub response_queue_depth: usize,
    /// Largest accepted frame body.
    pub max_frame_len: usize,
    /// Whether to require token authentication.
    pub require_auth: bool,
    /// Secret key for token validation (if auth enabled).
    pub auth_secret: Option<Vec<u8>>,
    /// How long an issued token stays valid.
    pub token_expiry: Duration,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: 1000,
            outbound_capacity: 256,
            response_queue_depth: 64,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            require_auth: false,
            auth_secret: None,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the maximum concurrent connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Sets the per-connection broadcast capacity.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    /// Sets the per-connection response queue depth.
    pub fn with_response_queue_depth(mut self, depth: usize) -> Self {
        self.response_queue_depth = depth.max(1);
        self
    }

    /// Sets the maximum frame body length.
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }

    /// Sets the token expiry.
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 7420)))
    }
}
