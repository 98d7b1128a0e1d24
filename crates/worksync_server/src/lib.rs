//! # worksync server
//!
//! Real-time sync server with scoped change broadcast.
//!
//! This crate provides:
//! - A TCP accept loop with a connection limit and graceful shutdown
//! - Per-connection read and write loops over the length-prefixed CBOR
//!   frame protocol
//! - Request handling with optimistic version checks
//! - `ConnectionRegistry`, which fans committed changes out to every
//!   connection subscribed to the affected scope
//! - Authentication (HMAC-SHA256 tokens with a registered-subject roster)
//!
//! # Broadcast
//!
//! Change events are published only after the repository commit succeeds.
//! Each connection has a bounded outbox; when it is full the oldest queued
//! event is dropped and a warning is logged, so a stalled peer never slows
//! delivery to the others. The originating connection receives its own
//! events like any other subscriber.
//!
//! # Authentication
//!
//! ```rust,ignore
//! use worksync_server::{AuthConfig, ServerConfig, TokenValidator};
//!
//! let secret = b"my-secure-secret-32-bytes-long!".to_vec();
//! let config = ServerConfig::default().with_auth(secret.clone());
//!
//! // Issue a token for a subject
//! let validator = TokenValidator::new(AuthConfig::new(secret));
//! let token = validator.create_token("ada")?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod connection;
mod error;
mod handler;
mod registry;
mod repository;
mod server;
mod stats;

pub use auth::{
    AuthConfig, Authenticator, HmacAuthenticator, OpenAuthenticator, TokenValidator, TOKEN_LEN,
};
pub use config::ServerConfig;
pub use connection::serve_connection;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use registry::{ConnectionId, ConnectionRegistry, Outbox};
pub use repository::{EntityRepository, MemoryRepository};
pub use server::SyncServer;
pub use stats::{ServerStats, StatsSnapshot};
