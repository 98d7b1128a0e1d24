//! # worksync client
//!
//! Resilient real-time sync client with optimistic entity stores.
//!
//! This crate provides:
//! - Transport links with a single-writer discipline
//! - A request dispatcher with per-request timeouts and push routing
//! - Circuit breaker and retry policy around every request
//! - A session state machine that rebuilds the link, re-authenticates and
//!   restores subscriptions after connection loss
//! - `EntityStore`, an optimistic per-kind cache with rollback
//! - `Replica`, the store set plus its reconciliation task
//!
//! ## Layering
//!
//! ```text
//! EntityStore ──► RequestSender (SyncClient)
//!                   └─► RetryPolicy ─► CircuitBreaker ─► Dispatcher ─► Link
//! ```
//!
//! ## Key Invariants
//!
//! - At most one mutation per entity id is in flight
//! - Every mutation ends confirmed or rolled back, never half-applied
//! - Cache writes from the server are version-gated
//! - Mutations fail fast while the connection is not `Connected`

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod circuit;
mod client;
mod config;
mod context;
mod dispatcher;
mod error;
mod observer;
mod replica;
mod retry;
mod session;
mod store;
#[cfg(test)]
mod testing;
mod transport;

pub use circuit::{CircuitBreaker, CircuitState};
pub use client::{RequestSender, SyncClient};
pub use config::{BreakerConfig, ClientConfig, RetryConfig};
pub use context::RequestContext;
pub use dispatcher::Dispatcher;
pub use error::{SyncError, SyncResult};
pub use observer::{Observer, ObserverId, ObserverList, DEFAULT_OBSERVER_CAPACITY};
pub use replica::Replica;
pub use retry::RetryPolicy;
pub use session::{ConnectionState, SessionMachine, SessionState};
pub use store::{
    ChangeCause, EntityStore, OperationAction, OperationStatus, PendingOperation, StoreChange,
};
pub use transport::{Connector, LinkEvent, TcpConnector};
