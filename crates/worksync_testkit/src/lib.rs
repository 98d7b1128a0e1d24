//! # worksync testkit
//!
//! Test utilities for worksync.
//!
//! This crate provides:
//! - Entity fixtures for every kind
//! - Property-based test generators using proptest
//! - An in-memory connector and a test cluster that run real clients
//!   against a real server without sockets
//!
//! ## Usage
//!
//! ```rust,ignore
//! use worksync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn two_clients_see_each_other() {
//!     let cluster = TestCluster::new();
//!     let alice = cluster.client("alice").await;
//!     let bob = cluster.client("bob").await;
//!     // ... test operations
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cluster::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use cluster::*;
pub use fixtures::*;
pub use generators::*;
