//! Server counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Connection and request counters.
///
/// All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
pub struct ServerStats {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    requests_handled: AtomicU64,
    requests_rejected: AtomicU64,
    mutations_committed: AtomicU64,
    events_published: AtomicU64,
}

impl ServerStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request(&self, rejected: bool) {
        self.requests_handled.fetch_add(1, Ordering::Relaxed);
        if rejected {
            self.requests_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_commit(&self) {
        self.mutations_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_published(&self, deliveries: usize) {
        self.events_published
            .fetch_add(deliveries as u64, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            requests_handled: self.requests_handled.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            mutations_committed: self.mutations_committed.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Connections accepted.
    pub connections_accepted: u64,
    /// Connections refused at the connection limit.
    pub connections_rejected: u64,
    /// Requests answered.
    pub requests_handled: u64,
    /// Requests answered with a rejection.
    pub requests_rejected: u64,
    /// Mutations committed.
    pub mutations_committed: u64,
    /// Push frames queued, one per receiving connection.
    pub events_published: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = ServerStats::new();
        stats.record_connection_accepted();
        stats.record_request(false);
        stats.record_request(true);
        stats.record_commit();
        stats.record_published(3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_accepted, 1);
        assert_eq!(snapshot.requests_handled, 2);
        assert_eq!(snapshot.requests_rejected, 1);
        assert_eq!(snapshot.mutations_committed, 1);
        assert_eq!(snapshot.events_published, 3);
        assert_eq!(snapshot.connections_rejected, 0);
    }
}
