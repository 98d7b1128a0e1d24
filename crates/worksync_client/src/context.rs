//! Per-call request context.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Explicit context threaded through every client call.
///
/// Carries the correlation id stamped into outgoing envelopes and the
/// cancellation signal honoured by the dispatcher, breaker and retry policy.
#[derive(Debug, Clone)]
pub struct RequestContext {
    correlation_id: Uuid,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Creates a context with a fresh correlation id.
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
        }
    }

    /// Uses an existing correlation id.
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Uses an existing cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Derives a context with the same correlation id whose cancellation
    /// follows this one but can also be cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            correlation_id: self.correlation_id,
            cancel: self.cancel.child_token(),
        }
    }

    /// Returns the correlation id.
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Returns the cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
