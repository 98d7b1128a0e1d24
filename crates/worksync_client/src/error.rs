//! Error types for the sync client.

use crate::session::{ConnectionState, SessionState};
use std::time::Duration;
use thiserror::Error;
use worksync_protocol::{
    EntityId, EntityKind, MessageId, ProtocolError, RejectCode, Rejection, ValidationError,
};

/// Result type for client operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Longest rejection message surfaced to callers.
const MAX_MESSAGE_LEN: usize = 256;

/// Errors that can occur while talking to the sync server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The transport could not be established or was lost.
    #[error("connection failure: {message}")]
    ConnectionFailure {
        /// Error message.
        message: String,
    },

    /// Low-level I/O failure.
    #[error("i/o error: {message}")]
    Io {
        /// Error message.
        message: String,
    },

    /// No response arrived before the deadline.
    #[error("request {message_id} timed out after {timeout:?}")]
    RequestTimeout {
        /// Id of the abandoned request.
        message_id: MessageId,
        /// Configured request timeout.
        timeout: Duration,
    },

    /// The circuit breaker is open; the call was not attempted.
    #[error("circuit open, retry after {retry_after:?}")]
    CircuitOpen {
        /// Remaining cooldown.
        retry_after: Duration,
    },

    /// The expected version no longer matches the server.
    #[error("version conflict on {entity_id}: expected {expected}, actual {actual}")]
    VersionConflict {
        /// Target entity.
        entity_id: EntityId,
        /// Version the client submitted.
        expected: u64,
        /// Version the server holds.
        actual: u64,
    },

    /// The server refused the request.
    #[error("server rejected request ({code:?}): {message}")]
    ServerRejected {
        /// Rejection code.
        code: RejectCode,
        /// Sanitized message.
        message: String,
    },

    /// The entity failed client-side validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The entity is not in the local cache.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Entity kind.
        kind: EntityKind,
        /// Entity id.
        id: EntityId,
    },

    /// The connection is not usable right now.
    #[error("not connected (connection is {state})")]
    NotConnected {
        /// Connection state at the time of the call.
        state: ConnectionState,
    },

    /// Another mutation of the same entity has not resolved yet.
    #[error("a mutation of {kind} {id} is already in flight")]
    MutationInFlight {
        /// Entity kind.
        kind: EntityKind,
        /// Entity id.
        id: EntityId,
    },

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// Identity could not be established.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Attempted session transition is not in the transition table.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: SessionState,
        /// Attempted target state.
        to: SessionState,
    },

    /// The server answered with the wrong response type.
    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        /// Expected response type.
        expected: &'static str,
        /// Received response type.
        actual: &'static str,
    },

    /// Encoding or framing error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SyncError {
    /// Creates a connection failure.
    pub fn connection_failure(message: impl Into<String>) -> Self {
        Self::ConnectionFailure {
            message: message.into(),
        }
    }

    /// Maps a server rejection onto the client taxonomy.
    ///
    /// `entity_id` is the target of the rejected request, if any.
    pub fn from_rejection(rejection: Rejection, entity_id: Option<EntityId>) -> Self {
        match (
            rejection.code,
            entity_id,
            rejection.expected_version,
            rejection.actual_version,
        ) {
            (RejectCode::VersionConflict, Some(entity_id), Some(expected), Some(actual)) => {
                Self::VersionConflict {
                    entity_id,
                    expected,
                    actual,
                }
            }
            (code, ..) => Self::ServerRejected {
                code,
                message: sanitize_message(&rejection.message),
            },
        }
    }

    /// Returns true for the transient kinds the retry policy may retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailure { .. }
                | SyncError::Io { .. }
                | SyncError::RequestTimeout { .. }
        )
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            message: e.to_string(),
        }
    }
}

impl From<ValidationError> for SyncError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e.to_string())
    }
}

/// Keeps the first line of a server message, without control characters,
/// truncated to a fixed length.
pub(crate) fn sanitize_message(message: &str) -> String {
    message
        .lines()
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_MESSAGE_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_allow_list() {
        assert!(SyncError::connection_failure("reset").is_transient());
        assert!(SyncError::from(std::io::Error::other("broken pipe")).is_transient());
        assert!(SyncError::RequestTimeout {
            message_id: MessageId::new(),
            timeout: Duration::from_secs(1),
        }
        .is_transient());

        assert!(!SyncError::CircuitOpen {
            retry_after: Duration::from_secs(1)
        }
        .is_transient());
        assert!(!SyncError::Validation("title".into()).is_transient());
        assert!(!SyncError::Cancelled.is_transient());
        assert!(!SyncError::VersionConflict {
            entity_id: EntityId::new(),
            expected: 1,
            actual: 2,
        }
        .is_transient());
    }

    #[test]
    fn version_conflict_from_rejection() {
        let id = EntityId::new();
        let err = SyncError::from_rejection(Rejection::version_conflict(3, 5), Some(id));
        assert_eq!(
            err,
            SyncError::VersionConflict {
                entity_id: id,
                expected: 3,
                actual: 5,
            }
        );
    }

    #[test]
    fn rejection_message_is_sanitized() {
        let long = "x".repeat(1000);
        let rejection = Rejection::new(
            RejectCode::Validation,
            format!("bad\u{7}title\nat /srv/app/handler.rs:42 {long}"),
        );
        match SyncError::from_rejection(rejection, None) {
            SyncError::ServerRejected { code, message } => {
                assert_eq!(code, RejectCode::Validation);
                assert_eq!(message, "badtitle");
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(sanitize_message(&long).len(), MAX_MESSAGE_LEN);
    }

    #[test]
    fn error_display() {
        let err = SyncError::NotConnected {
            state: ConnectionState::Reconnecting,
        };
        assert_eq!(err.to_string(), "not connected (connection is reconnecting)");
    }
}
