//! Error types for the sync server.

use thiserror::Error;
use worksync_protocol::{
    EntityId, EntityKind, ProtocolError, RejectCode, Rejection, ValidationError,
};

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Message sent to clients in place of internal error details.
const INTERNAL_MESSAGE: &str = "internal server error";

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The subject is not registered.
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),

    /// Authorization failed.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// The entity failed validation.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The expected version does not match the stored version.
    #[error("version conflict: expected {expected}, actual {actual}")]
    VersionConflict {
        /// Version the client submitted.
        expected: u64,
        /// Version the server holds.
        actual: u64,
    },

    /// No live entity with that id.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Entity kind.
        kind: EntityKind,
        /// Entity id.
        id: EntityId,
    },

    /// Protocol version mismatch.
    #[error("protocol version mismatch: {0}")]
    ProtocolMismatch(String),

    /// Encoding or framing error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if the client caused this error.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::UnknownIdentity(_)
                | ServerError::NotAuthorized(_)
                | ServerError::Validation(_)
                | ServerError::VersionConflict { .. }
                | ServerError::NotFound { .. }
                | ServerError::ProtocolMismatch(_)
        )
    }

    /// Returns true if the server is at fault.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            ServerError::Protocol(_) | ServerError::Internal(_) | ServerError::Io(_)
        )
    }

    /// Converts the error into a wire rejection. Server-side failures are
    /// reported generically; their details stay in the logs.
    pub fn to_rejection(&self) -> Rejection {
        match self {
            ServerError::InvalidRequest(message) | ServerError::ProtocolMismatch(message) => {
                Rejection::new(RejectCode::InvalidRequest, message.clone())
            }
            ServerError::AuthenticationFailed(message) => {
                Rejection::new(RejectCode::Unauthenticated, message.clone())
            }
            ServerError::UnknownIdentity(_) => {
                Rejection::new(RejectCode::UnknownIdentity, "identity is not registered")
            }
            ServerError::NotAuthorized(message) => {
                Rejection::new(RejectCode::Unauthorized, message.clone())
            }
            ServerError::Validation(e) => Rejection::new(RejectCode::Validation, e.to_string()),
            ServerError::VersionConflict { expected, actual } => {
                Rejection::version_conflict(*expected, *actual)
            }
            ServerError::NotFound { .. } => Rejection::new(RejectCode::NotFound, self.to_string()),
            ServerError::Protocol(_) | ServerError::Internal(_) | ServerError::Io(_) => {
                Rejection::new(RejectCode::Internal, INTERNAL_MESSAGE)
            }
        }
    }
}
