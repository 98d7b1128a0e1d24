//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding wire messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Failed to encode a message to CBOR.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode CBOR bytes into a message.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// A frame header announced a body larger than the configured maximum.
    #[error("frame of {len} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Announced body length.
        len: usize,
        /// Configured maximum body length.
        max: usize,
    },
}

impl ProtocolError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Returns true if the byte stream can no longer be trusted after this error.
    ///
    /// A body that fails to decode still had a valid length prefix, so the
    /// reader can skip it and stay aligned. An oversized frame cannot be
    /// skipped safely.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::FrameTooLarge { .. })
    }
}
