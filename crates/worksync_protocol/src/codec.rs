//! Binary envelope codec and stream framing.
//!
//! ## Frame Format
//!
//! Every frame is:
//! - 4 bytes: body length (big-endian `u32`)
//! - N bytes: CBOR-encoded [`Envelope`]
//!
//! The codec is pure: it turns envelopes into bytes and drains complete
//! frames out of a read buffer. Reading and writing sockets is left to the
//! client and server crates.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::Envelope;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length of the frame header.
pub const FRAME_HEADER_LEN: usize = 4;

/// Default maximum frame body length (4 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Encodes an envelope to CBOR.
pub fn encode_envelope(envelope: &Envelope) -> ProtocolResult<Vec<u8>> {
    let mut body = Vec::new();
    ciborium::into_writer(envelope, &mut body)
        .map_err(|e| ProtocolError::encoding_failed(e.to_string()))?;
    Ok(body)
}

/// Decodes an envelope from CBOR.
pub fn decode_envelope(bytes: &[u8]) -> ProtocolResult<Envelope> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::decoding_failed(e.to_string()))
}

/// Length-prefixed frame codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    /// Creates a codec that refuses bodies larger than `max_frame_len`.
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Returns the maximum frame body length.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Encodes an envelope into a complete frame.
    pub fn encode(&self, envelope: &Envelope) -> ProtocolResult<Bytes> {
        let body = encode_envelope(envelope)?;
        let len = header_len(body.len(), self.max_frame_len)?;

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.put_u32(len);
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    /// Drains the next complete frame from `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A body that fails to
    /// decode is consumed before the error is returned, so the caller can
    /// log it and keep reading.
    pub fn decode(&self, buf: &mut BytesMut) -> ProtocolResult<Option<Envelope>> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let total = FRAME_HEADER_LEN + len;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_LEN);
        let body = buf.split_to(len);
        decode_envelope(&body).map(Some)
    }
}

/// Checks a body length against the configured limit and the width of the
/// length prefix.
fn header_len(len: usize, max: usize) -> ProtocolResult<u32> {
    if len > max {
        return Err(ProtocolError::FrameTooLarge { len, max });
    }
    u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge {
        len,
        max: u32::MAX as usize,
    })
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}
