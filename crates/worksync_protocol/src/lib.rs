//! # worksync protocol
//!
//! Entity model and wire protocol shared by the worksync client and server.
//!
//! This crate provides:
//! - `Entity`, the versioned shape shared by every synchronized kind
//! - `KindStrategy`, the per-kind validation/merge/scope table
//! - `ChangeEvent` and field-level diffing
//! - The wire `Envelope` with its request, response and push payloads
//! - CBOR encoding and length-prefixed framing
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod codec;
mod entity;
mod error;
mod id;
mod kind;
mod messages;

pub use change::{diff, ChangeEvent, ChangeType, FieldChange};
pub use codec::{
    decode_envelope, encode_envelope, FrameCodec, DEFAULT_MAX_FRAME_LEN, FRAME_HEADER_LEN,
};
pub use entity::{
    now_millis, AttributePatch, Attributes, Edit, Entity, EntityPatch, FieldValue, Millis,
};
pub use error::{ProtocolError, ProtocolResult};
pub use id::{EntityId, MessageId, ScopeId};
pub use kind::{Capabilities, EntityKind, KindStrategy, ValidationError, MAX_TITLE_LEN};
pub use messages::{
    Credentials, Envelope, Payload, Principal, RejectCode, Rejection, Request, Response,
    PROTOCOL_VERSION,
};
