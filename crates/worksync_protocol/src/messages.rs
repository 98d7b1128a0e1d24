//! Protocol messages.

use crate::change::ChangeEvent;
use crate::entity::{Entity, EntityPatch};
use crate::id::{EntityId, MessageId, ScopeId};
use crate::kind::EntityKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// The unit transmitted in every frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message id; responses echo the id of their request.
    pub message_id: MessageId,
    /// Correlation id of the call chain that produced this message.
    pub correlation_id: Uuid,
    /// Message body.
    pub payload: Payload,
}

impl Envelope {
    /// Creates a request envelope with a fresh message id.
    pub fn request(correlation_id: Uuid, request: Request) -> Self {
        Self {
            message_id: MessageId::new(),
            correlation_id,
            payload: Payload::Request(request),
        }
    }

    /// Creates a response envelope answering `message_id`.
    pub fn response(message_id: MessageId, correlation_id: Uuid, response: Response) -> Self {
        Self {
            message_id,
            correlation_id,
            payload: Payload::Response(response),
        }
    }

    /// Creates a push envelope with a fresh message id.
    pub fn push(correlation_id: Uuid, event: ChangeEvent) -> Self {
        Self {
            message_id: MessageId::new(),
            correlation_id,
            payload: Payload::Push(event),
        }
    }
}

/// Envelope body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Client to server request.
    Request(Request),
    /// Server to client response.
    Response(Response),
    /// Unsolicited server to client change notification.
    Push(ChangeEvent),
}

impl Payload {
    /// Returns a short name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Request(request) => request.type_name(),
            Payload::Response(response) => response.type_name(),
            Payload::Push(_) => "push",
        }
    }
}

/// Credentials presented when establishing identity.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Who the client claims to be.
    pub subject: String,
    /// Opaque proof, validated by the server's authenticator.
    pub token: Vec<u8>,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(subject: impl Into<String>, token: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            token,
        }
    }
}

// Tokens stay out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("subject", &self.subject)
            .field("token", &format_args!("<{} bytes>", self.token.len()))
            .finish()
    }
}

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    /// Authenticated subject.
    pub subject: String,
}

/// Requests sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Establish identity for this connection.
    Authenticate {
        /// Protocol version spoken by the client.
        protocol_version: u16,
        /// Client credentials.
        credentials: Credentials,
    },
    /// Register an identity the server does not know yet.
    Register {
        /// Client credentials.
        credentials: Credentials,
    },
    /// Add scopes to this connection's subscription set.
    Subscribe {
        /// Scopes to add.
        scope_ids: Vec<ScopeId>,
    },
    /// Remove scopes from this connection's subscription set.
    Unsubscribe {
        /// Scopes to remove.
        scope_ids: Vec<ScopeId>,
    },
    /// Load every entity of a kind within a scope.
    Fetch {
        /// Kind to load.
        kind: EntityKind,
        /// Scope to load.
        scope_id: ScopeId,
    },
    /// Create a new entity.
    Create {
        /// The entity to create (version is ignored).
        entity: Entity,
    },
    /// Update an existing entity.
    Update {
        /// Kind of the entity.
        kind: EntityKind,
        /// Target entity.
        id: EntityId,
        /// Version the client last saw.
        expected_version: u64,
        /// Requested changes.
        patch: EntityPatch,
    },
    /// Soft-delete an entity.
    Delete {
        /// Kind of the entity.
        kind: EntityKind,
        /// Target entity.
        id: EntityId,
        /// Version the client last saw.
        expected_version: u64,
    },
    /// Liveness check.
    Ping,
}

impl Request {
    /// Returns a short name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Authenticate { .. } => "authenticate",
            Request::Register { .. } => "register",
            Request::Subscribe { .. } => "subscribe",
            Request::Unsubscribe { .. } => "unsubscribe",
            Request::Fetch { .. } => "fetch",
            Request::Create { .. } => "create",
            Request::Update { .. } => "update",
            Request::Delete { .. } => "delete",
            Request::Ping => "ping",
        }
    }

    /// Returns true for requests that change entity state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Request::Create { .. } | Request::Update { .. } | Request::Delete { .. }
        )
    }
}

/// Responses sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Identity established.
    Authenticated {
        /// Authenticated principal.
        principal: Principal,
    },
    /// Identity registered; the client should authenticate next.
    Registered,
    /// Subscription set after the request.
    Subscribed {
        /// Every scope the connection is now subscribed to.
        scope_ids: Vec<ScopeId>,
    },
    /// Subscription set after the request.
    Unsubscribed {
        /// Every scope the connection is still subscribed to.
        scope_ids: Vec<ScopeId>,
    },
    /// Snapshot of a kind within a scope, including soft-deleted entities.
    Entities {
        /// The entities.
        entities: Vec<Entity>,
    },
    /// Mutation committed; carries the authoritative entity.
    Committed {
        /// Entity with its new version.
        entity: Entity,
    },
    /// Answer to `Ping`.
    Pong,
    /// The request was refused.
    Rejected(Rejection),
}

impl Response {
    /// Returns a short name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Response::Authenticated { .. } => "authenticated",
            Response::Registered => "registered",
            Response::Subscribed { .. } => "subscribed",
            Response::Unsubscribed { .. } => "unsubscribed",
            Response::Entities { .. } => "entities",
            Response::Committed { .. } => "committed",
            Response::Pong => "pong",
            Response::Rejected(_) => "rejected",
        }
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    /// `expected_version` did not match the server's version.
    VersionConflict,
    /// The entity failed validation.
    Validation,
    /// The target entity does not exist.
    NotFound,
    /// Credentials were refused.
    Unauthenticated,
    /// Credentials were valid but the subject is not registered.
    UnknownIdentity,
    /// The connection has not authenticated, or may not do this.
    Unauthorized,
    /// The request was malformed or not allowed in this state.
    InvalidRequest,
    /// The server failed; details stay in the server log.
    Internal,
}

/// A refused request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Why the request was refused.
    pub code: RejectCode,
    /// Human-readable, sanitized description.
    pub message: String,
    /// Version the client expected (version conflicts only).
    pub expected_version: Option<u64>,
    /// Version the server holds (version conflicts only).
    pub actual_version: Option<u64>,
}

impl Rejection {
    /// Creates a rejection.
    pub fn new(code: RejectCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            expected_version: None,
            actual_version: None,
        }
    }

    /// Creates a version-conflict rejection.
    pub fn version_conflict(expected: u64, actual: u64) -> Self {
        Self {
            code: RejectCode::VersionConflict,
            message: format!("version conflict: expected {expected}, actual {actual}"),
            expected_version: Some(expected),
            actual_version: Some(actual),
        }
    }
}
