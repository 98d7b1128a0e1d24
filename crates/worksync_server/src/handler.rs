//! Request handling.
//!
//! One [`RequestHandler`] exists per connection and holds that connection's
//! identity. Every request produces exactly one response; failures become
//! `Response::Rejected`. Change events are published only after the
//! repository commit has succeeded.

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::repository::EntityRepository;
use crate::stats::ServerStats;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use worksync_protocol::{
    now_millis, ChangeEvent, Credentials, Entity, EntityId, EntityKind, EntityPatch, Principal,
    Request, Response, ScopeId, PROTOCOL_VERSION,
};

/// Shared state for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Authoritative storage.
    pub repository: Arc<dyn EntityRepository>,
    /// Identity check.
    pub authenticator: Arc<dyn Authenticator>,
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Counters.
    pub stats: Arc<ServerStats>,
}

impl HandlerContext {
    /// Creates a handler context.
    pub fn new(
        config: ServerConfig,
        repository: Arc<dyn EntityRepository>,
        authenticator: Arc<dyn Authenticator>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            config,
            repository,
            authenticator,
            registry,
            stats: Arc::new(ServerStats::new()),
        }
    }
}

/// Handler for the requests of one connection.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
    connection_id: ConnectionId,
    principal: Option<Principal>,
}

impl RequestHandler {
    /// Creates an unauthenticated handler for `connection_id`.
    pub fn new(context: Arc<HandlerContext>, connection_id: ConnectionId) -> Self {
        Self {
            context,
            connection_id,
            principal: None,
        }
    }

    /// Returns the authenticated principal, if any.
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// Handles one request.
    pub fn handle(&mut self, correlation_id: Uuid, request: Request) -> Response {
        let name = request.type_name();
        let result = self.dispatch(correlation_id, request);
        self.context.stats.record_request(result.is_err());

        match result {
            Ok(response) => {
                debug!(connection = %self.connection_id, %correlation_id, request = name, "request handled");
                response
            }
            Err(e) => {
                if e.is_server_error() {
                    error!(connection = %self.connection_id, %correlation_id, request = name, error = %e, "request failed");
                } else {
                    warn!(connection = %self.connection_id, %correlation_id, request = name, error = %e, "request rejected");
                }
                Response::Rejected(e.to_rejection())
            }
        }
    }

    fn dispatch(&mut self, correlation_id: Uuid, request: Request) -> ServerResult<Response> {
        let anonymous = matches!(
            request,
            Request::Ping | Request::Authenticate { .. } | Request::Register { .. }
        );
        if !anonymous {
            self.require_principal()?;
        }

        match request {
            Request::Ping => Ok(Response::Pong),
            Request::Authenticate {
                protocol_version,
                credentials,
            } => self.handle_authenticate(protocol_version, &credentials),
            Request::Register { credentials } => self.handle_register(&credentials),
            Request::Subscribe { scope_ids } => self.handle_subscribe(scope_ids),
            Request::Unsubscribe { scope_ids } => self.handle_unsubscribe(scope_ids),
            Request::Fetch { kind, scope_id } => Ok(Response::Entities {
                entities: self.context.repository.list(kind, scope_id),
            }),
            Request::Create { entity } => self.handle_create(correlation_id, entity),
            Request::Update {
                kind,
                id,
                expected_version,
                patch,
            } => self.handle_update(correlation_id, kind, id, expected_version, &patch),
            Request::Delete {
                kind,
                id,
                expected_version,
            } => self.handle_delete(correlation_id, kind, id, expected_version),
        }
    }

    fn require_principal(&self) -> ServerResult<&Principal> {
        self.principal
            .as_ref()
            .ok_or_else(|| ServerError::NotAuthorized("authenticate first".into()))
    }

    fn handle_authenticate(
        &mut self,
        protocol_version: u16,
        credentials: &Credentials,
    ) -> ServerResult<Response> {
        if protocol_version != PROTOCOL_VERSION {
            return Err(ServerError::ProtocolMismatch(format!(
                "unsupported protocol version {protocol_version}, server speaks {PROTOCOL_VERSION}"
            )));
        }
        let principal = self.context.authenticator.authenticate(credentials)?;
        if let Some(current) = &self.principal {
            if current != &principal {
                return Err(ServerError::InvalidRequest(format!(
                    "connection is already authenticated as {}",
                    current.subject
                )));
            }
        }
        info!(connection = %self.connection_id, subject = %principal.subject, "authenticated");
        self.principal = Some(principal.clone());
        Ok(Response::Authenticated { principal })
    }

    fn handle_register(&self, credentials: &Credentials) -> ServerResult<Response> {
        self.context.authenticator.register(credentials)?;
        info!(connection = %self.connection_id, subject = %credentials.subject, "identity registered");
        Ok(Response::Registered)
    }

    fn handle_subscribe(&self, scope_ids: Vec<ScopeId>) -> ServerResult<Response> {
        let registry = &self.context.registry;
        let mut scopes = registry.subscription(self.connection_id);
        scopes.extend(scope_ids);
        registry.set_subscription(self.connection_id, scopes.clone());
        Ok(Response::Subscribed {
            scope_ids: scopes.into_iter().collect(),
        })
    }

    fn handle_unsubscribe(&self, scope_ids: Vec<ScopeId>) -> ServerResult<Response> {
        let registry = &self.context.registry;
        let removed: BTreeSet<ScopeId> = scope_ids.into_iter().collect();
        let scopes: BTreeSet<ScopeId> = registry
            .subscription(self.connection_id)
            .difference(&removed)
            .copied()
            .collect();
        registry.set_subscription(self.connection_id, scopes.clone());
        Ok(Response::Unsubscribed {
            scope_ids: scopes.into_iter().collect(),
        })
    }

    fn handle_create(&self, correlation_id: Uuid, mut entity: Entity) -> ServerResult<Response> {
        entity.version = 0;
        entity.kind.strategy().validate(&entity)?;

        let committed = self.context.repository.commit(entity, 0)?;
        self.publish(correlation_id, ChangeEvent::created(committed.clone()));
        Ok(Response::Committed { entity: committed })
    }

    fn handle_update(
        &self,
        correlation_id: Uuid,
        kind: EntityKind,
        id: EntityId,
        expected_version: u64,
        patch: &EntityPatch,
    ) -> ServerResult<Response> {
        let current = self.live_entity(kind, id, expected_version)?;
        let merged = kind.strategy().merge(&current, patch);
        kind.strategy().validate(&merged)?;

        let committed = self.context.repository.commit(merged, expected_version)?;
        self.publish(
            correlation_id,
            ChangeEvent::updated(&current, committed.clone()),
        );
        Ok(Response::Committed { entity: committed })
    }

    fn handle_delete(
        &self,
        correlation_id: Uuid,
        kind: EntityKind,
        id: EntityId,
        expected_version: u64,
    ) -> ServerResult<Response> {
        let mut entity = self.live_entity(kind, id, expected_version)?;
        if !kind.strategy().capabilities.soft_delete {
            return Err(ServerError::InvalidRequest(format!("{kind} cannot be deleted")));
        }
        entity.deleted_at = Some(now_millis());

        let committed = self.context.repository.commit(entity, expected_version)?;
        self.publish(correlation_id, ChangeEvent::deleted(committed.clone()));
        Ok(Response::Committed { entity: committed })
    }

    /// Loads a non-deleted entity and checks the caller's version.
    fn live_entity(
        &self,
        kind: EntityKind,
        id: EntityId,
        expected_version: u64,
    ) -> ServerResult<Entity> {
        let current = self
            .context
            .repository
            .get(kind, id)
            .filter(|e| !e.is_deleted())
            .ok_or(ServerError::NotFound { kind, id })?;
        if current.version != expected_version {
            return Err(ServerError::VersionConflict {
                expected: expected_version,
                actual: current.version,
            });
        }
        Ok(current)
    }

    fn publish(&self, correlation_id: Uuid, event: ChangeEvent) {
        self.context.stats.record_commit();
        // The commit already succeeded; a publish failure must not turn it
        // into a rejection.
        match self.context.registry.publish(correlation_id, &event) {
            Ok(delivered) => self.context.stats.record_published(delivered),
            Err(e) => {
                error!(%correlation_id, entity_id = %event.entity_id, error = %e, "failed to publish change event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthConfig, HmacAuthenticator, OpenAuthenticator};
    use crate::registry::Outbox;
    use crate::repository::MemoryRepository;
    use tokio_util::sync::CancellationToken;
    use worksync_protocol::{Edit, FrameCodec, RejectCode};

    struct Fixture {
        context: Arc<HandlerContext>,
        repository: Arc<MemoryRepository>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_authenticator(Arc::new(OpenAuthenticator))
        }

        fn with_authenticator(authenticator: Arc<dyn Authenticator>) -> Self {
            let repository = Arc::new(MemoryRepository::new());
            let context = Arc::new(HandlerContext::new(
                ServerConfig::default(),
                Arc::clone(&repository) as Arc<dyn EntityRepository>,
                authenticator,
                Arc::new(ConnectionRegistry::new(FrameCodec::default())),
            ));
            Self {
                context,
                repository,
            }
        }

        fn connect(&self) -> (RequestHandler, Arc<Outbox>) {
            let registry = &self.context.registry;
            let id = registry.next_connection_id();
            let outbox = Arc::new(Outbox::new(16));
            registry.register(id, Arc::clone(&outbox), CancellationToken::new());
            (RequestHandler::new(Arc::clone(&self.context), id), outbox)
        }

        fn authenticated(&self) -> (RequestHandler, Arc<Outbox>) {
            let (mut handler, outbox) = self.connect();
            let response = handler.handle(Uuid::new_v4(), authenticate("ada", Vec::new()));
            assert!(matches!(response, Response::Authenticated { .. }));
            (handler, outbox)
        }
    }

    fn authenticate(subject: &str, token: Vec<u8>) -> Request {
        Request::Authenticate {
            protocol_version: PROTOCOL_VERSION,
            credentials: Credentials::new(subject, token),
        }
    }

    fn rejection(response: Response) -> worksync_protocol::Rejection {
        match response {
            Response::Rejected(rejection) => rejection,
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    fn committed(response: Response) -> Entity {
        match response {
            Response::Committed { entity } => entity,
            other => panic!("expected commit, got {other:?}"),
        }
    }

    fn work_item(scope: ScopeId) -> Entity {
        Entity::draft(EntityKind::WorkItem)
            .in_project(scope)
            .with_field("title", "Ship it")
    }

    fn subscribe(handler: &mut RequestHandler, scope: ScopeId) {
        let response = handler.handle(
            Uuid::new_v4(),
            Request::Subscribe {
                scope_ids: vec![scope],
            },
        );
        assert!(matches!(response, Response::Subscribed { .. }));
    }

    #[test]
    fn ping_needs_no_identity() {
        let fixture = Fixture::new();
        let (mut handler, _) = fixture.connect();
        assert_eq!(handler.handle(Uuid::new_v4(), Request::Ping), Response::Pong);
    }

    #[test]
    fn requests_before_authentication_are_rejected() {
        let fixture = Fixture::new();
        let (mut handler, _) = fixture.connect();
        let response = handler.handle(
            Uuid::new_v4(),
            Request::Create {
                entity: work_item(ScopeId::new()),
            },
        );
        assert_eq!(rejection(response).code, RejectCode::Unauthorized);
        assert!(fixture.repository.is_empty());
    }

    #[test]
    fn protocol_version_mismatch() {
        let fixture = Fixture::new();
        let (mut handler, _) = fixture.connect();
        let response = handler.handle(
            Uuid::new_v4(),
            Request::Authenticate {
                protocol_version: 99,
                credentials: Credentials::new("ada", Vec::new()),
            },
        );
        assert_eq!(rejection(response).code, RejectCode::InvalidRequest);
        assert!(handler.principal().is_none());
    }

    #[test]
    fn unknown_identity_registers_then_authenticates() {
        let auth = Arc::new(HmacAuthenticator::new(AuthConfig::new(
            b"handler-secret".to_vec(),
        )));
        let token = auth.validator().create_token("grace").unwrap();
        let fixture = Fixture::with_authenticator(Arc::clone(&auth) as Arc<dyn Authenticator>);
        let (mut handler, _) = fixture.connect();

        let first = handler.handle(Uuid::new_v4(), authenticate("grace", token.clone()));
        assert_eq!(rejection(first).code, RejectCode::UnknownIdentity);

        let registered = handler.handle(
            Uuid::new_v4(),
            Request::Register {
                credentials: Credentials::new("grace", token.clone()),
            },
        );
        assert_eq!(registered, Response::Registered);

        let second = handler.handle(Uuid::new_v4(), authenticate("grace", token));
        assert!(matches!(second, Response::Authenticated { .. }));
        assert_eq!(handler.principal().unwrap().subject, "grace");
    }

    #[test]
    fn subscribe_and_unsubscribe_report_the_full_set() {
        let fixture = Fixture::new();
        let (mut handler, _) = fixture.authenticated();
        let (x, y) = (ScopeId::new(), ScopeId::new());

        let response = handler.handle(
            Uuid::new_v4(),
            Request::Subscribe {
                scope_ids: vec![x, y],
            },
        );
        match response {
            Response::Subscribed { scope_ids } => assert_eq!(scope_ids.len(), 2),
            other => panic!("unexpected {other:?}"),
        }

        let response = handler.handle(Uuid::new_v4(), Request::Unsubscribe { scope_ids: vec![x] });
        assert_eq!(response, Response::Unsubscribed { scope_ids: vec![y] });
    }

    #[test]
    fn create_commits_and_broadcasts_to_subscribers() {
        let fixture = Fixture::new();
        let scope = ScopeId::new();
        let (mut writer, writer_outbox) = fixture.authenticated();
        let (mut watcher, watcher_outbox) = fixture.authenticated();
        let (_idle, idle_outbox) = fixture.authenticated();
        subscribe(&mut writer, scope);
        subscribe(&mut watcher, scope);

        let entity = committed(writer.handle(
            Uuid::new_v4(),
            Request::Create {
                entity: work_item(scope),
            },
        ));

        assert_eq!(entity.version, 1);
        assert_eq!(watcher_outbox.len(), 1);
        assert_eq!(writer_outbox.len(), 1);
        assert!(idle_outbox.is_empty());
        assert_eq!(fixture.context.stats.snapshot().events_published, 2);
    }

    #[test]
    fn moving_between_projects_notifies_both() {
        let fixture = Fixture::new();
        let (from, to) = (ScopeId::new(), ScopeId::new());
        let (mut writer, _) = fixture.authenticated();
        let (mut old_watcher, old_outbox) = fixture.authenticated();
        let (mut new_watcher, new_outbox) = fixture.authenticated();
        subscribe(&mut old_watcher, from);
        subscribe(&mut new_watcher, to);

        let entity = committed(writer.handle(
            Uuid::new_v4(),
            Request::Create {
                entity: work_item(from),
            },
        ));
        assert_eq!(old_outbox.len(), 1);
        assert!(new_outbox.is_empty());

        let moved = committed(writer.handle(
            Uuid::new_v4(),
            Request::Update {
                kind: EntityKind::WorkItem,
                id: entity.id,
                expected_version: 1,
                patch: EntityPatch::new().project(Edit::Set(to)),
            },
        ));
        assert_eq!(moved.attributes.project_id, Some(to));
        assert_eq!(old_outbox.len(), 2);
        assert_eq!(new_outbox.len(), 1);
    }

    #[test]
    fn invalid_entity_is_rejected_without_commit() {
        let fixture = Fixture::new();
        let (mut handler, _) = fixture.authenticated();
        let response = handler.handle(
            Uuid::new_v4(),
            Request::Create {
                entity: Entity::draft(EntityKind::WorkItem).in_project(ScopeId::new()),
            },
        );
        assert_eq!(rejection(response).code, RejectCode::Validation);
        assert!(fixture.repository.is_empty());
    }

    #[test]
    fn stale_update_conflicts_without_change_or_broadcast() {
        let fixture = Fixture::new();
        let scope = ScopeId::new();
        let (mut handler, outbox) = fixture.authenticated();

        let mut entity = committed(handler.handle(
            Uuid::new_v4(),
            Request::Create {
                entity: work_item(scope),
            },
        ));
        for n in 1..5 {
            entity = committed(handler.handle(
                Uuid::new_v4(),
                Request::Update {
                    kind: EntityKind::WorkItem,
                    id: entity.id,
                    expected_version: n,
                    patch: EntityPatch::new().set("title", format!("rev {n}")),
                },
            ));
        }
        assert_eq!(entity.version, 5);
        subscribe(&mut handler, scope);

        let response = handler.handle(
            Uuid::new_v4(),
            Request::Update {
                kind: EntityKind::WorkItem,
                id: entity.id,
                expected_version: 3,
                patch: EntityPatch::new().set("title", "stale"),
            },
        );
        let rejection = rejection(response);
        assert_eq!(rejection.code, RejectCode::VersionConflict);
        assert_eq!(rejection.expected_version, Some(3));
        assert_eq!(rejection.actual_version, Some(5));

        let stored = fixture.repository.get(EntityKind::WorkItem, entity.id).unwrap();
        assert_eq!(stored, entity);
        assert!(outbox.is_empty());
    }

    #[test]
    fn delete_soft_deletes_and_hides_from_updates() {
        let fixture = Fixture::new();
        let (mut handler, _) = fixture.authenticated();
        let entity = committed(handler.handle(
            Uuid::new_v4(),
            Request::Create {
                entity: work_item(ScopeId::new()),
            },
        ));

        let deleted = committed(handler.handle(
            Uuid::new_v4(),
            Request::Delete {
                kind: EntityKind::WorkItem,
                id: entity.id,
                expected_version: 1,
            },
        ));
        assert!(deleted.is_deleted());
        assert_eq!(deleted.version, 2);

        let response = handler.handle(
            Uuid::new_v4(),
            Request::Update {
                kind: EntityKind::WorkItem,
                id: entity.id,
                expected_version: 2,
                patch: EntityPatch::new().set("title", "zombie"),
            },
        );
        assert_eq!(rejection(response).code, RejectCode::NotFound);
    }

    #[test]
    fn fetch_includes_soft_deleted() {
        let fixture = Fixture::new();
        let scope = ScopeId::new();
        let (mut handler, _) = fixture.authenticated();
        let kept = committed(handler.handle(
            Uuid::new_v4(),
            Request::Create {
                entity: work_item(scope),
            },
        ));
        let doomed = committed(handler.handle(
            Uuid::new_v4(),
            Request::Create {
                entity: work_item(scope),
            },
        ));
        handler.handle(
            Uuid::new_v4(),
            Request::Delete {
                kind: EntityKind::WorkItem,
                id: doomed.id,
                expected_version: 1,
            },
        );

        match handler.handle(
            Uuid::new_v4(),
            Request::Fetch {
                kind: EntityKind::WorkItem,
                scope_id: scope,
            },
        ) {
            Response::Entities { entities } => {
                assert_eq!(entities.len(), 2);
                assert!(entities.iter().any(|e| e.id == kept.id && !e.is_deleted()));
                assert!(entities.iter().any(|e| e.id == doomed.id && e.is_deleted()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
