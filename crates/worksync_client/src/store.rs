//! Optimistic entity store.
//!
//! One store per entity kind, parameterized by the kind's strategy table.
//! Mutations are applied to the cache before the server confirms them:
//!
//! 1. A second mutation of an id that already has one in flight is refused
//!    locally with [`SyncError::MutationInFlight`].
//! 2. The projected value (version unchanged) is written to the cache and the
//!    id is marked pending.
//! 3. The request goes out through the client's retry and breaker pipeline.
//! 4. A commit replaces the projection with the authoritative entity; any
//!    failure restores the previous value. Either way the pending mark is
//!    cleared and observers are told.
//!
//! Push events for an id with a mutation in flight are buffered and replayed
//! once it resolves. Every cache write from the server side is version-gated,
//! so duplicate or stale events are harmless.

use crate::client::RequestSender;
use crate::context::RequestContext;
use crate::error::{SyncError, SyncResult};
use crate::observer::{Observer, ObserverId, ObserverList};
use crate::session::ConnectionState;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use worksync_protocol::{
    now_millis, ChangeEvent, Entity, EntityId, EntityKind, EntityPatch, KindStrategy, Request,
    Response, ScopeId,
};

/// How many resolved operations are kept for inspection.
const RECENT_CAPACITY: usize = 64;

/// What a pending operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationAction {
    /// Creates a new entity.
    Create,
    /// Patches an existing entity.
    Update,
    /// Soft-deletes an entity.
    Delete,
}

/// Lifecycle of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    /// Sent, not yet resolved.
    InFlight,
    /// The server committed it.
    Confirmed,
    /// It failed and the cache was restored.
    RolledBack,
}

/// A local mutation and its optimistic projection.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    /// Store-local operation id.
    pub op_id: u64,
    /// Target entity.
    pub entity_id: EntityId,
    /// Kind of the target.
    pub kind: EntityKind,
    /// What the operation does.
    pub action: OperationAction,
    /// The value shown while the operation is in flight.
    pub projected: Entity,
    /// Version the mutation was submitted against.
    pub expected_version: u64,
    /// Current status.
    pub status: OperationStatus,
}

/// Why a cached entity changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    /// A local mutation was applied optimistically.
    Optimistic,
    /// The server committed a local mutation.
    Confirmed,
    /// A local mutation failed and was undone.
    RolledBack,
    /// A push event from the server.
    Remote,
    /// A snapshot load.
    Loaded,
}

/// Notification published to store observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreChange {
    /// Kind of the changed entity.
    pub kind: EntityKind,
    /// The changed entity.
    pub id: EntityId,
    /// What caused it.
    pub cause: ChangeCause,
}

struct InFlight {
    operation: PendingOperation,
    previous: Option<Entity>,
}

#[derive(Default)]
struct StoreState {
    cache: HashMap<EntityId, Entity>,
    pending: HashMap<EntityId, InFlight>,
    buffered: HashMap<EntityId, Vec<Entity>>,
    recent: VecDeque<PendingOperation>,
    loaded_scopes: BTreeSet<ScopeId>,
    /// Last known version of entities dropped after leaving every loaded
    /// scope, so late pushes cannot bring them back.
    evicted: HashMap<EntityId, u64>,
}

impl StoreState {
    /// Writes `entity` if it is newer than what the store has seen. An
    /// entity that moved out of every loaded scope is evicted instead.
    fn apply_authoritative(&mut self, entity: Entity) -> bool {
        let seen = self
            .cache
            .get(&entity.id)
            .map(|cached| cached.version)
            .or_else(|| self.evicted.get(&entity.id).copied());
        if seen.is_some_and(|version| entity.version <= version) {
            return false;
        }
        if self.left_loaded_scopes(&entity) {
            self.evict(entity.id, entity.version);
        } else {
            self.evicted.remove(&entity.id);
            self.cache.insert(entity.id, entity);
        }
        true
    }

    /// True when the cached revision sits in a loaded scope and `entity`
    /// sits in none.
    fn left_loaded_scopes(&self, entity: &Entity) -> bool {
        let loaded = |e: &Entity| e.scopes().iter().any(|s| self.loaded_scopes.contains(s));
        self.cache.get(&entity.id).is_some_and(|cached| loaded(cached)) && !loaded(entity)
    }

    fn evict(&mut self, id: EntityId, version: u64) {
        self.cache.remove(&id);
        self.evicted.insert(id, version);
    }

    fn take_in_flight(&mut self, id: EntityId, op_id: u64) -> Option<InFlight> {
        match self.pending.get(&id) {
            Some(in_flight) if in_flight.operation.op_id == op_id => self.pending.remove(&id),
            _ => None,
        }
    }

    /// Replays pushes held back while `id` was in flight.
    fn drain_buffered(&mut self, id: EntityId) -> bool {
        let mut applied = false;
        for entity in self.buffered.remove(&id).unwrap_or_default() {
            applied |= self.apply_authoritative(entity);
        }
        applied
    }

    fn record(&mut self, operation: PendingOperation) {
        if self.recent.len() == RECENT_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back(operation);
    }
}

/// What a mutation sends and shows.
struct Submission {
    projected: Entity,
    expected_version: u64,
    request: Request,
}

/// Optimistic cache of one entity kind.
pub struct EntityStore<S: RequestSender> {
    kind: EntityKind,
    strategy: &'static KindStrategy,
    sender: Arc<S>,
    state: Mutex<StoreState>,
    observers: ObserverList<StoreChange>,
    next_op: AtomicU64,
}

impl<S: RequestSender> EntityStore<S> {
    /// Creates an empty store for `kind`.
    pub fn new(kind: EntityKind, sender: Arc<S>) -> Self {
        Self {
            kind,
            strategy: kind.strategy(),
            sender,
            state: Mutex::new(StoreState::default()),
            observers: ObserverList::new(),
            next_op: AtomicU64::new(1),
        }
    }

    /// Returns the kind this store holds.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Returns the entity unless it is unknown or soft-deleted.
    pub fn get_by_id(&self, id: EntityId) -> Option<Entity> {
        self.state
            .lock()
            .cache
            .get(&id)
            .filter(|entity| !entity.is_deleted())
            .cloned()
    }

    /// Returns true if a live entity with `id` is cached.
    pub fn exists(&self, id: EntityId) -> bool {
        self.get_by_id(id).is_some()
    }

    /// Returns every non-deleted entity, positioned ones first.
    pub fn get_all(&self) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self
            .state
            .lock()
            .cache
            .values()
            .filter(|entity| !entity.is_deleted())
            .cloned()
            .collect();
        entities.sort_by_key(|e| (e.attributes.position.is_none(), e.attributes.position, e.id));
        entities
    }

    /// Returns true while a mutation of `id` is in flight.
    pub fn is_pending(&self, id: EntityId) -> bool {
        self.state.lock().pending.contains_key(&id)
    }

    /// Returns the operations currently in flight.
    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        self.state
            .lock()
            .pending
            .values()
            .map(|in_flight| in_flight.operation.clone())
            .collect()
    }

    /// Returns recently resolved operations, oldest first.
    pub fn recent_operations(&self) -> Vec<PendingOperation> {
        self.state.lock().recent.iter().cloned().collect()
    }

    /// Returns the scopes loaded so far.
    pub fn loaded_scopes(&self) -> BTreeSet<ScopeId> {
        self.state.lock().loaded_scopes.clone()
    }

    /// Subscribes to cache changes.
    pub fn subscribe(&self) -> Observer<StoreChange> {
        self.observers.subscribe()
    }

    /// Removes a subscription.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Creates `entity`. The server assigns version 1.
    pub async fn create(&self, ctx: &RequestContext, entity: Entity) -> SyncResult<Entity> {
        let id = entity.id;
        let strategy = self.strategy;
        self.mutate(ctx, id, OperationAction::Create, move |current| {
            if current.is_some() {
                return Err(SyncError::Validation(format!("{} {id} already exists", entity.kind)));
            }
            let mut projected = entity;
            projected.version = 0;
            projected.updated_at = now_millis();
            strategy.validate(&projected)?;
            Ok(Submission {
                request: Request::Create {
                    entity: projected.clone(),
                },
                projected,
                expected_version: 0,
            })
        })
        .await
    }

    /// Applies `patch` to the entity with `id`.
    pub async fn update(
        &self,
        ctx: &RequestContext,
        id: EntityId,
        patch: EntityPatch,
    ) -> SyncResult<Entity> {
        let kind = self.kind;
        let strategy = self.strategy;
        self.mutate(ctx, id, OperationAction::Update, move |current| {
            let current = live(current).ok_or(SyncError::NotFound { kind, id })?;
            let projected = strategy.merge(current, &patch);
            strategy.validate(&projected)?;
            Ok(Submission {
                expected_version: current.version,
                request: Request::Update {
                    kind,
                    id,
                    expected_version: current.version,
                    patch,
                },
                projected,
            })
        })
        .await
    }

    /// Soft-deletes the entity with `id`.
    pub async fn delete(&self, ctx: &RequestContext, id: EntityId) -> SyncResult<Entity> {
        let kind = self.kind;
        self.mutate(ctx, id, OperationAction::Delete, move |current| {
            let current = live(current).ok_or(SyncError::NotFound { kind, id })?;
            let mut projected = current.clone();
            projected.deleted_at = Some(now_millis());
            Ok(Submission {
                expected_version: current.version,
                request: Request::Delete {
                    kind,
                    id,
                    expected_version: current.version,
                },
                projected,
            })
        })
        .await
    }

    /// Loads every entity of this kind in `scope` and remembers the scope
    /// for resync. Returns how many cached values changed.
    pub async fn load(&self, ctx: &RequestContext, scope: ScopeId) -> SyncResult<usize> {
        // Cached members of the scope; any the snapshot no longer lists
        // have moved away or vanished and are dropped.
        let before: Vec<(EntityId, u64)> = {
            let state = self.state.lock();
            state
                .cache
                .values()
                .filter(|e| !state.pending.contains_key(&e.id) && e.scopes().contains(&scope))
                .map(|e| (e.id, e.version))
                .collect()
        };
        let request = Request::Fetch {
            kind: self.kind,
            scope_id: scope,
        };
        let entities = match self.sender.send(ctx, request).await? {
            Response::Entities { entities } => entities,
            other => {
                return Err(SyncError::UnexpectedResponse {
                    expected: "entities",
                    actual: other.type_name(),
                })
            }
        };

        let mut changed = Vec::new();
        {
            let mut state = self.state.lock();
            state.loaded_scopes.insert(scope);
            let listed: BTreeSet<EntityId> = entities.iter().map(|e| e.id).collect();
            for entity in entities.into_iter().filter(|e| e.kind == self.kind) {
                let id = entity.id;
                if state.pending.contains_key(&id) {
                    state.buffered.entry(id).or_default().push(entity);
                } else if state.apply_authoritative(entity) {
                    changed.push(id);
                }
            }
            for (id, version) in before {
                let untouched = !state.pending.contains_key(&id)
                    && state.cache.get(&id).is_some_and(|e| e.version == version);
                if untouched && !listed.contains(&id) {
                    state.evict(id, version);
                    changed.push(id);
                }
            }
        }

        debug!(
            correlation_id = %ctx.correlation_id(),
            kind = %self.kind,
            scope = %scope,
            changed = changed.len(),
            "scope loaded"
        );
        for id in &changed {
            self.notify(*id, ChangeCause::Loaded);
        }
        Ok(changed.len())
    }

    /// Reloads every scope loaded so far.
    pub async fn resync(&self, ctx: &RequestContext) -> SyncResult<usize> {
        let mut changed = 0;
        for scope in self.loaded_scopes() {
            changed += self.load(ctx, scope).await?;
        }
        Ok(changed)
    }

    /// Reconciles a push event. Returns true if the cache changed.
    pub fn apply_change(&self, event: &ChangeEvent) -> bool {
        if event.kind != self.kind {
            return false;
        }
        let id = event.entity_id;
        let applied = {
            let mut state = self.state.lock();
            if state.pending.contains_key(&id) {
                state
                    .buffered
                    .entry(id)
                    .or_default()
                    .push(event.entity.clone());
                debug!(kind = %self.kind, %id, version = event.version(), "buffering push for in-flight entity");
                return false;
            }
            state.apply_authoritative(event.entity.clone())
        };

        if applied {
            self.notify(id, ChangeCause::Remote);
        } else {
            debug!(kind = %self.kind, %id, version = event.version(), "discarding stale push");
        }
        applied
    }

    async fn mutate<P>(
        &self,
        ctx: &RequestContext,
        id: EntityId,
        action: OperationAction,
        prepare: P,
    ) -> SyncResult<Entity>
    where
        P: FnOnce(Option<&Entity>) -> SyncResult<Submission>,
    {
        let (op_id, request) = {
            let mut state = self.state.lock();
            if state.pending.contains_key(&id) {
                debug!(kind = %self.kind, %id, "refusing concurrent mutation");
                return Err(SyncError::MutationInFlight {
                    kind: self.kind,
                    id,
                });
            }
            let connection = self.sender.connection_state();
            if connection != ConnectionState::Connected {
                return Err(SyncError::NotConnected { state: connection });
            }

            let previous = state.cache.get(&id).cloned();
            let Submission {
                projected,
                expected_version,
                request,
            } = prepare(previous.as_ref())?;

            let op_id = self.next_op.fetch_add(1, Ordering::Relaxed);
            let operation = PendingOperation {
                op_id,
                entity_id: id,
                kind: self.kind,
                action,
                projected: projected.clone(),
                expected_version,
                status: OperationStatus::InFlight,
            };
            state.cache.insert(id, projected);
            state.pending.insert(
                id,
                InFlight {
                    operation,
                    previous,
                },
            );
            (op_id, request)
        };
        debug!(
            correlation_id = %ctx.correlation_id(),
            kind = %self.kind,
            %id,
            op_id,
            ?action,
            "optimistic change applied"
        );
        self.notify(id, ChangeCause::Optimistic);

        let mut guard = RollbackGuard {
            store: self,
            id,
            op_id,
            armed: true,
        };
        let result = self.sender.send(ctx, request).await;
        guard.armed = false;

        match result {
            Ok(Response::Committed { entity }) if entity.id == id => {
                self.confirm(id, op_id, entity.clone());
                Ok(entity)
            }
            Ok(other) => {
                let error = SyncError::UnexpectedResponse {
                    expected: "committed",
                    actual: other.type_name(),
                };
                self.roll_back(id, op_id, &error);
                Err(error)
            }
            Err(error) => {
                self.roll_back(id, op_id, &error);
                Err(error)
            }
        }
    }

    fn confirm(&self, id: EntityId, op_id: u64, entity: Entity) {
        let remote = {
            let mut state = self.state.lock();
            let Some(in_flight) = state.take_in_flight(id, op_id) else {
                return;
            };
            let mut operation = in_flight.operation;
            operation.status = OperationStatus::Confirmed;
            state.record(operation);
            state.cache.insert(id, entity);
            state.drain_buffered(id)
        };
        debug!(kind = %self.kind, %id, op_id, "mutation confirmed");
        self.notify(id, ChangeCause::Confirmed);
        if remote {
            self.notify(id, ChangeCause::Remote);
        }
    }

    fn roll_back(&self, id: EntityId, op_id: u64, error: &SyncError) {
        let remote = {
            let mut state = self.state.lock();
            let Some(in_flight) = state.take_in_flight(id, op_id) else {
                return;
            };
            match in_flight.previous {
                Some(previous) => state.cache.insert(id, previous),
                None => state.cache.remove(&id),
            };
            let mut operation = in_flight.operation;
            operation.status = OperationStatus::RolledBack;
            state.record(operation);
            state.drain_buffered(id)
        };
        warn!(kind = %self.kind, %id, op_id, error = %error, "mutation rolled back");
        self.notify(id, ChangeCause::RolledBack);
        if remote {
            self.notify(id, ChangeCause::Remote);
        }
    }

    fn notify(&self, id: EntityId, cause: ChangeCause) {
        self.observers.publish(&StoreChange {
            kind: self.kind,
            id,
            cause,
        });
    }
}

fn live(entity: Option<&Entity>) -> Option<&Entity> {
    entity.filter(|entity| !entity.is_deleted())
}

/// Undoes the optimistic change if the mutation future is dropped before
/// the request resolves.
struct RollbackGuard<'a, S: RequestSender> {
    store: &'a EntityStore<S>,
    id: EntityId,
    op_id: u64,
    armed: bool,
}

impl<S: RequestSender> Drop for RollbackGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.store
                .roll_back(self.id, self.op_id, &SyncError::Cancelled);
        }
    }
}
