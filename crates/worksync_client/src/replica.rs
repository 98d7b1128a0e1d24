//! Replica: one store per entity kind over a shared client.

use crate::client::RequestSender;
use crate::context::RequestContext;
use crate::error::SyncResult;
use crate::session::ConnectionState;
use crate::store::EntityStore;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use worksync_protocol::{ChangeEvent, EntityKind};

/// The full set of entity stores for one client.
pub struct Replica<S: RequestSender> {
    sender: Arc<S>,
    stores: [Arc<EntityStore<S>>; EntityKind::ALL.len()],
}

impl<S: RequestSender> Replica<S> {
    /// Creates empty stores for every kind.
    pub fn new(sender: Arc<S>) -> Self {
        let stores = EntityKind::ALL
            .map(|kind| Arc::new(EntityStore::new(kind, Arc::clone(&sender))));
        Self { sender, stores }
    }

    /// Returns the shared sender.
    pub fn sender(&self) -> &Arc<S> {
        &self.sender
    }

    /// Returns the store for `kind`.
    pub fn store(&self, kind: EntityKind) -> &Arc<EntityStore<S>> {
        &self.stores[kind as usize]
    }

    /// Iterates over every store.
    pub fn stores(&self) -> impl Iterator<Item = &Arc<EntityStore<S>>> {
        self.stores.iter()
    }

    /// Hands a push event to the store of its kind.
    pub fn route(&self, event: &ChangeEvent) -> bool {
        self.store(event.kind).apply_change(event)
    }

    /// Reloads every scope each store has loaded. Keeps going past a failing
    /// store and returns the first error.
    pub async fn resync(&self, ctx: &RequestContext) -> SyncResult<usize> {
        let mut changed = 0;
        let mut first_error = None;
        for store in &self.stores {
            match store.resync(ctx).await {
                Ok(count) => changed += count,
                Err(e) => {
                    warn!(kind = %store.kind(), error = %e, "resync failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(changed),
        }
    }

    /// Spawns the reconciliation task: routes push events to stores and
    /// resyncs loaded scopes whenever the connection becomes usable again.
    /// The task ends when the connection closes or the replica is dropped.
    pub fn attach(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let mut changes = self.sender.changes();
        let mut connection = self.sender.watch_connection();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = changes.recv() => {
                        let Some(event) = event else { break };
                        let Some(replica) = weak.upgrade() else { break };
                        replica.route(&event);
                    }
                    changed = connection.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *connection.borrow_and_update();
                        if state == ConnectionState::Closed {
                            break;
                        }
                        if state != ConnectionState::Connected {
                            continue;
                        }
                        let Some(replica) = weak.upgrade() else { break };
                        let ctx = RequestContext::new();
                        match replica.resync(&ctx).await {
                            Ok(changed) => {
                                info!(correlation_id = %ctx.correlation_id(), changed, "replica resynced");
                            }
                            Err(e) => {
                                warn!(correlation_id = %ctx.correlation_id(), error = %e, "replica resync incomplete");
                            }
                        }
                    }
                }
            }
            debug!("replica reconciliation stopped");
        })
    }
}
