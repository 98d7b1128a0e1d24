//! Live connections and change broadcast.
//!
//! Every connection owns a bounded [`Outbox`] of encoded push frames.
//! Broadcasting encodes an event once and offers the bytes to each
//! subscribed outbox without awaiting, so one slow peer cannot stall the
//! others. A full outbox drops its oldest frame.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;
use worksync_protocol::{ChangeEvent, Envelope, FrameCodec, ScopeId};

use crate::error::ServerResult;

/// Identifies one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Bounded queue of encoded push frames for one connection.
pub struct Outbox {
    queue: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Outbox {
    /// Creates an outbox holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Queues a frame. Returns true if the oldest frame was dropped to
    /// make room. Frames offered after `close` are discarded.
    pub fn push(&self, frame: Bytes) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let dropped = {
            let mut queue = self.queue.lock();
            let dropped = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(frame);
            dropped
        };
        if dropped {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        dropped
    }

    /// Waits for the next frame. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<Bytes> {
        loop {
            let notified = self.notify.notified();
            if let Some(frame) = self.queue.lock().pop_front() {
                return Some(frame);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Stops accepting frames and wakes the consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Returns the number of queued frames.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Returns true if no frame is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Returns how many frames were dropped for lack of room.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Entry {
    outbox: Arc<Outbox>,
    scopes: BTreeSet<ScopeId>,
    shutdown: CancellationToken,
}

/// Registry of live connections and their subscription sets.
pub struct ConnectionRegistry {
    codec: FrameCodec,
    next_id: AtomicU64,
    connections: RwLock<HashMap<ConnectionId, Entry>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry encoding frames with `codec`.
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            next_id: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Allocates a connection id.
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Adds a connection with an empty subscription set.
    pub fn register(&self, id: ConnectionId, outbox: Arc<Outbox>, shutdown: CancellationToken) {
        self.connections.write().insert(
            id,
            Entry {
                outbox,
                scopes: BTreeSet::new(),
                shutdown,
            },
        );
        debug!(connection = %id, "connection registered");
    }

    /// Removes a connection and closes its outbox.
    pub fn unregister(&self, id: ConnectionId) {
        if let Some(entry) = self.connections.write().remove(&id) {
            entry.outbox.close();
            debug!(connection = %id, "connection unregistered");
        }
    }

    /// Asks a connection to shut down. Returns false if it is unknown.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        match self.connections.read().get(&id) {
            Some(entry) => {
                entry.shutdown.cancel();
                true
            }
            None => false,
        }
    }

    /// Replaces the subscription set of a connection.
    pub fn set_subscription(&self, id: ConnectionId, scopes: BTreeSet<ScopeId>) {
        if let Some(entry) = self.connections.write().get_mut(&id) {
            entry.scopes = scopes;
        }
    }

    /// Returns the subscription set of a connection.
    pub fn subscription(&self, id: ConnectionId) -> BTreeSet<ScopeId> {
        self.connections
            .read()
            .get(&id)
            .map(|entry| entry.scopes.clone())
            .unwrap_or_default()
    }

    /// Returns the ids of every live connection.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Returns the number of live connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Returns true if no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Sends `event` to every connection subscribed to `scope`.
    /// Returns the number of connections it was queued for.
    pub fn broadcast(
        &self,
        scope: ScopeId,
        correlation_id: Uuid,
        event: &ChangeEvent,
    ) -> ServerResult<usize> {
        self.fan_out(correlation_id, event, |scopes| scopes.contains(&scope))
    }

    /// Sends `event` to every connection subscribed to any of its scopes.
    /// A connection subscribed to several of them receives it once.
    pub fn publish(&self, correlation_id: Uuid, event: &ChangeEvent) -> ServerResult<usize> {
        self.fan_out(correlation_id, event, |scopes| {
            event.scope_ids.iter().any(|scope| scopes.contains(scope))
        })
    }

    fn fan_out(
        &self,
        correlation_id: Uuid,
        event: &ChangeEvent,
        subscribed: impl Fn(&BTreeSet<ScopeId>) -> bool,
    ) -> ServerResult<usize> {
        let frame = self
            .codec
            .encode(&Envelope::push(correlation_id, event.clone()))?;

        let connections = self.connections.read();
        let mut delivered = 0;
        for (id, entry) in connections.iter() {
            if !subscribed(&entry.scopes) {
                continue;
            }
            if entry.outbox.push(frame.clone()) {
                warn!(
                    connection = %id,
                    dropped = entry.outbox.dropped(),
                    "outbox full, dropped oldest event"
                );
            }
            delivered += 1;
        }
        debug!(
            %correlation_id,
            kind = %event.kind,
            entity_id = %event.entity_id,
            delivered,
            "change event published"
        );
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use std::time::Duration;
    use worksync_protocol::{Entity, EntityKind, Payload};

    fn event(scope: ScopeId) -> ChangeEvent {
        let mut entity = Entity::draft(EntityKind::WorkItem)
            .in_project(scope)
            .with_field("title", "Broadcast");
        entity.version = 1;
        ChangeEvent::created(entity)
    }

    fn connect(registry: &ConnectionRegistry, capacity: usize) -> (ConnectionId, Arc<Outbox>) {
        let id = registry.next_connection_id();
        let outbox = Arc::new(Outbox::new(capacity));
        registry.register(id, Arc::clone(&outbox), CancellationToken::new());
        (id, outbox)
    }

    fn decode(frame: Bytes) -> Envelope {
        let mut buf = BytesMut::from(&frame[..]);
        FrameCodec::default().decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn full_outbox_drops_oldest() {
        let outbox = Outbox::new(2);
        assert!(!outbox.push(Bytes::from_static(b"1")));
        assert!(!outbox.push(Bytes::from_static(b"2")));
        assert!(outbox.push(Bytes::from_static(b"3")));
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.dropped(), 1);
        assert_eq!(
            outbox.queue.lock().front().cloned(),
            Some(Bytes::from_static(b"2"))
        );
    }

    #[tokio::test]
    async fn pop_waits_for_frames_and_ends_on_close() {
        let outbox = Arc::new(Outbox::new(4));
        let consumer = {
            let outbox = Arc::clone(&outbox);
            tokio::spawn(async move {
                let mut frames = Vec::new();
                while let Some(frame) = outbox.pop().await {
                    frames.push(frame);
                }
                frames
            })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        outbox.push(Bytes::from_static(b"a"));
        tokio::time::sleep(Duration::from_millis(5)).await;
        outbox.close();

        let frames = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"a")]);
        assert!(!outbox.push(Bytes::from_static(b"late")));
    }

    #[test]
    fn broadcast_reaches_only_subscribers() {
        let registry = ConnectionRegistry::new(FrameCodec::default());
        let scope = ScopeId::new();
        let (a, outbox_a) = connect(&registry, 8);
        let (_b, outbox_b) = connect(&registry, 8);
        registry.set_subscription(a, BTreeSet::from([scope]));

        let event = event(scope);
        let delivered = registry.broadcast(scope, Uuid::new_v4(), &event).unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(outbox_a.len(), 1);
        assert!(outbox_b.is_empty());

        let frame = outbox_a.queue.lock().pop_front().unwrap();
        match decode(frame).payload {
            Payload::Push(pushed) => assert_eq!(pushed, event),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn publish_delivers_once_per_connection() {
        let registry = ConnectionRegistry::new(FrameCodec::default());
        let scope = ScopeId::new();
        let (a, outbox) = connect(&registry, 8);
        registry.set_subscription(a, BTreeSet::from([scope, ScopeId::new()]));

        assert_eq!(registry.publish(Uuid::new_v4(), &event(scope)).unwrap(), 1);
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn unregister_closes_outbox() {
        let registry = ConnectionRegistry::new(FrameCodec::default());
        let scope = ScopeId::new();
        let (id, outbox) = connect(&registry, 8);
        registry.set_subscription(id, BTreeSet::from([scope]));
        registry.unregister(id);

        assert!(registry.is_empty());
        assert!(registry.subscription(id).is_empty());
        assert_eq!(registry.broadcast(scope, Uuid::new_v4(), &event(scope)).unwrap(), 0);
        assert!(!outbox.push(Bytes::from_static(b"x")));
    }

    #[test]
    fn disconnect_cancels_connection_token() {
        let registry = ConnectionRegistry::new(FrameCodec::default());
        let id = registry.next_connection_id();
        let token = CancellationToken::new();
        registry.register(id, Arc::new(Outbox::new(1)), token.clone());

        assert!(registry.disconnect(id));
        assert!(token.is_cancelled());
        assert!(!registry.disconnect(registry.next_connection_id()));
        assert_eq!(id.to_string(), "conn-1");
    }
}
