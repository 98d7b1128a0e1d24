//! Explicit observer lists.
//!
//! Each subscriber has a bounded queue. A subscriber that stops reading
//! loses new values once its queue is full instead of growing memory.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// Queue depth per subscriber unless configured otherwise.
pub const DEFAULT_OBSERVER_CAPACITY: usize = 1024;

/// Identifies one subscription on an [`ObserverList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Receiving end of a subscription.
///
/// Values arrive in publish order. Dropping the observer unsubscribes it
/// lazily on the next publish.
#[derive(Debug)]
pub struct Observer<T> {
    id: ObserverId,
    rx: mpsc::Receiver<T>,
}

impl<T> Observer<T> {
    /// Returns the subscription id.
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Waits for the next value; `None` after unsubscription.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Returns the next value if one is queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// A list of subscribers that each receive every published value.
#[derive(Debug)]
pub struct ObserverList<T> {
    next_id: AtomicU64,
    capacity: usize,
    dropped: AtomicU64,
    senders: Mutex<Vec<(ObserverId, mpsc::Sender<T>)>>,
}

impl<T: Clone> ObserverList<T> {
    /// Creates an empty list with the default queue depth.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_OBSERVER_CAPACITY)
    }

    /// Creates an empty list whose subscribers queue at most `capacity`
    /// values each.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Adds a subscriber.
    pub fn subscribe(&self) -> Observer<T> {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.capacity);
        self.senders.lock().push((id, tx));
        Observer { id, rx }
    }

    /// Removes a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut senders = self.senders.lock();
        let before = senders.len();
        senders.retain(|(observer, _)| *observer != id);
        senders.len() != before
    }

    /// Delivers `value` to every live subscriber and returns how many got it.
    /// Subscribers with a full queue miss the value.
    pub fn publish(&self, value: &T) -> usize {
        let mut delivered = 0;
        let mut senders = self.senders.lock();
        senders.retain(|(id, tx)| match tx.try_send(value.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    observer = id.0,
                    capacity = self.capacity,
                    "observer queue full, dropping value"
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }

    /// Returns how many values were dropped for full queues.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns the number of subscribers.
    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    /// Returns true if nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for ObserverList<T> {
    fn default() -> Self {
        Self::new()
    }
}
