//! Request/response dispatcher.
//!
//! Every outbound request gets a fresh message id and a pending completion
//! entry. The link's read loop hands each inbound envelope to
//! [`Dispatcher::route`], which resolves the matching entry, forwards push
//! events to observers, or drops anything else with a warning.
//!
//! Entries leave the map exactly once: resolved by a response, failed by
//! [`Dispatcher::fail_all`] when the link dies, or removed by the requester on
//! timeout, cancellation or drop. Ids removed by the requester are remembered
//! for a while so their late responses are discarded quietly.

use crate::context::RequestContext;
use crate::error::{SyncError, SyncResult};
use crate::observer::{Observer, ObserverList};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use worksync_protocol::{ChangeEvent, Envelope, FrameCodec, MessageId, Payload, Request, Response};

/// How many abandoned request ids are remembered.
const ABANDONED_CAPACITY: usize = 256;

type Completion = oneshot::Sender<SyncResult<Response>>;

/// Correlates requests with responses over the current link.
pub struct Dispatcher {
    codec: FrameCodec,
    timeout: Duration,
    pending: Mutex<HashMap<MessageId, Completion>>,
    abandoned: Mutex<VecDeque<MessageId>>,
    writer: RwLock<Option<mpsc::Sender<Bytes>>>,
    pushes: ObserverList<ChangeEvent>,
}

impl Dispatcher {
    /// Creates a dispatcher with no link attached.
    pub fn new(codec: FrameCodec, timeout: Duration) -> Self {
        Self {
            codec,
            timeout,
            pending: Mutex::new(HashMap::new()),
            abandoned: Mutex::new(VecDeque::with_capacity(ABANDONED_CAPACITY)),
            writer: RwLock::new(None),
            pushes: ObserverList::new(),
        }
    }

    /// Routes outbound frames to a link's writer.
    pub fn attach(&self, writer: mpsc::Sender<Bytes>) {
        *self.writer.write() = Some(writer);
    }

    /// Detaches the current writer; requests fail until a new one attaches.
    pub fn detach(&self) {
        *self.writer.write() = None;
    }

    /// Returns true if a writer is attached.
    pub fn is_attached(&self) -> bool {
        self.writer.read().is_some()
    }

    /// Returns the configured request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Subscribes to push events.
    pub fn subscribe_pushes(&self) -> Observer<ChangeEvent> {
        self.pushes.subscribe()
    }

    /// Sends `request` and waits for its response.
    pub async fn request(&self, ctx: &RequestContext, request: Request) -> SyncResult<Response> {
        if ctx.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        if !self.is_attached() {
            return Err(SyncError::connection_failure("no transport attached"));
        }

        let request_type = request.type_name();
        let envelope = Envelope::request(ctx.correlation_id(), request);
        let message_id = envelope.message_id;
        let frame = self.codec.encode(&envelope)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(message_id, tx);
        let _entry = PendingEntry {
            dispatcher: self,
            message_id,
        };

        // Teardown detaches before failing pending entries, so an entry
        // inserted after that sweep finds no writer here.
        let writer = self
            .writer
            .read()
            .clone()
            .ok_or_else(|| SyncError::connection_failure("no transport attached"))?;

        debug!(
            %message_id,
            correlation_id = %ctx.correlation_id(),
            request = request_type,
            "sending request"
        );

        let exchange = async {
            writer
                .send(frame)
                .await
                .map_err(|_| SyncError::connection_failure("transport writer closed"))?;
            rx.await
                .unwrap_or_else(|_| Err(SyncError::connection_failure("connection lost")))
        };

        tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => {
                debug!(%message_id, "request cancelled");
                Err(SyncError::Cancelled)
            }
            result = tokio::time::timeout(self.timeout, exchange) => {
                result.unwrap_or_else(|_| {
                    warn!(%message_id, timeout = ?self.timeout, request = request_type, "request timed out");
                    Err(SyncError::RequestTimeout {
                        message_id,
                        timeout: self.timeout,
                    })
                })
            }
        }
    }

    /// Handles one inbound envelope. Never fails.
    pub fn route(&self, envelope: Envelope) {
        let message_id = envelope.message_id;
        match envelope.payload {
            Payload::Response(response) => {
                let completion = self.pending.lock().remove(&message_id);
                match completion {
                    Some(completion) => {
                        debug!(
                            %message_id,
                            correlation_id = %envelope.correlation_id,
                            response = response.type_name(),
                            "response received"
                        );
                        let _ = completion.send(Ok(response));
                    }
                    None if self.was_abandoned(&message_id) => {
                        debug!(%message_id, "discarding late response");
                    }
                    None => {
                        warn!(
                            %message_id,
                            response = response.type_name(),
                            "dropping response with no pending request"
                        );
                    }
                }
            }
            Payload::Push(event) => {
                debug!(
                    %message_id,
                    kind = %event.kind,
                    entity_id = %event.entity_id,
                    version = event.version(),
                    "push received"
                );
                self.pushes.publish(&event);
            }
            Payload::Request(request) => {
                warn!(
                    %message_id,
                    request = request.type_name(),
                    "dropping request frame sent by server"
                );
            }
        }
    }

    /// Fails every pending request with `error`.
    pub fn fail_all(&self, error: SyncError) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), error = %error, "failing pending requests");
        }
        for (_, completion) in drained {
            let _ = completion.send(Err(error.clone()));
        }
    }

    fn abandon(&self, message_id: MessageId) {
        if self.pending.lock().remove(&message_id).is_none() {
            return;
        }
        let mut abandoned = self.abandoned.lock();
        if abandoned.len() == ABANDONED_CAPACITY {
            abandoned.pop_front();
        }
        abandoned.push_back(message_id);
    }

    fn was_abandoned(&self, message_id: &MessageId) -> bool {
        self.abandoned.lock().contains(message_id)
    }
}

/// Removes a still-pending entry when the requester stops waiting.
struct PendingEntry<'a> {
    dispatcher: &'a Dispatcher,
    message_id: MessageId,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.dispatcher.abandon(self.message_id);
    }
}
