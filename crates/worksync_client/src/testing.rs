//! Scripted request sender for store and replica tests.

use crate::client::RequestSender;
use crate::context::RequestContext;
use crate::error::{SyncError, SyncResult};
use crate::observer::{Observer, ObserverList};
use crate::session::ConnectionState;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use tokio::sync::{oneshot, watch};
use worksync_protocol::{ChangeEvent, Entity, Request, Response};

enum Reply {
    Now(SyncResult<Response>),
    Gated(oneshot::Receiver<SyncResult<Response>>),
}

pub(crate) struct FakeSender {
    connection: watch::Sender<ConnectionState>,
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<Request>>,
    pushes: ObserverList<ChangeEvent>,
}

impl FakeSender {
    pub(crate) fn connected() -> Self {
        Self {
            connection: watch::Sender::new(ConnectionState::Connected),
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            pushes: ObserverList::new(),
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.connection.send_replace(state);
    }

    pub(crate) fn reply(&self, result: SyncResult<Response>) {
        self.replies.lock().push_back(Reply::Now(result));
    }

    /// Queues a reply released through the returned sender.
    pub(crate) fn gated(&self) -> oneshot::Sender<SyncResult<Response>> {
        let (tx, rx) = oneshot::channel();
        self.replies.lock().push_back(Reply::Gated(rx));
        tx
    }

    pub(crate) fn push(&self, event: ChangeEvent) {
        self.pushes.publish(&event);
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }
}

impl RequestSender for FakeSender {
    fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    fn changes(&self) -> Observer<ChangeEvent> {
        self.pushes.subscribe()
    }

    fn send(
        &self,
        _ctx: &RequestContext,
        request: Request,
    ) -> impl Future<Output = SyncResult<Response>> + Send {
        self.requests.lock().push(request);
        let reply = self.replies.lock().pop_front();
        async move {
            match reply {
                Some(Reply::Now(result)) => result,
                Some(Reply::Gated(rx)) => rx.await.unwrap_or(Err(SyncError::Cancelled)),
                None => Err(SyncError::connection_failure("no scripted reply")),
            }
        }
    }
}

/// The entity as the server would commit it.
pub(crate) fn committed(entity: &Entity, version: u64) -> Response {
    let mut entity = entity.clone();
    entity.version = version;
    Response::Committed { entity }
}
