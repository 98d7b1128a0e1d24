//! Sync client: handshake, guarded request pipeline and reconnection.
//!
//! Every request goes through `retry(breaker(dispatcher))`. The client owns
//! one logical transport shared by all stores. When the link drops while
//! `Ready`, a supervisor task walks the session through `Reconnecting`:
//! teardown, rebuild through the breaker and retry policy, re-authentication
//! with the original credentials, and a replay of the whole subscription set
//! before `Ready` is signalled again. Mutations fail fast with
//! [`SyncError::NotConnected`] in the meantime.

use crate::circuit::{CircuitBreaker, CircuitState};
use crate::config::ClientConfig;
use crate::context::RequestContext;
use crate::dispatcher::Dispatcher;
use crate::error::{sanitize_message, SyncError, SyncResult};
use crate::observer::Observer;
use crate::retry::RetryPolicy;
use crate::session::{ConnectionState, SessionMachine, SessionState};
use crate::transport::{Connector, Link, LinkEvent};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use worksync_protocol::{
    ChangeEvent, Credentials, EntityId, FrameCodec, Principal, RejectCode, Request, Response,
    ScopeId, PROTOCOL_VERSION,
};

/// Shortest pause while waiting out an open circuit.
const MIN_CIRCUIT_WAIT: Duration = Duration::from_millis(10);

/// The request surface stores depend on.
pub trait RequestSender: Send + Sync + 'static {
    /// Returns the current connection state.
    fn connection_state(&self) -> ConnectionState;

    /// Subscribes to connection state changes.
    fn watch_connection(&self) -> watch::Receiver<ConnectionState>;

    /// Subscribes to server push events.
    fn changes(&self) -> Observer<ChangeEvent>;

    /// Sends a request. Rejections surface as errors.
    fn send(
        &self,
        ctx: &RequestContext,
        request: Request,
    ) -> impl Future<Output = SyncResult<Response>> + Send;
}

/// Client connection to a worksync server.
pub struct SyncClient<C: Connector> {
    inner: Arc<ClientInner<C>>,
}

impl<C: Connector> Clone for SyncClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ClientInner<C: Connector> {
    config: ClientConfig,
    codec: FrameCodec,
    connector: C,
    dispatcher: Arc<Dispatcher>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    session: SessionMachine,
    scopes: Mutex<BTreeSet<ScopeId>>,
    principal: Mutex<Option<Principal>>,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    shutdown: CancellationToken,
}

impl<C: Connector> SyncClient<C> {
    /// Creates a disconnected client.
    pub fn new(config: ClientConfig, connector: C) -> Self {
        let codec = FrameCodec::new(config.max_frame_len);
        let dispatcher = Arc::new(Dispatcher::new(codec, config.request_timeout));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = ClientInner {
            breaker: CircuitBreaker::new(config.breaker.clone()),
            retry: RetryPolicy::new(config.retry.clone()),
            config,
            codec,
            connector,
            dispatcher,
            session: SessionMachine::new(),
            scopes: Mutex::new(BTreeSet::new()),
            principal: Mutex::new(None),
            link: Mutex::new(None),
            generation: AtomicU64::new(0),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown: CancellationToken::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Returns the fine-grained session state.
    pub fn session_state(&self) -> SessionState {
        self.inner.session.state()
    }

    /// Subscribes to session state changes.
    pub fn watch_session(&self) -> watch::Receiver<SessionState> {
        self.inner.session.watch_session()
    }

    /// Returns the circuit breaker state.
    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }

    /// Returns the authenticated principal, if any.
    pub fn principal(&self) -> Option<Principal> {
        self.inner.principal.lock().clone()
    }

    /// Returns the subscription set restored on every reconnect.
    pub fn subscriptions(&self) -> BTreeSet<ScopeId> {
        self.inner.scopes.lock().clone()
    }

    /// Opens the transport, authenticates (registering if the server asks
    /// for it) and restores subscriptions.
    pub async fn connect(&self, ctx: &RequestContext) -> SyncResult<()> {
        let inner = &self.inner;
        if inner.session.is_closed() {
            return Err(SyncError::NotConnected {
                state: ConnectionState::Closed,
            });
        }
        self.start_supervisor();

        inner.session.transition(SessionState::WaitingForTransport)?;
        match inner.handshake(ctx).await {
            Ok(()) => {
                inner.session.transition(SessionState::Ready)?;
                info!(correlation_id = %ctx.correlation_id(), "connected");
                Ok(())
            }
            Err(e) => {
                warn!(correlation_id = %ctx.correlation_id(), error = %e, "connect failed");
                inner.teardown(e.clone());
                let _ = inner.session.transition(SessionState::Error);
                Err(e)
            }
        }
    }

    /// Leaves the `Error` state and connects again.
    pub async fn reconnect(&self, ctx: &RequestContext) -> SyncResult<()> {
        self.inner.session.transition(SessionState::Initializing)?;
        self.connect(ctx).await
    }

    /// Adds scopes to the subscription set.
    pub async fn subscribe(
        &self,
        ctx: &RequestContext,
        scope_ids: &[ScopeId],
    ) -> SyncResult<Vec<ScopeId>> {
        let request = Request::Subscribe {
            scope_ids: scope_ids.to_vec(),
        };
        match self.inner.send(ctx, request).await? {
            Response::Subscribed { scope_ids: active } => {
                self.inner.scopes.lock().extend(scope_ids.iter().copied());
                Ok(active)
            }
            other => Err(unexpected("subscribed", &other)),
        }
    }

    /// Removes scopes from the subscription set.
    pub async fn unsubscribe(
        &self,
        ctx: &RequestContext,
        scope_ids: &[ScopeId],
    ) -> SyncResult<Vec<ScopeId>> {
        let request = Request::Unsubscribe {
            scope_ids: scope_ids.to_vec(),
        };
        match self.inner.send(ctx, request).await? {
            Response::Unsubscribed { scope_ids: active } => {
                let mut scopes = self.inner.scopes.lock();
                for scope in scope_ids {
                    scopes.remove(scope);
                }
                Ok(active)
            }
            other => Err(unexpected("unsubscribed", &other)),
        }
    }

    /// Round-trips a ping.
    pub async fn ping(&self, ctx: &RequestContext) -> SyncResult<()> {
        match self.inner.send(ctx, Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(unexpected("pong", &other)),
        }
    }

    /// Closes the client. Pending requests fail and no reconnect follows.
    pub fn close(&self) {
        let inner = &self.inner;
        inner.session.close();
        inner.shutdown.cancel();
        inner.teardown(SyncError::NotConnected {
            state: ConnectionState::Closed,
        });
        info!("client closed");
    }

    fn start_supervisor(&self) {
        let Some(events) = self.inner.events_rx.lock().take() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(supervise(weak, events, shutdown));
    }
}

impl<C: Connector> RequestSender for SyncClient<C> {
    fn connection_state(&self) -> ConnectionState {
        self.inner.session.connection_state()
    }

    fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.session.watch_connection()
    }

    fn changes(&self) -> Observer<ChangeEvent> {
        self.inner.dispatcher.subscribe_pushes()
    }

    fn send(
        &self,
        ctx: &RequestContext,
        request: Request,
    ) -> impl Future<Output = SyncResult<Response>> + Send {
        self.inner.send(ctx, request)
    }
}

impl<C: Connector> ClientInner<C> {
    fn ensure_connected(&self) -> SyncResult<()> {
        match self.session.connection_state() {
            ConnectionState::Connected => Ok(()),
            state => Err(SyncError::NotConnected { state }),
        }
    }

    async fn send(&self, ctx: &RequestContext, request: Request) -> SyncResult<Response> {
        self.ensure_connected()?;
        let target = target_of(&request);

        self.retry
            .execute(ctx, move |attempt| {
                let request = request.clone();
                async move {
                    if attempt > 1 {
                        self.ensure_connected()?;
                    }
                    self.breaker
                        .execute(move || self.exchange(ctx, request, target))
                        .await
                }
            })
            .await
    }

    async fn exchange(
        &self,
        ctx: &RequestContext,
        request: Request,
        target: Option<EntityId>,
    ) -> SyncResult<Response> {
        match self.dispatcher.request(ctx, request).await? {
            Response::Rejected(rejection) => Err(SyncError::from_rejection(rejection, target)),
            response => Ok(response),
        }
    }

    async fn handshake(&self, ctx: &RequestContext) -> SyncResult<()> {
        self.open_link(ctx).await?;
        self.session.transition(SessionState::AuthenticatingIdentity)?;
        self.authenticate(ctx, false).await?;
        self.session
            .transition(SessionState::RestoringSubscriptions)?;
        self.restore_subscriptions(ctx).await
    }

    async fn resume(&self, ctx: &RequestContext) -> SyncResult<()> {
        self.open_link(ctx).await?;
        self.authenticate(ctx, true).await?;
        self.restore_subscriptions(ctx).await
    }

    /// Builds a new link through the breaker and retry policy, waiting out
    /// an open circuit a bounded number of times.
    async fn open_link(&self, ctx: &RequestContext) -> SyncResult<()> {
        let mut circuit_waits = 0;
        loop {
            let connected = self
                .retry
                .execute(ctx, move |attempt| async move {
                    if attempt > 1 {
                        debug!(attempt, "retrying connect");
                    }
                    self.breaker
                        .execute(move || async move {
                            self.connector
                                .connect()
                                .await
                                .map_err(|e| SyncError::connection_failure(e.to_string()))
                        })
                        .await
                })
                .await;

            match connected {
                Ok(stream) => {
                    self.install_link(stream);
                    return Ok(());
                }
                Err(SyncError::CircuitOpen { retry_after })
                    if circuit_waits < self.config.retry.max_attempts =>
                {
                    circuit_waits += 1;
                    info!(?retry_after, "circuit open, waiting before connecting");
                    tokio::select! {
                        biased;
                        _ = ctx.cancellation().cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(retry_after.max(MIN_CIRCUIT_WAIT)) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn install_link(&self, stream: C::Stream) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let link = Link::spawn(
            stream,
            generation,
            Arc::clone(&self.dispatcher),
            self.codec,
            self.config.outbound_queue_depth,
            self.events_tx.clone(),
        );
        if let Some(old) = self.link.lock().replace(link) {
            old.close();
        }
    }

    fn teardown(&self, error: SyncError) {
        if let Some(link) = self.link.lock().take() {
            debug!(generation = link.generation(), "tearing down link");
            link.close();
        }
        self.dispatcher.detach();
        self.dispatcher.fail_all(error);
    }

    async fn authenticate(&self, ctx: &RequestContext, resuming: bool) -> SyncResult<()> {
        let credentials = self.config.credentials.clone();
        let mut registered = false;
        loop {
            let request = Request::Authenticate {
                protocol_version: PROTOCOL_VERSION,
                credentials: credentials.clone(),
            };
            match self.dispatcher.request(ctx, request).await? {
                Response::Authenticated { principal } => {
                    return self.accept_principal(principal, resuming);
                }
                Response::Rejected(rejection)
                    if rejection.code == RejectCode::UnknownIdentity
                        && !resuming
                        && !registered =>
                {
                    info!(subject = %credentials.subject, "identity unknown, registering");
                    self.session.transition(SessionState::NeedsRegistration)?;
                    self.register(ctx, &credentials).await?;
                    registered = true;
                    self.session
                        .transition(SessionState::AuthenticatingIdentity)?;
                }
                Response::Rejected(rejection) => {
                    return Err(SyncError::AuthenticationFailed(sanitize_message(
                        &rejection.message,
                    )));
                }
                other => return Err(unexpected("authenticated", &other)),
            }
        }
    }

    async fn register(&self, ctx: &RequestContext, credentials: &Credentials) -> SyncResult<()> {
        let request = Request::Register {
            credentials: credentials.clone(),
        };
        match self.dispatcher.request(ctx, request).await? {
            Response::Registered => Ok(()),
            Response::Rejected(rejection) => Err(SyncError::AuthenticationFailed(
                sanitize_message(&rejection.message),
            )),
            other => Err(unexpected("registered", &other)),
        }
    }

    fn accept_principal(&self, principal: Principal, resuming: bool) -> SyncResult<()> {
        let mut current = self.principal.lock();
        if let Some(previous) = current.as_ref() {
            if resuming && *previous != principal {
                warn!(
                    previous = %previous.subject,
                    current = %principal.subject,
                    "identity changed across reconnect"
                );
                return Err(SyncError::AuthenticationFailed(
                    "identity changed across reconnect".to_string(),
                ));
            }
        }
        info!(subject = %principal.subject, "authenticated");
        *current = Some(principal);
        Ok(())
    }

    async fn restore_subscriptions(&self, ctx: &RequestContext) -> SyncResult<()> {
        let scope_ids: Vec<ScopeId> = self.scopes.lock().iter().copied().collect();
        if scope_ids.is_empty() {
            return Ok(());
        }

        let request = Request::Subscribe {
            scope_ids: scope_ids.clone(),
        };
        match self.dispatcher.request(ctx, request).await? {
            Response::Subscribed { scope_ids: active } => {
                let missing = scope_ids.iter().filter(|s| !active.contains(s)).count();
                if missing > 0 {
                    return Err(SyncError::ServerRejected {
                        code: RejectCode::InvalidRequest,
                        message: format!("{missing} scopes were not restored"),
                    });
                }
                info!(count = scope_ids.len(), "subscriptions restored");
                Ok(())
            }
            Response::Rejected(rejection) => Err(SyncError::from_rejection(rejection, None)),
            other => Err(unexpected("subscribed", &other)),
        }
    }

    async fn handle_link_event(&self, event: LinkEvent) {
        let LinkEvent::Lost { generation, reason } = event;
        if self.session.is_closed()
            || generation != self.generation.load(Ordering::SeqCst)
            || self.session.state() != SessionState::Ready
        {
            debug!(generation, "ignoring loss of inactive link");
            return;
        }
        if self.session.transition(SessionState::Reconnecting).is_err() {
            return;
        }
        self.teardown(SyncError::connection_failure(reason));

        let ctx = RequestContext::new().with_cancellation(self.shutdown.child_token());
        info!(correlation_id = %ctx.correlation_id(), generation, "reconnecting");
        match self.resume(&ctx).await {
            Ok(()) => {
                if self.session.transition(SessionState::Ready).is_ok() {
                    info!(correlation_id = %ctx.correlation_id(), "reconnected");
                }
            }
            Err(e) => {
                warn!(correlation_id = %ctx.correlation_id(), error = %e, "reconnection failed");
                self.teardown(e);
                let _ = self.session.transition(SessionState::Error);
            }
        }
    }
}

impl<C: Connector> Drop for ClientInner<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn supervise<C: Connector>(
    weak: Weak<ClientInner<C>>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        let Some(inner) = weak.upgrade() else { break };
        inner.handle_link_event(event).await;
    }
    debug!("connection supervisor stopped");
}

fn target_of(request: &Request) -> Option<EntityId> {
    match request {
        Request::Create { entity } => Some(entity.id),
        Request::Update { id, .. } | Request::Delete { id, .. } => Some(*id),
        _ => None,
    }
}

fn unexpected(expected: &'static str, actual: &Response) -> SyncError {
    SyncError::UnexpectedResponse {
        expected,
        actual: actual.type_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use bytes::BytesMut;
    use std::io;
    use std::sync::atomic::AtomicU32;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use worksync_protocol::{Entity, EntityKind, Envelope, Payload, Rejection};

    struct PipeConnector {
        streams: mpsc::UnboundedSender<DuplexStream>,
        refusals: AtomicU32,
    }

    impl Connector for PipeConnector {
        type Stream = DuplexStream;

        fn connect(&self) -> impl Future<Output = io::Result<DuplexStream>> + Send {
            let refused = self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let result = if refused {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
            } else {
                let (client, server) = duplex(64 * 1024);
                let _ = self.streams.send(server);
                Ok(client)
            };
            async move { result }
        }
    }

    struct Peer {
        stream: DuplexStream,
        buf: BytesMut,
        codec: FrameCodec,
    }

    impl Peer {
        fn new(stream: DuplexStream) -> Self {
            Self {
                stream,
                buf: BytesMut::new(),
                codec: FrameCodec::default(),
            }
        }

        async fn recv(&mut self) -> Envelope {
            loop {
                if let Some(envelope) = self.codec.decode(&mut self.buf).unwrap() {
                    return envelope;
                }
                let n = self.stream.read_buf(&mut self.buf).await.unwrap();
                assert!(n > 0, "client closed the stream");
            }
        }

        async fn send(&mut self, envelope: Envelope) {
            let frame = self.codec.encode(&envelope).unwrap();
            self.stream.write_all(&frame).await.unwrap();
        }

        async fn reply(&mut self, to: &Envelope, response: Response) {
            self.send(Envelope::response(to.message_id, to.correlation_id, response))
                .await;
        }

        async fn expect(&mut self, name: &str) -> Envelope {
            let envelope = self.recv().await;
            assert_eq!(envelope.payload.type_name(), name);
            envelope
        }

        async fn accept_auth(&mut self, subject: &str) {
            let auth = self.expect("authenticate").await;
            let principal = Principal {
                subject: subject.to_string(),
            };
            self.reply(&auth, Response::Authenticated { principal }).await;
        }
    }

    fn client(refusals: u32) -> (SyncClient<PipeConnector>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (streams, streams_rx) = mpsc::unbounded_channel();
        let connector = PipeConnector {
            streams,
            refusals: AtomicU32::new(refusals),
        };
        let config = ClientConfig::new(Credentials::new("ada", b"token".to_vec()))
            .with_request_timeout(Duration::from_secs(5))
            .with_retry(
                RetryConfig::new(3)
                    .with_initial_delay(Duration::from_millis(1))
                    .with_max_delay(Duration::from_millis(5)),
            );
        (SyncClient::new(config, connector), streams_rx)
    }

    async fn connected(
        client: &SyncClient<PipeConnector>,
        streams: &mut mpsc::UnboundedReceiver<DuplexStream>,
    ) -> Peer {
        let task = tokio::spawn({
            let client = client.clone();
            async move { client.connect(&RequestContext::new()).await }
        });
        let mut peer = Peer::new(streams.recv().await.unwrap());
        peer.accept_auth("ada").await;
        task.await.unwrap().unwrap();
        peer
    }

    #[tokio::test]
    async fn connect_authenticates() {
        let (client, mut streams) = client(0);
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);

        let _peer = connected(&client, &mut streams).await;
        assert_eq!(client.connection_state(), ConnectionState::Connected);
        assert_eq!(client.principal().unwrap().subject, "ada");
    }

    #[tokio::test]
    async fn unknown_identity_registers_then_authenticates() {
        let (client, mut streams) = client(0);
        let task = tokio::spawn({
            let client = client.clone();
            async move { client.connect(&RequestContext::new()).await }
        });

        let mut peer = Peer::new(streams.recv().await.unwrap());
        let auth = peer.expect("authenticate").await;
        peer.reply(
            &auth,
            Response::Rejected(Rejection::new(RejectCode::UnknownIdentity, "who?")),
        )
        .await;
        let register = peer.expect("register").await;
        peer.reply(&register, Response::Registered).await;
        peer.accept_auth("ada").await;

        task.await.unwrap().unwrap();
        assert_eq!(client.session_state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn requests_fail_fast_when_disconnected() {
        let (client, _streams) = client(0);
        let err = client
            .send(&RequestContext::new(), Request::Ping)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::NotConnected {
                state: ConnectionState::Disconnected
            }
        );
    }

    #[tokio::test]
    async fn rejection_maps_to_version_conflict() {
        let (client, mut streams) = client(0);
        let mut peer = connected(&client, &mut streams).await;

        let id = EntityId::new();
        let task = tokio::spawn({
            let client = client.clone();
            async move {
                let request = Request::Delete {
                    kind: EntityKind::WorkItem,
                    id,
                    expected_version: 3,
                };
                client.send(&RequestContext::new(), request).await
            }
        });
        let delete = peer.expect("delete").await;
        peer.reply(&delete, Response::Rejected(Rejection::version_conflict(3, 5)))
            .await;

        assert_eq!(
            task.await.unwrap(),
            Err(SyncError::VersionConflict {
                entity_id: id,
                expected: 3,
                actual: 5,
            })
        );
        assert_eq!(client.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn reconnect_restores_subscriptions_before_ready() {
        let (client, mut streams) = client(0);
        let mut peer = connected(&client, &mut streams).await;
        let mut pushes = client.changes();

        let scopes = [ScopeId::new(), ScopeId::new()];
        let task = tokio::spawn({
            let client = client.clone();
            async move { client.subscribe(&RequestContext::new(), &scopes).await }
        });
        let subscribe = peer.expect("subscribe").await;
        peer.reply(
            &subscribe,
            Response::Subscribed {
                scope_ids: scopes.to_vec(),
            },
        )
        .await;
        task.await.unwrap().unwrap();

        let mut session = client.watch_session();
        drop(peer);

        let mut peer = Peer::new(streams.recv().await.unwrap());
        peer.accept_auth("ada").await;
        let replay = peer.expect("subscribe").await;
        match &replay.payload {
            Payload::Request(Request::Subscribe { scope_ids }) => {
                let replayed: BTreeSet<_> = scope_ids.iter().copied().collect();
                assert_eq!(replayed, scopes.into_iter().collect());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(client.session_state(), SessionState::Reconnecting);
        peer.reply(
            &replay,
            Response::Subscribed {
                scope_ids: scopes.to_vec(),
            },
        )
        .await;

        session
            .wait_for(|state| *state == SessionState::Ready)
            .await
            .unwrap();

        let entity = Entity::draft(EntityKind::WorkItem)
            .in_project(scopes[0])
            .with_field("title", "After reconnect");
        let event = ChangeEvent::created(entity);
        peer.send(Envelope::push(uuid::Uuid::new_v4(), event.clone()))
            .await;
        assert_eq!(pushes.recv().await, Some(event));
    }

    #[tokio::test]
    async fn exhausted_connect_moves_to_error_until_reconnect() {
        let (client, mut streams) = client(3);

        let err = client.connect(&RequestContext::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::ConnectionFailure { .. }));
        assert_eq!(client.session_state(), SessionState::Error);

        let task = tokio::spawn({
            let client = client.clone();
            async move { client.reconnect(&RequestContext::new()).await }
        });
        let mut peer = Peer::new(streams.recv().await.unwrap());
        peer.accept_auth("ada").await;
        task.await.unwrap().unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn reconnect_outside_error_is_refused() {
        let (client, _streams) = client(0);
        let err = client.reconnect(&RequestContext::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let (client, mut streams) = client(0);
        let _peer = connected(&client, &mut streams).await;

        client.close();
        assert_eq!(client.connection_state(), ConnectionState::Closed);
        assert_eq!(
            client.ping(&RequestContext::new()).await,
            Err(SyncError::NotConnected {
                state: ConnectionState::Closed
            })
        );
    }
}
