//! Main sync server.

use crate::auth::{AuthConfig, Authenticator, HmacAuthenticator, OpenAuthenticator};
use crate::config::ServerConfig;
use crate::connection::serve_connection;
use crate::error::ServerResult;
use crate::handler::HandlerContext;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::repository::{EntityRepository, MemoryRepository};
use crate::stats::StatsSnapshot;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use worksync_protocol::FrameCodec;

/// The sync server.
///
/// Accepts connections, answers requests against an [`EntityRepository`]
/// and fans committed changes out to subscribed connections.
///
/// # Example
///
/// ```no_run
/// use worksync_server::{ServerConfig, SyncServer};
///
/// # async fn run() -> worksync_server::ServerResult<()> {
/// let server = SyncServer::new(ServerConfig::default());
/// server.run().await
/// # }
/// ```
pub struct SyncServer {
    context: Arc<HandlerContext>,
    shutdown: CancellationToken,
    limiter: Arc<Semaphore>,
}

impl SyncServer {
    /// Creates a server with in-memory storage. Token authentication is
    /// enabled when the configuration carries an auth secret.
    pub fn new(config: ServerConfig) -> Self {
        let authenticator: Arc<dyn Authenticator> = match &config.auth_secret {
            Some(secret) if config.require_auth => Arc::new(HmacAuthenticator::new(
                AuthConfig::new(secret.clone()).with_expiry(config.token_expiry),
            )),
            _ => Arc::new(OpenAuthenticator),
        };
        Self::with_parts(config, Arc::new(MemoryRepository::new()), authenticator)
    }

    /// Creates a server over existing storage and authenticator.
    pub fn with_parts(
        config: ServerConfig,
        repository: Arc<dyn EntityRepository>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(FrameCodec::new(
            config.max_frame_len,
        )));
        let limiter = Arc::new(Semaphore::new(config.max_connections.max(1)));
        let context = Arc::new(HandlerContext::new(
            config,
            repository,
            authenticator,
            registry,
        ));
        Self {
            context,
            shutdown: CancellationToken::new(),
            limiter,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// Returns the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.context.registry
    }

    /// Returns the storage.
    pub fn repository(&self) -> &Arc<dyn EntityRepository> {
        &self.context.repository
    }

    /// Returns the server counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.context.stats.snapshot()
    }

    /// Binds the configured address.
    pub async fn listen(&self) -> ServerResult<TcpListener> {
        let listener = TcpListener::bind(self.context.config.bind_addr).await?;
        Ok(listener)
    }

    /// Binds the configured address and serves until shut down.
    pub async fn run(&self) -> ServerResult<()> {
        let listener = self.listen().await?;
        self.serve(listener).await
    }

    /// Accepts connections from `listener` until shut down.
    pub async fn serve(&self, listener: TcpListener) -> ServerResult<()> {
        let local: Option<SocketAddr> = listener.local_addr().ok();
        info!(addr = ?local, "sync server listening");

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&self.limiter).try_acquire_owned() else {
                self.context.stats.record_connection_rejected();
                warn!(%peer, "connection limit reached, refusing connection");
                drop(stream);
                continue;
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "failed to set TCP_NODELAY");
            }

            self.context.stats.record_connection_accepted();
            let id = self.context.registry.next_connection_id();
            debug!(%peer, connection = %id, "accepted connection");
            let context = Arc::clone(&self.context);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                serve_connection(stream, context, id, shutdown).await;
                drop(permit);
            });
        }

        info!("sync server stopped accepting connections");
        Ok(())
    }

    /// Serves a single already-established stream. Counts against the
    /// connection limit like an accepted socket; returns `None` when the
    /// limit is reached.
    pub fn serve_stream<S>(&self, stream: S) -> Option<(ConnectionId, JoinHandle<()>)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Ok(permit) = Arc::clone(&self.limiter).try_acquire_owned() else {
            self.context.stats.record_connection_rejected();
            warn!("connection limit reached, refusing stream");
            return None;
        };
        self.context.stats.record_connection_accepted();
        let id = self.context.registry.next_connection_id();
        let context = Arc::clone(&self.context);
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            serve_connection(stream, context, id, shutdown).await;
            drop(permit);
        });
        Some((id, task))
    }

    /// Forcibly closes one connection.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.context.registry.disconnect(id)
    }

    /// Stops accepting and closes every connection.
    pub fn shutdown(&self) {
        info!("sync server shutting down");
        self.shutdown.cancel();
    }

    /// Returns true once `shutdown` was called.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use uuid::Uuid;
    use worksync_protocol::{Envelope, Payload, Request, Response};

    #[test]
    fn auth_follows_configuration() {
        let open = SyncServer::new(ServerConfig::default());
        assert!(!open.config().require_auth);

        let secured = SyncServer::new(ServerConfig::default().with_auth(b"secret".to_vec()));
        assert!(secured.config().require_auth);
        assert_eq!(secured.stats(), StatsSnapshot::default());
    }

    #[tokio::test]
    async fn serve_stream_respects_connection_limit() {
        let server = SyncServer::new(ServerConfig::default().with_max_connections(1));
        let (_a, first) = duplex(1024);
        let (_b, second) = duplex(1024);

        assert!(server.serve_stream(first).is_some());
        assert!(server.serve_stream(second).is_none());
        let stats = server.stats();
        assert_eq!(stats.connections_accepted, 1);
        assert_eq!(stats.connections_rejected, 1);
    }

    #[tokio::test]
    async fn tcp_round_trip_and_shutdown() {
        let server = Arc::new(SyncServer::new(ServerConfig::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve(listener).await }
        });

        let codec = FrameCodec::default();
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let ping = Envelope::request(Uuid::new_v4(), Request::Ping);
        stream
            .write_all(&codec.encode(&ping).unwrap())
            .await
            .unwrap();

        let mut buf = BytesMut::new();
        let reply = loop {
            if let Some(reply) = codec.decode(&mut buf).unwrap() {
                break reply;
            }
            assert_ne!(stream.read_buf(&mut buf).await.unwrap(), 0);
        };
        assert_eq!(reply.message_id, ping.message_id);
        assert_eq!(reply.payload, Payload::Response(Response::Pong));

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(server.is_shut_down());
        assert_eq!(stream.read_buf(&mut buf).await.unwrap_or(0), 0);
    }
}
