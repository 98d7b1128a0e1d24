//! In-process server and clients for end-to-end tests.
//!
//! [`MemoryConnector`] hands the client one end of a `tokio::io::duplex`
//! pipe and serves the other end on a real [`SyncServer`], so tests run
//! the full framing, dispatch and broadcast path without sockets.

use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use worksync_client::{
    ClientConfig, Connector, EntityStore, Replica, RequestContext, SessionState, SyncClient,
    SyncResult,
};
use worksync_protocol::{EntityKind, ScopeId};
use worksync_server::{
    AuthConfig, ConnectionId, HmacAuthenticator, MemoryRepository, ServerConfig, SyncServer,
};

use crate::fixtures::{client_config, client_config_with_token};

const PIPE_CAPACITY: usize = 256 * 1024;

/// Connects clients to an in-process server over duplex pipes.
#[derive(Clone)]
pub struct MemoryConnector {
    server: Arc<SyncServer>,
    connections: Arc<Mutex<Vec<ConnectionId>>>,
}

impl MemoryConnector {
    /// Creates a connector for `server`.
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self {
            server,
            connections: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns every connection this connector has opened, oldest first.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.connections.lock().clone()
    }

    /// Returns the most recently opened connection.
    pub fn current_connection(&self) -> Option<ConnectionId> {
        self.connections.lock().last().copied()
    }
}

impl Connector for MemoryConnector {
    type Stream = DuplexStream;

    fn connect(&self) -> impl Future<Output = io::Result<DuplexStream>> + Send {
        let server = Arc::clone(&self.server);
        let connections = Arc::clone(&self.connections);
        async move {
            if server.is_shut_down() {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "server is shut down",
                ));
            }
            let (client, served) = tokio::io::duplex(PIPE_CAPACITY);
            let (id, _task) = server.serve_stream(served).ok_or_else(|| {
                io::Error::new(io::ErrorKind::ConnectionRefused, "connection limit reached")
            })?;
            connections.lock().push(id);
            Ok(client)
        }
    }
}

/// A connected client with its replica and reconciliation task.
pub struct TestClient {
    /// The client.
    pub client: SyncClient<MemoryConnector>,
    /// Stores for every kind, fed by the reconciliation task.
    pub replica: Arc<Replica<SyncClient<MemoryConnector>>>,
    connector: MemoryConnector,
    task: JoinHandle<()>,
}

impl TestClient {
    /// Returns the store for `kind`.
    pub fn store(&self, kind: EntityKind) -> &Arc<EntityStore<SyncClient<MemoryConnector>>> {
        self.replica.store(kind)
    }

    /// Returns the server-side id of the current connection.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connector.current_connection()
    }

    /// Returns every connection the client has opened.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.connector.connections()
    }

    /// Subscribes to `scopes`.
    pub async fn subscribe(&self, scopes: &[ScopeId]) -> SyncResult<()> {
        self.client
            .subscribe(&RequestContext::new(), scopes)
            .await
            .map(|_| ())
    }

    /// Waits until the session reaches `state`.
    pub async fn wait_for(&self, state: SessionState) {
        let mut watch = self.client.watch_session();
        tokio::time::timeout(Duration::from_secs(10), async {
            while *watch.borrow_and_update() != state {
                if watch.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .expect("session state not reached in time");
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.client.close();
        self.task.abort();
    }
}

/// A server plus helpers for spawning connected clients.
pub struct TestCluster {
    server: Arc<SyncServer>,
    authenticator: Option<Arc<HmacAuthenticator>>,
}

impl TestCluster {
    /// Creates a cluster whose server accepts any subject.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Creates a cluster from a server configuration.
    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            server: Arc::new(SyncServer::new(config)),
            authenticator: None,
        }
    }

    /// Creates a cluster that requires HMAC tokens. No subject is
    /// registered up front.
    pub fn with_token_auth(secret: &[u8]) -> Self {
        let config = ServerConfig::default().with_auth(secret.to_vec());
        let authenticator = Arc::new(HmacAuthenticator::new(
            AuthConfig::new(secret.to_vec()).with_expiry(config.token_expiry),
        ));
        let server = SyncServer::with_parts(
            config,
            Arc::new(MemoryRepository::new()),
            Arc::clone(&authenticator) as Arc<dyn worksync_server::Authenticator>,
        );
        Self {
            server: Arc::new(server),
            authenticator: Some(authenticator),
        }
    }

    /// Returns the server.
    pub fn server(&self) -> &Arc<SyncServer> {
        &self.server
    }

    /// Returns the token authenticator, when token auth is on.
    pub fn authenticator(&self) -> Option<&Arc<HmacAuthenticator>> {
        self.authenticator.as_ref()
    }

    /// Returns a connector bound to this cluster's server.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector::new(Arc::clone(&self.server))
    }

    /// Builds a client configuration for `subject`, with a valid token
    /// when token auth is on.
    pub fn config_for(&self, subject: &str) -> ClientConfig {
        match &self.authenticator {
            Some(auth) => {
                let token = auth
                    .validator()
                    .create_token(subject)
                    .expect("Failed to issue token");
                client_config_with_token(subject, token)
            }
            None => client_config(subject),
        }
    }

    /// Connects a client for `subject` and attaches its replica.
    pub async fn client(&self, subject: &str) -> TestClient {
        self.client_with_config(self.config_for(subject))
            .await
            .expect("Failed to connect test client")
    }

    /// Connects a client with an explicit configuration.
    pub async fn client_with_config(&self, config: ClientConfig) -> SyncResult<TestClient> {
        let connector = self.connector();
        let client = SyncClient::new(config, connector.clone());
        client.connect(&RequestContext::new()).await?;
        let replica = Arc::new(Replica::new(Arc::new(client.clone())));
        let task = replica.attach();
        Ok(TestClient {
            client,
            replica,
            connector,
            task,
        })
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls `condition` until it holds or ten seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
