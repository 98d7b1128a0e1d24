//! Transport: connectors and the per-connection link tasks.
//!
//! A [`Link`] owns one physical stream. A single writer task drains the
//! outbound frame queue, so concurrent callers never interleave partial
//! frames. A reader task decodes frames and hands them to the dispatcher.
//! Whichever task notices the stream dying reports it once as a
//! [`LinkEvent::Lost`] tagged with the link generation.

use crate::dispatcher::Dispatcher;
use crate::error::SyncError;
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use worksync_protocol::FrameCodec;

/// Opens byte streams to the server.
pub trait Connector: Send + Sync + 'static {
    /// The stream type produced.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Opens a new stream.
    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Connects over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Creates a connector for `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Returns the target address.
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self) -> impl Future<Output = io::Result<TcpStream>> + Send {
        let addr = self.addr.clone();
        async move {
            let stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        }
    }
}

/// Events reported by link tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The stream closed or failed unexpectedly.
    Lost {
        /// Generation of the lost link.
        generation: u64,
        /// What happened.
        reason: String,
    },
}

struct LinkShared {
    generation: u64,
    stop: CancellationToken,
    reported: AtomicBool,
    dispatcher: Arc<Dispatcher>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkShared {
    fn lost(&self, reason: String) {
        if !self.reported.swap(true, Ordering::SeqCst) {
            warn!(generation = self.generation, %reason, "link lost");
            self.dispatcher
                .fail_all(SyncError::connection_failure(reason.clone()));
            let _ = self.events.send(LinkEvent::Lost {
                generation: self.generation,
                reason,
            });
        }
        self.stop.cancel();
    }
}

/// One live connection: a reader task and a writer task.
pub(crate) struct Link {
    shared: Arc<LinkShared>,
}

impl Link {
    /// Splits `stream`, attaches its writer to the dispatcher and starts
    /// both tasks.
    pub(crate) fn spawn<S>(
        stream: S,
        generation: u64,
        dispatcher: Arc<Dispatcher>,
        codec: FrameCodec,
        queue_depth: usize,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        dispatcher.attach(tx);

        let shared = Arc::new(LinkShared {
            generation,
            stop: CancellationToken::new(),
            reported: AtomicBool::new(false),
            dispatcher,
            events,
        });

        tokio::spawn(write_loop(writer, rx, Arc::clone(&shared)));
        tokio::spawn(read_loop(reader, codec, Arc::clone(&shared)));
        debug!(generation, "link established");

        Self { shared }
    }

    /// Returns the link generation.
    pub(crate) fn generation(&self) -> u64 {
        self.shared.generation
    }

    /// Stops both tasks without reporting a loss.
    pub(crate) fn close(&self) {
        self.shared.reported.store(true, Ordering::SeqCst);
        self.shared.stop.cancel();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<Bytes>, shared: Arc<LinkShared>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.stop.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = writer.write_all(&frame).await {
            shared.lost(format!("write failed: {e}"));
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(mut reader: R, codec: FrameCodec, shared: Arc<LinkShared>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(envelope)) => shared.dispatcher.route(envelope),
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    shared.lost(e.to_string());
                    return;
                }
                Err(e) => warn!(error = %e, "dropping undecodable frame"),
            }
        }

        let read = tokio::select! {
            biased;
            _ = shared.stop.cancelled() => return,
            read = reader.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                shared.lost("connection closed by server".to_string());
                return;
            }
            Ok(_) => {}
            Err(e) => {
                shared.lost(format!("read failed: {e}"));
                return;
            }
        }
    }
}
