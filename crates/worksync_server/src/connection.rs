//! Per-connection read and write loops.
//!
//! The read loop decodes requests and handles them in arrival order. Its
//! responses travel to the write loop over a bounded channel that is never
//! subject to dropping; push frames come from the connection's [`Outbox`].
//! The write loop is the only task that writes to the stream.

use crate::handler::{HandlerContext, RequestHandler};
use crate::registry::{ConnectionId, Outbox};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use worksync_protocol::{Envelope, FrameCodec, Payload};

/// Serves one stream until the peer disconnects, a fatal protocol error
/// occurs or `shutdown` is cancelled.
pub async fn serve_connection<S>(
    stream: S,
    context: Arc<HandlerContext>,
    connection_id: ConnectionId,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let config = &context.config;
    let codec = FrameCodec::new(config.max_frame_len);
    let outbox = Arc::new(Outbox::new(config.outbound_capacity));
    let stop = shutdown.child_token();
    let (responses_tx, responses_rx) = mpsc::channel(config.response_queue_depth.max(1));

    context
        .registry
        .register(connection_id, Arc::clone(&outbox), stop.clone());
    info!(connection = %connection_id, "connection opened");

    let (reader, writer) = tokio::io::split(stream);
    let writer_task = tokio::spawn(write_loop(
        writer,
        responses_rx,
        Arc::clone(&outbox),
        stop.clone(),
        connection_id,
    ));

    let handler = RequestHandler::new(Arc::clone(&context), connection_id);
    read_loop(reader, codec, handler, responses_tx, &stop).await;

    stop.cancel();
    context.registry.unregister(connection_id);
    if let Err(e) = writer_task.await {
        warn!(connection = %connection_id, error = %e, "writer task failed");
    }
    info!(connection = %connection_id, dropped_events = outbox.dropped(), "connection closed");
}

async fn read_loop<R>(
    mut reader: R,
    codec: FrameCodec,
    mut handler: RequestHandler,
    responses: mpsc::Sender<Bytes>,
    stop: &CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        loop {
            let envelope = match codec.decode(&mut buf) {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    warn!(error = %e, "closing connection after fatal frame error");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "dropping undecodable frame");
                    continue;
                }
            };

            let Envelope {
                message_id,
                correlation_id,
                payload,
            } = envelope;
            let request = match payload {
                Payload::Request(request) => request,
                other => {
                    warn!(%correlation_id, payload = other.type_name(), "ignoring non-request frame");
                    continue;
                }
            };

            let response = handler.handle(correlation_id, request);
            let frame = match codec.encode(&Envelope::response(message_id, correlation_id, response)) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(%correlation_id, error = %e, "failed to encode response");
                    continue;
                }
            };
            let sent = tokio::select! {
                biased;
                _ = stop.cancelled() => return,
                sent = responses.send(frame) => sent,
            };
            if sent.is_err() {
                return;
            }
        }

        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            read = reader.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!("peer closed connection");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "read failed");
                return;
            }
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut responses: mpsc::Receiver<Bytes>,
    outbox: Arc<Outbox>,
    stop: CancellationToken,
    connection_id: ConnectionId,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            frame = responses.recv() => frame,
            frame = outbox.pop() => frame,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = writer.write_all(&frame).await {
            debug!(connection = %connection_id, error = %e, "write failed");
            stop.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::OpenAuthenticator;
    use crate::config::ServerConfig;
    use crate::registry::ConnectionRegistry;
    use crate::repository::MemoryRepository;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};
    use uuid::Uuid;
    use worksync_protocol::{Credentials, Request, Response, PROTOCOL_VERSION};

    fn context() -> Arc<HandlerContext> {
        Arc::new(HandlerContext::new(
            ServerConfig::default(),
            Arc::new(MemoryRepository::new()),
            Arc::new(OpenAuthenticator),
            Arc::new(ConnectionRegistry::new(FrameCodec::default())),
        ))
    }

    async fn call(stream: &mut DuplexStream, buf: &mut BytesMut, request: Request) -> Envelope {
        let codec = FrameCodec::default();
        let envelope = Envelope::request(Uuid::new_v4(), request);
        stream
            .write_all(&codec.encode(&envelope).unwrap())
            .await
            .unwrap();
        let reply = loop {
            if let Some(reply) = codec.decode(buf).unwrap() {
                break reply;
            }
            assert_ne!(stream.read_buf(buf).await.unwrap(), 0, "server hung up");
        };
        assert_eq!(reply.message_id, envelope.message_id);
        assert_eq!(reply.correlation_id, envelope.correlation_id);
        reply
    }

    #[tokio::test]
    async fn answers_requests_in_order() {
        let context = context();
        let id = context.registry.next_connection_id();
        let (mut client, server) = duplex(64 * 1024);
        let task = tokio::spawn(serve_connection(
            server,
            Arc::clone(&context),
            id,
            CancellationToken::new(),
        ));

        let mut buf = BytesMut::new();
        let pong = call(&mut client, &mut buf, Request::Ping).await;
        assert_eq!(pong.payload, Payload::Response(Response::Pong));

        let auth = call(
            &mut client,
            &mut buf,
            Request::Authenticate {
                protocol_version: PROTOCOL_VERSION,
                credentials: Credentials::new("ada", Vec::new()),
            },
        )
        .await;
        assert!(matches!(
            auth.payload,
            Payload::Response(Response::Authenticated { .. })
        ));
        assert_eq!(context.registry.len(), 1);

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(context.registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_closes_the_stream() {
        let context = context();
        let id = context.registry.next_connection_id();
        let shutdown = CancellationToken::new();
        let (mut client, server) = duplex(1024);
        let task = tokio::spawn(serve_connection(server, context, id, shutdown.clone()));

        let mut buf = BytesMut::new();
        call(&mut client, &mut buf, Request::Ping).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.read_buf(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn oversized_frame_ends_the_connection() {
        let context = context();
        let id = context.registry.next_connection_id();
        let (mut client, server) = duplex(1024);
        let task = tokio::spawn(serve_connection(
            server,
            context,
            id,
            CancellationToken::new(),
        ));

        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
