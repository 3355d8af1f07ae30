//! Server side of the transport.
//!
//! A [`ServerTransport`] accepts connections and dispatches inbound requests
//! to the handler subscribed for the request's partition. Handlers run on the
//! event loop task and reply through a [`ServerOutput`], either right away or
//! later from any task. The loop keeps a reply handle per dispatched request
//! until the response is sent or the partition is unsubscribed.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelOptions, InboundFrame};
use crate::conductor::{
    ChannelChange, ChannelListener, ChannelManager, ManagerQueues, MessageHandler,
};
use crate::config::TransportConfig;
use crate::error::{HandlerError, Result};
use crate::metrics::{MetricsSnapshot, TransportMetrics};
use crate::protocol::{self, Message, LENGTH_FIELD_LENGTH};
use crate::registry::{RemoteAddressRegistry, RemoteEndpoint, StreamId};
use crate::routing::PartitionId;
use crate::send_buffer::{ClaimError, SendBuffer, SendBufferReceiver};

/// A request handed to a [`RequestHandler`].
#[derive(Debug, Clone)]
pub struct ServerRequest {
    /// Partition the request is addressed to.
    pub partition_id: PartitionId,
    /// Server-local id; pass it to [`ServerOutput::send_response`].
    pub request_id: u64,
    /// Stream of the client that sent the request.
    pub stream_id: StreamId,
    /// Address of the client.
    pub remote: SocketAddr,
    /// Request payload.
    pub payload: Bytes,
}

/// Handles the requests of one partition.
///
/// Returning `Ok` promises a response through [`ServerOutput::send_response`];
/// returning an error drops the request. A panic is treated like an error.
pub trait RequestHandler: Send + Sync {
    /// Handles `request`.
    fn on_request(
        &self,
        request: &ServerRequest,
        output: &ServerOutput,
    ) -> std::result::Result<(), HandlerError>;
}

impl<F> RequestHandler for F
where
    F: Fn(&ServerRequest, &ServerOutput) -> std::result::Result<(), HandlerError> + Send + Sync,
{
    fn on_request(
        &self,
        request: &ServerRequest,
        output: &ServerOutput,
    ) -> std::result::Result<(), HandlerError> {
        self(request, output)
    }
}

/// Handler that answers every request with the payload `f` computes.
pub fn respond_with<F>(f: F) -> impl RequestHandler
where
    F: Fn(&ServerRequest) -> std::result::Result<Bytes, HandlerError> + Send + Sync,
{
    move |request: &ServerRequest, output: &ServerOutput| -> std::result::Result<(), HandlerError> {
        let payload = f(request)?;
        output.send_response(request.partition_id, request.request_id, payload);
        Ok(())
    }
}

enum ServerCommand {
    Subscribe {
        partition_id: PartitionId,
        handler: Arc<dyn RequestHandler>,
    },
    Unsubscribe {
        partition_id: PartitionId,
    },
    SendResponse {
        partition_id: PartitionId,
        request_id: u64,
        payload: Bytes,
    },
    Adopt {
        stream: TcpStream,
        endpoint: Arc<RemoteEndpoint>,
    },
    RegisterListener(Arc<dyn ChannelListener>),
    PendingRequests {
        reply: oneshot::Sender<usize>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Reply path of a server-side request.
#[derive(Clone)]
pub struct ServerOutput {
    commands: mpsc::UnboundedSender<ServerCommand>,
    send_buffer: SendBuffer,
    metrics: Arc<TransportMetrics>,
}

impl ServerOutput {
    /// Sends the response to a dispatched request.
    ///
    /// At most one response is sent per request; responses to unknown or
    /// already answered requests are ignored. Returns false if the
    /// transport is closed.
    pub fn send_response(
        &self,
        partition_id: PartitionId,
        request_id: u64,
        payload: Bytes,
    ) -> bool {
        self.commands
            .send(ServerCommand::SendResponse {
                partition_id,
                request_id,
                payload,
            })
            .is_ok()
    }

    /// Pushes a fire-and-forget message to a connected client.
    pub fn send_message(&self, stream_id: StreamId, payload: &[u8]) -> bool {
        let length = protocol::message_frame_length(payload.len());
        match self.send_buffer.claim(length, stream_id) {
            Ok(mut claim) => {
                protocol::write_message_frame(&mut claim.region(), payload);
                claim.commit().is_ok()
            }
            Err(e) => {
                if e.is_transient() {
                    self.metrics.backpressure_events.inc();
                }
                trace!(stream_id, error = %e, "message not sent");
                false
            }
        }
    }
}

impl fmt::Debug for ServerOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOutput")
            .field("send_buffer", &self.send_buffer)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct ReplyHandle {
    stream_id: StreamId,
    wire_request_id: u64,
}

struct Partition {
    handler: Arc<dyn RequestHandler>,
    pending: HashMap<u64, ReplyHandle>,
}

struct DeferredResponse {
    partition_id: PartitionId,
    reply: ReplyHandle,
    payload: Bytes,
}

impl DeferredResponse {
    fn frame_length(&self) -> usize {
        protocol::request_frame_length(self.payload.len())
    }
}

/// Event loop of a server transport.
struct ServerConductor {
    channels: ChannelManager,
    queues: ManagerQueues,
    commands: mpsc::UnboundedReceiver<ServerCommand>,
    frames: SendBufferReceiver,
    output: ServerOutput,
    registry: Arc<RemoteAddressRegistry>,
    partitions: HashMap<PartitionId, Partition>,
    deferred: VecDeque<DeferredResponse>,
    next_request_id: u64,
    message_handler: Option<Arc<dyn MessageHandler>>,
    metrics: Arc<TransportMetrics>,
}

impl ServerConductor {
    async fn run(mut self) {
        loop {
            let waiting_for = self.deferred.front().map(DeferredResponse::frame_length);
            let send_buffer = self.output.send_buffer.clone();
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(ServerCommand::Close { done }) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(event) = self.queues.events.recv() => {
                    if let ChannelChange::Closed(stream_id) = self.channels.on_event(event) {
                        if let Some(endpoint) = self.registry.get_by_stream_id(stream_id) {
                            self.registry.retire(&endpoint);
                        }
                    }
                }
                Some(frame) = self.frames.next() => {
                    self.channels.forward(frame);
                }
                _ = send_buffer.wait_for_capacity(waiting_for.unwrap_or(0)),
                    if waiting_for.is_some() =>
                {
                    self.flush_deferred();
                }
                Some(inbound) = self.queues.inbound.recv() => self.on_inbound(inbound),
            }
        }
    }

    fn on_command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::Subscribe {
                partition_id,
                handler,
            } => {
                debug!(%partition_id, "partition subscribed");
                self.partitions.insert(
                    partition_id,
                    Partition {
                        handler,
                        pending: HashMap::new(),
                    },
                );
            }
            ServerCommand::Unsubscribe { partition_id } => {
                if let Some(partition) = self.partitions.remove(&partition_id) {
                    debug!(%partition_id, dropped = partition.pending.len(), "partition unsubscribed");
                }
            }
            ServerCommand::SendResponse {
                partition_id,
                request_id,
                payload,
            } => {
                let reply = self
                    .partitions
                    .get_mut(&partition_id)
                    .and_then(|p| p.pending.remove(&request_id));
                match reply {
                    Some(reply) => self.write_response(DeferredResponse {
                        partition_id,
                        reply,
                        payload,
                    }),
                    None => trace!(%partition_id, request_id, "no pending request for response"),
                }
            }
            ServerCommand::Adopt { stream, endpoint } => {
                debug!(stream_id = endpoint.stream_id(), addr = %endpoint.address(), "connection accepted");
                self.channels.adopt(stream, &endpoint);
            }
            ServerCommand::RegisterListener(listener) => self.channels.register_listener(listener),
            ServerCommand::PendingRequests { reply } => {
                let _ = reply.send(self.partitions.values().map(|p| p.pending.len()).sum());
            }
            ServerCommand::Close { .. } => {}
        }
    }

    fn on_inbound(&mut self, inbound: InboundFrame) {
        match Message::decode(inbound.frame) {
            Ok(Message::RequestResponse {
                request_id,
                partition_id,
                payload,
            }) => self.dispatch(inbound.stream_id, request_id, partition_id, payload),
            Ok(Message::Single { payload }) => match &self.message_handler {
                Some(handler) => handler.on_message(inbound.stream_id, payload),
                None => trace!(stream_id = inbound.stream_id, "single message without handler dropped"),
            },
            Ok(Message::Control(_)) | Ok(Message::Unknown(_)) => {}
            Err(e) => warn!(stream_id = inbound.stream_id, error = %e, "undecodable inbound frame dropped"),
        }
    }

    fn dispatch(
        &mut self,
        stream_id: StreamId,
        wire_request_id: u64,
        partition_id: PartitionId,
        payload: Bytes,
    ) {
        let Some(partition) = self.partitions.get_mut(&partition_id) else {
            debug!(%partition_id, stream_id, "no handler for partition, request dropped");
            return;
        };
        let remote = match self.registry.get_by_stream_id(stream_id) {
            Some(endpoint) => endpoint.address(),
            None => return,
        };
        let request = ServerRequest {
            partition_id,
            request_id: self.next_request_id,
            stream_id,
            remote,
            payload,
        };
        self.next_request_id += 1;
        self.metrics.requests_dispatched.inc();

        let output = &self.output;
        let handler = &partition.handler;
        let handled =
            panic::catch_unwind(AssertUnwindSafe(|| handler.on_request(&request, output)));
        match handled {
            Ok(Ok(())) => {
                partition.pending.insert(
                    request.request_id,
                    ReplyHandle {
                        stream_id,
                        wire_request_id,
                    },
                );
            }
            Ok(Err(e)) => {
                self.metrics.handler_errors.inc();
                warn!(%partition_id, request_id = request.request_id, error = %e, "request handler failed, request dropped");
            }
            Err(_) => {
                self.metrics.handler_errors.inc();
                warn!(%partition_id, request_id = request.request_id, "request handler panicked, request dropped");
            }
        }
    }

    fn write_response(&mut self, response: DeferredResponse) {
        if !self.deferred.is_empty() {
            self.deferred.push_back(response);
            return;
        }
        if let Err(response) = self.try_write(response) {
            self.deferred.push_back(response);
        }
    }

    fn flush_deferred(&mut self) {
        while let Some(response) = self.deferred.pop_front() {
            if let Err(response) = self.try_write(response) {
                self.deferred.push_front(response);
                break;
            }
        }
    }

    /// Returns the response if the send buffer is full.
    fn try_write(
        &mut self,
        response: DeferredResponse,
    ) -> std::result::Result<(), DeferredResponse> {
        let length = response.frame_length();
        match self.output.send_buffer.claim(length, response.reply.stream_id) {
            Ok(mut claim) => {
                protocol::write_request_frame(
                    &mut claim.region(),
                    response.reply.wire_request_id,
                    response.partition_id,
                    &response.payload,
                );
                if claim.commit().is_ok() {
                    self.metrics.responses_sent.inc();
                }
                Ok(())
            }
            Err(ClaimError::InsufficientCapacity { .. }) => {
                self.metrics.backpressure_events.inc();
                trace!(length, "send buffer full, response deferred");
                Err(response)
            }
            Err(e) => {
                warn!(partition_id = %response.partition_id, error = %e, "response dropped");
                Ok(())
            }
        }
    }

    async fn shutdown(&mut self) {
        self.partitions.clear();
        self.deferred.clear();
        self.output.send_buffer.close();
        while let Some(frame) = self.frames.try_next() {
            drop(frame);
        }
        self.channels.shutdown().await;
        debug!("server conductor stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<RemoteAddressRegistry>,
    commands: mpsc::UnboundedSender<ServerCommand>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let endpoint = registry.register(addr);
                    if commands.send(ServerCommand::Adopt { stream, endpoint }).is_err() {
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = shutdown.notified() => return,
        }
    }
}

/// Accepts connections and dispatches requests to partition handlers.
pub struct ServerTransport {
    local_addr: SocketAddr,
    output: ServerOutput,
    metrics: Arc<TransportMetrics>,
    closed: AtomicBool,
    stop_accepting: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerTransport {
    /// Binds a listener on `address` and starts the server.
    pub async fn bind(config: TransportConfig, address: SocketAddr) -> Result<Self> {
        Self::start(config, address, None).await
    }

    /// Like [`bind`](Self::bind), handing inbound single messages to
    /// `handler`.
    pub async fn bind_with_message_handler(
        config: TransportConfig,
        address: SocketAddr,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        Self::start(config, address, Some(handler)).await
    }

    async fn start(
        config: TransportConfig,
        address: SocketAddr,
        message_handler: Option<Arc<dyn MessageHandler>>,
    ) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;

        let metrics = Arc::new(TransportMetrics::new());
        let registry = Arc::new(RemoteAddressRegistry::new());
        let (send_buffer, frames) = SendBuffer::new(
            config.send_buffer_capacity,
            config.max_message_size + LENGTH_FIELD_LENGTH,
        );
        let (channels, queues) = ChannelManager::new(
            Arc::clone(&registry),
            ChannelOptions::from(&config),
            None,
            config.receive_queue_capacity,
            Arc::clone(&metrics),
        );
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let output = ServerOutput {
            commands: commands_tx.clone(),
            send_buffer,
            metrics: Arc::clone(&metrics),
        };

        let conductor = ServerConductor {
            channels,
            queues,
            commands: commands_rx,
            frames,
            output: output.clone(),
            registry: Arc::clone(&registry),
            partitions: HashMap::new(),
            deferred: VecDeque::new(),
            next_request_id: 0,
            message_handler,
            metrics: Arc::clone(&metrics),
        };
        let stop_accepting = Arc::new(Notify::new());
        let tasks = vec![
            tokio::spawn(conductor.run()),
            tokio::spawn(accept_loop(
                listener,
                registry,
                commands_tx,
                Arc::clone(&stop_accepting),
            )),
        ];
        info!(%local_addr, "server transport listening");

        Ok(Self {
            local_addr,
            output,
            metrics,
            closed: AtomicBool::new(false),
            stop_accepting,
            tasks: Mutex::new(tasks),
        })
    }

    /// Address the server accepts connections on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Routes requests for `partition_id` to `handler`, replacing any
    /// previous handler.
    pub fn subscribe(&self, partition_id: PartitionId, handler: impl RequestHandler + 'static) {
        let _ = self.output.commands.send(ServerCommand::Subscribe {
            partition_id,
            handler: Arc::new(handler),
        });
    }

    /// Removes the handler of `partition_id`. Requests still awaiting a
    /// response are forgotten; their senders time out.
    pub fn unsubscribe(&self, partition_id: PartitionId) {
        let _ = self
            .output
            .commands
            .send(ServerCommand::Unsubscribe { partition_id });
    }

    /// Reply path usable from any task.
    pub fn output(&self) -> ServerOutput {
        self.output.clone()
    }

    /// Adds a listener for connection events.
    pub fn register_channel_listener(&self, listener: Arc<dyn ChannelListener>) {
        let _ = self
            .output
            .commands
            .send(ServerCommand::RegisterListener(listener));
    }

    /// Number of dispatched requests still awaiting a response.
    pub async fn pending_requests(&self) -> usize {
        let (reply, count) = oneshot::channel();
        if self
            .output
            .commands
            .send(ServerCommand::PendingRequests { reply })
            .is_err()
        {
            return 0;
        }
        count.await.unwrap_or(0)
    }

    /// Stops accepting, closes all channels and drops pending requests.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_accepting.notify_one();
        let (done, closed) = oneshot::channel();
        if self.output.commands.send(ServerCommand::Close { done }).is_ok() {
            let _ = closed.await;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            let _ = task.await;
        }
        info!(local_addr = %self.local_addr, "server transport closed");
    }

    /// Returns the transport counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl fmt::Debug for ServerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTransport")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Buf, BytesMut};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config() -> TransportConfig {
        TransportConfig {
            keep_alive_interval_ms: 0,
            ..Default::default()
        }
    }

    async fn server() -> ServerTransport {
        ServerTransport::bind(config(), SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap()
    }

    async fn send_request(stream: &mut TcpStream, request_id: u64, partition: u32, payload: &[u8]) {
        let mut frame = BytesMut::new();
        protocol::write_request_frame(&mut frame, request_id, PartitionId::new(partition), payload);
        stream.write_all(&frame).await.unwrap();
    }

    async fn read_frame(stream: &mut TcpStream) -> Message {
        let len = stream.read_u32().await.unwrap() as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        Message::decode(Bytes::from(body)).unwrap()
    }

    #[tokio::test]
    async fn test_response_carries_wire_request_id_and_partition() {
        let server = server().await;
        server.subscribe(
            PartitionId::new(3),
            respond_with(|request: &ServerRequest| {
                let mut reply = request.payload.to_vec();
                reply.reverse();
                Ok(Bytes::from(reply))
            }),
        );

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        send_request(&mut client, 77, 3, &[1, 2]).await;
        match read_frame(&mut client).await {
            Message::RequestResponse {
                request_id,
                partition_id,
                payload,
            } => {
                assert_eq!(request_id, 77);
                assert_eq!(partition_id, PartitionId::new(3));
                assert_eq!(payload.as_ref(), &[2, 1]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(server.metrics().responses_sent, 1);
        server.close().await;
    }

    #[tokio::test]
    async fn test_request_without_handler_is_dropped() {
        let server = server().await;
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        send_request(&mut client, 1, 9, b"nobody").await;

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(100), client.read(&mut buf)).await;
        assert!(read.is_err());
        server.close().await;
    }

    #[tokio::test]
    async fn test_handler_error_drops_request() {
        let server = server().await;
        server.subscribe(
            PartitionId::new(1),
            |_: &ServerRequest, _: &ServerOutput| -> std::result::Result<(), HandlerError> {
                Err(HandlerError::new("rejected"))
            },
        );
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        send_request(&mut client, 1, 1, b"x").await;

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(100), client.read(&mut buf)).await;
        assert!(read.is_err());
        assert_eq!(server.metrics().handler_errors, 1);
        server.close().await;
    }

    #[tokio::test]
    async fn test_deferred_response_from_another_task() {
        let server = server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.subscribe(
            PartitionId::new(2),
            move |request: &ServerRequest,
                  _: &ServerOutput|
                  -> std::result::Result<(), HandlerError> {
                let _ = tx.send(request.clone());
                Ok(())
            },
        );
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        send_request(&mut client, 5, 2, b"later").await;

        let request = rx.recv().await.unwrap();
        assert_eq!(server.pending_requests().await, 1);
        let output = server.output();
        tokio::spawn(async move {
            for payload in [&b"done"[..], b"twice"] {
                output.send_response(
                    request.partition_id,
                    request.request_id,
                    Bytes::from_static(payload),
                );
            }
        });

        match read_frame(&mut client).await {
            Message::RequestResponse { request_id, payload, .. } => {
                assert_eq!(request_id, 5);
                assert_eq!(payload.as_ref(), b"done");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(100), client.read(&mut buf)).await;
        assert!(read.is_err());
        assert_eq!(server.pending_requests().await, 0);
        server.close().await;
    }

    #[tokio::test]
    async fn test_panicking_handler_leaves_other_partitions_served() {
        let server = server().await;
        server.subscribe(
            PartitionId::new(1),
            |_: &ServerRequest, _: &ServerOutput| -> std::result::Result<(), HandlerError> {
                panic!("handler bug");
            },
        );
        server.subscribe(
            PartitionId::new(2),
            respond_with(|_: &ServerRequest| Ok(Bytes::from_static(b"alive"))),
        );
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        send_request(&mut client, 1, 1, b"boom").await;
        send_request(&mut client, 2, 2, b"next").await;

        match read_frame(&mut client).await {
            Message::RequestResponse { request_id, payload, .. } => {
                assert_eq!(request_id, 2);
                assert_eq!(payload.as_ref(), b"alive");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(server.metrics().handler_errors, 1);
        assert_eq!(server.pending_requests().await, 0);
        server.close().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_forgets_pending_requests() {
        let server = server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.subscribe(
            PartitionId::new(4),
            move |request: &ServerRequest,
                  _: &ServerOutput|
                  -> std::result::Result<(), HandlerError> {
                let _ = tx.send(request.clone());
                Ok(())
            },
        );
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        send_request(&mut client, 8, 4, b"pending").await;
        let request = rx.recv().await.unwrap();

        server.unsubscribe(PartitionId::new(4));
        server
            .output()
            .send_response(request.partition_id, request.request_id, Bytes::from_static(b"late"));

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(100), client.read(&mut buf)).await;
        assert!(read.is_err());
        server.close().await;
    }

    #[tokio::test]
    async fn test_server_pushes_single_message() {
        let server = server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.subscribe(
            PartitionId::new(1),
            move |request: &ServerRequest,
                  _: &ServerOutput|
                  -> std::result::Result<(), HandlerError> {
                let _ = tx.send(request.stream_id);
                Ok(())
            },
        );
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        send_request(&mut client, 1, 1, b"hello").await;
        let stream_id = rx.recv().await.unwrap();

        assert!(server.output().send_message(stream_id, b"push"));
        let len = client.read_u32().await.unwrap() as usize;
        let mut body = vec![0u8; len];
        client.read_exact(&mut body).await.unwrap();
        let mut body = &body[..];
        assert_eq!(body.get_u16(), protocol::ProtocolId::SingleMessage.as_u16());
        assert_eq!(body, b"push");
        server.close().await;
    }
}
