//! Client side of the transport.
//!
//! A [`ClientTransport`] owns one event loop task. The loop owns the
//! channels and the correlation table that maps outstanding request ids to
//! the requests waiting for them. Public methods never block: they enqueue
//! commands for the loop or claim send-buffer space directly. Each request
//! runs in its own task, see [`crate::request`].

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelOptions, InboundFrame};
use crate::conductor::{
    ChannelChange, ChannelListener, ChannelManager, ManagerQueues, MessageHandler,
};
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::metrics::{MetricsSnapshot, TransportMetrics};
use crate::protocol::{self, Message, LENGTH_FIELD_LENGTH};
use crate::registry::{RemoteAddressRegistry, RemoteEndpoint, StreamId};
use crate::request::{
    accept_all, fixed_target, AttemptSender, PendingRequest, RequestPool, RequestTiming,
    ResponseFuture, ResponseValidator, TargetResolver,
};
use crate::routing::{EndpointRegistry, NodeId, PartitionId, RequestTarget};
use crate::send_buffer::{ClaimError, SendBuffer, SendBufferReceiver};

type ResponseSender = oneshot::Sender<Result<Bytes>>;
type ResponseReceiver = oneshot::Receiver<Result<Bytes>>;

enum ClientCommand {
    Register {
        request_id: u64,
        endpoint: Arc<RemoteEndpoint>,
        reply: oneshot::Sender<Result<ResponseReceiver>>,
    },
    Unregister {
        request_id: u64,
    },
    Connect {
        endpoint: Arc<RemoteEndpoint>,
    },
    CloseChannel {
        stream_id: StreamId,
    },
    RegisterListener(Arc<dyn ChannelListener>),
    CloseAllChannels,
    PendingResponses {
        reply: oneshot::Sender<usize>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

struct Correlation {
    stream_id: StreamId,
    address: SocketAddr,
    reply: ResponseSender,
}

/// Event loop of a client transport.
struct ClientConductor {
    channels: ChannelManager,
    queues: ManagerQueues,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    frames: SendBufferReceiver,
    send_buffer: SendBuffer,
    correlations: HashMap<u64, Correlation>,
    message_handler: Option<Arc<dyn MessageHandler>>,
    metrics: Arc<TransportMetrics>,
}

impl ClientConductor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(ClientCommand::Close { done }) => {
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
                        self.fail_stream(stream_id);
                    }
                }
                Some(frame) = self.frames.next() => {
                    self.channels.forward(frame);
                }
                Some(inbound) = self.queues.inbound.recv() => self.on_inbound(inbound),
            }
        }
    }

    fn on_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Register {
                request_id,
                endpoint,
                reply,
            } => {
                if !self.channels.is_connected(endpoint.stream_id()) {
                    self.channels.connect(&endpoint);
                    let _ = reply.send(Err(TransportError::NotConnected {
                        addr: endpoint.address(),
                    }));
                    return;
                }
                let (tx, rx) = oneshot::channel();
                self.correlations.insert(
                    request_id,
                    Correlation {
                        stream_id: endpoint.stream_id(),
                        address: endpoint.address(),
                        reply: tx,
                    },
                );
                let _ = reply.send(Ok(rx));
            }
            ClientCommand::Unregister { request_id } => {
                self.correlations.remove(&request_id);
            }
            ClientCommand::Connect { endpoint } => self.channels.connect(&endpoint),
            ClientCommand::CloseChannel { stream_id } => self.channels.close_channel(stream_id),
            ClientCommand::RegisterListener(listener) => self.channels.register_listener(listener),
            ClientCommand::CloseAllChannels => self.channels.close_all(),
            ClientCommand::PendingResponses { reply } => {
                let _ = reply.send(self.correlations.len());
            }
            ClientCommand::Close { .. } => {}
        }
    }

    fn on_inbound(&mut self, inbound: InboundFrame) {
        match Message::decode(inbound.frame) {
            Ok(Message::RequestResponse {
                request_id,
                payload,
                ..
            }) => {
                let waiting = self
                    .correlations
                    .get(&request_id)
                    .is_some_and(|c| c.stream_id == inbound.stream_id);
                match waiting.then(|| self.correlations.remove(&request_id)).flatten() {
                    Some(correlation) => {
                        let _ = correlation.reply.send(Ok(payload));
                    }
                    None => {
                        self.metrics.late_responses.inc();
                        trace!(request_id, stream_id = inbound.stream_id, "response without waiting request dropped");
                    }
                }
            }
            Ok(Message::Single { payload }) => match &self.message_handler {
                Some(handler) => handler.on_message(inbound.stream_id, payload),
                None => trace!(stream_id = inbound.stream_id, "single message without handler dropped"),
            },
            Ok(Message::Control(_)) | Ok(Message::Unknown(_)) => {}
            Err(e) => warn!(stream_id = inbound.stream_id, error = %e, "undecodable inbound frame dropped"),
        }
    }

    fn fail_stream(&mut self, stream_id: StreamId) {
        let failed: Vec<u64> = self
            .correlations
            .iter()
            .filter(|(_, c)| c.stream_id == stream_id)
            .map(|(id, _)| *id)
            .collect();
        for request_id in failed {
            if let Some(correlation) = self.correlations.remove(&request_id) {
                let _ = correlation.reply.send(Err(TransportError::ChannelClosed {
                    addr: correlation.address,
                }));
            }
        }
    }

    async fn shutdown(&mut self) {
        for (_, correlation) in self.correlations.drain() {
            let _ = correlation.reply.send(Err(TransportError::TransportClosed));
        }
        self.send_buffer.close();
        while let Some(frame) = self.frames.try_next() {
            drop(frame);
        }
        self.channels.shutdown().await;
        debug!("client conductor stopped");
    }
}

struct ClientInner {
    config: TransportConfig,
    commands: mpsc::UnboundedSender<ClientCommand>,
    send_buffer: SendBuffer,
    routing: EndpointRegistry,
    pool: RequestPool,
    metrics: Arc<TransportMetrics>,
    closed: AtomicBool,
}

impl ClientInner {
    fn command(&self, command: ClientCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::TransportClosed)
    }

    async fn write_request(
        &self,
        request_id: u64,
        partition_id: PartitionId,
        stream_id: StreamId,
        payload: &[u8],
    ) -> Result<()> {
        let length = protocol::request_frame_length(payload.len());
        loop {
            match self.send_buffer.claim(length, stream_id) {
                Ok(mut claim) => {
                    protocol::write_request_frame(
                        &mut claim.region(),
                        request_id,
                        partition_id,
                        payload,
                    );
                    return Ok(claim.commit()?);
                }
                Err(ClaimError::InsufficientCapacity { .. }) => {
                    self.metrics.backpressure_events.inc();
                    self.send_buffer.wait_for_capacity(length).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Unregisters a correlation entry unless disarmed.
struct Registration<'a> {
    commands: &'a mpsc::UnboundedSender<ClientCommand>,
    request_id: u64,
    armed: bool,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.commands.send(ClientCommand::Unregister {
                request_id: self.request_id,
            });
        }
    }
}

#[async_trait]
impl AttemptSender for ClientInner {
    fn resolve(&self, node_id: NodeId) -> Option<SocketAddr> {
        self.routing.get_endpoint(node_id).map(|e| e.address())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn send_attempt(
        &self,
        request_id: u64,
        target: RequestTarget,
        address: SocketAddr,
        payload: &Bytes,
    ) -> Result<Bytes> {
        let endpoint = self
            .routing
            .get_endpoint(target.node_id)
            .ok_or(TransportError::NotConnected { addr: address })?;

        let (reply, registered) = oneshot::channel();
        self.command(ClientCommand::Register {
            request_id,
            endpoint: Arc::clone(&endpoint),
            reply,
        })?;
        let response = registered
            .await
            .map_err(|_| TransportError::TransportClosed)??;
        let mut registration = Registration {
            commands: &self.commands,
            request_id,
            armed: true,
        };

        self.write_request(request_id, target.partition_id, endpoint.stream_id(), payload)
            .await?;
        let result = response.await.map_err(|_| TransportError::TransportClosed)?;
        registration.armed = false;
        result
    }
}

/// Sends requests and messages to remote nodes.
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct ClientTransport {
    inner: Arc<ClientInner>,
    conductor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ClientTransport {
    /// Starts a client transport.
    pub fn new(config: TransportConfig) -> Result<Self> {
        Self::start(config, None)
    }

    /// Starts a client transport that hands inbound single messages to
    /// `handler`.
    pub fn with_message_handler(
        config: TransportConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        Self::start(config, Some(handler))
    }

    fn start(
        config: TransportConfig,
        message_handler: Option<Arc<dyn MessageHandler>>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(TransportMetrics::new());
        let registry = Arc::new(RemoteAddressRegistry::new());
        let (send_buffer, frames) = SendBuffer::new(
            config.send_buffer_capacity,
            config.max_message_size + LENGTH_FIELD_LENGTH,
        );
        let (channels, queues) = ChannelManager::new(
            Arc::clone(&registry),
            ChannelOptions::from(&config),
            Some(config.reconnect_delay()),
            config.receive_queue_capacity,
            Arc::clone(&metrics),
        );
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let conductor = ClientConductor {
            channels,
            queues,
            commands: commands_rx,
            frames,
            send_buffer: send_buffer.clone(),
            correlations: HashMap::new(),
            message_handler,
            metrics: Arc::clone(&metrics),
        };
        let handle = tokio::spawn(conductor.run());
        info!(
            request_pool_size = config.request_pool_size,
            send_buffer_capacity = config.send_buffer_capacity,
            "client transport started"
        );

        let inner = ClientInner {
            pool: RequestPool::new(config.request_pool_size),
            routing: EndpointRegistry::new(registry),
            config,
            commands: commands_tx,
            send_buffer,
            metrics,
            closed: AtomicBool::new(false),
        };
        Ok(Self {
            inner: Arc::new(inner),
            conductor: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Sends a request, retrying against the targets `resolver` returns
    /// until `validator` accepts a response or `timeout` passes.
    pub fn send_request_with_retry(
        &self,
        resolver: TargetResolver,
        validator: ResponseValidator,
        payload: Bytes,
        timeout: Duration,
    ) -> ResponseFuture {
        if self.inner.closed.load(Ordering::Acquire) {
            return ResponseFuture::ready(Err(TransportError::TransportClosed));
        }
        let slot = match self.inner.pool.acquire() {
            Ok(slot) => slot,
            Err(e) => return ResponseFuture::ready(Err(e)),
        };
        self.inner.metrics.requests_submitted.inc();
        let timing = RequestTiming {
            timeout,
            retry_delay: self.inner.config.retry_delay(),
        };
        let request = PendingRequest::new(slot, resolver, validator, payload, timing);
        trace!(request_id = request.request_id(), ?timeout, "request submitted");

        let inner = Arc::clone(&self.inner);
        ResponseFuture::spawned(tokio::spawn(async move {
            request.run(inner.as_ref(), &inner.metrics).await
        }))
    }

    /// Sends a request to one partition of one node, accepting the first
    /// response.
    pub fn send_request(
        &self,
        node_id: NodeId,
        partition_id: PartitionId,
        payload: Bytes,
        timeout: Duration,
    ) -> ResponseFuture {
        self.send_request_with_retry(
            fixed_target(RequestTarget::new(node_id, partition_id)),
            accept_all(),
            payload,
            timeout,
        )
    }

    /// Sends a request with the configured default timeout.
    pub fn send_request_default(
        &self,
        node_id: NodeId,
        partition_id: PartitionId,
        payload: Bytes,
    ) -> ResponseFuture {
        let timeout = self.inner.config.default_request_timeout();
        self.send_request(node_id, partition_id, payload, timeout)
    }

    /// Sends a fire-and-forget message. Returns false if the node is unknown
    /// or the message could not be buffered.
    pub fn send_message(&self, node_id: NodeId, payload: &[u8]) -> bool {
        let Some(endpoint) = self.inner.routing.get_endpoint(node_id) else {
            return false;
        };
        let length = protocol::message_frame_length(payload.len());
        match self.inner.send_buffer.claim(length, endpoint.stream_id()) {
            Ok(mut claim) => {
                protocol::write_message_frame(&mut claim.region(), payload);
                claim.commit().is_ok()
            }
            Err(e) => {
                if e.is_transient() {
                    self.inner.metrics.backpressure_events.inc();
                }
                trace!(%node_id, error = %e, "message not sent");
                false
            }
        }
    }

    /// Maps `node_id` to `address` and opens a channel to it.
    pub fn set_endpoint(&self, node_id: NodeId, address: SocketAddr) {
        let endpoint = self.inner.routing.set_endpoint(node_id, address);
        let _ = self.inner.command(ClientCommand::Connect { endpoint });
    }

    /// Removes the mapping of `node_id`. Its endpoint is deactivated; an
    /// existing channel stays open but is not reopened once it closes.
    pub fn remove_endpoint(&self, node_id: NodeId) {
        self.inner.routing.remove_endpoint(node_id);
    }

    /// Removes the mapping of `node_id`, retires its endpoint and closes its
    /// channel.
    pub fn retire_endpoint(&self, node_id: NodeId) {
        if let Some(endpoint) = self.inner.routing.retire(node_id) {
            let _ = self.inner.command(ClientCommand::CloseChannel {
                stream_id: endpoint.stream_id(),
            });
        }
    }

    /// Returns the endpoint `node_id` maps to.
    pub fn endpoint(&self, node_id: NodeId) -> Option<Arc<RemoteEndpoint>> {
        self.inner.routing.get_endpoint(node_id)
    }

    /// Adds a listener for channel open and close events.
    pub fn register_channel_listener(&self, listener: Arc<dyn ChannelListener>) {
        let _ = self
            .inner
            .command(ClientCommand::RegisterListener(listener));
    }

    /// Closes every open channel. Channels to active endpoints are reopened.
    pub fn close_all_channels(&self) {
        let _ = self.inner.command(ClientCommand::CloseAllChannels);
    }

    /// Stops the transport: outstanding requests fail with
    /// [`TransportError::TransportClosed`], the send buffer and all channels
    /// are closed.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (done, closed) = oneshot::channel();
        if self.inner.command(ClientCommand::Close { done }).is_ok() {
            let _ = closed.await;
        }
        let handle = self
            .conductor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("client transport closed");
    }

    /// Returns the transport counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Number of requests submitted and not yet finished.
    pub fn outstanding_requests(&self) -> usize {
        self.inner.pool.in_use()
    }

    /// Number of requests on the wire that still wait for a response.
    pub async fn pending_responses(&self) -> usize {
        let (reply, count) = oneshot::channel();
        if self.inner.command(ClientCommand::PendingResponses { reply }).is_err() {
            return 0;
        }
        count.await.unwrap_or(0)
    }

    /// Returns the configuration the transport runs with.
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }
}

impl fmt::Debug for ClientTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTransport")
            .field("routing", &self.inner.routing)
            .field("pool", &self.inner.pool)
            .field("send_buffer", &self.inner.send_buffer)
            .finish()
    }
}
