//! Request/response over an injected messaging service.
//!
//! Some deployments already run a pub/sub capable cluster messaging layer.
//! [`MessagingClient`] and [`MessagingServer`] keep the request contract of
//! the socket transport (request pool, retry, deadline, response validation,
//! attempt history, at-most-once responses) but hand delivery to a
//! [`MessagingService`]. Partition handlers are registered under the topic
//! [`topic_name`](crate::protocol::topic_name) derives from the partition id.
//!
//! [`LocalMessagingNetwork`] is an in-process service for tests and
//! single-process clusters.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::error::{HandlerError, Result, TransportError};
use crate::metrics::{MetricsSnapshot, TransportMetrics};
use crate::protocol::topic_name;
use crate::registry::RemoteAddressRegistry;
use crate::request::{
    accept_all, fixed_target, AttemptSender, PendingRequest, RequestPool, RequestTiming,
    ResponseFuture, ResponseValidator, TargetResolver,
};
use crate::routing::{EndpointRegistry, NodeId, PartitionId, RequestTarget};

/// Serves the requests published on one topic.
#[async_trait]
pub trait TopicHandler: Send + Sync {
    /// Handles a request from `sender` and returns the reply payload.
    async fn handle(&self, sender: SocketAddr, payload: Bytes) -> Result<Bytes>;
}

/// A cluster messaging layer able to deliver a request to a topic on a
/// remote member and return its reply.
#[async_trait]
pub trait MessagingService: Send + Sync {
    /// Sends `payload` to `topic` on the member at `address` and waits at
    /// most `timeout` for the reply.
    ///
    /// Fails with [`TransportError::NotConnected`] if no member listens on
    /// `address` and with [`TransportError::NoRemoteHandler`] if the member
    /// has no handler for `topic`.
    async fn send_and_receive(
        &self,
        address: SocketAddr,
        topic: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes>;

    /// Installs the handler of `topic`, replacing any previous one.
    fn register_handler(&self, topic: &str, handler: Arc<dyn TopicHandler>);

    /// Removes the handler of `topic`.
    fn unregister_handler(&self, topic: &str);

    /// Address of the local member.
    fn address(&self) -> SocketAddr;
}

#[derive(Default)]
struct LocalMember {
    handlers: Mutex<HashMap<String, Arc<dyn TopicHandler>>>,
}

/// In-process messaging network. Members join with an address and reach
/// each other through it.
#[derive(Clone, Default)]
pub struct LocalMessagingNetwork {
    members: Arc<Mutex<HashMap<SocketAddr, Arc<LocalMember>>>>,
}

impl LocalMessagingNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a member at `address`, or returns a service for the member
    /// already there.
    pub fn join(&self, address: SocketAddr) -> Arc<LocalMessagingService> {
        let member = Arc::clone(
            self.members
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .entry(address)
                .or_default(),
        );
        debug!(%address, "member joined local messaging network");
        Arc::new(LocalMessagingService {
            address,
            member,
            network: self.clone(),
        })
    }

    /// Removes the member at `address`. Requests to it fail with
    /// [`TransportError::NotConnected`].
    pub fn leave(&self, address: SocketAddr) {
        if self
            .members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&address)
            .is_some()
        {
            debug!(%address, "member left local messaging network");
        }
    }

    fn member(&self, address: SocketAddr) -> Option<Arc<LocalMember>> {
        self.members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&address)
            .cloned()
    }
}

impl fmt::Debug for LocalMessagingNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("LocalMessagingNetwork")
            .field("members", &members.len())
            .finish()
    }
}

/// One member of a [`LocalMessagingNetwork`].
pub struct LocalMessagingService {
    address: SocketAddr,
    member: Arc<LocalMember>,
    network: LocalMessagingNetwork,
}

#[async_trait]
impl MessagingService for LocalMessagingService {
    async fn send_and_receive(
        &self,
        address: SocketAddr,
        topic: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes> {
        let member = self
            .network
            .member(address)
            .ok_or(TransportError::NotConnected { addr: address })?;
        let handler = member
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .cloned()
            .ok_or_else(|| TransportError::NoRemoteHandler {
                topic: topic.to_string(),
            })?;

        match tokio::time::timeout(timeout, handler.handle(self.address, payload)).await {
            Ok(reply) => reply,
            Err(_) => Err(TransportError::Messaging {
                reason: format!("no reply on {topic} from {address} within {timeout:?}"),
            }),
        }
    }

    fn register_handler(&self, topic: &str, handler: Arc<dyn TopicHandler>) {
        self.member
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic.to_string(), handler);
    }

    fn unregister_handler(&self, topic: &str) {
        self.member
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(topic);
    }

    fn address(&self) -> SocketAddr {
        self.address
    }
}

impl fmt::Debug for LocalMessagingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMessagingService")
            .field("address", &self.address)
            .finish()
    }
}

struct MessagingClientInner {
    config: TransportConfig,
    service: Arc<dyn MessagingService>,
    routing: EndpointRegistry,
    pool: RequestPool,
    metrics: Arc<TransportMetrics>,
    closed: AtomicBool,
    shutdown: Notify,
}

#[async_trait]
impl AttemptSender for MessagingClientInner {
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
        let shutdown = self.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        if self.is_closed() {
            return Err(TransportError::TransportClosed);
        }

        let topic = topic_name(target.partition_id);
        trace!(request_id, %address, topic = %topic, "sending request through messaging service");
        let timeout = self.config.default_request_timeout();
        tokio::select! {
            reply = self.service.send_and_receive(address, &topic, payload.clone(), timeout) => {
                reply
            }
            _ = shutdown => Err(TransportError::TransportClosed),
        }
    }
}

/// Client half of the messaging variant.
#[derive(Clone)]
pub struct MessagingClient {
    inner: Arc<MessagingClientInner>,
}

impl MessagingClient {
    /// Creates a client sending through `service`.
    pub fn new(config: TransportConfig, service: Arc<dyn MessagingService>) -> Result<Self> {
        config.validate()?;
        info!(
            address = %service.address(),
            request_pool_size = config.request_pool_size,
            "messaging client started"
        );
        let inner = MessagingClientInner {
            pool: RequestPool::new(config.request_pool_size),
            routing: EndpointRegistry::new(Arc::new(RemoteAddressRegistry::new())),
            config,
            service,
            metrics: Arc::new(TransportMetrics::new()),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Sends a request, retrying against the targets `resolver` returns
    /// until `validator` accepts a reply or `timeout` passes.
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
        let max_size = self.inner.config.max_message_size;
        if payload.len() > max_size {
            return ResponseFuture::ready(Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max_size,
            }));
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

        let inner = Arc::clone(&self.inner);
        ResponseFuture::spawned(tokio::spawn(async move {
            request.run(inner.as_ref(), &inner.metrics).await
        }))
    }

    /// Sends a request to one partition of one node, accepting the first
    /// reply.
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

    /// Maps `node_id` to the messaging address of its member.
    pub fn set_endpoint(&self, node_id: NodeId, address: SocketAddr) {
        self.inner.routing.set_endpoint(node_id, address);
    }

    /// Forgets the address of `node_id`.
    pub fn remove_endpoint(&self, node_id: NodeId) {
        self.inner.routing.remove_endpoint(node_id);
    }

    /// Fails outstanding requests with [`TransportError::TransportClosed`].
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.shutdown.notify_waiters();
            info!(address = %self.inner.service.address(), "messaging client closed");
        }
    }

    /// Returns the client counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

impl fmt::Debug for MessagingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagingClient")
            .field("address", &self.inner.service.address())
            .field("pool", &self.inner.pool)
            .finish()
    }
}

/// A request handed to a [`MessagingRequestHandler`].
#[derive(Debug, Clone)]
pub struct MessagingRequest {
    /// Partition the request is addressed to.
    pub partition_id: PartitionId,
    /// Server-local id; pass it to [`MessagingOutput::send_response`].
    pub request_id: u64,
    /// Messaging address of the sender.
    pub remote: SocketAddr,
    /// Request payload.
    pub payload: Bytes,
}

/// Handles the requests of one partition of a [`MessagingServer`].
///
/// Handlers run on the server's event loop. An error, or a panic, is
/// returned to the sender and fails its request.
pub trait MessagingRequestHandler: Send + Sync {
    /// Handles `request`.
    fn on_request(
        &self,
        request: &MessagingRequest,
        output: &MessagingOutput,
    ) -> std::result::Result<(), HandlerError>;
}

impl<F> MessagingRequestHandler for F
where
    F: Fn(&MessagingRequest, &MessagingOutput) -> std::result::Result<(), HandlerError>
        + Send
        + Sync,
{
    fn on_request(
        &self,
        request: &MessagingRequest,
        output: &MessagingOutput,
    ) -> std::result::Result<(), HandlerError> {
        self(request, output)
    }
}

struct PartitionRequests {
    handler: Arc<dyn MessagingRequestHandler>,
    pending: HashMap<u64, oneshot::Sender<Bytes>>,
}

type Dispatched = oneshot::Sender<Result<oneshot::Receiver<Bytes>>>;

enum MessagingCommand {
    Subscribe {
        partition_id: PartitionId,
        handler: Arc<dyn MessagingRequestHandler>,
    },
    Unsubscribe {
        partition_id: PartitionId,
    },
    Dispatch {
        partition_id: PartitionId,
        remote: SocketAddr,
        payload: Bytes,
        dispatched: Dispatched,
    },
    SendResponse {
        partition_id: PartitionId,
        request_id: u64,
        payload: Bytes,
    },
    PendingRequests {
        reply: oneshot::Sender<usize>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Event loop of a messaging server. Owns the partition table.
struct MessagingConductor {
    service: Arc<dyn MessagingService>,
    commands: mpsc::UnboundedReceiver<MessagingCommand>,
    output: MessagingOutput,
    partitions: HashMap<PartitionId, PartitionRequests>,
    next_request_id: u64,
    metrics: Arc<TransportMetrics>,
}

impl MessagingConductor {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            if let MessagingCommand::Close { done } = command {
                self.shutdown();
                let _ = done.send(());
                return;
            }
            self.on_command(command);
        }
        self.shutdown();
    }

    fn on_command(&mut self, command: MessagingCommand) {
        match command {
            MessagingCommand::Subscribe {
                partition_id,
                handler,
            } => {
                debug!(%partition_id, "partition subscribed");
                self.partitions.insert(
                    partition_id,
                    PartitionRequests {
                        handler,
                        pending: HashMap::new(),
                    },
                );
            }
            MessagingCommand::Unsubscribe { partition_id } => {
                if let Some(partition) = self.partitions.remove(&partition_id) {
                    debug!(%partition_id, dropped = partition.pending.len(), "partition unsubscribed");
                }
            }
            MessagingCommand::Dispatch {
                partition_id,
                remote,
                payload,
                dispatched,
            } => {
                let _ = dispatched.send(self.dispatch(partition_id, remote, payload));
            }
            MessagingCommand::SendResponse {
                partition_id,
                request_id,
                payload,
            } => {
                let reply = self
                    .partitions
                    .get_mut(&partition_id)
                    .and_then(|p| p.pending.remove(&request_id));
                match reply {
                    Some(reply) => {
                        if reply.send(payload).is_ok() {
                            self.metrics.responses_sent.inc();
                        } else {
                            trace!(%partition_id, request_id, "sender gave up before response");
                        }
                    }
                    None => trace!(%partition_id, request_id, "no pending request for response"),
                }
            }
            MessagingCommand::PendingRequests { reply } => {
                let _ = reply.send(self.partitions.values().map(|p| p.pending.len()).sum());
            }
            MessagingCommand::Close { .. } => {}
        }
    }

    fn dispatch(
        &mut self,
        partition_id: PartitionId,
        remote: SocketAddr,
        payload: Bytes,
    ) -> Result<oneshot::Receiver<Bytes>> {
        let Some(partition) = self.partitions.get_mut(&partition_id) else {
            return Err(TransportError::NoRemoteHandler {
                topic: topic_name(partition_id),
            });
        };
        let request = MessagingRequest {
            partition_id,
            request_id: self.next_request_id,
            remote,
            payload,
        };
        self.next_request_id += 1;
        self.metrics.requests_dispatched.inc();

        // An inline reply is queued behind this dispatch, so the pending
        // entry exists by the time it is handled.
        let output = &self.output;
        let handler = &partition.handler;
        let handled =
            panic::catch_unwind(AssertUnwindSafe(|| handler.on_request(&request, output)));
        let error = match handled {
            Ok(Ok(())) => {
                let (reply, response) = oneshot::channel();
                partition.pending.insert(request.request_id, reply);
                return Ok(response);
            }
            Ok(Err(e)) => {
                warn!(%partition_id, request_id = request.request_id, error = %e, "request handler failed");
                e
            }
            Err(_) => {
                warn!(%partition_id, request_id = request.request_id, "request handler panicked");
                HandlerError::new("request handler panicked")
            }
        };
        self.metrics.handler_errors.inc();
        Err(error.into())
    }

    fn shutdown(&mut self) {
        for (partition_id, partition) in self.partitions.drain() {
            self.service.unregister_handler(&topic_name(partition_id));
            if !partition.pending.is_empty() {
                debug!(%partition_id, dropped = partition.pending.len(), "pending requests dropped");
            }
        }
        debug!(address = %self.service.address(), "messaging conductor stopped");
    }
}

/// Reply path of a [`MessagingServer`].
#[derive(Clone)]
pub struct MessagingOutput {
    commands: mpsc::UnboundedSender<MessagingCommand>,
}

impl MessagingOutput {
    /// Replies to a dispatched request.
    ///
    /// At most one response is delivered per request; responses to unknown
    /// or already answered requests are ignored. Returns false if the server
    /// is closed.
    pub fn send_response(
        &self,
        partition_id: PartitionId,
        request_id: u64,
        payload: Bytes,
    ) -> bool {
        self.commands
            .send(MessagingCommand::SendResponse {
                partition_id,
                request_id,
                payload,
            })
            .is_ok()
    }
}

impl fmt::Debug for MessagingOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagingOutput")
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

struct PartitionTopic {
    partition_id: PartitionId,
    commands: mpsc::UnboundedSender<MessagingCommand>,
}

impl PartitionTopic {
    fn no_handler(&self) -> TransportError {
        TransportError::NoRemoteHandler {
            topic: topic_name(self.partition_id),
        }
    }
}

#[async_trait]
impl TopicHandler for PartitionTopic {
    async fn handle(&self, sender: SocketAddr, payload: Bytes) -> Result<Bytes> {
        let (dispatched, registered) = oneshot::channel();
        self.commands
            .send(MessagingCommand::Dispatch {
                partition_id: self.partition_id,
                remote: sender,
                payload,
                dispatched,
            })
            .map_err(|_| self.no_handler())?;
        let response = registered.await.map_err(|_| self.no_handler())??;
        response.await.map_err(|_| self.no_handler())
    }
}

/// Server half of the messaging variant.
///
/// Must be created inside a tokio runtime.
pub struct MessagingServer {
    service: Arc<dyn MessagingService>,
    output: MessagingOutput,
    metrics: Arc<TransportMetrics>,
    conductor: Mutex<Option<JoinHandle<()>>>,
}

impl MessagingServer {
    /// Creates a server receiving through `service`.
    pub fn new(service: Arc<dyn MessagingService>) -> Self {
        let metrics = Arc::new(TransportMetrics::new());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let output = MessagingOutput {
            commands: commands_tx,
        };
        let conductor = MessagingConductor {
            service: Arc::clone(&service),
            commands: commands_rx,
            output: output.clone(),
            partitions: HashMap::new(),
            next_request_id: 0,
            metrics: Arc::clone(&metrics),
        };
        let handle = tokio::spawn(conductor.run());
        info!(address = %service.address(), "messaging server started");
        Self {
            service,
            output,
            metrics,
            conductor: Mutex::new(Some(handle)),
        }
    }

    /// Routes requests for `partition_id` to `handler`.
    pub fn subscribe(
        &self,
        partition_id: PartitionId,
        handler: impl MessagingRequestHandler + 'static,
    ) {
        let subscribed = self.output.commands.send(MessagingCommand::Subscribe {
            partition_id,
            handler: Arc::new(handler),
        });
        if subscribed.is_err() {
            return;
        }
        self.service.register_handler(
            &topic_name(partition_id),
            Arc::new(PartitionTopic {
                partition_id,
                commands: self.output.commands.clone(),
            }),
        );
    }

    /// Removes the handler of `partition_id` and drops its pending
    /// requests.
    pub fn unsubscribe(&self, partition_id: PartitionId) {
        self.service.unregister_handler(&topic_name(partition_id));
        let _ = self
            .output
            .commands
            .send(MessagingCommand::Unsubscribe { partition_id });
    }

    /// Reply path usable from any task.
    pub fn output(&self) -> MessagingOutput {
        self.output.clone()
    }

    /// Replies to a dispatched request.
    pub fn send_response(
        &self,
        partition_id: PartitionId,
        request_id: u64,
        payload: Bytes,
    ) -> bool {
        self.output.send_response(partition_id, request_id, payload)
    }

    /// Number of dispatched requests still awaiting a response.
    pub async fn pending_requests(&self) -> usize {
        let (reply, count) = oneshot::channel();
        let asked = self
            .output
            .commands
            .send(MessagingCommand::PendingRequests { reply });
        if asked.is_err() {
            return 0;
        }
        count.await.unwrap_or(0)
    }

    /// Unregisters every partition topic and drops pending requests.
    pub async fn close(&self) {
        let (done, closed) = oneshot::channel();
        if self.output.commands.send(MessagingCommand::Close { done }).is_ok() {
            let _ = closed.await;
        }
        let handle = self
            .conductor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
            info!(address = %self.service.address(), "messaging server closed");
        }
    }

    /// Returns the server counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl fmt::Debug for MessagingServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagingServer")
            .field("address", &self.service.address())
            .finish()
    }
}
