//! Channel management shared by the client and server event loops.
//!
//! The [`ChannelManager`] is owned by an event loop task. It opens, adopts
//! and closes channels, routes committed frames to them, reconnects channels
//! of active endpoints, and fans lifecycle events out to user listeners.
//! Channel tasks report back through an event queue so all bookkeeping
//! happens on the owning task.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::channel::{
    ChannelHandle, ChannelLifecycleListener, ChannelOptions, InboundFrame, TransportChannel,
};
use crate::metrics::TransportMetrics;
use crate::registry::{RemoteAddressRegistry, RemoteEndpoint, StreamId};
use crate::send_buffer::CommittedFrame;

/// Observer of connections opened and closed by a transport.
pub trait ChannelListener: Send + Sync {
    /// A channel to `endpoint` finished connecting.
    fn on_connection_established(&self, endpoint: &RemoteEndpoint) {
        let _ = endpoint;
    }

    /// A connected channel to `endpoint` closed.
    fn on_connection_closed(&self, endpoint: &RemoteEndpoint) {
        let _ = endpoint;
    }
}

/// Receiver of fire-and-forget messages.
pub trait MessageHandler: Send + Sync {
    /// Handles a single message that arrived on `stream_id`.
    fn on_message(&self, stream_id: StreamId, payload: Bytes);
}

impl<F> MessageHandler for F
where
    F: Fn(StreamId, Bytes) + Send + Sync,
{
    fn on_message(&self, stream_id: StreamId, payload: Bytes) {
        self(stream_id, payload)
    }
}

/// Lifecycle event posted by channel tasks and reconnect timers.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A channel connected.
    Connected {
        /// Channel that connected.
        channel_id: u64,
        /// Its endpoint.
        endpoint: Arc<RemoteEndpoint>,
    },
    /// A channel closed.
    Closed {
        /// Channel that closed.
        channel_id: u64,
        /// Its endpoint.
        endpoint: Arc<RemoteEndpoint>,
        /// Whether the channel had connected before closing.
        was_connected: bool,
    },
    /// The reconnect delay for an endpoint elapsed.
    Reconnect {
        /// Endpoint to reconnect.
        endpoint: Arc<RemoteEndpoint>,
    },
}

struct EventForwarder(mpsc::UnboundedSender<ChannelEvent>);

impl ChannelLifecycleListener for EventForwarder {
    fn on_channel_connected(&self, channel_id: u64, endpoint: &Arc<RemoteEndpoint>) {
        let _ = self.0.send(ChannelEvent::Connected {
            channel_id,
            endpoint: Arc::clone(endpoint),
        });
    }

    fn on_channel_closed(
        &self,
        channel_id: u64,
        endpoint: &Arc<RemoteEndpoint>,
        was_connected: bool,
    ) {
        let _ = self.0.send(ChannelEvent::Closed {
            channel_id,
            endpoint: Arc::clone(endpoint),
            was_connected,
        });
    }
}

/// What the owning event loop must do after a channel event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelChange {
    /// Nothing; the event was stale or informational.
    None,
    /// The channel carrying `stream_id` connected.
    Opened(StreamId),
    /// The channel carrying `stream_id` closed; requests awaiting a reply on
    /// it must be failed.
    Closed(StreamId),
}

/// Queues an event loop selects on.
#[derive(Debug)]
pub struct ManagerQueues {
    /// Frames read by channel tasks.
    pub inbound: mpsc::Receiver<InboundFrame>,
    /// Lifecycle events.
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

struct ManagedChannel {
    handle: ChannelHandle,
    task: JoinHandle<()>,
}

/// Owns the channels of one transport.
pub struct ChannelManager {
    registry: Arc<RemoteAddressRegistry>,
    options: ChannelOptions,
    reconnect_delay: Option<Duration>,
    metrics: Arc<TransportMetrics>,
    forwarder: Arc<EventForwarder>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    inbound: mpsc::Sender<InboundFrame>,
    channels: HashMap<StreamId, ManagedChannel>,
    listeners: Vec<Arc<dyn ChannelListener>>,
    closing: bool,
}

impl ChannelManager {
    /// Creates a manager. Channels of active endpoints are reopened after
    /// `reconnect_delay`; `None` disables reconnects (server side).
    pub fn new(
        registry: Arc<RemoteAddressRegistry>,
        options: ChannelOptions,
        reconnect_delay: Option<Duration>,
        receive_queue_capacity: usize,
        metrics: Arc<TransportMetrics>,
    ) -> (ChannelManager, ManagerQueues) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(receive_queue_capacity);
        let manager = ChannelManager {
            registry,
            options,
            reconnect_delay,
            metrics,
            forwarder: Arc::new(EventForwarder(events_tx.clone())),
            events: events_tx,
            inbound: inbound_tx,
            channels: HashMap::new(),
            listeners: Vec::new(),
            closing: false,
        };
        let queues = ManagerQueues {
            inbound: inbound_rx,
            events: events_rx,
        };
        (manager, queues)
    }

    /// Adds a user listener.
    pub fn register_listener(&mut self, listener: Arc<dyn ChannelListener>) {
        self.listeners.push(listener);
    }

    /// Opens a channel to `endpoint` unless one exists or the endpoint is not
    /// active.
    pub fn connect(&mut self, endpoint: &Arc<RemoteEndpoint>) {
        if self.closing || !endpoint.is_active() {
            return;
        }
        if self.channels.contains_key(&endpoint.stream_id()) {
            return;
        }
        let (channel, handle) = TransportChannel::new(
            Arc::clone(endpoint),
            self.options.clone(),
            self.forwarder.clone(),
            Arc::clone(&self.metrics),
        );
        debug!(channel_id = handle.channel_id(), stream_id = endpoint.stream_id(), addr = %endpoint.address(), "opening channel");
        let task = channel.spawn(self.inbound.clone());
        self.channels
            .insert(endpoint.stream_id(), ManagedChannel { handle, task });
    }

    /// Takes over a socket accepted from `endpoint`.
    pub fn adopt(&mut self, stream: TcpStream, endpoint: &Arc<RemoteEndpoint>) {
        if self.closing {
            return;
        }
        let (channel, handle) = TransportChannel::accepted(
            stream,
            Arc::clone(endpoint),
            self.options.clone(),
            self.forwarder.clone(),
            Arc::clone(&self.metrics),
        );
        let task = channel.spawn(self.inbound.clone());
        if let Some(previous) = self
            .channels
            .insert(endpoint.stream_id(), ManagedChannel { handle, task })
        {
            previous.handle.close();
        }
    }

    /// Returns true if a connected channel carries `stream_id`.
    pub fn is_connected(&self, stream_id: StreamId) -> bool {
        self.channels
            .get(&stream_id)
            .is_some_and(|c| c.handle.is_connected())
    }

    /// Returns the number of open or opening channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns true if no channel is open or opening.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Hands a committed frame to the channel of its stream.
    ///
    /// The frame is dropped if no channel can take it; a channel is opened if
    /// the endpoint is still active. Returns whether the frame was queued.
    pub fn forward(&mut self, frame: CommittedFrame) -> bool {
        let stream_id = frame.stream_id();
        let rejected = match self.channels.get(&stream_id) {
            Some(channel) => match channel.handle.send(frame) {
                Ok(()) => return true,
                Err(frame) => frame,
            },
            None => frame,
        };
        drop(rejected);
        self.metrics.frames_dropped.inc();
        trace!(stream_id, "no channel for committed frame, dropped");
        if let Some(endpoint) = self.registry.get_by_stream_id(stream_id) {
            self.connect(&endpoint);
        }
        false
    }

    /// Applies a lifecycle event.
    pub fn on_event(&mut self, event: ChannelEvent) -> ChannelChange {
        match event {
            ChannelEvent::Connected {
                channel_id,
                endpoint,
            } => {
                if !self.is_current(endpoint.stream_id(), channel_id) {
                    return ChannelChange::None;
                }
                for listener in &self.listeners {
                    listener.on_connection_established(&endpoint);
                }
                ChannelChange::Opened(endpoint.stream_id())
            }
            ChannelEvent::Closed {
                channel_id,
                endpoint,
                was_connected,
            } => {
                let stream_id = endpoint.stream_id();
                if !self.is_current(stream_id, channel_id) {
                    return ChannelChange::None;
                }
                self.channels.remove(&stream_id);
                if was_connected {
                    for listener in &self.listeners {
                        listener.on_connection_closed(&endpoint);
                    }
                }
                self.schedule_reconnect(endpoint);
                ChannelChange::Closed(stream_id)
            }
            ChannelEvent::Reconnect { endpoint } => {
                self.connect(&endpoint);
                ChannelChange::None
            }
        }
    }

    fn is_current(&self, stream_id: StreamId, channel_id: u64) -> bool {
        self.channels
            .get(&stream_id)
            .is_some_and(|c| c.handle.channel_id() == channel_id)
    }

    fn schedule_reconnect(&self, endpoint: Arc<RemoteEndpoint>) {
        let Some(delay) = self.reconnect_delay else {
            return;
        };
        if self.closing || !endpoint.is_active() {
            return;
        }
        trace!(stream_id = endpoint.stream_id(), ?delay, "scheduling reconnect");
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(ChannelEvent::Reconnect { endpoint });
        });
    }

    /// Closes the channel carrying `stream_id`, if any.
    pub fn close_channel(&mut self, stream_id: StreamId) {
        if let Some(channel) = self.channels.get(&stream_id) {
            channel.handle.close();
        }
    }

    /// Closes every channel. Channels of active endpoints are reopened.
    pub fn close_all(&mut self) {
        for channel in self.channels.values() {
            channel.handle.close();
        }
    }

    /// Closes every channel for good and waits for their tasks to end.
    pub async fn shutdown(&mut self) {
        self.closing = true;
        self.close_all();
        for (_, channel) in self.channels.drain() {
            let _ = channel.task.await;
        }
    }
}

impl fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelManager")
            .field("channels", &self.channels.len())
            .field("listeners", &self.listeners.len())
            .field("closing", &self.closing)
            .finish()
    }
}
