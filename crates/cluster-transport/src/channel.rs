//! A single TCP connection to a remote endpoint.
//!
//! Each channel is driven by its own task: it connects, then interleaves
//! writing committed frames, reading and de-framing inbound data, and sending
//! keep-alives on an idle connection. A channel is never reopened; a fresh one
//! is created to reconnect.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::WriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::metrics::TransportMetrics;
use crate::protocol::{self, ControlMessage, ProtocolId, LENGTH_FIELD_LENGTH};
use crate::registry::{RemoteEndpoint, StreamId};
use crate::send_buffer::CommittedFrame;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, not yet connecting.
    Idle,
    /// Socket connect in progress.
    Connecting,
    /// Connected; frames flow both ways.
    Connected,
    /// Terminal.
    Closed,
}

impl ChannelState {
    fn as_u8(self) -> u8 {
        match self {
            ChannelState::Idle => 0,
            ChannelState::Connecting => 1,
            ChannelState::Connected => 2,
            ChannelState::Closed => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ChannelState::Idle,
            1 => ChannelState::Connecting,
            2 => ChannelState::Connected,
            _ => ChannelState::Closed,
        }
    }
}

/// Receives the lifecycle transitions of a channel.
pub trait ChannelLifecycleListener: Send + Sync {
    /// The channel finished connecting.
    fn on_channel_connected(&self, channel_id: u64, endpoint: &Arc<RemoteEndpoint>);

    /// The channel closed. Called exactly once per channel.
    fn on_channel_closed(
        &self,
        channel_id: u64,
        endpoint: &Arc<RemoteEndpoint>,
        was_connected: bool,
    );
}

/// Consumer of inbound data frames.
pub trait FrameHandler {
    /// Handles one frame (without its length prefix). Returning `false`
    /// declines the frame; it is offered again, before any later frame, on
    /// the next poll.
    fn on_frame(&mut self, stream_id: StreamId, frame: &Bytes) -> bool;
}

/// A data frame read from a channel.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Stream of the endpoint the channel is connected to.
    pub stream_id: StreamId,
    /// Channel the frame arrived on.
    pub channel_id: u64,
    /// The message, without its length prefix.
    pub frame: Bytes,
}

/// Frame handler that forwards frames into the bounded receive queue of an
/// event loop. Declines frames while the queue is full.
#[derive(Debug, Clone)]
pub struct ReceiveQueue {
    tx: mpsc::Sender<InboundFrame>,
    channel_id: u64,
}

impl ReceiveQueue {
    fn new(tx: mpsc::Sender<InboundFrame>, channel_id: u64) -> Self {
        Self { tx, channel_id }
    }
}

impl FrameHandler for ReceiveQueue {
    fn on_frame(&mut self, stream_id: StreamId, frame: &Bytes) -> bool {
        let inbound = InboundFrame {
            stream_id,
            channel_id: self.channel_id,
            frame: frame.clone(),
        };
        match self.tx.try_send(inbound) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            // Event loop is gone; nothing left to deliver to.
            Err(mpsc::error::TrySendError::Closed(_)) => true,
        }
    }
}

/// Socket and framing settings of a channel.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Largest inbound message accepted.
    pub max_message_size: usize,
    /// Read buffer growth step.
    pub read_buffer_size: usize,
    /// Socket connect timeout.
    pub connect_timeout: Duration,
    /// Whether TCP_NODELAY is set.
    pub nodelay: bool,
    /// Idle time before a keep-alive is sent.
    pub keep_alive: Option<Duration>,
}

impl From<&TransportConfig> for ChannelOptions {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            read_buffer_size: config.read_buffer_size,
            connect_timeout: config.connect_timeout(),
            nodelay: config.nodelay,
            keep_alive: config.keep_alive_interval(),
        }
    }
}

struct ChannelShared {
    state: AtomicU8,
    close_requested: AtomicBool,
    close_reported: AtomicBool,
    shutdown: Notify,
}

impl ChannelShared {
    fn new(state: ChannelState) -> Self {
        Self {
            state: AtomicU8::new(state.as_u8()),
            close_requested: AtomicBool::new(false),
            close_reported: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn request_close(&self) {
        if !self.close_requested.swap(true, Ordering::AcqRel) {
            self.shutdown.notify_one();
        }
    }
}

/// Handle used by the event loop to feed and close a channel.
#[derive(Clone)]
pub struct ChannelHandle {
    channel_id: u64,
    endpoint: Arc<RemoteEndpoint>,
    shared: Arc<ChannelShared>,
    outbound: mpsc::UnboundedSender<CommittedFrame>,
}

impl ChannelHandle {
    /// Unique id of the channel.
    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Endpoint the channel belongs to.
    pub fn endpoint(&self) -> &Arc<RemoteEndpoint> {
        &self.endpoint
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Returns true while frames can be written.
    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Queues a committed frame for writing. Returns the frame if the
    /// channel is closing.
    pub fn send(&self, frame: CommittedFrame) -> std::result::Result<(), CommittedFrame> {
        if self.shared.close_requested.load(Ordering::Acquire) {
            return Err(frame);
        }
        self.outbound.send(frame).map_err(|e| e.0)
    }

    /// Asks the channel to close. Idempotent.
    pub fn close(&self) {
        self.shared.request_close();
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("channel_id", &self.channel_id)
            .field("stream_id", &self.endpoint.stream_id())
            .field("state", &self.state())
            .finish()
    }
}

/// Bound on writing the close notice to a peer that stopped reading.
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// A frame being written; a committed frame keeps its send-buffer capacity
/// until the last byte is on the socket.
struct Outgoing {
    bytes: Bytes,
    written: usize,
    frame: Option<CommittedFrame>,
}

impl Outgoing {
    fn frame(frame: CommittedFrame) -> Self {
        Self {
            bytes: frame.bytes().clone(),
            written: 0,
            frame: Some(frame),
        }
    }

    fn control(control: ControlMessage) -> Self {
        let mut bytes = BytesMut::with_capacity(protocol::CONTROL_FRAME_LENGTH);
        protocol::write_control_frame(&mut bytes, control);
        Self {
            bytes: bytes.freeze(),
            written: 0,
            frame: None,
        }
    }

    fn unwritten(&self) -> &[u8] {
        &self.bytes[self.written..]
    }

    fn is_done(&self) -> bool {
        self.written == self.bytes.len()
    }
}

/// One connection to a remote endpoint, owned by its task.
pub struct TransportChannel {
    channel_id: u64,
    endpoint: Arc<RemoteEndpoint>,
    options: ChannelOptions,
    shared: Arc<ChannelShared>,
    listener: Arc<dyn ChannelLifecycleListener>,
    metrics: Arc<TransportMetrics>,
    stream: Option<TcpStream>,
    outbound: mpsc::UnboundedReceiver<CommittedFrame>,
    read_buf: BytesMut,
    pending: Option<Bytes>,
    peer_closed: bool,
    was_connected: bool,
}

impl TransportChannel {
    /// Creates an unconnected channel to `endpoint`.
    pub fn new(
        endpoint: Arc<RemoteEndpoint>,
        options: ChannelOptions,
        listener: Arc<dyn ChannelLifecycleListener>,
        metrics: Arc<TransportMetrics>,
    ) -> (TransportChannel, ChannelHandle) {
        Self::build(endpoint, options, listener, metrics, None)
    }

    /// Wraps a socket accepted by a server.
    pub fn accepted(
        stream: TcpStream,
        endpoint: Arc<RemoteEndpoint>,
        options: ChannelOptions,
        listener: Arc<dyn ChannelLifecycleListener>,
        metrics: Arc<TransportMetrics>,
    ) -> (TransportChannel, ChannelHandle) {
        if options.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "failed to set TCP_NODELAY on accepted socket");
            }
        }
        Self::build(endpoint, options, listener, metrics, Some(stream))
    }

    fn build(
        endpoint: Arc<RemoteEndpoint>,
        options: ChannelOptions,
        listener: Arc<dyn ChannelLifecycleListener>,
        metrics: Arc<TransportMetrics>,
        stream: Option<TcpStream>,
    ) -> (TransportChannel, ChannelHandle) {
        let channel_id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let initial = if stream.is_some() {
            ChannelState::Connected
        } else {
            ChannelState::Idle
        };
        let shared = Arc::new(ChannelShared::new(initial));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ChannelHandle {
            channel_id,
            endpoint: Arc::clone(&endpoint),
            shared: Arc::clone(&shared),
            outbound: tx,
        };
        let channel = TransportChannel {
            channel_id,
            endpoint,
            read_buf: BytesMut::with_capacity(options.read_buffer_size),
            options,
            shared,
            listener,
            metrics,
            stream,
            outbound: rx,
            pending: None,
            peer_closed: false,
            was_connected: false,
        };
        (channel, handle)
    }

    /// Unique id of the channel.
    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Opens the socket, bounded by the connect timeout.
    ///
    /// Aborted early if the channel is closed meanwhile.
    pub async fn connect(&mut self) -> Result<()> {
        let addr = self.endpoint.address();
        self.shared.set_state(ChannelState::Connecting);
        let deadline = self.options.connect_timeout;

        let connected = tokio::select! {
            result = tokio::time::timeout(deadline, TcpStream::connect(addr)) => result,
            _ = self.shared.shutdown.notified() => {
                return Err(TransportError::NotConnected { addr });
            }
        };
        let stream = connected
            .map_err(|_| TransportError::ConnectionTimeout {
                addr,
                timeout_ms: deadline.as_millis() as u64,
            })?
            .map_err(TransportError::IoError)?;
        if self.options.nodelay {
            stream.set_nodelay(true).map_err(TransportError::IoError)?;
        }
        self.stream = Some(stream);
        self.shared.set_state(ChannelState::Connected);
        Ok(())
    }

    /// Hands every complete buffered frame to `handler`, in order.
    ///
    /// A previously declined frame is offered first. Processing stops at the
    /// first declined frame; it and the remaining bytes are kept. Control
    /// frames are consumed here. Returns the number of frames delivered.
    pub fn receive<H: FrameHandler + ?Sized>(&mut self, handler: &mut H) -> Result<usize> {
        let stream_id = self.endpoint.stream_id();
        let mut delivered = 0;

        if let Some(frame) = self.pending.take() {
            if !handler.on_frame(stream_id, &frame) {
                self.pending = Some(frame);
                return Ok(0);
            }
            delivered += 1;
        }

        while !self.peer_closed {
            let max_message_size = self.options.max_message_size;
            let frame = match protocol::split_data_frame(&mut self.read_buf, max_message_size)? {
                Some(frame) => frame,
                None => break,
            };
            self.metrics.frame_received(LENGTH_FIELD_LENGTH + frame.len());
            if self.consume_control(&frame) {
                continue;
            }
            if !handler.on_frame(stream_id, &frame) {
                self.pending = Some(frame);
                break;
            }
            delivered += 1;
        }
        Ok(delivered)
    }

    fn consume_control(&mut self, frame: &Bytes) -> bool {
        if frame.len() < 2 {
            return false;
        }
        match ProtocolId::from_u16(u16::from_be_bytes([frame[0], frame[1]])) {
            Some(ProtocolId::Control(ControlMessage::Close)) => {
                debug!(channel_id = self.channel_id, "peer requested close");
                self.peer_closed = true;
                true
            }
            Some(ProtocolId::Control(control)) => {
                trace!(channel_id = self.channel_id, ?control, "control message ignored");
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    /// Asks the channel to close. Idempotent.
    pub fn close(&self) {
        self.shared.request_close();
    }

    /// Spawns the channel task.
    pub fn spawn(self, inbound: mpsc::Sender<InboundFrame>) -> JoinHandle<()> {
        tokio::spawn(self.run(inbound))
    }

    /// Drives the channel until it closes.
    pub async fn run(mut self, inbound: mpsc::Sender<InboundFrame>) {
        let mut queue = ReceiveQueue::new(inbound, self.channel_id);

        if self.stream.is_none() {
            if let Err(e) = self.connect().await {
                debug!(channel_id = self.channel_id, addr = %self.endpoint.address(), error = %e, "channel connect failed");
                self.finish();
                return;
            }
        }
        if self.shared.close_requested.load(Ordering::Acquire) {
            self.finish();
            return;
        }

        self.was_connected = true;
        self.metrics.channels_opened.inc();
        debug!(channel_id = self.channel_id, stream_id = self.endpoint.stream_id(), addr = %self.endpoint.address(), "channel connected");
        self.listener.on_channel_connected(self.channel_id, &self.endpoint);

        if let Some(mut stream) = self.stream.take() {
            match self.pump(&mut stream, &mut queue).await {
                Ok(()) => {}
                Err(e) => debug!(channel_id = self.channel_id, error = %e, "channel failed"),
            }
        }
        self.finish();
    }

    async fn pump(&mut self, stream: &mut TcpStream, queue: &mut ReceiveQueue) -> Result<()> {
        let (mut reader, mut writer) = stream.split();
        let keep_alive = self.options.keep_alive;
        let mut keep_alive_at = keep_alive.map(|interval| Instant::now() + interval);
        let mut outgoing: Option<Outgoing> = None;

        loop {
            self.receive(queue)?;
            if self.peer_closed {
                return Ok(());
            }
            let backpressured = self.pending.is_some();
            if self.read_buf.capacity() == self.read_buf.len() {
                self.read_buf.reserve(self.options.read_buffer_size);
            }
            let unwritten = outgoing.as_ref().map_or(&[][..], Outgoing::unwritten);
            let idle = outgoing.is_none();

            // Writes go through `write`, which is cancel safe, so a peer that
            // stops reading never blocks shutdown or the read side.
            tokio::select! {
                biased;
                _ = self.shared.shutdown.notified() => {
                    self.say_goodbye(&mut writer, outgoing.take()).await;
                    return Ok(());
                }
                written = writer.write(unwritten), if !idle => {
                    let written = written?;
                    if written == 0 {
                        return Err(TransportError::IoError(std::io::ErrorKind::WriteZero.into()));
                    }
                    if let Some(out) = outgoing.as_mut() {
                        out.written += written;
                        if out.is_done() {
                            if let Some(frame) = outgoing.take().and_then(|out| out.frame) {
                                self.metrics.frame_sent(frame.bytes().len());
                            }
                            keep_alive_at = keep_alive.map(|interval| Instant::now() + interval);
                        }
                    }
                }
                frame = self.outbound.recv(), if idle => {
                    let Some(frame) = frame else { return Ok(()) };
                    outgoing = Some(Outgoing::frame(frame));
                }
                read = reader.read_buf(&mut self.read_buf), if !backpressured => {
                    if read? == 0 {
                        debug!(channel_id = self.channel_id, "peer closed connection");
                        return Ok(());
                    }
                }
                permit = queue.tx.reserve(), if backpressured => {
                    if permit.is_err() {
                        return Ok(());
                    }
                }
                _ = sleep_until(keep_alive_at.unwrap_or_else(Instant::now)),
                    if keep_alive_at.is_some() =>
                {
                    if idle {
                        outgoing = Some(Outgoing::control(ControlMessage::KeepAlive));
                        trace!(channel_id = self.channel_id, "keep-alive queued");
                    }
                    keep_alive_at = keep_alive.map(|interval| Instant::now() + interval);
                }
            }
        }
    }

    /// Tells the peer the channel is closing, unless a frame is half written.
    async fn say_goodbye(&mut self, writer: &mut WriteHalf<'_>, interrupted: Option<Outgoing>) {
        if let Some(out) = interrupted {
            if out.frame.is_some() {
                self.metrics.frames_dropped.inc();
            }
            if out.written > 0 {
                return;
            }
        }
        let mut close = BytesMut::with_capacity(protocol::CONTROL_FRAME_LENGTH);
        protocol::write_control_frame(&mut close, ControlMessage::Close);
        if tokio::time::timeout(CLOSE_WRITE_TIMEOUT, writer.write_all(&close))
            .await
            .is_err()
        {
            trace!(channel_id = self.channel_id, "close notice not written");
        }
    }

    fn finish(&mut self) {
        self.shared.close_requested.store(true, Ordering::Release);
        self.shared.set_state(ChannelState::Closed);
        self.outbound.close();
        let dropped = std::iter::from_fn(|| self.outbound.try_recv().ok()).count();
        if dropped > 0 {
            self.metrics.frames_dropped.add(dropped as u64);
            warn!(channel_id = self.channel_id, dropped, "discarded queued frames of closed channel");
        }
        if self.shared.close_reported.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.was_connected {
            self.metrics.channels_closed.inc();
        }
        debug!(channel_id = self.channel_id, stream_id = self.endpoint.stream_id(), was_connected = self.was_connected, "channel closed");
        self.listener
            .on_channel_closed(self.channel_id, &self.endpoint, self.was_connected);
    }
}

impl fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportChannel")
            .field("channel_id", &self.channel_id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{write_message_frame, write_request_frame};
    use crate::registry::RemoteAddressRegistry;
    use crate::routing::PartitionId;
    use crate::send_buffer::SendBuffer;
    use bytes::Buf;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Connected(u64),
        Closed(u64, bool),
    }

    struct Recorder(mpsc::UnboundedSender<Event>);

    impl ChannelLifecycleListener for Recorder {
        fn on_channel_connected(&self, channel_id: u64, _endpoint: &Arc<RemoteEndpoint>) {
            let _ = self.0.send(Event::Connected(channel_id));
        }

        fn on_channel_closed(
            &self,
            channel_id: u64,
            _endpoint: &Arc<RemoteEndpoint>,
            was_connected: bool,
        ) {
            let _ = self.0.send(Event::Closed(channel_id, was_connected));
        }
    }

    struct Collect {
        frames: Vec<Bytes>,
        accept: usize,
    }

    impl FrameHandler for Collect {
        fn on_frame(&mut self, _stream_id: StreamId, frame: &Bytes) -> bool {
            if self.frames.len() == self.accept {
                return false;
            }
            self.frames.push(frame.clone());
            true
        }
    }

    fn options() -> ChannelOptions {
        ChannelOptions {
            max_message_size: 1024,
            read_buffer_size: 256,
            connect_timeout: Duration::from_secs(1),
            nodelay: true,
            keep_alive: None,
        }
    }

    fn channel_to(
        addr: SocketAddr,
        options: ChannelOptions,
    ) -> (TransportChannel, ChannelHandle, mpsc::UnboundedReceiver<Event>) {
        let registry = RemoteAddressRegistry::new();
        let endpoint = registry.register(addr);
        let (tx, rx) = mpsc::unbounded_channel();
        let (channel, handle) = TransportChannel::new(
            endpoint,
            options,
            Arc::new(Recorder(tx)),
            Arc::new(TransportMetrics::new()),
        );
        (channel, handle, rx)
    }

    fn unused_address() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 1))
    }

    #[test]
    fn test_receive_keeps_declined_frame_for_next_poll() {
        let (mut channel, _handle, _events) = channel_to(unused_address(), options());
        for payload in [&b"a"[..], b"b", b"c"] {
            write_message_frame(&mut channel.read_buf, payload);
        }

        let mut handler = Collect {
            frames: Vec::new(),
            accept: 1,
        };
        assert_eq!(channel.receive(&mut handler).unwrap(), 1);
        assert!(channel.pending.is_some());

        handler.accept = 3;
        assert_eq!(channel.receive(&mut handler).unwrap(), 2);
        let payloads: Vec<u8> = handler.frames.iter().map(|f| f[2]).collect();
        assert_eq!(payloads, b"abc".to_vec());
    }

    #[test]
    fn test_receive_waits_for_partial_frame() {
        let (mut channel, _handle, _events) = channel_to(unused_address(), options());
        let mut full = BytesMut::new();
        write_request_frame(&mut full, 9, PartitionId::new(1), b"payload");
        channel.read_buf.extend_from_slice(&full[..10]);

        let mut handler = Collect {
            frames: Vec::new(),
            accept: 10,
        };
        assert_eq!(channel.receive(&mut handler).unwrap(), 0);
        channel.read_buf.extend_from_slice(&full[10..]);
        assert_eq!(channel.receive(&mut handler).unwrap(), 1);
    }

    #[test]
    fn test_receive_consumes_control_frames() {
        let (mut channel, _handle, _events) = channel_to(unused_address(), options());
        protocol::write_control_frame(&mut channel.read_buf, ControlMessage::KeepAlive);
        write_message_frame(&mut channel.read_buf, b"x");
        protocol::write_control_frame(&mut channel.read_buf, ControlMessage::Close);
        write_message_frame(&mut channel.read_buf, b"after close");

        let mut handler = Collect {
            frames: Vec::new(),
            accept: 10,
        };
        assert_eq!(channel.receive(&mut handler).unwrap(), 1);
        assert!(channel.peer_closed);
    }

    #[test]
    fn test_receive_rejects_oversize_prefix() {
        let (mut channel, _handle, _events) = channel_to(unused_address(), options());
        channel.read_buf.extend_from_slice(&(4096u32).to_be_bytes());
        let mut handler = Collect {
            frames: Vec::new(),
            accept: 10,
        };
        assert!(matches!(
            channel.receive(&mut handler),
            Err(TransportError::PayloadTooLarge { size: 4096, .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_reports_closed_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (channel, handle, mut events) = channel_to(addr, options());
        let (tx, _rx) = mpsc::channel(8);
        channel.spawn(tx).await.unwrap();

        let id = handle.channel_id();
        assert_eq!(events.recv().await, Some(Event::Closed(id, false)));
        assert_eq!(handle.state(), ChannelState::Closed);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_close_fires_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (channel, handle, mut events) = channel_to(addr, options());
        let (tx, _rx) = mpsc::channel(8);
        let task = channel.spawn(tx);
        let (_peer, _) = listener.accept().await.unwrap();

        let id = handle.channel_id();
        assert_eq!(events.recv().await, Some(Event::Connected(id)));

        let closers: Vec<_> = (0..4)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.close() })
            })
            .collect();
        for closer in closers {
            closer.await.unwrap();
        }
        task.await.unwrap();
        assert_eq!(events.recv().await, Some(Event::Closed(id, true)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (channel, handle, mut events) = channel_to(addr, options());
        let (tx, mut inbound) = mpsc::channel(8);
        let _task = channel.spawn(tx);
        let (mut peer, _) = listener.accept().await.unwrap();
        assert!(matches!(events.recv().await, Some(Event::Connected(_))));

        let (buffer, mut drained) = SendBuffer::new(1024, 1024);
        let mut claim = buffer.claim(protocol::message_frame_length(3), 0).unwrap();
        write_message_frame(&mut claim.region(), b"out");
        claim.commit().unwrap();
        handle.send(drained.next().await.unwrap()).unwrap();

        let mut received = vec![0u8; protocol::message_frame_length(3)];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(&received[6..], b"out");

        let mut reply = BytesMut::new();
        write_message_frame(&mut reply, b"in");
        peer.write_all(&reply).await.unwrap();
        let frame = inbound.recv().await.unwrap();
        assert_eq!(frame.channel_id, handle.channel_id());
        assert_eq!(&frame.frame[2..], b"in");
    }

    #[tokio::test]
    async fn test_peer_close_control_closes_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (channel, handle, mut events) = channel_to(addr, options());
        let (tx, _rx) = mpsc::channel(8);
        let task = channel.spawn(tx);
        let (mut peer, _) = listener.accept().await.unwrap();
        assert!(matches!(events.recv().await, Some(Event::Connected(_))));

        let mut close = BytesMut::new();
        protocol::write_control_frame(&mut close, ControlMessage::Close);
        peer.write_all(&close).await.unwrap();

        task.await.unwrap();
        assert_eq!(events.recv().await, Some(Event::Closed(handle.channel_id(), true)));
    }

    #[tokio::test]
    async fn test_idle_channel_sends_keep_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let options = ChannelOptions {
            keep_alive: Some(Duration::from_millis(20)),
            ..options()
        };
        let (channel, _handle, _events) = channel_to(addr, options);
        let (tx, _rx) = mpsc::channel(8);
        let _task = channel.spawn(tx);
        let (mut peer, _) = listener.accept().await.unwrap();

        let mut frame = vec![0u8; protocol::CONTROL_FRAME_LENGTH];
        tokio::time::timeout(Duration::from_secs(2), peer.read_exact(&mut frame))
            .await
            .unwrap()
            .unwrap();
        let mut frame = &frame[..];
        assert_eq!(frame.get_u32(), 6);
        assert_eq!(frame.get_u16(), ProtocolId::Control(ControlMessage::KeepAlive).as_u16());
    }

    #[tokio::test]
    async fn test_close_is_not_blocked_by_peer_that_never_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (channel, handle, mut events) = channel_to(addr, options());
        let (tx, _rx) = mpsc::channel(8);
        let task = channel.spawn(tx);
        let (_peer, _) = listener.accept().await.unwrap();
        let id = handle.channel_id();
        assert_eq!(events.recv().await, Some(Event::Connected(id)));

        // Far more than the loopback socket buffers hold.
        let payload = vec![7u8; 8 * 1024 * 1024];
        let frame_length = protocol::message_frame_length(payload.len());
        let (buffer, mut drained) = SendBuffer::new(4 * frame_length, frame_length);
        for _ in 0..4 {
            let mut claim = buffer.claim(frame_length, 0).unwrap();
            write_message_frame(&mut claim.region(), &payload);
            claim.commit().unwrap();
            handle.send(drained.next().await.unwrap()).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        handle.close();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("close waited for the stalled write")
            .unwrap();
        assert_eq!(events.recv().await, Some(Event::Closed(id, true)));
        assert_eq!(handle.state(), ChannelState::Closed);
    }
}
