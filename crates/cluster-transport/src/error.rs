use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::routing::NodeId;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected to {addr}")]
    NotConnected { addr: SocketAddr },

    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout { addr: SocketAddr, timeout_ms: u64 },

    #[error("channel to {addr} closed while awaiting response")]
    ChannelClosed { addr: SocketAddr },

    #[error("no remote handler registered for topic {topic}")]
    NoRemoteHandler { topic: String },

    #[error("request {request_id} timed out after {timeout:?}; attempted {attempts}")]
    RequestTimeout {
        request_id: u64,
        timeout: Duration,
        attempts: AttemptHistory,
    },

    #[error("request pool exhausted ({capacity} requests outstanding)")]
    RequestPoolExhausted { capacity: usize },

    #[error("request slot {request_id} released twice")]
    DoubleRelease { request_id: u64 },

    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge { size: usize, max_size: usize },

    #[error("send buffer has no room for {length} bytes")]
    SendBufferFull { length: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("request handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("messaging service error: {reason}")]
    Messaging { reason: String },

    #[error("transport closed")]
    TransportClosed,

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Error returned by a server-side request handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Creates a handler error carrying the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// One target a request was sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// Logical node the target resolver returned.
    pub node_id: NodeId,
    /// Network address the node resolved to at the time of the attempt.
    pub address: SocketAddr,
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.address)
    }
}

/// Ordered list of targets tried by a request, oldest first.
///
/// Consecutive attempts against the same target are recorded once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptHistory(Vec<Attempt>);

impl AttemptHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Records an attempt unless it repeats the most recent one.
    pub fn record(&mut self, attempt: Attempt) {
        if self.0.last() != Some(&attempt) {
            self.0.push(attempt);
        }
    }

    /// Returns the recorded attempts in order.
    pub fn attempts(&self) -> &[Attempt] {
        &self.0
    }

    /// Returns the nodes tried, in order.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.0.iter().map(|a| a.node_id).collect()
    }

    /// Returns the number of recorded attempts.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no target was ever tried.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AttemptHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, attempt) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{attempt}")?;
        }
        f.write_str("]")
    }
}

/// Returns true for transient failures that a request retries within its deadline.
///
/// Retryable: `NotConnected`, `ChannelClosed`, `NoRemoteHandler`.
/// Everything else ends the request.
pub fn is_retryable(error: &TransportError) -> bool {
    match error {
        TransportError::NotConnected { .. } => true,
        TransportError::ChannelClosed { .. } => true,
        TransportError::ConnectionTimeout { .. } => false,
        TransportError::NoRemoteHandler { .. } => true,
        TransportError::RequestTimeout { .. } => false,
        TransportError::RequestPoolExhausted { .. } => false,
        TransportError::DoubleRelease { .. } => false,
        TransportError::PayloadTooLarge { .. } => false,
        TransportError::SendBufferFull { .. } => false,
        TransportError::InvalidConfig(_) => false,
        TransportError::InvalidFrame { .. } => false,
        TransportError::Handler(_) => false,
        TransportError::Messaging { .. } => false,
        TransportError::TransportClosed => false,
        TransportError::IoError(_) => false,
    }
}
