#![warn(missing_docs)]

//! Cluster transport: framed request/response and fire-and-forget messaging between nodes
//!
//! Request path:  ClientTransport → RequestPool → SendBuffer (claim/commit) → conductor → TransportChannel → TCP
//! Response path: TCP → TransportChannel → receive queue → conductor → correlation table → ResponseFuture
//! Server path:   TCP → ServerTransport conductor → partition handler → ServerOutput → SendBuffer → TCP

pub mod channel;
pub mod client;
pub mod conductor;
pub mod config;
pub mod error;
pub mod messaging;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod request;
pub mod routing;
pub mod send_buffer;
pub mod server;

pub use channel::{ChannelOptions, ChannelState, TransportChannel};
pub use client::ClientTransport;
pub use conductor::{ChannelListener, MessageHandler};
pub use config::{ConfigError, TransportConfig};
pub use error::{is_retryable, Attempt, AttemptHistory, HandlerError, Result, TransportError};
pub use messaging::{
    LocalMessagingNetwork, LocalMessagingService, MessagingClient, MessagingOutput,
    MessagingRequest, MessagingRequestHandler, MessagingServer, MessagingService, TopicHandler,
};
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use protocol::{topic_name, ControlMessage, Message, COMMAND_API_TOPIC_PREFIX};
pub use registry::{EndpointState, RemoteAddressRegistry, RemoteEndpoint, StreamId};
pub use request::{
    accept_all, fixed_target, ClientResponse, RequestPool, ResponseAction, ResponseFuture,
    ResponseValidator, TargetResolver,
};
pub use routing::{EndpointRegistry, NodeId, PartitionId, RequestTarget};
pub use send_buffer::{ClaimError, SendBuffer};
pub use server::{respond_with, RequestHandler, ServerOutput, ServerRequest, ServerTransport};
