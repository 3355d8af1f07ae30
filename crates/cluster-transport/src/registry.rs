//! Remote address registry.
//!
//! Assigns a stable stream id to every distinct remote socket address and
//! tracks its lifecycle. Stream ids are dense indices into a copy-on-write
//! array: appends happen under a writer lock, readers clone the published
//! snapshot and never wait on a writer that is building a new one.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

/// Identifier assigned to a remote endpoint by the registry.
pub type StreamId = u32;

const STATE_ACTIVE: u8 = 0;
const STATE_INACTIVE: u8 = 1;
const STATE_RETIRED: u8 = 2;

/// Lifecycle of a remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Routable; channels are opened and kept open.
    Active,
    /// Temporarily unreachable; the stream id is kept for reactivation.
    Inactive,
    /// Permanently invalid; the stream id is never handed out again.
    Retired,
}

impl From<u8> for EndpointState {
    fn from(raw: u8) -> Self {
        match raw {
            STATE_ACTIVE => EndpointState::Active,
            STATE_INACTIVE => EndpointState::Inactive,
            _ => EndpointState::Retired,
        }
    }
}

/// A remote network endpoint known to the registry.
pub struct RemoteEndpoint {
    stream_id: StreamId,
    address: SocketAddr,
    state: AtomicU8,
}

impl RemoteEndpoint {
    fn new(stream_id: StreamId, address: SocketAddr) -> Self {
        Self {
            stream_id,
            address,
            state: AtomicU8::new(STATE_ACTIVE),
        }
    }

    /// Returns the stream id assigned to this endpoint.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Returns the socket address of this endpoint.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> EndpointState {
        EndpointState::from(self.state.load(Ordering::Acquire))
    }

    /// Returns true if the endpoint is routable.
    pub fn is_active(&self) -> bool {
        self.state() == EndpointState::Active
    }

    /// Returns true if the endpoint has been retired.
    pub fn is_retired(&self) -> bool {
        self.state() == EndpointState::Retired
    }
}

impl fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("stream_id", &self.stream_id)
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

/// Registry of remote endpoints keyed by stream id.
pub struct RemoteAddressRegistry {
    writer: Mutex<()>,
    published: RwLock<Arc<Vec<Arc<RemoteEndpoint>>>>,
    size: AtomicUsize,
}

impl Default for RemoteAddressRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RemoteAddressRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAddressRegistry")
            .field("size", &self.len())
            .finish()
    }
}

impl RemoteAddressRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            writer: Mutex::new(()),
            published: RwLock::new(Arc::new(Vec::new())),
            size: AtomicUsize::new(0),
        }
    }

    /// Registers `address` and returns its endpoint.
    ///
    /// Returns the existing endpoint if the address is active or inactive,
    /// reactivating it in the latter case. Otherwise a new endpoint with the
    /// next stream id is appended.
    pub fn register(&self, address: SocketAddr) -> Arc<RemoteEndpoint> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snapshot();

        if let Some(existing) = current
            .iter()
            .find(|e| e.address == address && !e.is_retired())
        {
            if existing
                .state
                .compare_exchange(
                    STATE_INACTIVE,
                    STATE_ACTIVE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                debug!(stream_id = existing.stream_id, %address, "remote endpoint reactivated");
            }
            return Arc::clone(existing);
        }

        let stream_id = current.len() as StreamId;
        let endpoint = Arc::new(RemoteEndpoint::new(stream_id, address));
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(Arc::clone(&endpoint));

        *self.published.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
        self.size.store(stream_id as usize + 1, Ordering::Release);
        debug!(stream_id, %address, "remote endpoint registered");
        endpoint
    }

    /// Returns the endpoint with the given stream id.
    pub fn get_by_stream_id(&self, stream_id: StreamId) -> Option<Arc<RemoteEndpoint>> {
        if stream_id as usize >= self.len() {
            return None;
        }
        self.snapshot().get(stream_id as usize).cloned()
    }

    /// Returns the active or inactive endpoint registered for `address`.
    pub fn get_by_address(&self, address: SocketAddr) -> Option<Arc<RemoteEndpoint>> {
        self.snapshot()
            .iter()
            .find(|e| e.address == address && !e.is_retired())
            .cloned()
    }

    /// Marks an endpoint inactive, keeping its stream id for reactivation.
    ///
    /// Retired endpoints stay retired.
    pub fn deactivate(&self, endpoint: &RemoteEndpoint) {
        if endpoint
            .state
            .compare_exchange(
                STATE_ACTIVE,
                STATE_INACTIVE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            debug!(stream_id = endpoint.stream_id, address = %endpoint.address, "remote endpoint deactivated");
        }
    }

    /// Permanently invalidates an endpoint.
    pub fn retire(&self, endpoint: &RemoteEndpoint) {
        let previous = endpoint.state.swap(STATE_RETIRED, Ordering::AcqRel);
        if previous != STATE_RETIRED {
            debug!(stream_id = endpoint.stream_id, address = %endpoint.address, "remote endpoint retired");
        }
    }

    /// Returns the number of endpoints ever registered.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Returns true if nothing was ever registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns all endpoints currently in the active state.
    pub fn active_endpoints(&self) -> Vec<Arc<RemoteEndpoint>> {
        self.snapshot()
            .iter()
            .filter(|e| e.is_active())
            .cloned()
            .collect()
    }

    fn snapshot(&self) -> Arc<Vec<Arc<RemoteEndpoint>>> {
        Arc::clone(&self.published.read().unwrap_or_else(|e| e.into_inner()))
    }
}
