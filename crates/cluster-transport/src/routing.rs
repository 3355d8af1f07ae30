//! Logical node and partition routing.
//!
//! Maps cluster node ids to remote endpoints of the address registry. The
//! target resolver of a request returns a [`RequestTarget`]; the client looks
//! the node up here to find the stream the request is written to.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::registry::{RemoteAddressRegistry, RemoteEndpoint};

/// Unique identifier for a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct NodeId(u64);

impl NodeId {
    /// Creates a new NodeId from a raw u64 value.
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    /// Returns the underlying u64 value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        NodeId(id)
    }
}

impl From<NodeId> for u64 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Identifier of a partition; requests are addressed to a partition on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct PartitionId(u32);

impl PartitionId {
    /// Creates a new PartitionId from a raw u32 value.
    pub fn new(id: u32) -> Self {
        PartitionId(id)
    }

    /// Returns the underlying u32 value.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for PartitionId {
    fn from(id: u32) -> Self {
        PartitionId(id)
    }
}

impl From<PartitionId> for u32 {
    fn from(id: PartitionId) -> Self {
        id.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition-{}", self.0)
    }
}

/// Where a request attempt is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestTarget {
    /// Node that should receive the request.
    pub node_id: NodeId,
    /// Partition on that node.
    pub partition_id: PartitionId,
}

impl RequestTarget {
    /// Creates a target.
    pub fn new(node_id: NodeId, partition_id: PartitionId) -> Self {
        Self {
            node_id,
            partition_id,
        }
    }
}

/// Thread-safe map from node id to remote endpoint.
pub struct EndpointRegistry {
    addresses: Arc<RemoteAddressRegistry>,
    endpoints: RwLock<HashMap<NodeId, Arc<RemoteEndpoint>>>,
}

impl EndpointRegistry {
    /// Creates a routing table backed by `addresses`.
    pub fn new(addresses: Arc<RemoteAddressRegistry>) -> Self {
        Self {
            addresses,
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the address registry endpoints are allocated from.
    pub fn address_registry(&self) -> &Arc<RemoteAddressRegistry> {
        &self.addresses
    }

    /// Maps `node_id` to `address` and returns the registered endpoint.
    ///
    /// If the node previously mapped to a different endpoint, that endpoint is
    /// deactivated unless another node still maps to it.
    pub fn set_endpoint(&self, node_id: NodeId, address: SocketAddr) -> Arc<RemoteEndpoint> {
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        let endpoint = self.addresses.register(address);
        let previous = endpoints.insert(node_id, Arc::clone(&endpoint));

        if let Some(previous) = previous {
            if previous.stream_id() != endpoint.stream_id() {
                self.release(&endpoints, &previous);
            }
        }
        debug!(%node_id, %address, stream_id = endpoint.stream_id(), "endpoint set");
        endpoint
    }

    /// Removes the mapping for `node_id` and deactivates its endpoint.
    ///
    /// The endpoint stays active if another node still maps to it.
    pub fn remove_endpoint(&self, node_id: NodeId) -> Option<Arc<RemoteEndpoint>> {
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        let removed = endpoints.remove(&node_id)?;
        self.release(&endpoints, &removed);
        debug!(%node_id, address = %removed.address(), "endpoint removed");
        Some(removed)
    }

    /// Removes the mapping for `node_id` and retires its endpoint.
    pub fn retire(&self, node_id: NodeId) -> Option<Arc<RemoteEndpoint>> {
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        let removed = endpoints.remove(&node_id)?;
        endpoints.retain(|_, e| e.stream_id() != removed.stream_id());
        self.addresses.retire(&removed);
        debug!(%node_id, address = %removed.address(), "endpoint retired");
        Some(removed)
    }

    /// Returns the endpoint `node_id` maps to.
    pub fn get_endpoint(&self, node_id: NodeId) -> Option<Arc<RemoteEndpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&node_id)
            .cloned()
    }

    /// Returns the number of mapped nodes.
    pub fn len(&self) -> usize {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Returns true if no node is mapped.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, endpoints: &HashMap<NodeId, Arc<RemoteEndpoint>>, endpoint: &RemoteEndpoint) {
        let still_mapped = endpoints
            .values()
            .any(|e| e.stream_id() == endpoint.stream_id());
        if !still_mapped {
            self.addresses.deactivate(endpoint);
        }
    }
}

impl fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("nodes", &self.len())
            .field("addresses", &self.addresses)
            .finish()
    }
}
