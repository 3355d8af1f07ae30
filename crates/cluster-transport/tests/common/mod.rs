//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cluster_transport::{ChannelListener, RemoteEndpoint, TransportConfig};
use tracing_subscriber::EnvFilter;

/// Installs a test subscriber once; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Configuration with short delays and keep-alive disabled.
pub fn test_config() -> TransportConfig {
    TransportConfig {
        reconnect_delay_ms: 20,
        connect_timeout_ms: 1000,
        keep_alive_interval_ms: 0,
        ..Default::default()
    }
}

pub fn localhost() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Returns a local address nothing listens on.
pub async fn refused_address() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind(localhost()).await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);
    address
}

/// Polls `condition` every few milliseconds until it holds or `limit`
/// passes.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Records connection events.
#[derive(Default)]
pub struct ConnectionRecorder {
    established: Mutex<Vec<SocketAddr>>,
    closed: Mutex<Vec<SocketAddr>>,
}

impl ConnectionRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn established(&self) -> usize {
        self.established.lock().unwrap().len()
    }

    pub fn closed(&self) -> usize {
        self.closed.lock().unwrap().len()
    }
}

impl ChannelListener for ConnectionRecorder {
    fn on_connection_established(&self, endpoint: &RemoteEndpoint) {
        self.established.lock().unwrap().push(endpoint.address());
    }

    fn on_connection_closed(&self, endpoint: &RemoteEndpoint) {
        self.closed.lock().unwrap().push(endpoint.address());
    }
}
