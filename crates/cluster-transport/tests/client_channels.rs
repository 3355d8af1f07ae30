//! Channel lifecycle as seen through the client transport.

mod common;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use cluster_transport::{
    accept_all, respond_with, ClientTransport, NodeId, PartitionId, RequestTarget, ServerRequest,
    ServerTransport, TargetResolver, TransportConfig, TransportError,
};
use tokio::net::{TcpListener, TcpStream};

use common::{eventually, init_tracing, localhost, test_config, ConnectionRecorder};

async fn accept_within(listener: &TcpListener, limit: Duration) -> Option<TcpStream> {
    tokio::time::timeout(limit, listener.accept())
        .await
        .ok()
        .and_then(|accepted| accepted.ok())
        .map(|(stream, _)| stream)
}

async fn echo_server() -> ServerTransport {
    let server = ServerTransport::bind(test_config(), localhost()).await.unwrap();
    server.subscribe(
        PartitionId::new(0),
        respond_with(|request: &ServerRequest| Ok(request.payload.clone())),
    );
    server
}

#[tokio::test]
async fn test_channel_opens_when_endpoint_is_set() {
    init_tracing();
    let server = echo_server().await;
    let client = ClientTransport::new(test_config()).unwrap();
    let recorder = ConnectionRecorder::new();
    client.register_channel_listener(recorder.clone());

    client.set_endpoint(NodeId::new(1), server.local_addr());

    assert!(eventually(Duration::from_secs(2), || recorder.established() == 1).await);
    assert!(client.endpoint(NodeId::new(1)).is_some());
    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_consecutive_requests_share_a_channel() {
    init_tracing();
    let server = echo_server().await;
    let accepted = ConnectionRecorder::new();
    server.register_channel_listener(accepted.clone());
    let client = ClientTransport::new(test_config()).unwrap();
    client.set_endpoint(NodeId::new(1), server.local_addr());

    for i in 0u8..3 {
        let response = client
            .send_request(
                NodeId::new(1),
                PartitionId::new(0),
                Bytes::from(vec![i]),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(response.payload.as_ref(), &[i]);
    }

    assert_eq!(accepted.established(), 1);
    assert_eq!(client.metrics().channels_opened, 1);
    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_new_channel_after_peer_closes() {
    init_tracing();
    let listener = TcpListener::bind(localhost()).await.unwrap();
    let client = ClientTransport::new(test_config()).unwrap();
    client.set_endpoint(NodeId::new(1), listener.local_addr().unwrap());

    let first = accept_within(&listener, Duration::from_secs(2)).await.unwrap();
    drop(first);

    assert!(accept_within(&listener, Duration::from_secs(2)).await.is_some());
    client.close().await;
}

#[tokio::test]
async fn test_deactivated_endpoint_is_not_reconnected() {
    init_tracing();
    let listener = TcpListener::bind(localhost()).await.unwrap();
    let client = ClientTransport::new(test_config()).unwrap();
    let recorder = ConnectionRecorder::new();
    client.register_channel_listener(recorder.clone());
    client.set_endpoint(NodeId::new(1), listener.local_addr().unwrap());
    let _first = accept_within(&listener, Duration::from_secs(2)).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || recorder.established() == 1).await);

    client.remove_endpoint(NodeId::new(1));
    client.close_all_channels();

    assert!(eventually(Duration::from_secs(2), || recorder.closed() == 1).await);
    assert!(accept_within(&listener, Duration::from_millis(300)).await.is_none());
    client.close().await;
}

#[tokio::test]
async fn test_retired_endpoint_is_not_reconnected() {
    init_tracing();
    let listener = TcpListener::bind(localhost()).await.unwrap();
    let client = ClientTransport::new(test_config()).unwrap();
    let recorder = ConnectionRecorder::new();
    client.register_channel_listener(recorder.clone());
    client.set_endpoint(NodeId::new(1), listener.local_addr().unwrap());
    let _first = accept_within(&listener, Duration::from_secs(2)).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || recorder.established() == 1).await);

    client.retire_endpoint(NodeId::new(1));
    client.close_all_channels();

    assert!(eventually(Duration::from_secs(2), || recorder.closed() == 1).await);
    assert!(accept_within(&listener, Duration::from_millis(300)).await.is_none());
    assert!(client.endpoint(NodeId::new(1)).is_none());
    client.close().await;
}

#[tokio::test]
async fn test_reregistration_reopens_channel() {
    init_tracing();
    let listener = TcpListener::bind(localhost()).await.unwrap();
    let address = listener.local_addr().unwrap();
    let client = ClientTransport::new(test_config()).unwrap();
    client.set_endpoint(NodeId::new(1), address);
    let _first = accept_within(&listener, Duration::from_secs(2)).await.unwrap();
    let stream_id = client.endpoint(NodeId::new(1)).unwrap().stream_id();

    client.remove_endpoint(NodeId::new(1));
    client.close_all_channels();
    assert!(accept_within(&listener, Duration::from_millis(200)).await.is_none());

    client.set_endpoint(NodeId::new(1), address);
    assert!(accept_within(&listener, Duration::from_secs(2)).await.is_some());
    assert_eq!(client.endpoint(NodeId::new(1)).unwrap().stream_id(), stream_id);
    client.close().await;
}

#[tokio::test]
async fn test_close_with_unreachable_remote_is_prompt() {
    init_tracing();
    let client = ClientTransport::new(test_config()).unwrap();
    // Non-routable; the connect attempt hangs until its timeout.
    client.set_endpoint(NodeId::new(1), SocketAddr::from(([10, 255, 255, 1], 26501)));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    tokio::time::timeout(Duration::from_secs(1), client.close())
        .await
        .expect("close did not complete");
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_close_completes_while_peer_stops_reading() {
    init_tracing();
    let listener = TcpListener::bind(localhost()).await.unwrap();
    let config = TransportConfig {
        max_message_size: 16 * 1024 * 1024,
        send_buffer_capacity: 256 * 1024 * 1024,
        ..test_config()
    };
    let client = ClientTransport::new(config).unwrap();
    client.set_endpoint(NodeId::new(1), listener.local_addr().unwrap());
    // Accepted and held open, never read.
    let _peer = accept_within(&listener, Duration::from_secs(2)).await.unwrap();

    let payload = Bytes::from(vec![0x5A; 8 * 1024 * 1024]);
    let requests: Vec<_> = (0..8)
        .map(|_| {
            client.send_request(
                NodeId::new(1),
                PartitionId::new(0),
                payload.clone(),
                Duration::from_millis(300),
            )
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(5), client.close())
        .await
        .expect("close blocked behind a stalled socket write");
    for request in requests {
        assert!(tokio::time::timeout(Duration::from_secs(2), request).await.unwrap().is_err());
    }
}

#[tokio::test]
async fn test_request_to_unknown_node_times_out() {
    init_tracing();
    let client = ClientTransport::new(test_config()).unwrap();

    let err = client
        .send_request(
            NodeId::new(99),
            PartitionId::new(0),
            Bytes::new(),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    match err {
        TransportError::RequestTimeout { attempts, .. } => assert!(attempts.is_empty()),
        other => panic!("unexpected error: {other}"),
    }
    client.close().await;
}

#[tokio::test]
async fn test_resolver_without_target_first_still_succeeds() {
    init_tracing();
    let server = echo_server().await;
    let client = ClientTransport::new(test_config()).unwrap();
    client.set_endpoint(NodeId::new(1), server.local_addr());

    let calls = Arc::new(AtomicUsize::new(0));
    let resolver: TargetResolver = {
        let calls = Arc::clone(&calls);
        Arc::new(move || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                None
            } else {
                Some(RequestTarget::new(NodeId::new(1), PartitionId::new(0)))
            }
        })
    };

    let response = client
        .send_request_with_retry(
            resolver,
            accept_all(),
            Bytes::from_static(b"late"),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert_eq!(response.payload.as_ref(), b"late");
    assert_eq!(response.attempts.nodes(), vec![NodeId::new(1)]);
    assert!(calls.load(Ordering::SeqCst) >= 3);
    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_single_message_reaches_server_handler() {
    init_tracing();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handler = Arc::new(move |_stream_id: u32, payload: Bytes| {
        let _ = tx.send(payload);
    });
    let server = ServerTransport::bind_with_message_handler(test_config(), localhost(), handler)
        .await
        .unwrap();
    let recorder = ConnectionRecorder::new();
    let client = ClientTransport::new(test_config()).unwrap();
    client.register_channel_listener(recorder.clone());
    client.set_endpoint(NodeId::new(1), server.local_addr());
    assert!(eventually(Duration::from_secs(2), || recorder.established() == 1).await);

    assert!(client.send_message(NodeId::new(1), b"fire"));
    let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(payload.as_ref(), b"fire");
    assert!(!client.send_message(NodeId::new(7), b"nobody"));

    client.close().await;
    server.close().await;
}
