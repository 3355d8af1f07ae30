//! Transport counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Adds one.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Adds `n`.
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns the current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Point-in-time copy of [`TransportMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests handed to the transport by callers.
    pub requests_submitted: u64,
    /// Requests that resolved with an accepted response.
    pub requests_completed: u64,
    /// Requests that failed with a non-timeout error.
    pub requests_failed: u64,
    /// Requests that reached their deadline.
    pub request_timeouts: u64,
    /// Attempts after the first one.
    pub request_retries: u64,
    /// Responses with no waiting request.
    pub late_responses: u64,
    /// Requests dispatched to server handlers.
    pub requests_dispatched: u64,
    /// Requests a server handler rejected.
    pub handler_errors: u64,
    /// Responses written by the server.
    pub responses_sent: u64,
    /// Data frames written to sockets.
    pub frames_sent: u64,
    /// Bytes written to sockets.
    pub bytes_sent: u64,
    /// Data frames read from sockets.
    pub frames_received: u64,
    /// Bytes read from sockets.
    pub bytes_received: u64,
    /// Committed frames discarded because no channel could carry them.
    pub frames_dropped: u64,
    /// Claims that found the send buffer full.
    pub backpressure_events: u64,
    /// Channels that reached the connected state.
    pub channels_opened: u64,
    /// Channels that closed after connecting.
    pub channels_closed: u64,
}

impl MetricsSnapshot {
    /// Channels currently connected.
    pub fn open_channels(&self) -> u64 {
        self.channels_opened.saturating_sub(self.channels_closed)
    }
}

/// Counters shared by the tasks of one transport.
#[derive(Debug, Default)]
pub struct TransportMetrics {
    /// See [`MetricsSnapshot::requests_submitted`].
    pub requests_submitted: Counter,
    /// See [`MetricsSnapshot::requests_completed`].
    pub requests_completed: Counter,
    /// See [`MetricsSnapshot::requests_failed`].
    pub requests_failed: Counter,
    /// See [`MetricsSnapshot::request_timeouts`].
    pub request_timeouts: Counter,
    /// See [`MetricsSnapshot::request_retries`].
    pub request_retries: Counter,
    /// See [`MetricsSnapshot::late_responses`].
    pub late_responses: Counter,
    /// See [`MetricsSnapshot::requests_dispatched`].
    pub requests_dispatched: Counter,
    /// See [`MetricsSnapshot::handler_errors`].
    pub handler_errors: Counter,
    /// See [`MetricsSnapshot::responses_sent`].
    pub responses_sent: Counter,
    /// See [`MetricsSnapshot::frames_sent`].
    pub frames_sent: Counter,
    /// See [`MetricsSnapshot::bytes_sent`].
    pub bytes_sent: Counter,
    /// See [`MetricsSnapshot::frames_received`].
    pub frames_received: Counter,
    /// See [`MetricsSnapshot::bytes_received`].
    pub bytes_received: Counter,
    /// See [`MetricsSnapshot::frames_dropped`].
    pub frames_dropped: Counter,
    /// See [`MetricsSnapshot::backpressure_events`].
    pub backpressure_events: Counter,
    /// See [`MetricsSnapshot::channels_opened`].
    pub channels_opened: Counter,
    /// See [`MetricsSnapshot::channels_closed`].
    pub channels_closed: Counter,
}

impl TransportMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one data frame written to a socket.
    pub fn frame_sent(&self, len: usize) {
        self.frames_sent.inc();
        self.bytes_sent.add(len as u64);
    }

    /// Records one data frame read from a socket.
    pub fn frame_received(&self, len: usize) {
        self.frames_received.inc();
        self.bytes_received.add(len as u64);
    }

    /// Takes a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_submitted: self.requests_submitted.get(),
            requests_completed: self.requests_completed.get(),
            requests_failed: self.requests_failed.get(),
            request_timeouts: self.request_timeouts.get(),
            request_retries: self.request_retries.get(),
            late_responses: self.late_responses.get(),
            requests_dispatched: self.requests_dispatched.get(),
            handler_errors: self.handler_errors.get(),
            responses_sent: self.responses_sent.get(),
            frames_sent: self.frames_sent.get(),
            bytes_sent: self.bytes_sent.get(),
            frames_received: self.frames_received.get(),
            bytes_received: self.bytes_received.get(),
            frames_dropped: self.frames_dropped.get(),
            backpressure_events: self.backpressure_events.get(),
            channels_opened: self.channels_opened.get(),
            channels_closed: self.channels_closed.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = TransportMetrics::new();
        metrics.requests_submitted.inc();
        metrics.request_retries.add(3);
        metrics.frame_sent(18);
        metrics.frame_sent(10);
        metrics.frame_received(7);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_submitted, 1);
        assert_eq!(snapshot.request_retries, 3);
        assert_eq!(snapshot.frames_sent, 2);
        assert_eq!(snapshot.bytes_sent, 28);
        assert_eq!(snapshot.frames_received, 1);
        assert_eq!(snapshot.bytes_received, 7);
    }

    #[test]
    fn test_open_channels() {
        let metrics = TransportMetrics::new();
        metrics.channels_opened.add(3);
        metrics.channels_closed.inc();
        assert_eq!(metrics.snapshot().open_channels(), 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = TransportMetrics::new();
        metrics.late_responses.inc();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["late_responses"], 1);
        assert_eq!(json["frames_dropped"], 0);
    }

    #[test]
    fn test_concurrent_increments() {
        let metrics = Arc::new(TransportMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.requests_completed.inc();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.snapshot().requests_completed, 4000);
    }
}
