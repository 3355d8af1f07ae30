//! Bounded multi-producer send buffer.
//!
//! Producers [`claim`](SendBuffer::claim) capacity for one frame, write the
//! frame into the returned [`Claim`] and commit it. Capacity is taken with a
//! compare-and-swap on the used byte count; no lock is held while a producer
//! writes. Committed frames are drained in commit order by a single
//! [`SendBufferReceiver`]. A frame keeps its capacity reserved until the
//! drained [`CommittedFrame`] is dropped, i.e. after it was written to a socket
//! or discarded, so the capacity bounds in-flight bytes end to end.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

use crate::error::TransportError;
use crate::registry::StreamId;

/// Reasons a claim can fail.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ClaimError {
    /// The buffer is full; retry after capacity is released.
    #[error("send buffer has no room for {length} bytes")]
    InsufficientCapacity {
        /// Requested frame length.
        length: usize,
    },

    /// The buffer was closed; no further claims succeed.
    #[error("send buffer closed")]
    Closed,

    /// The frame can never fit.
    #[error("frame of {length} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Requested frame length.
        length: usize,
        /// Largest frame the buffer accepts.
        max: usize,
    },
}

impl ClaimError {
    /// Returns true if the claim may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClaimError::InsufficientCapacity { .. })
    }
}

impl From<ClaimError> for TransportError {
    fn from(e: ClaimError) -> Self {
        match e {
            ClaimError::InsufficientCapacity { length } => {
                TransportError::SendBufferFull { length }
            }
            ClaimError::Closed => TransportError::TransportClosed,
            ClaimError::FrameTooLarge { length, max } => TransportError::PayloadTooLarge {
                size: length,
                max_size: max,
            },
        }
    }
}

struct Shared {
    capacity: usize,
    max_frame_length: usize,
    used: AtomicUsize,
    closed: AtomicBool,
    committing: AtomicUsize,
    released: Notify,
    drain_wakeup: Notify,
    queue: mpsc::UnboundedSender<CommittedFrame>,
}

impl Shared {
    fn release(&self, length: usize) {
        self.used.fetch_sub(length, Ordering::AcqRel);
        self.released.notify_waiters();
    }
}

/// Producer handle of the send buffer. Cheap to clone.
#[derive(Clone)]
pub struct SendBuffer {
    shared: Arc<Shared>,
}

impl SendBuffer {
    /// Creates a buffer of `capacity` bytes accepting frames of at most
    /// `max_frame_length` bytes.
    pub fn new(capacity: usize, max_frame_length: usize) -> (SendBuffer, SendBufferReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            capacity,
            max_frame_length: max_frame_length.min(capacity),
            used: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            committing: AtomicUsize::new(0),
            released: Notify::new(),
            drain_wakeup: Notify::new(),
            queue: tx,
        });
        let receiver = SendBufferReceiver {
            shared: Arc::clone(&shared),
            rx,
        };
        (SendBuffer { shared }, receiver)
    }

    /// Reserves `length` bytes for a frame destined for `stream_id`.
    pub fn claim(&self, length: usize, stream_id: StreamId) -> Result<Claim, ClaimError> {
        if self.is_closed() {
            return Err(ClaimError::Closed);
        }
        let max = self.shared.max_frame_length;
        if length > max {
            return Err(ClaimError::FrameTooLarge { length, max });
        }

        let capacity = self.shared.capacity;
        let mut used = self.shared.used.load(Ordering::Acquire);
        loop {
            if used + length > capacity {
                return Err(ClaimError::InsufficientCapacity { length });
            }
            match self.shared.used.compare_exchange_weak(
                used,
                used + length,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => used = actual,
            }
        }

        Ok(Claim {
            stream_id,
            buf: BytesMut::zeroed(length),
            lease: CapacityLease {
                shared: Arc::clone(&self.shared),
                length,
            },
        })
    }

    /// Waits until at least `length` bytes are free or the buffer is closed.
    ///
    /// A free byte count observed here is not reserved; the caller still has
    /// to claim and may lose the race to another producer.
    pub async fn wait_for_capacity(&self, length: usize) {
        loop {
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() || self.available() >= length {
                return;
            }
            notified.await;
        }
    }

    /// Waits for the next release of capacity, or returns at once if closed.
    pub async fn capacity_released(&self) {
        let notified = self.shared.released.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Closes the buffer. Later claims fail; the receiver drains what was
    /// committed and then ends.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.drain_wakeup.notify_one();
            self.shared.released.notify_waiters();
        }
    }

    /// Returns true once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Bytes currently claimed or committed but not yet released.
    pub fn used(&self) -> usize {
        self.shared.used.load(Ordering::Acquire)
    }

    /// Bytes that can currently be claimed.
    pub fn available(&self) -> usize {
        self.shared.capacity.saturating_sub(self.used())
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Largest frame that can be claimed.
    pub fn max_frame_length(&self) -> usize {
        self.shared.max_frame_length
    }
}

impl fmt::Debug for SendBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendBuffer")
            .field("capacity", &self.shared.capacity)
            .field("used", &self.used())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Capacity held by a claim or a committed frame; returned on drop.
struct CapacityLease {
    shared: Arc<Shared>,
    length: usize,
}

impl Drop for CapacityLease {
    fn drop(&mut self) {
        self.shared.release(self.length);
    }
}

/// A reservation of send-buffer space for one frame.
///
/// Dropping a claim without committing it aborts it.
pub struct Claim {
    stream_id: StreamId,
    buf: BytesMut,
    lease: CapacityLease,
}

impl Claim {
    /// Stream the frame will be written to.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Length of the reserved region.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true for a zero-length claim.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The writable region, exactly as long as the claim.
    pub fn region(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }

    /// Publishes the frame to the drainer.
    ///
    /// Fails with [`ClaimError::Closed`] if the buffer was closed since the
    /// claim was taken; the capacity is released in that case.
    pub fn commit(self) -> Result<(), ClaimError> {
        let shared = Arc::clone(&self.lease.shared);
        // Counted before the closed check so a closing drainer waits for it.
        shared.committing.fetch_add(1, Ordering::SeqCst);
        let result = if shared.closed.load(Ordering::SeqCst) {
            Err(ClaimError::Closed)
        } else {
            let frame = CommittedFrame {
                stream_id: self.stream_id,
                bytes: self.buf.freeze(),
                _lease: self.lease,
            };
            shared.queue.send(frame).map_err(|_| ClaimError::Closed)
        };
        let last = shared.committing.fetch_sub(1, Ordering::SeqCst) == 1;
        if last && shared.closed.load(Ordering::SeqCst) {
            shared.drain_wakeup.notify_one();
        }
        result
    }

    /// Releases the reservation without publishing anything.
    pub fn abort(self) {}
}

impl fmt::Debug for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claim")
            .field("stream_id", &self.stream_id)
            .field("length", &self.lease.length)
            .finish()
    }
}

/// A committed frame taken off the buffer.
///
/// Its capacity is released when the frame is dropped.
pub struct CommittedFrame {
    stream_id: StreamId,
    bytes: Bytes,
    _lease: CapacityLease,
}

impl CommittedFrame {
    /// Stream the frame is destined for.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// The frame bytes, including the length prefix.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

impl fmt::Debug for CommittedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommittedFrame")
            .field("stream_id", &self.stream_id)
            .field("length", &self.bytes.len())
            .finish()
    }
}

/// Single consumer of committed frames.
pub struct SendBufferReceiver {
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<CommittedFrame>,
}

impl SendBufferReceiver {
    /// Returns the next committed frame in commit order.
    ///
    /// Returns `None` once the buffer is closed and drained.
    pub async fn next(&mut self) -> Option<CommittedFrame> {
        loop {
            let wakeup = self.shared.drain_wakeup.notified();
            tokio::pin!(wakeup);
            wakeup.as_mut().enable();

            if let Ok(frame) = self.rx.try_recv() {
                return Some(frame);
            }
            if self.shared.closed.load(Ordering::SeqCst)
                && self.shared.committing.load(Ordering::SeqCst) == 0
            {
                // Commits that passed the closed check have published by now.
                return self.rx.try_recv().ok();
            }
            tokio::select! {
                frame = self.rx.recv() => return frame,
                _ = wakeup => {}
            }
        }
    }

    /// Returns a committed frame if one is ready.
    pub fn try_next(&mut self) -> Option<CommittedFrame> {
        self.rx.try_recv().ok()
    }
}

impl fmt::Debug for SendBufferReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendBufferReceiver").finish_non_exhaustive()
    }
}
