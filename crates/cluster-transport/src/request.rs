//! Client request management.
//!
//! A request holds a slot of the [`RequestPool`] from submission until it
//! is closed. Each slot yields request ids with a stride of the pool
//! capacity, so ids of outstanding requests never collide and a late
//! response for an earlier generation of a slot never matches a newer
//! request. [`PendingRequest::run`] drives one request through its attempts
//! until a response is accepted, a non-retryable failure occurs or the
//! deadline passes.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::error::{is_retryable, Attempt, AttemptHistory, Result, TransportError};
use crate::metrics::TransportMetrics;
use crate::routing::{NodeId, RequestTarget};

/// Picks the target of the next attempt. `None` means no target is known
/// yet; the request waits one retry delay and asks again.
pub type TargetResolver = Arc<dyn Fn() -> Option<RequestTarget> + Send + Sync>;

/// Inspects a response payload and decides whether the request is done.
pub type ResponseValidator = Arc<dyn Fn(&[u8]) -> ResponseAction + Send + Sync>;

/// Verdict of a [`ResponseValidator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
    /// Hand the response to the caller.
    Complete,
    /// Discard the response and try again.
    Retry,
}

/// Resolver that always returns `target`.
pub fn fixed_target(target: RequestTarget) -> TargetResolver {
    Arc::new(move || Some(target))
}

/// Validator that accepts every response.
pub fn accept_all() -> ResponseValidator {
    Arc::new(|_: &[u8]| ResponseAction::Complete)
}

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Resolving a target and writing the request.
    Submitting,
    /// Written; waiting for the correlated response.
    AwaitingResponse,
    /// A response was accepted.
    Resolved,
    /// The deadline passed.
    TimedOut,
    /// A non-retryable error ended the request.
    Failed,
    /// The slot was returned to the pool.
    Closed,
}

const SLOT_IN_USE: u64 = 1;

/// Per-slot state word: `generation << 1 | in_use`.
struct PoolInner {
    capacity: usize,
    slots: Box<[AtomicU64]>,
}

impl PoolInner {
    fn request_id(&self, index: usize, generation: u64) -> u64 {
        generation * self.capacity as u64 + index as u64
    }

    fn release(&self, index: usize, request_id: u64) -> Result<()> {
        let generation = request_id / self.capacity as u64;
        let taken = generation << 1 | SLOT_IN_USE;
        self.slots[index]
            .compare_exchange(taken, (generation + 1) << 1, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| TransportError::DoubleRelease { request_id })
    }
}

/// Fixed-size pool of request slots.
///
/// Acquire and release are single compare-and-swap operations on the slot
/// state, so callers on any task share the pool without a lock.
#[derive(Clone)]
pub struct RequestPool {
    inner: Arc<PoolInner>,
}

impl RequestPool {
    /// Creates a pool of `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                slots: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            }),
        }
    }

    /// Takes a free slot, lowest index first.
    pub fn acquire(&self) -> Result<RequestSlot> {
        for (index, slot) in self.inner.slots.iter().enumerate() {
            let mut state = slot.load(Ordering::Acquire);
            while state & SLOT_IN_USE == 0 {
                match slot.compare_exchange_weak(
                    state,
                    state | SLOT_IN_USE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        return Ok(RequestSlot {
                            pool: Arc::clone(&self.inner),
                            index,
                            request_id: self.inner.request_id(index, state >> 1),
                            released: false,
                        });
                    }
                    Err(actual) => state = actual,
                }
            }
        }
        Err(TransportError::RequestPoolExhausted {
            capacity: self.inner.capacity,
        })
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of slots currently taken.
    pub fn in_use(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|slot| slot.load(Ordering::Acquire) & SLOT_IN_USE != 0)
            .count()
    }
}

impl fmt::Debug for RequestPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPool")
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// A taken pool slot. Returned to the pool on drop if not released before.
pub struct RequestSlot {
    pool: Arc<PoolInner>,
    index: usize,
    request_id: u64,
    released: bool,
}

impl RequestSlot {
    /// The request id of this generation of the slot.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Returns the slot to the pool. A second release fails with
    /// [`TransportError::DoubleRelease`].
    pub fn release(&mut self) -> Result<()> {
        self.pool.release(self.index, self.request_id)?;
        self.released = true;
        Ok(())
    }
}

impl Drop for RequestSlot {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.pool.release(self.index, self.request_id);
        }
    }
}

impl fmt::Debug for RequestSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSlot")
            .field("request_id", &self.request_id)
            .field("released", &self.released)
            .finish()
    }
}

/// An accepted response.
#[derive(Debug, Clone)]
pub struct ClientResponse {
    /// Id the request was sent with.
    pub request_id: u64,
    /// Node that answered.
    pub node_id: NodeId,
    /// Address of the node that answered.
    pub remote: SocketAddr,
    /// Response payload.
    pub payload: Bytes,
    /// Targets tried, oldest first; the last one answered.
    pub attempts: AttemptHistory,
}

/// Delivers single attempts of a request.
#[async_trait]
pub trait AttemptSender: Send + Sync {
    /// Returns the address of `node_id`, or `None` if the node is unknown.
    fn resolve(&self, node_id: NodeId) -> Option<SocketAddr>;

    /// Returns true once the sender was shut down; requests then fail with
    /// [`TransportError::TransportClosed`].
    fn is_closed(&self) -> bool {
        false
    }

    /// Sends one attempt and waits for its response payload.
    async fn send_attempt(
        &self,
        request_id: u64,
        target: RequestTarget,
        address: SocketAddr,
        payload: &Bytes,
    ) -> Result<Bytes>;
}

/// Timing of the attempts of one request.
#[derive(Debug, Clone, Copy)]
pub struct RequestTiming {
    /// Overall deadline, measured from submission.
    pub timeout: Duration,
    /// Delay between attempts.
    pub retry_delay: Duration,
}

/// State of one in-flight request, owned by the task that drives it.
pub struct PendingRequest {
    slot: RequestSlot,
    resolver: TargetResolver,
    validator: ResponseValidator,
    payload: Bytes,
    timing: RequestTiming,
    deadline: Instant,
    state: RequestState,
    attempts: AttemptHistory,
}

impl PendingRequest {
    /// Creates a request; the deadline starts now.
    pub fn new(
        slot: RequestSlot,
        resolver: TargetResolver,
        validator: ResponseValidator,
        payload: Bytes,
        timing: RequestTiming,
    ) -> Self {
        Self {
            slot,
            resolver,
            validator,
            payload,
            deadline: Instant::now() + timing.timeout,
            timing,
            state: RequestState::Submitting,
            attempts: AttemptHistory::new(),
        }
    }

    /// The request id.
    pub fn request_id(&self) -> u64 {
        self.slot.request_id()
    }

    /// The current state.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Drives the request to completion and releases its slot.
    pub async fn run<S: AttemptSender + ?Sized>(
        mut self,
        sender: &S,
        metrics: &TransportMetrics,
    ) -> Result<ClientResponse> {
        let request_id = self.request_id();
        let outcome = timeout_at(self.deadline, self.attempt_until_done(sender, metrics)).await;

        let result = match outcome {
            Ok(Ok((target, remote, payload))) => {
                self.transition(RequestState::Resolved);
                metrics.requests_completed.inc();
                Ok(ClientResponse {
                    request_id,
                    node_id: target.node_id,
                    remote,
                    payload,
                    attempts: self.attempts.clone(),
                })
            }
            Ok(Err(e)) => {
                self.transition(RequestState::Failed);
                metrics.requests_failed.inc();
                debug!(request_id, error = %e, "request failed");
                Err(e)
            }
            Err(_) => {
                self.transition(RequestState::TimedOut);
                metrics.request_timeouts.inc();
                debug!(request_id, attempts = %self.attempts, "request timed out");
                Err(TransportError::RequestTimeout {
                    request_id,
                    timeout: self.timing.timeout,
                    attempts: self.attempts.clone(),
                })
            }
        };

        if let Err(e) = self.slot.release() {
            warn!(request_id, error = %e, "request slot already released");
        }
        self.transition(RequestState::Closed);
        result
    }

    async fn attempt_until_done<S: AttemptSender + ?Sized>(
        &mut self,
        sender: &S,
        metrics: &TransportMetrics,
    ) -> Result<(RequestTarget, SocketAddr, Bytes)> {
        let request_id = self.request_id();
        loop {
            if sender.is_closed() {
                return Err(TransportError::TransportClosed);
            }
            self.transition(RequestState::Submitting);
            let resolved = (self.resolver)()
                .and_then(|target| sender.resolve(target.node_id).map(|addr| (target, addr)));
            let Some((target, address)) = resolved else {
                trace!(request_id, "no target available, waiting");
                sleep(self.timing.retry_delay).await;
                continue;
            };

            if !self.attempts.is_empty() {
                metrics.request_retries.inc();
            }
            self.attempts.record(Attempt {
                node_id: target.node_id,
                address,
            });

            self.transition(RequestState::AwaitingResponse);
            match sender
                .send_attempt(request_id, target, address, &self.payload)
                .await
            {
                Ok(response) => match (self.validator)(&response) {
                    ResponseAction::Complete => return Ok((target, address, response)),
                    ResponseAction::Retry => {
                        trace!(request_id, node_id = %target.node_id, "response rejected by validator, retrying");
                    }
                },
                Err(e) if is_retryable(&e) => {
                    trace!(request_id, node_id = %target.node_id, error = %e, "attempt failed, retrying");
                }
                Err(e) => return Err(e),
            }
            sleep(self.timing.retry_delay).await;
        }
    }

    fn transition(&mut self, next: RequestState) {
        if self.state != next {
            trace!(request_id = self.request_id(), from = ?self.state, to = ?next, "request state");
            self.state = next;
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("request_id", &self.request_id())
            .field("state", &self.state)
            .field("attempts", &self.attempts.len())
            .finish()
    }
}

/// Future of a submitted request.
///
/// Dropping it does not cancel the request.
pub struct ResponseFuture {
    inner: ResponseInner,
}

enum ResponseInner {
    Ready(Option<Result<ClientResponse>>),
    Running(JoinHandle<Result<ClientResponse>>),
}

impl ResponseFuture {
    /// A future that resolves immediately with `result`.
    pub fn ready(result: Result<ClientResponse>) -> Self {
        Self {
            inner: ResponseInner::Ready(Some(result)),
        }
    }

    /// A future resolved by the task `handle`.
    pub fn spawned(handle: JoinHandle<Result<ClientResponse>>) -> Self {
        Self {
            inner: ResponseInner::Running(handle),
        }
    }
}

impl Future for ResponseFuture {
    type Output = Result<ClientResponse>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            ResponseInner::Ready(result) => match result.take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Ready(Err(TransportError::TransportClosed)),
            },
            ResponseInner::Running(handle) => match Pin::new(handle).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(TransportError::TransportClosed)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner {
            ResponseInner::Ready(_) => "ready",
            ResponseInner::Running(_) => "running",
        };
        f.debug_struct("ResponseFuture").field("state", &state).finish()
    }
}
