//! Concurrency limiter with a bounded wait queue.

use http::StatusCode;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::ratelimit::LimitPolicy;

/// Queue length below which abandoned waiters are left for hand-off to skip.
const MIN_PRUNE_LEN: usize = 16;

/// Why a request was not admitted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("too many concurrent requests and the wait queue is full")]
    QueueFull,

    #[error("timed out waiting for a free request slot")]
    QueueTimeout,

    #[error("request queue was closed")]
    Closed,
}

#[derive(Debug)]
struct State {
    active: usize,
    max: usize,
    /// `None` means unbounded
    queue_size: Option<usize>,
    queue_timeout: Option<Duration>,
    enabled: bool,
    error_code: StatusCode,
    waiters: VecDeque<oneshot::Sender<AdmissionPermit>>,
    /// Queue length that triggers the next sweep of abandoned waiters
    prune_at: usize,
}

impl State {
    /// Drop waiters that timed out or were cancelled.
    fn prune_waiters(&mut self) {
        self.waiters.retain(|waiter| !waiter.is_closed());
        self.prune_at = (self.waiters.len() * 2).max(MIN_PRUNE_LEN);
    }

    fn live_waiters(&self) -> usize {
        self.waiters.iter().filter(|waiter| !waiter.is_closed()).count()
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
}

impl Shared {
    /// Give a finished request's slot to the oldest live waiter, or free it.
    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.active <= state.max && self.hand_off(&mut state) {
            return;
        }
        state.active = state.active.saturating_sub(1);
        trace!(active = state.active, "Request slot released");
    }

    /// Pass a permit to the first waiter still listening. The slot stays
    /// occupied, so `active` is unchanged on success.
    fn hand_off(self: &Arc<Self>, state: &mut State) -> bool {
        while let Some(waiter) = state.waiters.pop_front() {
            let permit = AdmissionPermit {
                shared: Some(self.clone()),
            };
            match waiter.send(permit) {
                Ok(()) => {
                    trace!(queued = state.waiters.len(), "Request slot handed to queued request");
                    return true;
                }
                Err(mut permit) => {
                    // Nobody owns this slot yet; dropping it must not release again.
                    permit.shared = None;
                    debug!("Skipping abandoned queued request");
                }
            }
        }
        false
    }
}

/// A claimed request slot. Dropping it releases the slot.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct AdmissionPermit {
    shared: Option<Arc<Shared>>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release();
        }
    }
}

impl fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("armed", &self.shared.is_some())
            .finish()
    }
}

/// Bounds the number of concurrently running requests.
///
/// Cloning is cheap and every clone shares the same slots and queue.
#[derive(Clone)]
pub struct RequestLimit {
    shared: Arc<Shared>,
}

impl RequestLimit {
    /// Allow `max` requests at once and queue up to `queue_size` more
    /// (`None` for an unbounded queue).
    pub fn new(max: usize, queue_size: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    active: 0,
                    max,
                    queue_size,
                    queue_timeout: None,
                    enabled: true,
                    error_code: StatusCode::SERVICE_UNAVAILABLE,
                    waiters: VecDeque::new(),
                    prune_at: MIN_PRUNE_LEN,
                }),
            }),
        }
    }

    /// Bound how long a queued request waits before giving up.
    pub fn with_queue_timeout(self, timeout: Duration) -> Self {
        self.shared.state.lock().queue_timeout = Some(timeout);
        self
    }

    pub fn from_policy(policy: &LimitPolicy) -> Self {
        let limit = Self::new(policy.concurrent_request, policy.queue_size);
        limit.reconfigure(policy);
        limit
    }

    /// Apply a new policy in place. Running and queued requests are kept.
    pub fn reconfigure(&self, policy: &LimitPolicy) {
        {
            let mut state = self.shared.state.lock();
            state.enabled = policy.enabled;
            state.error_code = policy.error_code;
            state.queue_timeout = policy.queue_timeout;
        }
        self.set_queue_size(policy.queue_size);
        self.set_max(policy.concurrent_request);
    }

    /// Change the concurrency cap.
    ///
    /// Raising it admits queued requests right away. Lowering it evicts
    /// nobody; the excess drains as running requests complete.
    pub fn set_max(&self, max: usize) {
        let mut state = self.shared.state.lock();
        state.max = max;
        while state.active < state.max && !state.waiters.is_empty() {
            if self.shared.hand_off(&mut state) {
                state.active += 1;
            }
        }
        debug!(max, active = state.active, queued = state.waiters.len(), "Request limit resized");
    }

    /// Change the queue bound. Requests already queued stay queued.
    pub fn set_queue_size(&self, queue_size: Option<usize>) {
        self.shared.state.lock().queue_size = queue_size;
    }

    /// Claim a slot, waiting in the queue if all slots are taken.
    pub async fn acquire(&self) -> Result<AdmissionPermit, AdmissionError> {
        let (mut receiver, timeout) = {
            let mut state = self.shared.state.lock();
            if state.active < state.max {
                state.active += 1;
                trace!(active = state.active, max = state.max, "Request admitted");
                return Ok(AdmissionPermit {
                    shared: Some(self.shared.clone()),
                });
            }

            if let Some(limit) = state.queue_size {
                if state.waiters.len() >= limit {
                    state.prune_waiters();
                }
                if state.waiters.len() >= limit {
                    debug!(active = state.active, queue_size = limit, "Request rejected, queue is full");
                    return Err(AdmissionError::QueueFull);
                }
            }
            if state.waiters.len() >= state.prune_at {
                state.prune_waiters();
            }

            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            debug!(active = state.active, queued = state.waiters.len(), "Request queued");
            (receiver, state.queue_timeout)
        };

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut receiver).await {
                Ok(received) => received,
                Err(_) => {
                    // A permit may have been sent just as the timer fired.
                    receiver.close();
                    return receiver.try_recv().map_err(|_| {
                        debug!(timeout_ms = limit.as_millis() as u64, "Queued request timed out");
                        AdmissionError::QueueTimeout
                    });
                }
            },
            None => receiver.await,
        };

        received.map_err(|_| AdmissionError::Closed)
    }

    /// Reject every queued request with [`AdmissionError::Closed`], returning
    /// how many were waiting.
    pub fn close_queue(&self) -> usize {
        let waiters = std::mem::take(&mut self.shared.state.lock().waiters);
        let closed = waiters.iter().filter(|waiter| !waiter.is_closed()).count();
        drop(waiters);
        if closed > 0 {
            debug!(closed, "Closed request queue");
        }
        closed
    }

    /// Requests currently holding a slot.
    pub fn active(&self) -> usize {
        self.shared.state.lock().active
    }

    /// Requests still waiting for a slot.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().live_waiters()
    }

    pub fn max(&self) -> usize {
        self.shared.state.lock().max
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.state.lock().enabled
    }

    pub fn error_code(&self) -> StatusCode {
        self.shared.state.lock().error_code
    }
}

impl fmt::Debug for RequestLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("RequestLimit")
            .field("active", &state.active)
            .field("max", &state.max)
            .field("queued", &state.live_waiters())
            .field("queue_size", &state.queue_size)
            .finish()
    }
}
