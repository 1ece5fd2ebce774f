//! The pending-call table: host-issued calls waiting for a reply.
//!
//! Every call the host sends to the peer gets an entry here, keyed by its
//! correlation id. A reply resolves it, the sweeper times it out, or a
//! local cancellation evicts it: whichever comes first wins and the rest
//! become no-ops.
//!
//! ```text
//! register(id) ──→ [pending] ──┬── resolve / reject   (reply arrived)
//!                              ├── cancel             (token, drop, ready)
//!                              └── sweep_expired      (timeout)
//! ```
//!
//! # Single resolution
//!
//! Settling a call means removing it from the map. The map removal
//! happens under the table lock, so exactly one settler can win; the
//! losers find nothing to remove and report `false`.
//!
//! # Timeout queue
//!
//! Calls are also pushed, in creation order, onto a queue of weak
//! references. Because every call shares the same timeout, the front of
//! the queue is always the next one to expire. Entries whose call has
//! already settled simply fail to upgrade and are discarded when they
//! reach the front.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use serde_json::Value;
use tether_protocol::ExceptionBody;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;

use crate::{CallError, CancelReason, SweepConfig};

/// What a settled call produces: the reply body (absent for void), or
/// why there is none.
pub type CallResult = Result<Option<Value>, CallError>;

// ---------------------------------------------------------------------------
// PendingCall
// ---------------------------------------------------------------------------

/// One outstanding call. Owns the sending half of its result slot.
struct PendingCall {
    id: String,
    created: Instant,
    slot: Mutex<Option<oneshot::Sender<CallResult>>>,
}

impl PendingCall {
    /// Delivers the result. The receiver may already be gone (the caller
    /// dropped the future); that's fine.
    fn settle(&self, result: CallResult) {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }
}

// ---------------------------------------------------------------------------
// PendingTable
// ---------------------------------------------------------------------------

struct TableState {
    calls: HashMap<String, Arc<PendingCall>>,
    queue: VecDeque<Weak<PendingCall>>,
}

/// Result of one [`PendingTable::sweep_expired`] pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Sweep {
    /// Ids cancelled by this pass.
    pub expired: Vec<String>,
    /// When the next call will expire, if any is still pending.
    pub next_deadline: Option<Instant>,
}

/// Thread-safe table of pending calls.
pub struct PendingTable {
    state: Mutex<TableState>,
    /// Wakes the sweeper when the queue goes from empty to non-empty.
    pub(crate) changed: Notify,
    config: SweepConfig,
}

impl PendingTable {
    pub fn new(config: SweepConfig) -> Self {
        Self {
            state: Mutex::new(TableState {
                calls: HashMap::new(),
                queue: VecDeque::new(),
            }),
            changed: Notify::new(),
            config: config.validated(),
        }
    }

    /// The (validated) timeout configuration.
    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Registers a new pending call and returns the future that completes
    /// when it settles.
    ///
    /// Dropping the returned [`PendingResponse`] before it completes
    /// cancels the call.
    ///
    /// # Errors
    /// Returns [`CallError::DuplicateId`] if `id` is already pending.
    pub fn register(
        self: &Arc<Self>,
        id: impl Into<String>,
    ) -> Result<PendingResponse, CallError> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();

        let mut state = self.lock();
        if state.calls.contains_key(&id) {
            return Err(CallError::DuplicateId(id));
        }
        let call = Arc::new(PendingCall {
            id: id.clone(),
            created: Instant::now(),
            slot: Mutex::new(Some(tx)),
        });
        let wake_sweeper = if self.config.timeout.is_some() {
            let was_empty = state.queue.is_empty();
            state.queue.push_back(Arc::downgrade(&call));
            was_empty
        } else {
            false
        };
        state.calls.insert(id.clone(), call);
        drop(state);

        if wake_sweeper {
            self.changed.notify_one();
        }
        tracing::trace!(%id, "pending call registered");

        Ok(PendingResponse {
            id,
            rx,
            table: Arc::downgrade(self),
            done: false,
        })
    }

    /// Settles `id` with an arbitrary result. Returns `false` if the id
    /// was not pending (unknown, or already settled).
    pub fn settle(&self, id: &str, result: CallResult) -> bool {
        let Some(call) = self.lock().calls.remove(id) else {
            return false;
        };
        call.settle(result);
        true
    }

    /// Resolves `id` with the reply body.
    pub fn resolve(&self, id: &str, body: Option<Value>) -> bool {
        self.settle(id, Ok(body))
    }

    /// Rejects `id` with the peer's exception.
    pub fn reject(&self, id: &str, error: ExceptionBody) -> bool {
        self.settle(id, Err(CallError::Peer(error)))
    }

    /// Cancels `id`.
    pub fn cancel(&self, id: &str, reason: CancelReason) -> bool {
        let cancelled = self.settle(id, Err(CallError::Cancelled(reason)));
        if cancelled {
            tracing::debug!(%id, %reason, "pending call cancelled");
        }
        cancelled
    }

    /// Cancels every pending call. Returns how many were cancelled.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let drained: Vec<Arc<PendingCall>> = {
            let mut state = self.lock();
            state.queue.clear();
            state.calls.drain().map(|(_, call)| call).collect()
        };

        for call in &drained {
            call.settle(Err(CallError::Cancelled(reason)));
        }
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), %reason, "all pending calls cancelled");
        }
        drained.len()
    }

    /// Cancels every call older than the timeout as of `now`.
    ///
    /// Walks the queue from the front and stops at the first call that
    /// has not expired yet; its deadline is reported back so the sweeper
    /// knows when to look again.
    pub fn sweep_expired(&self, now: Instant) -> Sweep {
        let Some(timeout) = self.config.timeout else {
            return Sweep::default();
        };

        let mut expired = Vec::new();
        let mut next_deadline = None;
        {
            let mut state = self.lock();
            while let Some(front) = state.queue.front() {
                let Some(call) = front.upgrade() else {
                    state.queue.pop_front();
                    continue;
                };
                let deadline = call.created + timeout;
                if deadline > now {
                    next_deadline = Some(deadline);
                    break;
                }
                state.queue.pop_front();
                if let Some(call) = state.calls.remove(&call.id) {
                    expired.push(call);
                }
            }
        }

        for call in &expired {
            tracing::debug!(id = %call.id, "pending call timed out");
            call.settle(Err(CallError::Cancelled(CancelReason::TimedOut)));
        }

        Sweep {
            expired: expired.iter().map(|call| call.id.clone()).collect(),
            next_deadline,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().calls.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().calls.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new(SweepConfig::default())
    }
}

// ---------------------------------------------------------------------------
// PendingResponse
// ---------------------------------------------------------------------------

/// Future returned by [`PendingTable::register`].
///
/// Holds only a weak reference back to the table, so an abandoned call
/// never keeps the table alive.
pub struct PendingResponse {
    id: String,
    rx: oneshot::Receiver<CallResult>,
    table: Weak<PendingTable>,
    done: bool,
}

impl PendingResponse {
    /// The correlation id of this call.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingResponse {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<CallResult> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.done = true;
                // The sender only disappears without sending if the table
                // itself was torn down.
                Poll::Ready(
                    result.unwrap_or(Err(CallError::Cancelled(CancelReason::Shutdown))),
                )
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(table) = self.table.upgrade() {
            if table.settle(&self.id, Err(CallError::Cancelled(CancelReason::Explicit))) {
                tracing::debug!(id = %self.id, "pending call dropped by caller");
            }
        }
    }
}

// =========================================================================
// Tests
// =========================================================================
