//! Background timeout sweeper.
//!
//! One task per table. It sleeps until the earliest pending deadline,
//! cancels whatever has expired, and goes back to sleep until the next
//! deadline. With nothing pending it parks on the table's `Notify` until a
//! new call is registered.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::PendingTable;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Timeout settings for a [`PendingTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    /// How long a call may wait for its reply. `None` disables timeouts,
    /// which is useful while stepping through the peer in a debugger.
    pub timeout: Option<Duration>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Self::DEFAULT_TIMEOUT),
        }
    }
}

impl SweepConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Smallest timeout the sweeper accepts.
    pub const MIN_TIMEOUT: Duration = Duration::from_millis(1);

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    /// No timeouts at all.
    pub fn disabled() -> Self {
        Self { timeout: None }
    }

    /// Clamps out-of-range values. A zero timeout would expire every call
    /// before it could be sent, so it is raised to [`Self::MIN_TIMEOUT`].
    pub fn validated(mut self) -> Self {
        if let Some(timeout) = self.timeout {
            if timeout < Self::MIN_TIMEOUT {
                warn!(?timeout, min = ?Self::MIN_TIMEOUT, "call timeout too small, clamping");
                self.timeout = Some(Self::MIN_TIMEOUT);
            }
        }
        self
    }
}

// ---------------------------------------------------------------------------
// TimeoutSweeper
// ---------------------------------------------------------------------------

/// Handle to a running sweeper task. Dropping it stops the task.
pub struct TimeoutSweeper {
    handle: JoinHandle<()>,
}

impl TimeoutSweeper {
    /// Spawns a sweeper for `table` on the current Tokio runtime.
    ///
    /// Returns `None` if the table has timeouts disabled; there is nothing
    /// to sweep.
    pub fn spawn(table: Arc<PendingTable>) -> Option<Self> {
        let timeout = table.config().timeout?;
        debug!(?timeout, "timeout sweeper started");
        let handle = tokio::spawn(run(table));
        Some(Self { handle })
    }

    /// Stops the sweeper. Pending calls are left as they are.
    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TimeoutSweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(table: Arc<PendingTable>) {
    loop {
        // Arm the wakeup before sweeping so a registration that lands
        // between the sweep and the wait is not missed.
        let changed = table.changed.notified();
        tokio::pin!(changed);
        changed.as_mut().enable();

        let sweep = table.sweep_expired(Instant::now());
        if !sweep.expired.is_empty() {
            debug!(count = sweep.expired.len(), "sweeper cancelled expired calls");
        }

        match sweep.next_deadline {
            Some(deadline) => {
                tokio::select! {
                    () = sleep_until(deadline) => {}
                    () = &mut changed => {}
                }
            }
            None => changed.await,
        }
    }
}
