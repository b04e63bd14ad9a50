//! Close barrier for asynchronous database users.
//!
//! Uses a single `AtomicU64` for lock-free accounting: the high bit records
//! that close was requested, the remaining bits count active users. The
//! close action runs exactly once, when the closed bit is set and the count
//! is zero.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const CLOSED: u64 = 1 << 63;
const COUNT_MASK: u64 = CLOSED - 1;

type OnClosed = Box<dyn FnOnce() + Send>;

/// Reference-counted guard that defers teardown until every user exits.
pub struct CloseBarrier {
    state: AtomicU64,
    on_closed: Mutex<Option<OnClosed>>,
}

impl CloseBarrier {
    /// Create a barrier that runs `on_closed` once it is closed and drained.
    pub fn new<F>(on_closed: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            state: AtomicU64::new(0),
            on_closed: Mutex::new(Some(Box::new(on_closed))),
        }
    }

    /// Register an active user.
    ///
    /// Returns false if the barrier is already closed; the caller must not
    /// call [`CloseBarrier::exit`] in that case.
    pub fn enter(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::SeqCst);
            if current & CLOSED != 0 {
                return false;
            }
            debug_assert!(current & COUNT_MASK < COUNT_MASK, "barrier count overflow");
            if self
                .state
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
            // CAS failed, retry
        }
    }

    /// Unregister a user previously admitted by [`CloseBarrier::enter`].
    pub fn exit(&self) {
        let previous = self.state.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous & COUNT_MASK > 0, "exit without matching enter");
        if previous == CLOSED | 1 {
            self.fire();
        }
    }

    /// Enter the barrier and return a guard that exits on drop.
    ///
    /// The guard owns a reference to the barrier so it can travel into
    /// spawned or blocking work.
    pub fn guard(self: &Arc<Self>) -> Option<BarrierGuard> {
        self.enter().then(|| BarrierGuard {
            barrier: Arc::clone(self),
        })
    }

    /// Request close.
    ///
    /// Runs the close action immediately when no user is active, otherwise
    /// when the last user exits. Calls after the first are no-ops.
    pub fn close(&self) {
        let previous = self.state.fetch_or(CLOSED, Ordering::SeqCst);
        if previous & CLOSED != 0 {
            return;
        }
        if previous & COUNT_MASK == 0 {
            self.fire();
        }
    }

    /// Whether close was requested.
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) & CLOSED != 0
    }

    /// Number of users currently inside the barrier.
    pub fn active(&self) -> u64 {
        self.state.load(Ordering::SeqCst) & COUNT_MASK
    }

    fn fire(&self) {
        let action = self
            .on_closed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(action) = action {
            tracing::debug!("Close barrier drained, running close action");
            action();
        }
    }
}

impl std::fmt::Debug for CloseBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseBarrier")
            .field("closed", &self.is_closed())
            .field("active", &self.active())
            .finish()
    }
}

/// Scope of one barrier user. Exits the barrier when dropped.
#[must_use = "dropping the guard exits the barrier immediately"]
pub struct BarrierGuard {
    barrier: Arc<CloseBarrier>,
}

impl BarrierGuard {
    /// Another guard on the same barrier.
    ///
    /// Never fails: while this guard lives the barrier cannot drain, even if
    /// close was already requested.
    pub fn share(&self) -> BarrierGuard {
        let previous = self.barrier.state.fetch_add(1, Ordering::SeqCst);
        debug_assert!(previous & COUNT_MASK > 0, "share without a live guard");
        BarrierGuard {
            barrier: Arc::clone(&self.barrier),
        }
    }
}

impl Drop for BarrierGuard {
    fn drop(&mut self) {
        self.barrier.exit();
    }
}
