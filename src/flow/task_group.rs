//! Lifetime-scoped execution context.
//!
//! A [`TaskGroup`] is created when the database initializes and cancelled
//! when it closes. Background tasks spawned through it stop at their next
//! suspension point after cancellation. Blocking work (SQLite calls) is
//! tracked but never interrupted.

use std::future::Future;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Handle to the database's background execution context.
#[derive(Clone, Debug)]
pub struct TaskGroup {
    handle: Handle,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl TaskGroup {
    /// Create a task group that schedules work on `handle`.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// The runtime this group schedules on.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn a cancellable background task.
    ///
    /// Returns `None` when the group is already cancelled.
    pub fn spawn<F>(&self, future: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            return None;
        }
        let token = self.token.clone();
        Some(self.tracker.spawn_on(
            async move {
                tokio::select! {
                    biased;
                    () = token.cancelled() => {}
                    () = future => {}
                }
            },
            &self.handle,
        ))
    }

    /// Spawn a task that runs to completion even if the group is cancelled
    /// meanwhile.
    ///
    /// Dropping the returned handle detaches the task; it keeps running.
    pub fn spawn_uninterrupted<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn_on(future, &self.handle)
    }

    /// Run blocking work on the runtime's blocking pool.
    ///
    /// Blocking work is not cancelled by [`TaskGroup::cancel`].
    pub fn spawn_blocking<F, R>(&self, work: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.tracker.spawn_blocking_on(work, &self.handle)
    }

    /// Cancel background tasks and refuse new ones.
    pub fn cancel(&self) {
        self.token.cancel();
        self.tracker.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
