//! Wall-clock deadline timers.
//!
//! Deadlines are user-facing wall-clock instants. Each arm converts the
//! deadline into a sleep relative to the clock's current time, so re-arming
//! after a restart or a clock change recomputes from "now".

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tokio::task::AbortHandle;

use super::clock::Clock;

/// Handle to an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Set of pending deadline timers backed by tokio sleep tasks.
pub struct TimerWheel {
    clock: Arc<dyn Clock>,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<TimerId, AbortHandle>>>,
}

impl TimerWheel {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            next_id: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `task` once `deadline` is reached. A deadline in the past fires
    /// immediately.
    ///
    /// The timer leaves the pending set before `task` starts, so `task` may
    /// itself cancel or re-arm timers without aborting itself.
    pub fn arm<F>(&self, deadline: DateTime<Local>, task: F) -> TimerId
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let delay = (deadline - self.clock.now()).to_std().unwrap_or_default();
        let pending = Arc::clone(&self.pending);

        // the lock is held until the handle is registered, so a zero delay
        // cannot remove the entry before it exists
        let mut guard = self.pending.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pending.lock().remove(&id);
            task.await;
        });
        guard.insert(id, handle.abort_handle());
        id
    }

    /// Cancel one timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&self, id: TimerId) -> bool {
        match self.pending.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, handle) in self.pending.lock().drain() {
            handle.abort();
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
