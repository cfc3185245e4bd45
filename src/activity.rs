//! Session activity tracking.
//!
//! Every byte in either direction touches the tracker; the idle timer is a
//! single task that waits for the idle window to elapse since the last
//! touch, recomputing its deadline whenever activity arrives instead of
//! re-arming a timer per byte.

use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct ActivityTracker {
    tx: std::sync::Arc<watch::Sender<Instant>>,
}

impl ActivityTracker {
    /// Create a tracker seeded with the current instant.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Instant::now());
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Record activity. Safe to call from blocking threads.
    pub fn touch(&self) {
        self.tx.send_replace(Instant::now());
    }

    /// Instant of the most recent activity.
    pub fn last(&self) -> Instant {
        *self.tx.borrow()
    }

    /// Resolve once `timeout` has elapsed with no activity.
    ///
    /// Each touch resets the remaining wait. The double-check after the
    /// sleep closes the window where a touch lands between the sleep
    /// completing and this task running.
    pub async fn idle_elapsed(&self, timeout: Duration) {
        let mut rx = self.tx.subscribe();
        loop {
            let last = *rx.borrow_and_update();
            let elapsed = last.elapsed();
            if elapsed >= timeout {
                return;
            }
            let remaining = timeout - elapsed;
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {
                    let last = *rx.borrow_and_update();
                    if last.elapsed() >= timeout {
                        return;
                    }
                }
                res = rx.changed() => {
                    if res.is_err() {
                        // Sender dropped; the session is going away.
                        return;
                    }
                }
            }
        }
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}
