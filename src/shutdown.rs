//! Graceful-shutdown coordination.
//!
//! The supervisor flips a watch channel when a termination signal arrives;
//! every socket loop holds a receiver and a guard. New upgrades are refused
//! once shutdown is in progress, and the supervisor waits for guards to
//! drop (bounded by the shutdown grace period) before force-terminating.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

/// Held by each active connection; dropping it decrements the drain count.
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            active: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    /// Register a connection. Returns a guard (hold it for the connection's
    /// lifetime) and a receiver that flips to `true` at shutdown.
    pub fn register(&self) -> (ConnectionGuard, watch::Receiver<bool>) {
        self.active.fetch_add(1, Ordering::SeqCst);
        (
            ConnectionGuard {
                active: self.active.clone(),
                drained: self.drained.clone(),
            },
            self.tx.subscribe(),
        )
    }

    /// Signal shutdown to every registered connection.
    pub fn begin(&self) {
        let _ = self.tx.send(true);
    }

    pub fn in_progress(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait until every guard is dropped, or `grace` elapses.
    /// Returns `true` when fully drained.
    pub async fn wait_for_drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        while self.active.load(Ordering::SeqCst) > 0 {
            let notified = self.drained.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return self.active.load(Ordering::SeqCst) == 0;
                }
            }
        }
        true
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn begin_flips_receivers() {
        let shutdown = ShutdownCoordinator::new();
        let (_guard, mut rx) = shutdown.register();
        assert!(!shutdown.in_progress());

        shutdown.begin();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(shutdown.in_progress());
    }

    #[tokio::test]
    async fn guards_track_active_connections() {
        let shutdown = ShutdownCoordinator::new();
        assert_eq!(shutdown.active_connections(), 0);
        let (g1, _) = shutdown.register();
        let (g2, _) = shutdown.register();
        assert_eq!(shutdown.active_connections(), 2);
        drop(g1);
        assert_eq!(shutdown.active_connections(), 1);
        drop(g2);
        assert_eq!(shutdown.active_connections(), 0);
    }

    #[tokio::test]
    async fn drain_returns_immediately_when_idle() {
        let shutdown = ShutdownCoordinator::new();
        assert!(shutdown.wait_for_drain(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn drain_waits_for_guard_drop() {
        let shutdown = ShutdownCoordinator::new();
        let (guard, _) = shutdown.register();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for_drain(Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn drain_times_out_with_held_guard() {
        let shutdown = ShutdownCoordinator::new();
        let (_guard, _) = shutdown.register();
        assert!(!shutdown.wait_for_drain(Duration::from_millis(30)).await);
    }
}
