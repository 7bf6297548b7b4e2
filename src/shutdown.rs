//! Shutdown coordination for the core's background tasks.
//!
//! The request consumer, the response consumer and the configuration follower all run
//! until the coordinator fires. Tasks register their join handles so a disconnect can
//! wait for them to drain.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Maximum time to wait for background tasks to drain.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shutdown coordinator for the core's background tasks.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    /// Watch channel for checking if shutdown is in progress.
    shutdown_watch: watch::Receiver<bool>,
    shutdown_watch_tx: Arc<watch::Sender<bool>>,
    is_shutting_down: Arc<AtomicBool>,
    /// Registered background tasks.
    tasks: Arc<Mutex<Vec<(String, JoinHandle<()>)>>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    /// Create a new shutdown coordinator with custom drain timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let (shutdown_watch_tx, shutdown_watch) = watch::channel(false);

        Self {
            shutdown_watch,
            shutdown_watch_tx: Arc::new(shutdown_watch_tx),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            tasks: Arc::new(Mutex::new(Vec::new())),
            timeout,
        }
    }

    /// Check if shutdown is in progress.
    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Initiate shutdown. Only the first call has an effect.
    pub fn shutdown(&self) -> bool {
        if self
            .is_shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Initiating core shutdown");
            let _ = self.shutdown_watch_tx.send(true);
            true
        } else {
            false
        }
    }

    /// Wait for the shutdown signal (for use in select! macros).
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_watch.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Track a background task so [`drain`](Self::drain) can wait for it.
    pub fn register(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        let name = name.into();
        debug!(task = %name, "Registered background task");
        self.tasks.lock().push((name, handle));
    }

    /// Wait for all registered tasks to finish, up to the drain timeout.
    ///
    /// Returns `false` if the timeout elapsed first.
    pub async fn drain(&self) -> bool {
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        let count = tasks.len();

        let all = async {
            for (name, handle) in tasks {
                if let Err(e) = handle.await {
                    warn!(task = %name, error = %e, "Background task ended abnormally");
                }
            }
        };

        if tokio::time::timeout(self.timeout, all).await.is_err() {
            warn!(timeout = ?self.timeout, "Background tasks did not drain in time");
            false
        } else {
            debug!(count, "Background tasks drained");
            true
        }
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
    async fn test_shutdown_coordinator_shutdown() {
        let coordinator = ShutdownCoordinator::new();

        assert!(!coordinator.is_shutting_down());
        assert!(coordinator.shutdown());
        assert!(coordinator.is_shutting_down());
        assert!(!coordinator.shutdown());
    }

    #[tokio::test]
    async fn test_wait_for_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        let waiter = coordinator.clone();
        let waiting = tokio::spawn(async move { waiter.wait_for_shutdown().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiting.is_finished());

        coordinator.shutdown();
        let result = tokio::time::timeout(Duration::from_millis(100), waiting).await;
        assert!(result.is_ok());

        // Already shut down: returns immediately.
        coordinator.wait_for_shutdown().await;
    }

    #[tokio::test]
    async fn test_drain_waits_for_tasks() {
        let coordinator = ShutdownCoordinator::new();
        let waiter = coordinator.clone();
        coordinator.register(
            "waiter",
            tokio::spawn(async move { waiter.wait_for_shutdown().await }),
        );

        coordinator.shutdown();
        assert!(coordinator.drain().await);
    }

    #[tokio::test]
    async fn test_drain_times_out() {
        let coordinator = ShutdownCoordinator::with_timeout(Duration::from_millis(20));
        coordinator.register(
            "stuck",
            tokio::spawn(async { tokio::time::sleep(Duration::from_secs(10)).await }),
        );

        assert!(!coordinator.drain().await);
    }
}
