//! Shutdown signalling and the throttled sleep every role loop runs on.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Latching shutdown signal shared by all roles
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `trigger` has been called, including before this call
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-interval pause that doubles as the loop cancellation point
#[derive(Clone)]
pub struct Throttle {
    interval: Duration,
    shutdown: Shutdown,
}

impl Throttle {
    pub fn new(interval: Duration, shutdown: Shutdown) -> Self {
        Self { interval, shutdown }
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Sleep one interval. Returns `false` when the loop should stop.
    pub async fn sleep(&self) -> bool {
        if self.shutdown.is_triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.interval) => !self.shutdown.is_triggered(),
            _ = self.shutdown.wait() => false,
        }
    }
}
