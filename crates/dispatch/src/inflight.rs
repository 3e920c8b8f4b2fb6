use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Counts background dispatch tasks so shutdown can wait for them.
#[derive(Clone, Default)]
pub struct InflightTracker {
    count: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

pub struct InflightGuard {
    count: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl InflightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> InflightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InflightGuard {
            count: self.count.clone(),
            idle: self.idle.clone(),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolves once no guard is alive.
    pub async fn wait_idle(&self) {
        loop {
            // Register before checking so a concurrent drop can't be missed.
            let notified = self.idle.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}
