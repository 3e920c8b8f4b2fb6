use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub deliveries_received: u64,
    pub deliveries_rejected: u64,
    pub events_accepted: u64,
    pub events_unknown: u64,
    pub events_skipped: u64,
    pub duplicates: u64,
    pub handler_failures: u64,
    pub send_attempts: u64,
    pub sends_ok: u64,
    pub sends_failed: u64,
}

#[derive(Debug)]
pub struct MetricsStore {
    start_time: Instant,
    deliveries_received: AtomicU64,
    deliveries_rejected: AtomicU64,
    events_accepted: AtomicU64,
    events_unknown: AtomicU64,
    events_skipped: AtomicU64,
    duplicates: AtomicU64,
    handler_failures: AtomicU64,
    send_attempts: AtomicU64,
    sends_ok: AtomicU64,
    sends_failed: AtomicU64,
}

impl MetricsStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            deliveries_received: AtomicU64::new(0),
            deliveries_rejected: AtomicU64::new(0),
            events_accepted: AtomicU64::new(0),
            events_unknown: AtomicU64::new(0),
            events_skipped: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            send_attempts: AtomicU64::new(0),
            sends_ok: AtomicU64::new(0),
            sends_failed: AtomicU64::new(0),
        })
    }

    pub fn inc_deliveries_received(&self) {
        self.deliveries_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_deliveries_rejected(&self) {
        self.deliveries_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_events_accepted(&self) {
        self.events_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_events_unknown(&self) {
        self.events_unknown.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_events_skipped(&self, count: u64) {
        self.events_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_duplicates(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_handler_failures(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_send_attempts(&self) {
        self.send_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sends_ok(&self) {
        self.sends_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sends_failed(&self) {
        self.sends_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            deliveries_received: self.deliveries_received.load(Ordering::Relaxed),
            deliveries_rejected: self.deliveries_rejected.load(Ordering::Relaxed),
            events_accepted: self.events_accepted.load(Ordering::Relaxed),
            events_unknown: self.events_unknown.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            send_attempts: self.send_attempts.load(Ordering::Relaxed),
            sends_ok: self.sends_ok.load(Ordering::Relaxed),
            sends_failed: self.sends_failed.load(Ordering::Relaxed),
        }
    }
}
