use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default retention for delivery records: well past the platform's
/// redelivery window.
pub const DEFAULT_RETENTION_SECS: i64 = 6 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Admission {
    Accepted,
    Duplicate,
}

/// Proof that a message id was accepted for processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryRecord {
    pub message_id: String,
    pub processed_at: DateTime<Utc>,
}

/// At-most-once gate in front of the dispatcher.
///
/// `admit` must check and insert as one atomic step: two concurrent calls
/// with the same id yield exactly one `Accepted`.
#[async_trait]
pub trait Deduplicator: Send + Sync {
    async fn admit(&self, message_id: &str) -> anyhow::Result<Admission>;

    fn backend_name(&self) -> &str;
}

#[derive(Debug, Default)]
struct DedupeCache {
    entries: HashMap<String, DateTime<Utc>>,
    order: VecDeque<DeliveryRecord>,
}

/// Process-local deduplicator. Records vanish on restart.
pub struct MemoryDeduplicator {
    cache: Mutex<DedupeCache>,
    retention: Duration,
    max_entries: usize,
    clock: Arc<dyn Clock>,
}

impl MemoryDeduplicator {
    pub fn new(retention: Duration, max_entries: usize) -> Self {
        Self::with_clock(retention, max_entries, Arc::new(SystemClock))
    }

    pub fn with_clock(retention: Duration, max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: Mutex::new(DedupeCache::default()),
            retention,
            max_entries: max_entries.max(1),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.cache.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Deduplicator for MemoryDeduplicator {
    async fn admit(&self, message_id: &str) -> anyhow::Result<Admission> {
        let now = self.clock.now();
        let mut cache = self.cache.lock().await;

        // Drop expired records from the front; `order` is sorted by insertion time.
        while let Some(front) = cache.order.front() {
            if now - front.processed_at > self.retention {
                let Some(old) = cache.order.pop_front() else {
                    break;
                };
                if cache
                    .entries
                    .get(&old.message_id)
                    .is_some_and(|ts| *ts == old.processed_at)
                {
                    cache.entries.remove(&old.message_id);
                }
            } else {
                break;
            }
        }

        if let Some(ts) = cache.entries.get(message_id) {
            if now - *ts <= self.retention {
                return Ok(Admission::Duplicate);
            }
        }

        cache.entries.insert(message_id.to_string(), now);
        cache.order.push_back(DeliveryRecord {
            message_id: message_id.to_string(),
            processed_at: now,
        });

        while cache.entries.len() > self.max_entries {
            let Some(evicted) = cache.order.pop_front() else {
                break;
            };
            if cache
                .entries
                .get(&evicted.message_id)
                .is_some_and(|ts| *ts == evicted.processed_at)
            {
                cache.entries.remove(&evicted.message_id);
            }
        }

        Ok(Admission::Accepted)
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}
