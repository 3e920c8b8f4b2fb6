use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use pagebridge_core::clock::{Clock, SystemClock};
use pagebridge_core::dedupe::{Admission, DeliveryRecord, Deduplicator};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::sync::Arc;
use tracing::{info, instrument};

/// Delivery records shared by every instance pointing at the same database.
#[derive(Clone)]
pub struct SqliteDeduplicator {
    pool: SqlitePool,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl SqliteDeduplicator {
    pub async fn new(database_url: &str, retention: Duration) -> Result<Self> {
        Self::with_clock(database_url, retention, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(
        database_url: &str,
        retention: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to SQLite database")?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        info!("SqliteDeduplicator initialized");
        Ok(Self {
            pool,
            retention,
            clock,
        })
    }

    /// Remove records older than the retention window. Returns rows deleted.
    #[instrument(skip(self))]
    pub async fn purge_expired(&self) -> Result<u64> {
        let cutoff = (self.clock.now() - self.retention).timestamp_millis();
        let result = sqlx::query("DELETE FROM deliveries WHERE processed_at_ms < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to purge expired deliveries")?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    pub async fn get(&self, message_id: &str) -> Result<Option<DeliveryRecord>> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT message_id, processed_at_ms FROM deliveries WHERE message_id = ?",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch delivery record")?;

        Ok(row.map(|(message_id, ms)| DeliveryRecord {
            message_id,
            processed_at: from_millis(ms),
        }))
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[async_trait]
impl Deduplicator for SqliteDeduplicator {
    #[instrument(skip(self))]
    async fn admit(&self, message_id: &str) -> Result<Admission> {
        let now = self.clock.now();
        let cutoff = (now - self.retention).timestamp_millis();

        // One statement: insert, or take over a record that has expired.
        // A live record leaves the row untouched and affects nothing.
        let result = sqlx::query(
            r#"
            INSERT INTO deliveries (message_id, processed_at_ms)
            VALUES (?, ?)
            ON CONFLICT(message_id) DO UPDATE
                SET processed_at_ms = excluded.processed_at_ms
                WHERE deliveries.processed_at_ms < ?
            "#,
        )
        .bind(message_id)
        .bind(now.timestamp_millis())
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to record delivery")?;

        if result.rows_affected() == 1 {
            Ok(Admission::Accepted)
        } else {
            Ok(Admission::Duplicate)
        }
    }

    fn backend_name(&self) -> &str {
        "sqlite"
    }
}
