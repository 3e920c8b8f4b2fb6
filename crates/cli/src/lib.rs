pub mod echo;

use pagebridge_core::config::{AppConfig, DedupeBackend};
use pagebridge_core::dedupe::{Deduplicator, MemoryDeduplicator, DEFAULT_RETENTION_SECS};
use pagebridge_core::handler::ReplyHandler;
use pagebridge_core::metrics::MetricsStore;
use pagebridge_core::normalizer::MessengerNormalizer;
use pagebridge_core::secrets::Secret;
use pagebridge_dispatch::Dispatcher;
use pagebridge_messenger::backoff::BackoffPolicy;
use pagebridge_messenger::MessengerSender;
use pagebridge_persistence::SqliteDeduplicator;
use pagebridge_server::gateway::{AppState, Gateway};
use serde_json::{json, Value};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub fn get_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pagebridge")
}

pub fn runtime_send_max_inflight(config: &AppConfig) -> usize {
    config
        .runtime
        .as_ref()
        .and_then(|r| r.send_max_inflight)
        .unwrap_or(4)
        .clamp(1, 64)
}

pub fn runtime_send_timeout(config: &AppConfig) -> Duration {
    let secs = config
        .runtime
        .as_ref()
        .and_then(|r| r.send_timeout_secs)
        .unwrap_or(10)
        .clamp(1, 60);
    Duration::from_secs(secs)
}

pub fn runtime_backoff_policy(config: &AppConfig) -> BackoffPolicy {
    let runtime = config.runtime.clone().unwrap_or_default();
    let base_ms = runtime.backoff_base_ms.unwrap_or(500).max(1);
    let max_ms = runtime.backoff_max_ms.unwrap_or(8000).max(base_ms);
    BackoffPolicy {
        max_attempts: runtime.send_max_attempts.unwrap_or(5).clamp(1, 10),
        base_delay: Duration::from_millis(base_ms),
        max_delay: Duration::from_millis(max_ms),
        jitter_ms: runtime.retry_jitter_ms.unwrap_or(150).clamp(0, 2000),
    }
}

pub fn runtime_dedupe_retention(config: &AppConfig) -> chrono::Duration {
    let secs = config
        .runtime
        .as_ref()
        .and_then(|r| r.dedupe_retention_secs)
        .unwrap_or(DEFAULT_RETENTION_SECS)
        .max(1);
    chrono::Duration::seconds(secs)
}

pub fn runtime_dedupe_max_entries(config: &AppConfig) -> usize {
    config
        .runtime
        .as_ref()
        .and_then(|r| r.dedupe_max_entries)
        .unwrap_or(20_000)
        .clamp(128, 1_000_000)
}

pub fn runtime_shutdown_grace(config: &AppConfig) -> Duration {
    let secs = config
        .runtime
        .as_ref()
        .and_then(|r| r.shutdown_grace_secs)
        .unwrap_or(15)
        .clamp(1, 120);
    Duration::from_secs(secs)
}

pub fn dedupe_database_url(config: &AppConfig) -> String {
    config.dedupe.database_url.clone().unwrap_or_else(|| {
        format!(
            "sqlite://{}?mode=rwc",
            get_config_dir().join("deliveries.db").display()
        )
    })
}

/// How often expired delivery records are purged from SQLite.
fn purge_interval(retention: chrono::Duration) -> Duration {
    let secs = retention.num_seconds().clamp(60, 600) as u64;
    Duration::from_secs(secs)
}

/// Effective configuration as printed by `check-config`. Secrets are masked.
pub fn render_config(config: &AppConfig) -> Value {
    let masked = |s: &Option<Secret>| s.as_ref().map(Secret::masked);
    let policy = runtime_backoff_policy(config);
    let backend = match config.dedupe.backend {
        DedupeBackend::Memory => "memory",
        DedupeBackend::Sqlite => "sqlite",
    };
    json!({
        "messenger": {
            "page_access_token": masked(&config.messenger.page_access_token),
            "verify_token": masked(&config.messenger.verify_token),
            "app_secret": masked(&config.messenger.app_secret),
            "api_base": config.api_base(),
        },
        "server": {
            "host": config.server.host,
            "port": config.server.port,
            "max_body_bytes": config.server.max_body_bytes,
        },
        "runtime": {
            "send_max_inflight": runtime_send_max_inflight(config),
            "send_timeout_secs": runtime_send_timeout(config).as_secs(),
            "send_max_attempts": policy.max_attempts,
            "backoff_base_ms": policy.base_delay.as_millis() as u64,
            "backoff_max_ms": policy.max_delay.as_millis() as u64,
            "retry_jitter_ms": policy.jitter_ms,
            "dedupe_retention_secs": runtime_dedupe_retention(config).num_seconds(),
            "dedupe_max_entries": runtime_dedupe_max_entries(config),
            "shutdown_grace_secs": runtime_shutdown_grace(config).as_secs(),
        },
        "dedupe": {
            "backend": backend,
            "database_url": match config.dedupe.backend {
                DedupeBackend::Sqlite => Some(dedupe_database_url(config)),
                DedupeBackend::Memory => None,
            },
        },
        "missing_credentials": config.missing_credentials(),
    })
}

async fn build_deduplicator(
    config: &AppConfig,
) -> anyhow::Result<(Arc<dyn Deduplicator>, Option<JoinHandle<()>>)> {
    let retention = runtime_dedupe_retention(config);
    match config.dedupe.backend {
        DedupeBackend::Memory => {
            let store = MemoryDeduplicator::new(retention, runtime_dedupe_max_entries(config));
            Ok((Arc::new(store), None))
        }
        DedupeBackend::Sqlite => {
            let url = dedupe_database_url(config);
            if config.dedupe.database_url.is_none() {
                std::fs::create_dir_all(get_config_dir())?;
            }
            let store = SqliteDeduplicator::new(&url, retention).await?;

            let purger = store.clone();
            let every = purge_interval(retention);
            let task = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                loop {
                    ticker.tick().await;
                    match purger.purge_expired().await {
                        Ok(0) => {}
                        Ok(n) => info!(purged = n, "expired delivery records removed"),
                        Err(e) => error!("Delivery record purge failed: {}", e),
                    }
                }
            });
            Ok((Arc::new(store), Some(task)))
        }
    }
}

/// Wire every component from `config` and serve until `shutdown` resolves.
pub async fn start_server<F>(
    config: AppConfig,
    handler: Arc<dyn ReplyHandler>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let missing = config.missing_credentials();
    if !missing.is_empty() {
        warn!(
            missing = ?missing,
            "credentials missing; unverifiable requests will be rejected and sends will fail"
        );
    }

    let metrics = MetricsStore::new();
    let policy = runtime_backoff_policy(&config);
    let token = config.messenger.page_access_token.clone().unwrap_or_default();
    let sender = MessengerSender::graph(
        config.api_base(),
        token,
        runtime_send_timeout(&config),
        policy,
        runtime_send_max_inflight(&config),
    )?
    .with_metrics(metrics.clone());

    let dispatcher = Dispatcher::new(handler, Arc::new(sender), metrics.clone());
    let (dedupe, purge_task) = build_deduplicator(&config).await?;
    info!(
        backend = dedupe.backend_name(),
        max_inflight = runtime_send_max_inflight(&config),
        "pagebridge components ready"
    );

    let state = AppState::new(
        config.messenger.verify_token.clone(),
        config.messenger.app_secret.clone(),
        Arc::new(MessengerNormalizer),
        dedupe,
        dispatcher,
        metrics,
    );
    let gateway = Gateway::new(config.server.clone(), state, runtime_shutdown_grace(&config));
    let result = gateway.serve(shutdown).await;

    if let Some(task) = purge_task {
        task.abort();
    }
    result
}
