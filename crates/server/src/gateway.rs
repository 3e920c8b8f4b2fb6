use crate::verify::{verify_delivery, verify_handshake, SignatureCheck, SIGNATURE_HEADER};
use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, DefaultBodyLimit, Query, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use pagebridge_core::audit::log_audit;
use pagebridge_core::config::ServerConfig;
use pagebridge_core::dedupe::{Admission, Deduplicator};
use pagebridge_core::metrics::{MetricsSnapshot, MetricsStore};
use pagebridge_core::normalizer::EventNormalizer;
use pagebridge_core::secrets::Secret;
use pagebridge_core::types::EventKind;
use pagebridge_dispatch::Dispatcher;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

const BANNER: &str = "pagebridge webhook is running";

#[derive(Clone)]
pub struct AppState {
    verify_token: Option<Secret>,
    app_secret: Option<Secret>,
    normalizer: Arc<dyn EventNormalizer>,
    dedupe: Arc<dyn Deduplicator>,
    dispatcher: Dispatcher,
    metrics: Arc<MetricsStore>,
    accepting: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(
        verify_token: Option<Secret>,
        app_secret: Option<Secret>,
        normalizer: Arc<dyn EventNormalizer>,
        dedupe: Arc<dyn Deduplicator>,
        dispatcher: Dispatcher,
        metrics: Arc<MetricsStore>,
    ) -> Self {
        Self {
            verify_token,
            app_secret,
            normalizer,
            dedupe,
            dispatcher,
            metrics,
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

pub struct Gateway {
    server: ServerConfig,
    state: AppState,
    shutdown_grace: Duration,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

impl Gateway {
    pub fn new(server: ServerConfig, state: AppState, shutdown_grace: Duration) -> Self {
        Self {
            server,
            state,
            shutdown_grace,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(banner))
            .route("/health", get(health_check))
            .route("/api/monitor/metrics", get(get_metrics))
            .route("/webhook", get(webhook_verify).post(webhook_delivery))
            .layer(DefaultBodyLimit::max(self.server.max_body_bytes))
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves. New deliveries are then answered
    /// with 503 while queued dispatches get up to the grace period.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind((self.server.host.as_str(), self.server.port)).await?;
        info!("Gateway listening on {}", listener.local_addr()?);

        let app = self.router();
        let state = self.state.clone();
        let grace = self.shutdown_grace;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                state.accepting.store(false, Ordering::SeqCst);
                info!("shutdown requested, refusing new deliveries");
                if state.dispatcher.drain(grace).await {
                    info!("in-flight dispatches finished");
                }
            })
            .await?;

        info!("Gateway stopped");
        Ok(())
    }
}

async fn banner() -> &'static str {
    BANNER
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

#[derive(Debug, Default, Deserialize)]
struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

async fn webhook_verify(
    State(state): State<AppState>,
    query: Result<Query<VerifyQuery>, QueryRejection>,
) -> Result<String, StatusCode> {
    let Query(query) = query.map_err(|e| {
        warn!(reason = %e, "webhook handshake rejected: unreadable query");
        StatusCode::FORBIDDEN
    })?;
    let expected = state.verify_token.as_ref().map(Secret::expose);
    match verify_handshake(
        query.mode.as_deref(),
        query.verify_token.as_deref(),
        query.challenge.as_deref(),
        expected,
    ) {
        Ok(challenge) => {
            info!("webhook handshake accepted");
            Ok(challenge)
        }
        Err(e) => {
            warn!(reason = %e, "webhook handshake rejected");
            Err(StatusCode::FORBIDDEN)
        }
    }
}

async fn webhook_delivery(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, StatusCode> {
    if !state.is_accepting() {
        // The platform redelivers on non-2xx.
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    state.metrics.inc_deliveries_received();

    let signature = headers.get(SIGNATURE_HEADER).and_then(|h| h.to_str().ok());
    let secret = state.app_secret.as_ref().map(Secret::expose);
    if let SignatureCheck::Invalid(reason) = verify_delivery(&body, signature, secret) {
        state.metrics.inc_deliveries_rejected();
        warn!(reason, body_bytes = body.len(), "delivery signature rejected");
        log_audit(
            "signature_rejected",
            "",
            json!({ "reason": reason, "body_bytes": body.len() }),
        );
        return Err(StatusCode::FORBIDDEN);
    }

    let normalized = state.normalizer.normalize(&body);
    if normalized.malformed_payload {
        warn!(body_bytes = body.len(), "delivery body is not a JSON object, acknowledging anyway");
    }
    let mut skipped = normalized.skipped;
    state.metrics.add_events_skipped(skipped as u64);

    let mut fresh = Vec::with_capacity(normalized.events.len());
    let mut duplicates = 0usize;
    for event in normalized.events {
        match state.dedupe.admit(&event.message_id).await {
            Ok(Admission::Accepted) => {
                state.metrics.inc_events_accepted();
                if event.kind == EventKind::Unknown {
                    state.metrics.inc_events_unknown();
                }
                fresh.push(event);
            }
            Ok(Admission::Duplicate) => {
                duplicates += 1;
                state.metrics.inc_duplicates();
                debug!(message_id = %event.message_id, "duplicate delivery ignored");
            }
            Err(e) => {
                skipped += 1;
                state.metrics.add_events_skipped(1);
                error!(
                    message_id = %event.message_id,
                    backend = state.dedupe.backend_name(),
                    error = %e,
                    "dedupe store failed, event skipped"
                );
            }
        }
    }

    let accepted = fresh.len();
    if !fresh.is_empty() {
        state.dispatcher.spawn_batch(fresh);
    }
    info!(accepted, duplicates, skipped, "delivery acknowledged");

    Ok(Json(json!({
        "status": "ok",
        "accepted": accepted,
        "duplicates": duplicates,
        "skipped": skipped,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::signature_header;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use pagebridge_core::dedupe::MemoryDeduplicator;
    use pagebridge_core::error::SendError;
    use pagebridge_core::handler::{MessageSender, ReplyHandler};
    use pagebridge_core::normalizer::{MessengerNormalizer, Normalized};
    use pagebridge_core::types::{InboundEvent, OutboundMessage, SentConfirmation};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    const SECRET: &str = "app-secret";
    const VERIFY: &str = "verify-me";

    struct CountingNormalizer {
        calls: AtomicUsize,
    }

    impl EventNormalizer for CountingNormalizer {
        fn normalize(&self, raw_body: &[u8]) -> Normalized {
            self.calls.fetch_add(1, Ordering::SeqCst);
            MessengerNormalizer.normalize(raw_body)
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReplyHandler for RecordingHandler {
        async fn handle(&self, event: &InboundEvent) -> anyhow::Result<Vec<OutboundMessage>> {
            self.seen.lock().unwrap().push(event.message_id.clone());
            Ok(Vec::new())
        }
    }

    struct NullSender;

    #[async_trait]
    impl MessageSender for NullSender {
        async fn send(&self, msg: OutboundMessage) -> Result<SentConfirmation, SendError> {
            Ok(SentConfirmation {
                recipient_id: msg.recipient_id,
                message_id: "m_out".to_string(),
                correlation_id: msg.correlation_id,
                attempts: 1,
            })
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl Deduplicator for BrokenStore {
        async fn admit(&self, _message_id: &str) -> anyhow::Result<Admission> {
            anyhow::bail!("database is locked")
        }

        fn backend_name(&self) -> &str {
            "broken"
        }
    }

    struct Harness {
        state: AppState,
        normalizer: Arc<CountingNormalizer>,
        handler: Arc<RecordingHandler>,
        metrics: Arc<MetricsStore>,
    }

    fn harness_with(dedupe: Arc<dyn Deduplicator>) -> Harness {
        let normalizer = Arc::new(CountingNormalizer {
            calls: AtomicUsize::new(0),
        });
        let handler = Arc::new(RecordingHandler::default());
        let metrics = MetricsStore::new();
        let dispatcher = Dispatcher::new(handler.clone(), Arc::new(NullSender), metrics.clone());
        let state = AppState::new(
            Some(Secret::new(VERIFY)),
            Some(Secret::new(SECRET)),
            normalizer.clone(),
            dedupe,
            dispatcher,
            metrics.clone(),
        );
        Harness {
            state,
            normalizer,
            handler,
            metrics,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MemoryDeduplicator::new(
            chrono::Duration::hours(6),
            1024,
        )))
    }

    fn delivery_body() -> &'static str {
        r#"{"object":"page","entry":[
            {"id":"page-1","time":1700000000000,"messaging":[
                {"sender":{"id":"u1"},"recipient":{"id":"page-1"},"timestamp":1700000000001,
                 "message":{"mid":"m_1","text":"hi"}},
                {"sender":{"id":"u2"},"recipient":{"id":"page-1"},"timestamp":1700000000002,
                 "postback":{"mid":"m_2","title":"Start","payload":"GET_STARTED"}},
                {"recipient":{"id":"page-1"},"message":{"mid":"m_3","text":"no sender"}}
            ]}
        ]}"#
    }

    fn signed(body: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&signature_header(body.as_bytes(), SECRET)).unwrap(),
        );
        headers
    }

    fn query(
        mode: Option<&str>,
        token: Option<&str>,
        challenge: Option<&str>,
    ) -> Result<Query<VerifyQuery>, QueryRejection> {
        Ok(Query(VerifyQuery {
            mode: mode.map(str::to_string),
            verify_token: token.map(str::to_string),
            challenge: challenge.map(str::to_string),
        }))
    }

    #[tokio::test]
    async fn handshake_returns_challenge_or_forbidden() {
        let h = harness();
        let ok = webhook_verify(
            State(h.state.clone()),
            query(Some("subscribe"), Some(VERIFY), Some("CHALLENGE_ACCEPTED")),
        )
        .await;
        assert_eq!(ok, Ok("CHALLENGE_ACCEPTED".to_string()));

        let wrong = webhook_verify(
            State(h.state.clone()),
            query(Some("subscribe"), Some("guess"), Some("CHALLENGE_ACCEPTED")),
        )
        .await;
        assert_eq!(wrong, Err(StatusCode::FORBIDDEN));

        let missing = webhook_verify(State(h.state.clone()), query(Some("subscribe"), None, Some("c"))).await;
        assert_eq!(missing, Err(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn handshake_rejected_without_configured_token() {
        let mut h = harness();
        h.state.verify_token = None;
        let out = webhook_verify(State(h.state), query(Some("subscribe"), Some(""), Some("c"))).await;
        assert_eq!(out, Err(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn unreadable_handshake_query_is_forbidden() {
        let h = harness();
        let uri: axum::http::Uri =
            "/webhook?hub.mode=subscribe&hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=c"
                .parse()
                .unwrap();
        let rejected = Query::<VerifyQuery>::try_from_uri(&uri);
        assert!(rejected.is_err());

        let out = webhook_verify(State(h.state), rejected).await;
        assert_eq!(out, Err(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn bad_signature_never_reaches_normalizer() {
        let h = harness();
        let body = delivery_body();
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&signature_header(body.as_bytes(), "wrong-secret")).unwrap(),
        );

        let out = webhook_delivery(State(h.state.clone()), headers, Bytes::from(body)).await;
        assert_eq!(out.err(), Some(StatusCode::FORBIDDEN));

        let unsigned = webhook_delivery(State(h.state.clone()), HeaderMap::new(), Bytes::from(body)).await;
        assert_eq!(unsigned.err(), Some(StatusCode::FORBIDDEN));

        assert_eq!(h.normalizer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.metrics.snapshot().deliveries_rejected, 2);
    }

    #[tokio::test]
    async fn redelivery_dispatches_nothing_new() {
        let h = harness();
        let body = delivery_body();

        let first = webhook_delivery(State(h.state.clone()), signed(body), Bytes::from(body))
            .await
            .expect("first delivery");
        assert_eq!(
            first.0,
            json!({"status":"ok","accepted":2,"duplicates":0,"skipped":1})
        );
        assert!(h.state.dispatcher.drain(Duration::from_secs(5)).await);

        let second = webhook_delivery(State(h.state.clone()), signed(body), Bytes::from(body))
            .await
            .expect("redelivery");
        assert_eq!(
            second.0,
            json!({"status":"ok","accepted":0,"duplicates":2,"skipped":1})
        );
        assert!(h.state.dispatcher.drain(Duration::from_secs(5)).await);

        let mut seen = h.handler.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["m_1".to_string(), "m_2".to_string()]);

        let snap = h.metrics.snapshot();
        assert_eq!(snap.deliveries_received, 2);
        assert_eq!(snap.events_accepted, 2);
        assert_eq!(snap.duplicates, 2);
        assert_eq!(snap.events_skipped, 2);
    }

    #[tokio::test]
    async fn redelivered_postback_without_mid_or_timestamp_is_a_duplicate() {
        let h = harness();
        let body = r#"{"object":"page","entry":[{"id":"page-1","messaging":[
            {"sender":{"id":"u7"},"recipient":{"id":"page-1"},
             "postback":{"title":"Start","payload":"GET_STARTED"}}
        ]}]}"#;

        let first = webhook_delivery(State(h.state.clone()), signed(body), Bytes::from(body))
            .await
            .expect("first delivery");
        assert_eq!(first.0["accepted"], 1);
        assert!(h.state.dispatcher.drain(Duration::from_secs(5)).await);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = webhook_delivery(State(h.state.clone()), signed(body), Bytes::from(body))
            .await
            .expect("redelivery");
        assert_eq!(second.0["accepted"], 0);
        assert_eq!(second.0["duplicates"], 1);
        assert!(h.state.dispatcher.drain(Duration::from_secs(5)).await);

        let seen = h.handler.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with("postback:u7:0:"));
    }

    #[tokio::test]
    async fn malformed_body_is_still_acknowledged() {
        let h = harness();
        let body = "this is not json";
        let out = webhook_delivery(State(h.state.clone()), signed(body), Bytes::from(body))
            .await
            .expect("acknowledged");
        assert_eq!(out.0["accepted"], 0);
        assert_eq!(h.normalizer.calls.load(Ordering::SeqCst), 1);
        assert!(h.handler.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failure_skips_event_but_acknowledges() {
        let h = harness_with(Arc::new(BrokenStore));
        let body = delivery_body();
        let out = webhook_delivery(State(h.state.clone()), signed(body), Bytes::from(body))
            .await
            .expect("acknowledged");
        assert_eq!(out.0["accepted"], 0);
        assert_eq!(out.0["skipped"], 3);
        assert!(h.state.dispatcher.drain(Duration::from_secs(1)).await);
        assert!(h.handler.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn refuses_deliveries_while_shutting_down() {
        let h = harness();
        h.state.accepting.store(false, Ordering::SeqCst);
        let body = delivery_body();
        let out = webhook_delivery(State(h.state.clone()), signed(body), Bytes::from(body)).await;
        assert_eq!(out.err(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(h.normalizer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.metrics.snapshot().deliveries_received, 0);
    }

    #[tokio::test]
    async fn health_and_metrics_report() {
        let h = harness();
        assert_eq!(banner().await, BANNER);
        let health = health_check().await;
        assert_eq!(health.0.status, "ok");
        assert!(!health.0.version.is_empty());

        h.metrics.inc_deliveries_received();
        let metrics = get_metrics(State(h.state.clone())).await;
        assert_eq!(metrics.0.deliveries_received, 1);
    }

    #[tokio::test]
    async fn serve_stops_accepting_after_shutdown_signal() {
        let h = harness();
        let state = h.state.clone();
        let server = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_body_bytes: 1024,
        };
        let gateway = Gateway::new(server, h.state, Duration::from_millis(200));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(gateway.serve(async move {
            let _ = rx.await;
        }));

        assert!(state.is_accepting());
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("server should stop")
            .expect("join")
            .expect("serve result");
        assert!(!state.is_accepting());
    }
}
