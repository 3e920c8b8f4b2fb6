pub mod api;
pub mod backoff;

use api::{GraphApi, SendApi};
use async_trait::async_trait;
use backoff::{BackoffPolicy, Sleeper, TokioSleeper};
use chrono::{DateTime, Utc};
use pagebridge_core::clock::{Clock, SystemClock};
use pagebridge_core::error::{SendError, SendErrorKind};
use pagebridge_core::handler::MessageSender;
use pagebridge_core::metrics::MetricsStore;
use pagebridge_core::secrets::Secret;
use pagebridge_core::types::{OutboundMessage, SendAttempt, SendState, SentConfirmation};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Outbound sender for the page: retries, backoff, a process-wide cap on
/// concurrent sends, and a shared pause when the platform signals throttling.
#[derive(Clone)]
pub struct MessengerSender {
    api: Arc<dyn SendApi>,
    policy: BackoffPolicy,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    permits: Arc<Semaphore>,
    throttled_until: Arc<Mutex<Option<DateTime<Utc>>>>,
    metrics: Option<Arc<MetricsStore>>,
}

impl MessengerSender {
    pub fn new(api: Arc<dyn SendApi>, policy: BackoffPolicy, max_inflight: usize) -> Self {
        Self {
            api,
            policy: BackoffPolicy {
                max_attempts: policy.max_attempts.max(1),
                ..policy
            },
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            permits: Arc::new(Semaphore::new(max_inflight.max(1))),
            throttled_until: Arc::new(Mutex::new(None)),
            metrics: None,
        }
    }

    /// Sender talking to the Graph API at `api_base`.
    pub fn graph(
        api_base: &str,
        token: Secret,
        timeout: Duration,
        policy: BackoffPolicy,
        max_inflight: usize,
    ) -> anyhow::Result<Self> {
        let api = GraphApi::new(api_base, token, timeout)?;
        Ok(Self::new(Arc::new(api), policy, max_inflight))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsStore>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    fn transition(state: &mut SendState, next: SendState, msg: &OutboundMessage) {
        debug_assert!(
            state.can_transition_to(next),
            "illegal send transition {:?} -> {:?}",
            state,
            next
        );
        debug!(correlation_id = %msg.correlation_id, from = ?state, to = ?next, "send state");
        *state = next;
    }

    fn throttle_until(&self, until: DateTime<Utc>) {
        let mut lock = self
            .throttled_until
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if lock.map_or(true, |current| current < until) {
            *lock = Some(until);
        }
    }

    async fn wait_for_throttle(&self) {
        let until = *self
            .throttled_until
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let Some(until) = until else {
            return;
        };
        let remaining = until - self.clock.now();
        if let Ok(remaining) = remaining.to_std() {
            if !remaining.is_zero() {
                debug!(wait_ms = remaining.as_millis() as u64, "send throttled");
                self.sleeper.sleep(remaining).await;
            }
        }
    }

    async fn send_with_retry(&self, msg: &OutboundMessage) -> Result<SentConfirmation, SendError> {
        let mut state = SendState::Pending;
        let mut attempt = SendAttempt::first();

        loop {
            self.wait_for_throttle().await;
            Self::transition(&mut state, SendState::Sending, msg);
            if let Some(metrics) = &self.metrics {
                metrics.inc_send_attempts();
            }

            // Held for the call only, so backoff sleeps don't starve other sends.
            let outcome = {
                let _permit = self.permits.acquire().await.map_err(|_| {
                    SendError::TransientSendFailure {
                        kind: SendErrorKind::Network,
                        attempts: attempt.attempt_number.saturating_sub(1),
                        message: "sender is shutting down".to_string(),
                    }
                })?;
                self.api.post_message(msg).await
            };

            let failure = match outcome {
                Ok(accepted) => {
                    Self::transition(&mut state, SendState::Sent, msg);
                    info!(
                        correlation_id = %msg.correlation_id,
                        attempt = attempt.attempt_number,
                        "outbound message sent"
                    );
                    return Ok(SentConfirmation {
                        recipient_id: accepted
                            .recipient_id
                            .unwrap_or_else(|| msg.recipient_id.clone()),
                        message_id: accepted.message_id.unwrap_or_default(),
                        correlation_id: msg.correlation_id.clone(),
                        attempts: attempt.attempt_number,
                    });
                }
                Err(failure) => failure,
            };

            let retryable = failure.kind.is_retryable();
            warn!(
                correlation_id = %msg.correlation_id,
                attempt = attempt.attempt_number,
                max_attempts = self.policy.max_attempts,
                classification = %failure.kind,
                code = ?failure.code,
                retryable,
                error = %failure.message,
                "outbound send attempt failed"
            );

            if !retryable {
                Self::transition(&mut state, SendState::Failed, msg);
                return Err(SendError::PermanentSendFailure {
                    kind: failure.kind,
                    attempts: attempt.attempt_number,
                    message: failure.message,
                });
            }
            if attempt.attempt_number >= self.policy.max_attempts {
                Self::transition(&mut state, SendState::Failed, msg);
                return Err(SendError::TransientSendFailure {
                    kind: failure.kind,
                    attempts: attempt.attempt_number,
                    message: failure.message,
                });
            }

            let delay = self.policy.delay_for(attempt.attempt_number);
            let retry_at = self.clock.now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            if failure.kind == SendErrorKind::RateLimited {
                self.throttle_until(retry_at);
            }
            attempt = attempt.next(failure.kind, retry_at);
            Self::transition(&mut state, SendState::Retrying, msg);
            debug!(
                correlation_id = %msg.correlation_id,
                next_attempt = attempt.attempt_number,
                delay_ms = delay.as_millis() as u64,
                "retrying outbound send"
            );
            self.sleeper.sleep(delay).await;
        }
    }
}

#[async_trait]
impl MessageSender for MessengerSender {
    async fn send(&self, msg: OutboundMessage) -> Result<SentConfirmation, SendError> {
        let result = self.send_with_retry(&msg).await;
        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(_) => metrics.inc_sends_ok(),
                Err(_) => metrics.inc_sends_failed(),
            }
        }
        result
    }
}
