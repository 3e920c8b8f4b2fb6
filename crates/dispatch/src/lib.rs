pub mod inflight;

use inflight::InflightTracker;
use pagebridge_core::audit::log_audit;
use pagebridge_core::handler::{MessageSender, ReplyHandler};
use pagebridge_core::metrics::MetricsStore;
use pagebridge_core::types::InboundEvent;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

type Lane = Arc<tokio::sync::Mutex<()>>;

/// Routes normalized events to the reply handler and hands the replies to
/// the outbound sender.
///
/// Events from different senders run concurrently. Events from one sender
/// go through that sender's lane, so a conversation sees its replies in
/// arrival order as far as the transport allows.
#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<dyn ReplyHandler>,
    sender: Arc<dyn MessageSender>,
    metrics: Arc<MetricsStore>,
    lanes: Arc<Mutex<HashMap<String, Lane>>>,
    inflight: InflightTracker,
}

impl Dispatcher {
    pub fn new(
        handler: Arc<dyn ReplyHandler>,
        sender: Arc<dyn MessageSender>,
        metrics: Arc<MetricsStore>,
    ) -> Self {
        Self {
            handler,
            sender,
            metrics,
            lanes: Arc::new(Mutex::new(HashMap::new())),
            inflight: InflightTracker::new(),
        }
    }

    /// Number of background dispatch tasks still running.
    pub fn inflight(&self) -> usize {
        self.inflight.count()
    }

    /// Run the handler for one event and send whatever it produced.
    /// Never fails: handler and send errors are logged and recorded here.
    pub async fn dispatch(&self, event: InboundEvent) {
        let event = Arc::new(event);
        let handler = self.handler.clone();
        let handler_name = handler.name().to_string();

        // Own task so a panicking handler is contained like an error.
        let task_event = event.clone();
        let outcome = tokio::spawn(async move { handler.handle(&task_event).await }).await;

        let replies = match outcome {
            Ok(Ok(replies)) => replies,
            Ok(Err(e)) => {
                self.metrics.inc_handler_failures();
                error!(
                    handler = %handler_name,
                    message_id = %event.message_id,
                    error = %e,
                    "reply handler failed"
                );
                return;
            }
            Err(join_err) => {
                self.metrics.inc_handler_failures();
                error!(
                    handler = %handler_name,
                    message_id = %event.message_id,
                    error = %join_err,
                    "reply handler panicked"
                );
                return;
            }
        };

        if replies.is_empty() {
            debug!(message_id = %event.message_id, kind = event.kind.as_str(), "no reply produced");
            return;
        }

        for reply in replies {
            let correlation_id = reply.correlation_id.clone();
            let recipient_id = reply.recipient_id.clone();
            match self.sender.send(reply).await {
                Ok(confirmation) => {
                    debug!(
                        correlation_id = %correlation_id,
                        platform_message_id = %confirmation.message_id,
                        attempts = confirmation.attempts,
                        "reply delivered"
                    );
                }
                Err(e) => {
                    error!(
                        correlation_id = %correlation_id,
                        classification = %e.kind(),
                        attempts = e.attempts(),
                        error = %e,
                        "reply delivery failed"
                    );
                    log_audit(
                        "delivery_failed",
                        &correlation_id,
                        json!({
                            "recipient_id": recipient_id,
                            "inbound_message_id": event.message_id,
                            "classification": e.kind().label(),
                            "permanent": e.is_permanent(),
                            "attempts": e.attempts(),
                            "error": e.to_string(),
                        }),
                    );
                }
            }
        }
    }

    /// Schedule a batch in the background and return immediately.
    /// Returns the number of lanes spawned.
    pub fn spawn_batch(&self, events: Vec<InboundEvent>) -> usize {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<InboundEvent>> = HashMap::new();
        for event in events {
            let key = event.sender_id.clone();
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(event);
        }

        let spawned = order.len();
        for sender_id in order {
            let Some(events) = groups.remove(&sender_id) else {
                continue;
            };
            let guard = self.inflight.enter();
            let lane = self.lane(&sender_id);
            let this = self.clone();
            tokio::spawn(async move {
                let _guard = guard;
                {
                    let _turn = lane.lock().await;
                    for event in events {
                        this.dispatch(event).await;
                    }
                }
                drop(lane);
                this.release_lane(&sender_id);
            });
        }
        spawned
    }

    /// Wait up to `grace` for background dispatches. Returns `false` if
    /// some were still running when the grace period ran out.
    pub async fn drain(&self, grace: Duration) -> bool {
        let pending = self.inflight.count();
        if pending > 0 {
            info!(pending, grace_secs = grace.as_secs(), "draining in-flight dispatches");
        }
        match tokio::time::timeout(grace, self.inflight.wait_idle()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    remaining = self.inflight.count(),
                    "grace period elapsed with dispatches still running"
                );
                false
            }
        }
    }

    fn lane(&self, sender_id: &str) -> Lane {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes.entry(sender_id.to_string()).or_default().clone()
    }

    fn release_lane(&self, sender_id: &str) {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map holds it: nobody is queued behind us.
        if lanes
            .get(sender_id)
            .is_some_and(|lane| Arc::strong_count(lane) == 1)
        {
            lanes.remove(sender_id);
        }
    }
}
