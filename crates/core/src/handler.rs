use crate::error::SendError;
use crate::types::{InboundEvent, OutboundMessage, SentConfirmation};
use async_trait::async_trait;

/// Bot-specific reply logic. Plugged into the dispatcher; the bridge itself
/// has no opinion on what a reply looks like.
#[async_trait]
pub trait ReplyHandler: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str {
        "reply_handler"
    }

    /// Produce zero or more replies for `event`. Errors are logged by the
    /// dispatcher and never retried.
    async fn handle(&self, event: &InboundEvent) -> anyhow::Result<Vec<OutboundMessage>>;
}

/// Delivers an outbound message to the platform.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, msg: OutboundMessage) -> Result<SentConfirmation, SendError>;
}
