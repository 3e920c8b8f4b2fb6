use async_trait::async_trait;
use pagebridge_core::handler::ReplyHandler;
use pagebridge_core::types::{EventKind, InboundEvent, OutboundMessage};

/// Longest text the send endpoint takes in one message (in characters).
pub const MAX_TEXT_CHARS: usize = 2000;

/// Default reply handler: repeats text back, acknowledges buttons and
/// attachments. Bots plug their own [`ReplyHandler`] in its place.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl ReplyHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn handle(&self, event: &InboundEvent) -> anyhow::Result<Vec<OutboundMessage>> {
        let replies = match event.kind {
            EventKind::Text => {
                let text = event.text.as_deref().unwrap_or_default().trim();
                if text.is_empty() {
                    return Ok(Vec::new());
                }
                split_text(text, MAX_TEXT_CHARS)
                    .into_iter()
                    .map(|chunk| OutboundMessage::text(event, &chunk))
                    .collect()
            }
            EventKind::Postback => {
                let label = event
                    .text
                    .as_deref()
                    .or(event.payload.as_deref())
                    .unwrap_or("button");
                vec![OutboundMessage::text(event, &format!("You selected: {label}"))]
            }
            EventKind::Attachment => {
                vec![OutboundMessage::text(event, "Thanks, we received your attachment.")]
            }
            EventKind::Unknown => Vec::new(),
        };
        Ok(replies)
    }
}

/// Split on char boundaries so no chunk exceeds `max_chars`.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars)
        .map(|chunk| chunk.iter().collect())
        .collect()
}
