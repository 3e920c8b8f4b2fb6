use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SendErrorKind;

/// A single inbound event from the platform, normalized.
///
/// Built once by the normalizer and handed around by value or shared
/// reference afterwards; nothing downstream mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Page-scoped id of the user who sent the event.
    pub sender_id: String,
    /// Page id the event was addressed to, when the platform supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    /// Platform message id (`mid`) or a synthesized stable id.
    pub message_id: String,
    pub received_at: DateTime<Utc>,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Text,
    Attachment,
    Postback,
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Text => "text",
            EventKind::Attachment => "attachment",
            EventKind::Postback => "postback",
            EventKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
    File,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Video => "video",
            AttachmentKind::Audio => "audio",
            AttachmentKind::File => "file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundContent {
    Text {
        text: String,
    },
    Attachment {
        kind: AttachmentKind,
        url: String,
        #[serde(default)]
        is_reusable: bool,
    },
}

/// A reply waiting to be delivered through the send API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub recipient_id: String,
    pub content: OutboundContent,
    /// Links this message back to the inbound event that produced it.
    pub correlation_id: String,
}

impl OutboundMessage {
    pub fn new(recipient_id: &str, content: OutboundContent) -> Self {
        Self {
            recipient_id: recipient_id.to_string(),
            content,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    /// Reply to the sender of `event`, correlated with its message id.
    pub fn reply(event: &InboundEvent, content: OutboundContent) -> Self {
        Self {
            recipient_id: event.sender_id.clone(),
            content,
            correlation_id: event.message_id.clone(),
        }
    }

    pub fn text(event: &InboundEvent, text: &str) -> Self {
        Self::reply(
            event,
            OutboundContent::Text {
                text: text.to_string(),
            },
        )
    }

    pub fn image(event: &InboundEvent, url: &str) -> Self {
        Self::reply(
            event,
            OutboundContent::Attachment {
                kind: AttachmentKind::Image,
                url: url.to_string(),
                is_reusable: true,
            },
        )
    }

    /// Builder-style method to override the correlation id
    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        self.correlation_id = correlation_id.to_string();
        self
    }
}

/// Successful terminal outcome of a send.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentConfirmation {
    pub recipient_id: String,
    pub message_id: String,
    pub correlation_id: String,
    pub attempts: u32,
}

/// Lifecycle of an outbound message inside the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SendState {
    Pending,
    Sending,
    Retrying,
    Sent,
    Failed,
}

impl SendState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SendState::Sent | SendState::Failed)
    }

    /// Whether `self -> next` is a legal step of the send state machine.
    pub fn can_transition_to(&self, next: SendState) -> bool {
        matches!(
            (self, next),
            (SendState::Pending, SendState::Sending)
                | (SendState::Sending, SendState::Sent)
                | (SendState::Sending, SendState::Retrying)
                | (SendState::Sending, SendState::Failed)
                | (SendState::Retrying, SendState::Sending)
        )
    }
}

/// Retry bookkeeping attached to a message while it is being sent.
#[derive(Debug, Clone, PartialEq)]
pub struct SendAttempt {
    pub attempt_number: u32,
    pub last_error: Option<SendErrorKind>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl SendAttempt {
    pub fn first() -> Self {
        Self {
            attempt_number: 1,
            last_error: None,
            next_retry_at: None,
        }
    }

    pub fn next(&self, error: SendErrorKind, retry_at: DateTime<Utc>) -> Self {
        Self {
            attempt_number: self.attempt_number + 1,
            last_error: Some(error),
            next_retry_at: Some(retry_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> InboundEvent {
        InboundEvent {
            sender_id: "psid-1".to_string(),
            recipient_id: Some("page-1".to_string()),
            message_id: "m_abc".to_string(),
            received_at: Utc::now(),
            kind: EventKind::Text,
            text: Some("hi".to_string()),
            payload: None,
        }
    }

    #[test]
    fn reply_targets_sender_and_correlates_with_message() {
        let msg = OutboundMessage::text(&event(), "hello");
        assert_eq!(msg.recipient_id, "psid-1");
        assert_eq!(msg.correlation_id, "m_abc");
        assert_eq!(
            msg.content,
            OutboundContent::Text {
                text: "hello".to_string()
            }
        );
    }

    #[test]
    fn standalone_messages_get_fresh_correlation_ids() {
        let content = OutboundContent::Text {
            text: "x".to_string(),
        };
        let a = OutboundMessage::new("psid", content.clone());
        let b = OutboundMessage::new("psid", content);
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn send_state_machine_only_allows_documented_edges() {
        assert!(SendState::Pending.can_transition_to(SendState::Sending));
        assert!(SendState::Sending.can_transition_to(SendState::Retrying));
        assert!(SendState::Retrying.can_transition_to(SendState::Sending));
        assert!(SendState::Sending.can_transition_to(SendState::Sent));
        assert!(SendState::Sending.can_transition_to(SendState::Failed));
        assert!(!SendState::Retrying.can_transition_to(SendState::Sent));
        assert!(!SendState::Sent.can_transition_to(SendState::Sending));
        assert!(!SendState::Failed.can_transition_to(SendState::Retrying));
        assert!(SendState::Sent.is_terminal());
        assert!(SendState::Failed.is_terminal());
        assert!(!SendState::Retrying.is_terminal());
    }

    #[test]
    fn attempt_bookkeeping_advances() {
        let first = SendAttempt::first();
        let retry_at = Utc::now();
        let second = first.next(SendErrorKind::Server(500), retry_at);
        assert_eq!(second.attempt_number, 2);
        assert_eq!(second.last_error, Some(SendErrorKind::Server(500)));
        assert_eq!(second.next_retry_at, Some(retry_at));
    }
}
