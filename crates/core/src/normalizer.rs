//! Turns raw webhook deliveries into [`InboundEvent`]s.
//!
//! The payload schema is controlled by the platform, so nothing here assumes
//! a field is present. A delivery looks like
//! `{"object":"page","entry":[{"id":..,"time":..,"messaging":[..]}]}`; every
//! item of every `messaging` array is normalized on its own and a bad item
//! never takes the rest of the batch down with it.

use crate::types::{EventKind, InboundEvent};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Result of normalizing one delivery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    /// Events in delivery order.
    pub events: Vec<InboundEvent>,
    /// Items that could not be turned into an event (malformed or echoes).
    pub skipped: usize,
    /// The body was not a JSON object at all.
    pub malformed_payload: bool,
}

impl Normalized {
    pub fn unknown_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| e.kind == EventKind::Unknown)
            .count()
    }
}

pub trait EventNormalizer: Send + Sync {
    /// Must be total: malformed input yields zero events, never a panic.
    fn normalize(&self, raw_body: &[u8]) -> Normalized;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MessengerNormalizer;

impl EventNormalizer for MessengerNormalizer {
    fn normalize(&self, raw_body: &[u8]) -> Normalized {
        let payload: Value = match serde_json::from_slice(raw_body) {
            Ok(v @ Value::Object(_)) => v,
            _ => {
                return Normalized {
                    malformed_payload: true,
                    ..Default::default()
                }
            }
        };

        let mut out = Normalized::default();
        let Some(entries) = payload.get("entry").and_then(Value::as_array) else {
            return out;
        };

        for entry in entries {
            let Some(messaging) = entry.get("messaging").and_then(Value::as_array) else {
                out.skipped += 1;
                continue;
            };
            let entry_time = entry.get("time").and_then(Value::as_i64);

            for item in messaging {
                match normalize_item(item, entry_time) {
                    Some(event) => out.events.push(event),
                    None => out.skipped += 1,
                }
            }
        }

        out
    }
}

fn str_field<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for key in path {
        cur = cur.get(key)?;
    }
    cur.as_str().filter(|s| !s.trim().is_empty())
}

/// Stable id for items the platform sent without one. Derived from the item
/// itself so a redelivery maps to the same id and two different items don't.
fn synthesized_id(kind: &str, sender_id: &str, ts: Option<i64>, item: &Value) -> String {
    // serde_json maps are key-ordered, so the serialization is canonical.
    let digest = Sha256::digest(item.to_string().as_bytes());
    format!(
        "{}:{}:{}:{}",
        kind,
        sender_id,
        ts.unwrap_or_default(),
        &hex::encode(digest)[..16]
    )
}

fn timestamp_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn normalize_item(item: &Value, entry_time: Option<i64>) -> Option<InboundEvent> {
    if !item.is_object() {
        return None;
    }
    let sender_id = str_field(item, &["sender", "id"])?.to_string();
    let recipient_id = str_field(item, &["recipient", "id"]).map(str::to_string);
    let raw_ts = item.get("timestamp").and_then(Value::as_i64).or(entry_time);
    let received_at = timestamp_from_millis(raw_ts).unwrap_or_else(Utc::now);

    if let Some(message) = item.get("message") {
        if message.get("is_echo").and_then(Value::as_bool) == Some(true) {
            return None;
        }
        let message_id = str_field(message, &["mid"])?.to_string();
        let text = str_field(message, &["text"]).map(str::to_string);
        let quick_reply = str_field(message, &["quick_reply", "payload"]).map(str::to_string);

        if text.is_some() {
            return Some(InboundEvent {
                sender_id,
                recipient_id,
                message_id,
                received_at,
                kind: EventKind::Text,
                text,
                payload: quick_reply,
            });
        }

        let first_attachment = message
            .get("attachments")
            .and_then(Value::as_array)
            .and_then(|a| a.first());
        if let Some(attachment) = first_attachment {
            let payload = str_field(attachment, &["payload", "url"])
                .or_else(|| str_field(attachment, &["type"]))
                .map(str::to_string);
            return Some(InboundEvent {
                sender_id,
                recipient_id,
                message_id,
                received_at,
                kind: EventKind::Attachment,
                text: None,
                payload,
            });
        }

        return Some(InboundEvent {
            sender_id,
            recipient_id,
            message_id,
            received_at,
            kind: EventKind::Unknown,
            text: None,
            payload: None,
        });
    }

    if let Some(postback) = item.get("postback") {
        let message_id = str_field(postback, &["mid"])
            .map(str::to_string)
            .unwrap_or_else(|| synthesized_id("postback", &sender_id, raw_ts, item));
        return Some(InboundEvent {
            sender_id,
            recipient_id,
            message_id,
            received_at,
            kind: EventKind::Postback,
            text: str_field(postback, &["title"]).map(str::to_string),
            payload: str_field(postback, &["payload"]).map(str::to_string),
        });
    }

    // Receipts, reactions, referrals and whatever the platform adds next.
    Some(InboundEvent {
        message_id: synthesized_id("unknown", &sender_id, raw_ts, item),
        sender_id,
        recipient_id,
        received_at,
        kind: EventKind::Unknown,
        text: None,
        payload: None,
    })
}
