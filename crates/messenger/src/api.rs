use async_trait::async_trait;
use pagebridge_core::error::SendErrorKind;
use pagebridge_core::secrets::Secret;
use pagebridge_core::types::{OutboundContent, OutboundMessage};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

/// What the platform returns for an accepted message.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ApiAccepted {
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

/// One failed call to the send endpoint, already classified.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiFailure {
    pub kind: SendErrorKind,
    pub code: Option<i64>,
    pub message: String,
}

impl ApiFailure {
    pub fn new(kind: SendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }
}

/// Single-shot transport to the platform's send endpoint. Retries live in
/// [`crate::MessengerSender`].
#[async_trait]
pub trait SendApi: Send + Sync {
    async fn post_message(&self, msg: &OutboundMessage) -> Result<ApiAccepted, ApiFailure>;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphError {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "type")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub error_subcode: Option<i64>,
    #[serde(default)]
    pub is_transient: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct GraphErrorEnvelope {
    error: GraphError,
}

/// Map an HTTP status plus optional Graph error object to a classification.
pub fn classify(status: u16, error: Option<&GraphError>) -> SendErrorKind {
    if let Some(err) = error {
        let subcode = err.error_subcode.unwrap_or_default();
        match err.code {
            // Invalid / expired token, session key invalid
            Some(190) | Some(102) => return SendErrorKind::Auth,
            // Application, user, page-level and messenger throttling
            Some(4) | Some(17) | Some(32) | Some(613) => return SendErrorKind::RateLimited,
            _ => {}
        }
        if (2_018_000..2_019_000).contains(&subcode) {
            return SendErrorKind::Policy;
        }
        match err.code {
            // Permission missing, recipient unavailable
            Some(10) | Some(200) | Some(551) => return SendErrorKind::Policy,
            Some(100) => return SendErrorKind::InvalidPayload,
            Some(1) | Some(2) => return SendErrorKind::Server(status),
            _ => {}
        }
        if err.is_transient == Some(true) {
            return SendErrorKind::Server(status);
        }
    }

    match status {
        401 => SendErrorKind::Auth,
        429 => SendErrorKind::RateLimited,
        s if s >= 500 => SendErrorKind::Server(s),
        s => SendErrorKind::Rejected(s),
    }
}

/// Request body for `POST /me/messages`.
pub fn message_payload(msg: &OutboundMessage) -> Value {
    let message = match &msg.content {
        OutboundContent::Text { text } => json!({ "text": text }),
        OutboundContent::Attachment {
            kind,
            url,
            is_reusable,
        } => json!({
            "attachment": {
                "type": kind.as_str(),
                "payload": { "url": url, "is_reusable": is_reusable }
            }
        }),
    };
    json!({
        "messaging_type": "RESPONSE",
        "recipient": { "id": msg.recipient_id },
        "message": message,
    })
}

/// Graph API send endpoint over reqwest.
#[derive(Clone)]
pub struct GraphApi {
    client: Client,
    api_base: String,
    token: Secret,
}

impl fmt::Debug for GraphApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphApi")
            .field("api_base", &self.api_base)
            .field("token", &self.token)
            .finish()
    }
}

impl GraphApi {
    pub fn new(api_base: &str, token: Secret, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/me/messages", self.api_base)
    }
}

#[async_trait]
impl SendApi for GraphApi {
    async fn post_message(&self, msg: &OutboundMessage) -> Result<ApiAccepted, ApiFailure> {
        let resp = self
            .client
            .post(self.messages_url())
            .bearer_auth(self.token.expose())
            .json(&message_payload(msg))
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    SendErrorKind::Timeout
                } else {
                    SendErrorKind::Network
                };
                // reqwest errors carry the URL, never the bearer header.
                ApiFailure::new(kind, e.to_string())
            })?;

        let status = resp.status();
        if status.is_success() {
            // The platform has taken the message; a body we can't parse must
            // not turn into a retry (and a second copy for the user).
            let accepted = resp.json::<ApiAccepted>().await.unwrap_or_default();
            return Ok(accepted);
        }

        let body = resp.text().await.unwrap_or_default();
        Err(failure_from_response(status, &body))
    }
}

fn failure_from_response(status: StatusCode, body: &str) -> ApiFailure {
    let graph_error = serde_json::from_str::<GraphErrorEnvelope>(body)
        .ok()
        .map(|e| e.error);
    let kind = classify(status.as_u16(), graph_error.as_ref());
    let message = graph_error
        .as_ref()
        .and_then(|e| e.message.clone())
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
    ApiFailure {
        kind,
        code: graph_error.and_then(|e| e.code),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use pagebridge_core::types::AttachmentKind;

    fn graph_error(code: i64, subcode: Option<i64>) -> GraphError {
        GraphError {
            message: Some("boom".to_string()),
            error_type: Some("OAuthException".to_string()),
            code: Some(code),
            error_subcode: subcode,
            is_transient: None,
        }
    }

    fn text_message() -> OutboundMessage {
        OutboundMessage::new(
            "psid-1",
            OutboundContent::Text {
                text: "Chào bạn".to_string(),
            },
        )
    }

    #[test]
    fn classification_table() {
        assert_eq!(classify(400, Some(&graph_error(190, None))), SendErrorKind::Auth);
        assert_eq!(classify(400, Some(&graph_error(613, None))), SendErrorKind::RateLimited);
        assert_eq!(classify(400, Some(&graph_error(4, None))), SendErrorKind::RateLimited);
        assert_eq!(classify(400, Some(&graph_error(10, None))), SendErrorKind::Policy);
        assert_eq!(classify(400, Some(&graph_error(551, None))), SendErrorKind::Policy);
        assert_eq!(
            classify(400, Some(&graph_error(100, Some(2018001)))),
            SendErrorKind::Policy
        );
        assert_eq!(classify(400, Some(&graph_error(100, None))), SendErrorKind::InvalidPayload);
        assert_eq!(classify(500, Some(&graph_error(2, None))), SendErrorKind::Server(500));
        assert_eq!(classify(502, None), SendErrorKind::Server(502));
        assert_eq!(classify(429, None), SendErrorKind::RateLimited);
        assert_eq!(classify(401, None), SendErrorKind::Auth);
        assert_eq!(classify(404, None), SendErrorKind::Rejected(404));

        let transient = GraphError {
            is_transient: Some(true),
            code: Some(9999),
            ..Default::default()
        };
        assert!(classify(400, Some(&transient)).is_retryable());
    }

    #[test]
    fn payload_shapes() {
        let text = message_payload(&text_message());
        assert_eq!(text["messaging_type"], "RESPONSE");
        assert_eq!(text["recipient"]["id"], "psid-1");
        assert_eq!(text["message"]["text"], "Chào bạn");

        let image = message_payload(&OutboundMessage::new(
            "psid-1",
            OutboundContent::Attachment {
                kind: AttachmentKind::Image,
                url: "https://cdn.example/p.jpg".to_string(),
                is_reusable: true,
            },
        ));
        assert_eq!(image["message"]["attachment"]["type"], "image");
        assert_eq!(
            image["message"]["attachment"]["payload"]["url"],
            "https://cdn.example/p.jpg"
        );
        assert_eq!(image["message"]["attachment"]["payload"]["is_reusable"], true);
        assert!(image["message"].get("text").is_none());
    }

    #[test]
    fn debug_masks_token() {
        let api = GraphApi::new(
            "https://graph.example/v18.0/",
            Secret::new("EAAGverysecretpagetoken"),
            Duration::from_secs(5),
        )
        .expect("client");
        let rendered = format!("{:?}", api);
        assert!(!rendered.contains("verysecret"));
        assert_eq!(api.messages_url(), "https://graph.example/v18.0/me/messages");
    }

    #[tokio::test]
    async fn posts_with_bearer_token_and_parses_success() {
        let server = MockServer::start();
        let sent = server.mock(|when, then| {
            when.method(POST)
                .path("/me/messages")
                .header("authorization", "Bearer EAAG-test-token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"recipient_id":"psid-1","message_id":"m_out_1"}"#);
        });

        let api = GraphApi::new(
            &server.base_url(),
            Secret::new("EAAG-test-token"),
            Duration::from_secs(3),
        )
        .expect("client");
        let accepted = api.post_message(&text_message()).await.expect("accepted");
        assert_eq!(accepted.recipient_id.as_deref(), Some("psid-1"));
        assert_eq!(accepted.message_id.as_deref(), Some("m_out_1"));
        sent.assert_calls(1);
    }

    #[tokio::test]
    async fn structured_errors_are_classified() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/me/messages");
            then.status(400)
                .header("content-type", "application/json")
                .body(
                    r#"{"error":{"message":"Invalid OAuth access token.","type":"OAuthException","code":190,"fbtrace_id":"AbC"}}"#,
                );
        });

        let api = GraphApi::new(&server.base_url(), Secret::new("bad"), Duration::from_secs(3))
            .expect("client");
        let failure = api.post_message(&text_message()).await.expect_err("should fail");
        assert_eq!(failure.kind, SendErrorKind::Auth);
        assert_eq!(failure.code, Some(190));
        assert_eq!(failure.message, "Invalid OAuth access token.");
    }

    #[tokio::test]
    async fn bare_server_errors_are_retryable() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/me/messages");
            then.status(503).body("upstream unavailable");
        });

        let api = GraphApi::new(&server.base_url(), Secret::new("t"), Duration::from_secs(3))
            .expect("client");
        let failure = api.post_message(&text_message()).await.expect_err("should fail");
        assert_eq!(failure.kind, SendErrorKind::Server(503));
        assert_eq!(failure.message, "HTTP 503");
        assert!(failure.kind.is_retryable());
    }
}
