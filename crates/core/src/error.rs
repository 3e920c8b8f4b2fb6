use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Classification of a single failed send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "status")]
pub enum SendErrorKind {
    /// Connection, TLS or body read failure.
    Network,
    Timeout,
    /// 5xx from the platform.
    Server(u16),
    /// HTTP 429 or one of the platform's throttling error codes.
    RateLimited,
    /// Invalid or expired access token.
    Auth,
    /// Recipient policy violation (not opted in, outside messaging window, blocked).
    Policy,
    /// The platform rejected the request body.
    InvalidPayload,
    /// Any other 4xx we have no specific mapping for.
    Rejected(u16),
}

impl SendErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SendErrorKind::Network
                | SendErrorKind::Timeout
                | SendErrorKind::Server(_)
                | SendErrorKind::RateLimited
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            SendErrorKind::Network => "network",
            SendErrorKind::Timeout => "timeout",
            SendErrorKind::Server(_) => "server",
            SendErrorKind::RateLimited => "rate_limited",
            SendErrorKind::Auth => "auth",
            SendErrorKind::Policy => "policy",
            SendErrorKind::InvalidPayload => "invalid_payload",
            SendErrorKind::Rejected(_) => "rejected",
        }
    }
}

impl fmt::Display for SendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendErrorKind::Server(status) | SendErrorKind::Rejected(status) => {
                write!(f, "{} ({})", self.label(), status)
            }
            _ => f.write_str(self.label()),
        }
    }
}

/// Terminal failure of an outbound send.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SendError {
    /// Every attempt failed with a retryable error and the budget is spent.
    #[error("transient send failure after {attempts} attempts ({kind}): {message}")]
    TransientSendFailure {
        kind: SendErrorKind,
        attempts: u32,
        message: String,
    },
    /// The platform refused the message; retrying would not help.
    #[error("permanent send failure after {attempts} attempt(s) ({kind}): {message}")]
    PermanentSendFailure {
        kind: SendErrorKind,
        attempts: u32,
        message: String,
    },
}

impl SendError {
    pub fn attempts(&self) -> u32 {
        match self {
            SendError::TransientSendFailure { attempts, .. }
            | SendError::PermanentSendFailure { attempts, .. } => *attempts,
        }
    }

    pub fn kind(&self) -> SendErrorKind {
        match self {
            SendError::TransientSendFailure { kind, .. }
            | SendError::PermanentSendFailure { kind, .. } => *kind,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, SendError::PermanentSendFailure { .. })
    }
}
