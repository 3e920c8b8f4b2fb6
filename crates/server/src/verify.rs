//! Webhook ownership handshake and delivery signature checks.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header the platform signs every delivery with.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("hub.mode is not 'subscribe'")]
    InvalidMode,
    #[error("verify token is not configured")]
    NotConfigured,
    #[error("verify token mismatch")]
    TokenMismatch,
    #[error("hub.challenge is missing")]
    MissingChallenge,
}

/// Returns the challenge to echo back if the subscription request is ours.
pub fn verify_handshake(
    mode: Option<&str>,
    token: Option<&str>,
    challenge: Option<&str>,
    expected_token: Option<&str>,
) -> Result<String, VerifyError> {
    if mode != Some("subscribe") {
        return Err(VerifyError::InvalidMode);
    }
    let expected = expected_token.unwrap_or_default();
    if expected.trim().is_empty() {
        return Err(VerifyError::NotConfigured);
    }
    let provided = token.unwrap_or_default();
    if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        return Err(VerifyError::TokenMismatch);
    }
    challenge
        .map(str::to_string)
        .ok_or(VerifyError::MissingChallenge)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Valid,
    Invalid(&'static str),
}

impl SignatureCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, SignatureCheck::Valid)
    }
}

/// HMAC-SHA256 of the exact raw body, compared in constant time.
pub fn verify_delivery(body: &[u8], header: Option<&str>, app_secret: Option<&str>) -> SignatureCheck {
    let secret = match app_secret {
        Some(s) if !s.trim().is_empty() => s,
        _ => return SignatureCheck::Invalid("app secret not configured"),
    };
    let Some(header) = header else {
        return SignatureCheck::Invalid("missing signature header");
    };
    let Some(sig_hex) = header.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return SignatureCheck::Invalid("unexpected signature scheme");
    };
    let Ok(provided) = hex::decode(sig_hex) else {
        return SignatureCheck::Invalid("signature is not hex");
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return SignatureCheck::Invalid("unusable app secret");
    };
    mac.update(body);
    match mac.verify_slice(&provided) {
        Ok(()) => SignatureCheck::Valid,
        Err(_) => SignatureCheck::Invalid("signature mismatch"),
    }
}

/// Header value the platform would send for `body`. Handy for replaying
/// captured deliveries against a local instance.
pub fn signature_header(body: &[u8], app_secret: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(app_secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}
