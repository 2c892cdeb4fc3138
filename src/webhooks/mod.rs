//! Payment webhook signing and decoding.
//!
//! Providers sign `"{timestamp}.{body}"` with HMAC-SHA256 and send
//! `x-signature: t=<unix seconds>,v1=<hex digest>`. Verification happens on
//! the raw body before anything is parsed.

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::models::payment::{PaymentStatus, WebhookAction, WebhookEvent};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WebhookError {
    #[error("invalid webhook secret")]
    InvalidSecret,
    #[error("malformed signature header")]
    MalformedSignature,
    #[error("signature timestamp outside tolerance ({0}s off)")]
    StaleTimestamp(i64),
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("unsupported event type: {0}")]
    UnsupportedEvent(String),
}

/// HMAC signer/verifier for webhook bodies.
#[derive(Clone)]
pub struct WebhookSigner {
    mac: HmacSha256,
    tolerance_secs: u64,
}

impl std::fmt::Debug for WebhookSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSigner")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

impl WebhookSigner {
    pub fn new(secret: &str, tolerance_secs: u64) -> Result<Self, WebhookError> {
        if secret.is_empty() {
            return Err(WebhookError::InvalidSecret);
        }
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| WebhookError::InvalidSecret)?;
        Ok(Self {
            mac,
            tolerance_secs,
        })
    }

    /// Hex HMAC of `"{timestamp}.{body}"`.
    pub fn sign(&self, timestamp: i64, body: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Full header value for a body signed at `timestamp`.
    pub fn signature_header(&self, timestamp: i64, body: &[u8]) -> String {
        format!("t={},v1={}", timestamp, self.sign(timestamp, body))
    }

    /// Checks the header against the body. The digest comparison is
    /// constant-time.
    pub fn verify(&self, header: &str, body: &[u8], now: DateTime<Utc>) -> Result<(), WebhookError> {
        let (timestamp, digest) = parse_signature_header(header)?;

        let skew = now
            .timestamp()
            .checked_sub(timestamp)
            .ok_or(WebhookError::MalformedSignature)?;
        if skew.unsigned_abs() > self.tolerance_secs {
            return Err(WebhookError::StaleTimestamp(skew));
        }

        let expected = hex::decode(digest).map_err(|_| WebhookError::MalformedSignature)?;
        let mut mac = self.mac.clone();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        mac.verify_slice(&expected)
            .map_err(|_| WebhookError::SignatureMismatch)
    }
}

fn parse_signature_header(header: &str) -> Result<(i64, &str), WebhookError> {
    let mut timestamp = None;
    let mut digest = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => digest = Some(value),
            _ => {}
        }
    }
    match (timestamp, digest) {
        (Some(t), Some(d)) if !d.is_empty() => Ok((t, d)),
        _ => Err(WebhookError::MalformedSignature),
    }
}

/// Wire envelope shared by the mock and REST gateways.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds.
    pub created: i64,
    pub data: WebhookData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookData {
    pub intent_id: String,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// Maps a provider event type onto the action it asks for and the status it
/// reports.
pub fn classify(event_type: &str) -> Option<(WebhookAction, Option<PaymentStatus>)> {
    let mapped = match event_type {
        "payment_intent.succeeded" | "charge.succeeded" | "charge.captured" => {
            (WebhookAction::MarkAsPaid, Some(PaymentStatus::Captured))
        }
        // authorized, waiting on capture
        "payment_intent.amount_capturable_updated" => {
            (WebhookAction::MarkAsPaid, Some(PaymentStatus::Processing))
        }
        "payment_intent.processing" => (
            WebhookAction::UpdatePaymentMethod,
            Some(PaymentStatus::Processing),
        ),
        "payment_intent.requires_action" => (
            WebhookAction::UpdatePaymentMethod,
            Some(PaymentStatus::RequiresAction),
        ),
        "payment_intent.payment_method_updated" | "payment_method.attached" => {
            (WebhookAction::UpdatePaymentMethod, None)
        }
        "payment_intent.payment_failed" | "charge.failed" => {
            (WebhookAction::MarkAsFailed, Some(PaymentStatus::Failed))
        }
        "payment_intent.canceled" => (WebhookAction::MarkAsFailed, Some(PaymentStatus::Cancelled)),
        "charge.refunded" | "refund.succeeded" => (WebhookAction::ProcessRefund, None),
        "charge.dispute.created" => (WebhookAction::ChargeDisputed, None),
        _ => return None,
    };
    Some(mapped)
}

/// Parses a verified body into a [`WebhookEvent`].
pub fn decode_event(body: &[u8]) -> Result<WebhookEvent, WebhookError> {
    let payload: WebhookPayload =
        serde_json::from_slice(body).map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
    if payload.id.is_empty() || payload.data.intent_id.is_empty() {
        return Err(WebhookError::InvalidPayload(
            "event id and intent id are required".to_string(),
        ));
    }
    let (action, status) = classify(&payload.event_type)
        .ok_or_else(|| WebhookError::UnsupportedEvent(payload.event_type.clone()))?;
    let occurred_at = Utc
        .timestamp_opt(payload.created, 0)
        .single()
        .ok_or_else(|| WebhookError::InvalidPayload("bad created timestamp".to_string()))?;

    Ok(WebhookEvent {
        event_id: payload.id,
        event_type: payload.event_type,
        provider_intent_id: payload.data.intent_id,
        action,
        status,
        amount: payload.data.amount,
        payment_method: payload.data.payment_method,
        failure_reason: payload.data.failure_reason,
        occurred_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn signer() -> WebhookSigner {
        WebhookSigner::new("whsec_test123secret456", 300).unwrap()
    }

    fn body() -> Vec<u8> {
        serde_json::to_vec(&WebhookPayload {
            id: "evt_1".to_string(),
            event_type: "payment_intent.succeeded".to_string(),
            created: 1_700_000_000,
            data: WebhookData {
                intent_id: "pi_1".to_string(),
                amount: Some(dec!(90.00)),
                ..Default::default()
            },
        })
        .unwrap()
    }

    #[test]
    fn extreme_timestamps_are_rejected_without_overflow() {
        let now = Utc::now();
        assert_matches!(
            signer().verify("t=-9223372036854775808,v1=00", b"{}", now),
            Err(WebhookError::MalformedSignature)
        );
        assert_matches!(
            signer().verify("t=9223372036854775807,v1=00", b"{}", now),
            Err(WebhookError::StaleTimestamp(skew)) if skew < 0
        );
    }

    #[test]
    fn valid_signature_is_accepted() {
        let now = Utc::now();
        let header = signer().signature_header(now.timestamp(), &body());
        assert!(signer().verify(&header, &body(), now).is_ok());
    }

    #[test]
    fn modified_payload_is_rejected() {
        let now = Utc::now();
        let header = signer().signature_header(now.timestamp(), &body());
        let mut tampered = body();
        tampered.push(b' ');
        assert_eq!(
            signer().verify(&header, &tampered, now),
            Err(WebhookError::SignatureMismatch)
        );
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let now = Utc::now();
        let other = WebhookSigner::new("wrong_secret", 300).unwrap();
        let header = other.signature_header(now.timestamp(), &body());
        assert_eq!(
            signer().verify(&header, &body(), now),
            Err(WebhookError::SignatureMismatch)
        );
    }

    #[test]
    fn old_timestamp_is_rejected() {
        let now = Utc::now();
        let header = signer().signature_header(now.timestamp() - 600, &body());
        assert_matches!(
            signer().verify(&header, &body(), now),
            Err(WebhookError::StaleTimestamp(600))
        );
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let now = Utc::now();
        for header in ["", "v1=abc", "t=123", "t=abc,v1=00", "t=1,v1=zz"] {
            assert!(signer().verify(header, &body(), now).is_err(), "{header}");
        }
    }

    #[test]
    fn decodes_capture_event() {
        let event = decode_event(&body()).unwrap();
        assert_eq!(event.event_id, "evt_1");
        assert_eq!(event.provider_intent_id, "pi_1");
        assert_eq!(event.action, WebhookAction::MarkAsPaid);
        assert_eq!(event.status, Some(PaymentStatus::Captured));
        assert_eq!(event.amount, Some(dec!(90.00)));
    }

    #[test]
    fn unknown_event_type_is_unsupported() {
        let body = br#"{"id":"evt_2","type":"customer.created","created":1700000000,"data":{"intent_id":"pi_1"}}"#;
        assert_matches!(decode_event(body), Err(WebhookError::UnsupportedEvent(_)));
    }
}
