use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    errors::ServiceError,
    models::payment::{PaymentStatus, WebhookEvent},
    webhooks::WebhookError,
};

/// Failures a gateway can report. The orchestrator decides which of these
/// are retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider call timed out")]
    Timeout,
    #[error("payment declined: {0}")]
    Declined(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("intent {0} not found at provider")]
    NotFound(String),
    #[error("invalid webhook signature: {0}")]
    InvalidSignature(String),
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),
}

impl From<WebhookError> for ProviderError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::InvalidPayload(_) | WebhookError::UnsupportedEvent(_) => {
                ProviderError::InvalidPayload(err.to_string())
            }
            other => ProviderError::InvalidSignature(other.to_string()),
        }
    }
}

impl From<ProviderError> for ServiceError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout => {
                ServiceError::ProviderUnavailable("payment provider timed out".to_string())
            }
            ProviderError::Declined(reason) => ServiceError::PaymentDeclined(reason),
            ProviderError::Unavailable(reason) => ServiceError::ProviderUnavailable(reason),
            ProviderError::NotFound(id) => {
                ServiceError::NotFound(format!("Provider intent {} not found", id))
            }
            ProviderError::InvalidSignature(_) => ServiceError::InvalidSignature,
            ProviderError::InvalidPayload(reason) => ServiceError::InvalidPayload(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateIntentRequest {
    pub checkout_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub idempotency_key: String,
}

/// The gateway's view of an intent, as returned by every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderIntent {
    pub provider_intent_id: String,
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub amount_authorized: Decimal,
    pub amount_captured: Decimal,
    pub amount_refunded: Decimal,
    pub client_secret: Option<String>,
    pub payment_method: Option<String>,
}

/// Payment gateway capability. Every implementation is driven the same way;
/// which one runs is a configuration choice.
///
/// Mutating calls take an idempotency key. Replaying a key must return the
/// original result without repeating the side effect.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn create_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<ProviderIntent, ProviderError>;

    async fn confirm(
        &self,
        provider_intent_id: &str,
        payment_method: &str,
        idempotency_key: &str,
    ) -> Result<ProviderIntent, ProviderError>;

    async fn capture(
        &self,
        provider_intent_id: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<ProviderIntent, ProviderError>;

    async fn cancel(
        &self,
        provider_intent_id: &str,
        idempotency_key: &str,
    ) -> Result<ProviderIntent, ProviderError>;

    async fn refund(
        &self,
        provider_intent_id: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<ProviderIntent, ProviderError>;

    async fn get_status(&self, provider_intent_id: &str) -> Result<ProviderIntent, ProviderError>;

    /// Verifies the signature over the raw body, then decodes it. Nothing is
    /// parsed from an unverified body.
    fn process_webhook(&self, payload: &[u8], signature: &str)
        -> Result<WebhookEvent, ProviderError>;
}
