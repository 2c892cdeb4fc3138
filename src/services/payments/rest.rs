use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::provider::{CreateIntentRequest, PaymentProvider, ProviderError, ProviderIntent};
use crate::{
    clock::SharedClock,
    errors::ServiceError,
    models::{
        money::{from_minor_units, to_minor_units},
        payment::{PaymentStatus, WebhookEvent},
    },
    webhooks::{decode_event, WebhookSigner},
};

/// JSON-over-HTTP gateway speaking a Stripe-shaped intents API in minor
/// units.
#[derive(Clone)]
pub struct RestPaymentProvider {
    client: Client,
    base_url: String,
    api_key: String,
    signer: WebhookSigner,
    clock: SharedClock,
}

#[derive(Debug, Deserialize)]
struct GatewayIntent {
    id: String,
    status: String,
    amount: i64,
    #[serde(default)]
    amount_capturable: i64,
    #[serde(default)]
    amount_received: i64,
    #[serde(default)]
    amount_refunded: i64,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    payment_method: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    error: GatewayErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorDetail {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

impl GatewayIntent {
    fn into_provider_intent(self) -> Result<ProviderIntent, ProviderError> {
        let status = match self.status.as_str() {
            "requires_payment_method" | "requires_confirmation" => PaymentStatus::Created,
            "requires_action" => PaymentStatus::RequiresAction,
            "processing" | "requires_capture" => PaymentStatus::Processing,
            "succeeded" if self.amount_refunded == 0 => PaymentStatus::Captured,
            "succeeded" if self.amount_refunded < self.amount_received => {
                PaymentStatus::PartiallyRefunded
            }
            "succeeded" | "refunded" => PaymentStatus::Refunded,
            "partially_refunded" => PaymentStatus::PartiallyRefunded,
            "canceled" | "cancelled" => PaymentStatus::Cancelled,
            "failed" => PaymentStatus::Failed,
            other => {
                return Err(ProviderError::InvalidPayload(format!(
                    "unknown intent status '{}'",
                    other
                )))
            }
        };
        Ok(ProviderIntent {
            provider_intent_id: self.id,
            status,
            amount: from_minor_units(self.amount),
            amount_authorized: from_minor_units(self.amount_capturable.max(self.amount_received)),
            amount_captured: from_minor_units(self.amount_received),
            amount_refunded: from_minor_units(self.amount_refunded),
            client_secret: self.client_secret,
            payment_method: self.payment_method,
        })
    }
}

/// The gateway takes integer cents; an amount it cannot represent is refused
/// before anything is sent.
fn minor_units(amount: Decimal) -> Result<i64, ProviderError> {
    to_minor_units(amount)
        .ok_or_else(|| ProviderError::Declined(format!("amount {} is out of range", amount)))
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Unavailable(err.to_string())
    }
}

impl RestPaymentProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
        signer: WebhookSigner,
        clock: SharedClock,
    ) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            signer,
            clock,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/payment_intents{}", self.base_url, path)
    }

    async fn send(
        &self,
        request: RequestBuilder,
        idempotency_key: Option<&str>,
    ) -> Result<ProviderIntent, ProviderError> {
        let mut request = request.bearer_auth(&self.api_key);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            let intent: GatewayIntent = response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidPayload(e.to_string()))?;
            debug!(provider_intent_id = %intent.id, status = %intent.status, "Gateway replied");
            return intent.into_provider_intent();
        }

        let (code, message) = match response.json::<GatewayErrorBody>().await {
            Ok(body) => (body.error.code, body.error.message),
            Err(_) => (None, status.to_string()),
        };
        warn!(%status, code = ?code, "Gateway call failed: {}", message);
        Err(match status {
            StatusCode::PAYMENT_REQUIRED
            | StatusCode::BAD_REQUEST
            | StatusCode::UNPROCESSABLE_ENTITY => ProviderError::Declined(code.unwrap_or(message)),
            StatusCode::NOT_FOUND => ProviderError::NotFound(message),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderError::Timeout,
            _ => ProviderError::Unavailable(message),
        })
    }
}

#[async_trait]
impl PaymentProvider for RestPaymentProvider {
    fn name(&self) -> &str {
        "rest"
    }

    #[instrument(skip(self, request), fields(checkout_id = %request.checkout_id))]
    async fn create_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<ProviderIntent, ProviderError> {
        let body = json!({
            "amount": minor_units(request.amount)?,
            "currency": request.currency.to_lowercase(),
            "capture_method": "automatic",
            "metadata": { "checkout_id": request.checkout_id },
        });
        self.send(
            self.client.post(self.url("")).json(&body),
            Some(&request.idempotency_key),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn confirm(
        &self,
        provider_intent_id: &str,
        payment_method: &str,
        idempotency_key: &str,
    ) -> Result<ProviderIntent, ProviderError> {
        let body = json!({ "payment_method": payment_method });
        self.send(
            self.client
                .post(self.url(&format!("/{}/confirm", provider_intent_id)))
                .json(&body),
            Some(idempotency_key),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn capture(
        &self,
        provider_intent_id: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<ProviderIntent, ProviderError> {
        let body = json!({ "amount_to_capture": minor_units(amount)? });
        self.send(
            self.client
                .post(self.url(&format!("/{}/capture", provider_intent_id)))
                .json(&body),
            Some(idempotency_key),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn cancel(
        &self,
        provider_intent_id: &str,
        idempotency_key: &str,
    ) -> Result<ProviderIntent, ProviderError> {
        self.send(
            self.client
                .post(self.url(&format!("/{}/cancel", provider_intent_id))),
            Some(idempotency_key),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn refund(
        &self,
        provider_intent_id: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<ProviderIntent, ProviderError> {
        let body = json!({ "amount": minor_units(amount)? });
        self.send(
            self.client
                .post(self.url(&format!("/{}/refunds", provider_intent_id)))
                .json(&body),
            Some(idempotency_key),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn get_status(&self, provider_intent_id: &str) -> Result<ProviderIntent, ProviderError> {
        self.send(
            self.client
                .get(self.url(&format!("/{}", provider_intent_id))),
            None,
        )
        .await
    }

    fn process_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<WebhookEvent, ProviderError> {
        self.signer.verify(signature, payload, self.clock.now())?;
        Ok(decode_event(payload)?)
    }
}
