//! In-process payment gateway.
//!
//! Behaves like a real gateway from the orchestrator's point of view:
//! idempotency keys replay stored replies, webhooks are HMAC signed, and
//! failures can be scripted per operation for tests and local runs.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::provider::{CreateIntentRequest, PaymentProvider, ProviderError, ProviderIntent};
use crate::{
    clock::SharedClock,
    models::payment::{PaymentStatus, WebhookEvent},
    webhooks::{decode_event, WebhookData, WebhookPayload, WebhookSigner},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Create,
    Confirm,
    Capture,
    Cancel,
    Refund,
    GetStatus,
}

/// Scripted result for the next call of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    /// Nothing reaches the gateway.
    Timeout,
    /// The gateway applies the call but the reply is lost.
    LostResponse,
    Decline(String),
    /// Confirm only: the customer must complete a challenge.
    RequiresAction,
    Unavailable,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct MockPaymentProvider {
    signer: WebhookSigner,
    clock: SharedClock,
    auto_capture: bool,
    intents: DashMap<String, ProviderIntent>,
    replies: DashMap<String, ProviderIntent>,
    script: Mutex<HashMap<MockOperation, VecDeque<MockOutcome>>>,
    applied: Mutex<Vec<(MockOperation, String)>>,
}

impl MockPaymentProvider {
    /// A gateway that captures as part of confirmation.
    pub fn new(signer: WebhookSigner, clock: SharedClock) -> Self {
        Self {
            signer,
            clock,
            auto_capture: true,
            intents: DashMap::new(),
            replies: DashMap::new(),
            script: Mutex::new(HashMap::new()),
            applied: Mutex::new(Vec::new()),
        }
    }

    /// Confirmation only authorizes; capture is a separate call.
    pub fn with_manual_capture(mut self) -> Self {
        self.auto_capture = false;
        self
    }

    pub fn script(&self, operation: MockOperation, outcome: MockOutcome) {
        lock(&self.script)
            .entry(operation)
            .or_default()
            .push_back(outcome);
    }

    /// Number of calls of `operation` that actually changed gateway state.
    pub fn applied_count(&self, operation: MockOperation) -> usize {
        lock(&self.applied)
            .iter()
            .filter(|(op, _)| *op == operation)
            .count()
    }

    pub fn intent(&self, provider_intent_id: &str) -> Option<ProviderIntent> {
        self.intents.get(provider_intent_id).map(|i| i.clone())
    }

    /// Moves an intent as if something happened out of band (a customer
    /// finishing 3DS, an operator capturing in the dashboard).
    pub fn force_status(&self, provider_intent_id: &str, status: PaymentStatus) {
        if let Some(mut intent) = self.intents.get_mut(provider_intent_id) {
            if status.is_captured() || status == PaymentStatus::Processing {
                intent.amount_authorized = intent.amount;
            }
            if status.is_captured() {
                intent.amount_captured = intent.amount;
            }
            intent.status = status;
        }
    }

    /// A signed webhook body and header with a fresh event id.
    pub fn signed_event(
        &self,
        event_type: &str,
        provider_intent_id: &str,
        amount: Option<Decimal>,
    ) -> (Vec<u8>, String) {
        let event_id = format!("evt_{}", Uuid::new_v4().simple());
        self.signed_event_with_id(&event_id, event_type, provider_intent_id, amount)
    }

    pub fn signed_event_with_id(
        &self,
        event_id: &str,
        event_type: &str,
        provider_intent_id: &str,
        amount: Option<Decimal>,
    ) -> (Vec<u8>, String) {
        let now = self.clock.now().timestamp();
        let payload = WebhookPayload {
            id: event_id.to_string(),
            event_type: event_type.to_string(),
            created: now,
            data: WebhookData {
                intent_id: provider_intent_id.to_string(),
                amount,
                payment_method: Some("card".to_string()),
                failure_reason: event_type
                    .contains("failed")
                    .then(|| "card_declined".to_string()),
            },
        };
        // serializing plain strings and decimals cannot fail
        let body = serde_json::to_vec(&payload).unwrap_or_default();
        let header = self.signer.signature_header(now, &body);
        (body, header)
    }

    fn next_outcome(&self, operation: MockOperation) -> Option<MockOutcome> {
        lock(&self.script)
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front())
    }

    /// Replays a stored reply, applies the scripted outcome, or runs `apply`
    /// against the stored intent.
    fn execute<F>(
        &self,
        operation: MockOperation,
        provider_intent_id: &str,
        idempotency_key: &str,
        apply: F,
    ) -> Result<ProviderIntent, ProviderError>
    where
        F: FnOnce(&mut ProviderIntent, Option<&MockOutcome>) -> Result<(), ProviderError>,
    {
        if let Some(reply) = self.replies.get(idempotency_key) {
            debug!(key = idempotency_key, "Replaying stored reply");
            return Ok(reply.clone());
        }

        let outcome = self.next_outcome(operation);
        match &outcome {
            Some(MockOutcome::Timeout) => return Err(ProviderError::Timeout),
            Some(MockOutcome::Unavailable) => {
                return Err(ProviderError::Unavailable("scripted outage".to_string()))
            }
            _ => {}
        }

        let reply = {
            let mut intent = self
                .intents
                .get_mut(provider_intent_id)
                .ok_or_else(|| ProviderError::NotFound(provider_intent_id.to_string()))?;
            let mut draft = intent.clone();
            apply(&mut draft, outcome.as_ref())?;
            *intent = draft.clone();
            draft
        };

        lock(&self.applied).push((operation, idempotency_key.to_string()));
        self.replies
            .insert(idempotency_key.to_string(), reply.clone());

        if outcome == Some(MockOutcome::LostResponse) {
            warn!(key = idempotency_key, "Dropping reply on the floor");
            return Err(ProviderError::Timeout);
        }
        Ok(reply)
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<ProviderIntent, ProviderError> {
        if let Some(reply) = self.replies.get(&request.idempotency_key) {
            return Ok(reply.clone());
        }
        let outcome = self.next_outcome(MockOperation::Create);
        match outcome {
            Some(MockOutcome::Timeout) => return Err(ProviderError::Timeout),
            Some(MockOutcome::Unavailable) => {
                return Err(ProviderError::Unavailable("scripted outage".to_string()))
            }
            Some(MockOutcome::Decline(reason)) => return Err(ProviderError::Declined(reason)),
            _ => {}
        }

        let id = format!("pi_mock_{}", Uuid::new_v4().simple());
        let intent = ProviderIntent {
            client_secret: Some(format!("{}_secret_{}", id, Uuid::new_v4().simple())),
            provider_intent_id: id.clone(),
            status: PaymentStatus::Created,
            amount: request.amount,
            amount_authorized: Decimal::ZERO,
            amount_captured: Decimal::ZERO,
            amount_refunded: Decimal::ZERO,
            payment_method: None,
        };
        self.intents.insert(id.clone(), intent.clone());
        lock(&self.applied).push((MockOperation::Create, request.idempotency_key.clone()));
        self.replies
            .insert(request.idempotency_key.clone(), intent.clone());
        info!(provider_intent_id = %id, amount = %request.amount, "Mock intent created");

        if outcome == Some(MockOutcome::LostResponse) {
            return Err(ProviderError::Timeout);
        }
        Ok(intent)
    }

    async fn confirm(
        &self,
        provider_intent_id: &str,
        payment_method: &str,
        idempotency_key: &str,
    ) -> Result<ProviderIntent, ProviderError> {
        let auto_capture = self.auto_capture;
        let mut declined = None;
        let result = self.execute(
            MockOperation::Confirm,
            provider_intent_id,
            idempotency_key,
            |intent, outcome| {
                match intent.status {
                    PaymentStatus::Created | PaymentStatus::RequiresAction => {}
                    PaymentStatus::Cancelled | PaymentStatus::Failed => {
                        return Err(ProviderError::Declined(format!(
                            "intent is {}",
                            intent.status
                        )))
                    }
                    // already confirmed
                    _ => return Ok(()),
                }
                intent.payment_method = Some(payment_method.to_string());
                match outcome {
                    Some(MockOutcome::Decline(reason)) => {
                        intent.status = PaymentStatus::Failed;
                        declined = Some(reason.clone());
                    }
                    Some(MockOutcome::RequiresAction) => {
                        intent.status = PaymentStatus::RequiresAction;
                    }
                    _ => {
                        intent.amount_authorized = intent.amount;
                        if auto_capture {
                            intent.amount_captured = intent.amount;
                            intent.status = PaymentStatus::Captured;
                        } else {
                            intent.status = PaymentStatus::Processing;
                        }
                    }
                }
                Ok(())
            },
        );
        match (result, declined) {
            (Ok(_), Some(reason)) => Err(ProviderError::Declined(reason)),
            (result, _) => result,
        }
    }

    async fn capture(
        &self,
        provider_intent_id: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<ProviderIntent, ProviderError> {
        self.execute(
            MockOperation::Capture,
            provider_intent_id,
            idempotency_key,
            |intent, outcome| {
                if let Some(MockOutcome::Decline(reason)) = outcome {
                    return Err(ProviderError::Declined(reason.clone()));
                }
                if intent.status.is_captured() {
                    return Ok(());
                }
                if intent.status != PaymentStatus::Processing || amount > intent.amount_authorized
                {
                    return Err(ProviderError::Declined(format!(
                        "cannot capture {} from a {} intent with {} authorized",
                        amount, intent.status, intent.amount_authorized
                    )));
                }
                intent.amount_captured = amount;
                intent.status = PaymentStatus::Captured;
                Ok(())
            },
        )
    }

    async fn cancel(
        &self,
        provider_intent_id: &str,
        idempotency_key: &str,
    ) -> Result<ProviderIntent, ProviderError> {
        self.execute(
            MockOperation::Cancel,
            provider_intent_id,
            idempotency_key,
            |intent, _| match intent.status {
                PaymentStatus::Created
                | PaymentStatus::RequiresAction
                | PaymentStatus::Processing => {
                    intent.status = PaymentStatus::Cancelled;
                    Ok(())
                }
                PaymentStatus::Cancelled | PaymentStatus::Failed => Ok(()),
                other => Err(ProviderError::Declined(format!(
                    "cannot cancel a {} intent",
                    other
                ))),
            },
        )
    }

    async fn refund(
        &self,
        provider_intent_id: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<ProviderIntent, ProviderError> {
        self.execute(
            MockOperation::Refund,
            provider_intent_id,
            idempotency_key,
            |intent, outcome| {
                if let Some(MockOutcome::Decline(reason)) = outcome {
                    return Err(ProviderError::Declined(reason.clone()));
                }
                let refundable = intent.amount_captured - intent.amount_refunded;
                if amount <= Decimal::ZERO || amount > refundable {
                    return Err(ProviderError::Declined(format!(
                        "refund of {} exceeds refundable {}",
                        amount, refundable
                    )));
                }
                intent.amount_refunded += amount;
                intent.status = if intent.amount_refunded == intent.amount_captured {
                    PaymentStatus::Refunded
                } else {
                    PaymentStatus::PartiallyRefunded
                };
                Ok(())
            },
        )
    }

    async fn get_status(&self, provider_intent_id: &str) -> Result<ProviderIntent, ProviderError> {
        match self.next_outcome(MockOperation::GetStatus) {
            Some(MockOutcome::Timeout) | Some(MockOutcome::LostResponse) => {
                return Err(ProviderError::Timeout)
            }
            Some(MockOutcome::Unavailable) => {
                return Err(ProviderError::Unavailable("scripted outage".to_string()))
            }
            _ => {}
        }
        self.intent(provider_intent_id)
            .ok_or_else(|| ProviderError::NotFound(provider_intent_id.to_string()))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn provider() -> MockPaymentProvider {
        let signer = WebhookSigner::new("whsec_test", 300).unwrap();
        MockPaymentProvider::new(signer, Arc::new(ManualClock::default()))
    }

    async fn created(provider: &MockPaymentProvider) -> ProviderIntent {
        provider
            .create_intent(&CreateIntentRequest {
                checkout_id: Uuid::new_v4(),
                amount: dec!(90.00),
                currency: "USD".to_string(),
                idempotency_key: "create:1".to_string(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn lost_response_is_recovered_by_replaying_the_key() {
        let provider = provider();
        let intent = created(&provider).await;
        provider.script(MockOperation::Confirm, MockOutcome::LostResponse);

        assert_eq!(
            provider
                .confirm(&intent.provider_intent_id, "card", "confirm:1")
                .await,
            Err(ProviderError::Timeout)
        );
        let replay = provider
            .confirm(&intent.provider_intent_id, "card", "confirm:1")
            .await
            .unwrap();

        assert_eq!(replay.status, PaymentStatus::Captured);
        assert_eq!(provider.applied_count(MockOperation::Confirm), 1);
    }

    #[tokio::test]
    async fn declined_confirm_fails_the_intent() {
        let provider = provider();
        let intent = created(&provider).await;
        provider.script(
            MockOperation::Confirm,
            MockOutcome::Decline("insufficient_funds".to_string()),
        );

        assert_matches!(
            provider
                .confirm(&intent.provider_intent_id, "card", "confirm:1")
                .await,
            Err(ProviderError::Declined(reason)) if reason == "insufficient_funds"
        );
        assert_eq!(
            provider.intent(&intent.provider_intent_id).unwrap().status,
            PaymentStatus::Failed
        );
    }

    #[tokio::test]
    async fn manual_capture_and_partial_refund() {
        let provider = provider().with_manual_capture();
        let intent = created(&provider).await;
        let id = intent.provider_intent_id.as_str();

        let confirmed = provider.confirm(id, "card", "confirm:1").await.unwrap();
        assert_eq!(confirmed.status, PaymentStatus::Processing);

        let captured = provider.capture(id, dec!(90.00), "capture:1").await.unwrap();
        assert_eq!(captured.amount_captured, dec!(90.00));

        let refunded = provider.refund(id, dec!(30.00), "refund:1").await.unwrap();
        assert_eq!(refunded.status, PaymentStatus::PartiallyRefunded);
        assert_matches!(
            provider.refund(id, dec!(60.01), "refund:2").await,
            Err(ProviderError::Declined(_))
        );
        assert_matches!(
            provider.cancel(id, "cancel:1").await,
            Err(ProviderError::Declined(_))
        );
    }

    #[tokio::test]
    async fn signed_events_verify() {
        let provider = provider();
        let (body, header) = provider.signed_event("charge.dispute.created", "pi_1", None);
        let event = provider.process_webhook(&body, &header).unwrap();
        assert_eq!(event.provider_intent_id, "pi_1");

        assert_matches!(
            provider.process_webhook(&body, "t=1,v1=00"),
            Err(ProviderError::InvalidSignature(_))
        );
    }
}
