//! Payment intent orchestration.
//!
//! The local [`PaymentIntent`] mirrors the gateway. It moves only on a reply
//! to a call made here or on a verified webhook whose event id has not been
//! seen, and in both cases only forwards (see
//! [`PaymentStatus::can_advance_to`]). Interactive calls and webhook ingress
//! may race on the same intent; the forward-only rule plus monotone amounts
//! make the order irrelevant.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::provider::{CreateIntentRequest, PaymentProvider, ProviderError, ProviderIntent};
use crate::{
    clock::SharedClock,
    errors::ServiceError,
    events::{Event, EventSender},
    models::{
        money::{round_money, to_minor_units},
        payment::{PaymentIntent, PaymentStatus, WebhookAction, WebhookEvent, WebhookOutcome},
    },
    repositories::VersionedStore,
};

const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// A processed webhook and the intent it touched.
#[derive(Debug, Clone)]
pub struct WebhookReceipt {
    pub outcome: WebhookOutcome,
    pub event: Option<WebhookEvent>,
    pub intent: Option<PaymentIntent>,
}

/// Replay-protection state of a provider event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventMark {
    /// Another delivery of the same event is being applied.
    InFlight,
    Processed(DateTime<Utc>),
}

#[derive(Clone)]
pub struct PaymentOrchestrator {
    intents: Arc<VersionedStore<PaymentIntent>>,
    by_provider_id: Arc<DashMap<String, Uuid>>,
    processed_events: Arc<DashMap<String, EventMark>>,
    provider: Arc<dyn PaymentProvider>,
    event_sender: Arc<EventSender>,
    clock: SharedClock,
    call_timeout: Duration,
    max_attempts: u32,
}

impl PaymentOrchestrator {
    pub fn new(
        intents: Arc<VersionedStore<PaymentIntent>>,
        provider: Arc<dyn PaymentProvider>,
        event_sender: Arc<EventSender>,
        clock: SharedClock,
        call_timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            intents,
            by_provider_id: Arc::new(DashMap::new()),
            processed_events: Arc::new(DashMap::new()),
            provider,
            event_sender,
            clock,
            call_timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn get_intent(&self, intent_id: Uuid) -> Result<PaymentIntent, ServiceError> {
        self.intents.require(intent_id)
    }

    pub fn find_by_provider_id(&self, provider_intent_id: &str) -> Option<PaymentIntent> {
        self.by_provider_id
            .get(provider_intent_id)
            .and_then(|id| self.intents.get(*id))
    }

    /// Most recent intent for a checkout session.
    pub fn latest_for_checkout(&self, checkout_id: Uuid) -> Option<PaymentIntent> {
        self.intents
            .find(|i| i.checkout_id == checkout_id)
            .into_iter()
            .max_by_key(|i| i.attempt)
    }

    pub fn is_event_processed(&self, event_id: &str) -> bool {
        matches!(
            self.processed_events.get(event_id).map(|mark| *mark),
            Some(EventMark::Processed(_))
        )
    }

    /// Creates a gateway intent for a checkout. A checkout that already has
    /// intents gets the next attempt number, and with it fresh keys.
    #[instrument(skip(self))]
    pub async fn create_intent(
        &self,
        checkout_id: Uuid,
        amount: Decimal,
        currency: &str,
    ) -> Result<PaymentIntent, ServiceError> {
        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Payment amount must be positive".to_string(),
            ));
        }
        if to_minor_units(amount).is_none() {
            return Err(ServiceError::ValidationError(format!(
                "Payment amount {} is out of range",
                amount
            )));
        }
        let attempt = self
            .intents
            .find(|i| i.checkout_id == checkout_id)
            .iter()
            .map(|i| i.attempt)
            .max()
            .unwrap_or(0)
            + 1;
        let request = CreateIntentRequest {
            checkout_id,
            amount,
            currency: currency.to_string(),
            idempotency_key: idempotency_key("create", checkout_id, amount, attempt),
        };

        let remote = self
            .call_with_retry("create", &request.idempotency_key, || {
                self.provider.create_intent(&request)
            })
            .await?;

        let now = self.clock.now();
        let intent = self.intents.insert(PaymentIntent {
            id: Uuid::new_v4(),
            checkout_id,
            provider: self.provider.name().to_string(),
            provider_intent_id: remote.provider_intent_id.clone(),
            amount,
            currency: currency.to_string(),
            status: remote.status,
            amount_authorized: remote.amount_authorized,
            amount_captured: remote.amount_captured,
            amount_refunded: remote.amount_refunded,
            attempt,
            payment_method: remote.payment_method.clone(),
            client_secret: remote.client_secret.clone(),
            disputed: false,
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        })?;
        self.by_provider_id
            .insert(intent.provider_intent_id.clone(), intent.id);

        info!(intent_id = %intent.id, attempt, "Payment intent created");
        self.event_sender
            .send_or_log(Event::PaymentIntentCreated {
                intent_id: intent.id,
                checkout_id,
                amount,
            })
            .await;
        Ok(intent)
    }

    /// Confirms with a payment method. Timeouts are retried with the same
    /// key; if the gateway never answers, its status is queried before the
    /// call is reported as pending.
    #[instrument(skip(self))]
    pub async fn confirm(
        &self,
        intent_id: Uuid,
        payment_method: &str,
    ) -> Result<PaymentIntent, ServiceError> {
        let intent = self.intents.require(intent_id)?;
        match intent.status {
            PaymentStatus::Created | PaymentStatus::RequiresAction => {}
            status if status.is_terminal() => {
                return Err(ServiceError::InvalidTransition(format!(
                    "Payment intent {} is {}",
                    intent_id, status
                )))
            }
            // already past confirmation
            _ => return Ok(intent),
        }
        let key = idempotency_key("confirm", intent.checkout_id, intent.amount, intent.attempt);
        let result = self
            .call_with_retry("confirm", &key, || {
                self.provider
                    .confirm(&intent.provider_intent_id, payment_method, &key)
            })
            .await;
        self.settle_call(&intent, result).await
    }

    /// Captures an authorized intent, by default for the full amount.
    #[instrument(skip(self))]
    pub async fn capture(
        &self,
        intent_id: Uuid,
        amount: Option<Decimal>,
    ) -> Result<PaymentIntent, ServiceError> {
        let intent = self.intents.require(intent_id)?;
        if intent.status.is_captured() {
            return Ok(intent);
        }
        let amount = amount.unwrap_or(intent.amount_authorized);
        if intent.status != PaymentStatus::Processing
            || amount <= Decimal::ZERO
            || amount > intent.amount_authorized
        {
            return Err(ServiceError::InvalidTransition(format!(
                "Cannot capture {} from intent {} ({}, {} authorized)",
                amount, intent_id, intent.status, intent.amount_authorized
            )));
        }
        let key = idempotency_key("capture", intent.checkout_id, amount, intent.attempt);
        let result = self
            .call_with_retry("capture", &key, || {
                self.provider
                    .capture(&intent.provider_intent_id, amount, &key)
            })
            .await;
        self.settle_call(&intent, result).await
    }

    /// Cancels an uncaptured intent. Cancelling twice is fine.
    #[instrument(skip(self))]
    pub async fn cancel(&self, intent_id: Uuid) -> Result<PaymentIntent, ServiceError> {
        let intent = self.intents.require(intent_id)?;
        match intent.status {
            PaymentStatus::Cancelled | PaymentStatus::Failed => return Ok(intent),
            status if status.is_captured() => {
                return Err(ServiceError::InvalidTransition(format!(
                    "Payment intent {} is {}; refund it instead",
                    intent_id, status
                )))
            }
            _ => {}
        }
        let key = idempotency_key("cancel", intent.checkout_id, intent.amount, intent.attempt);
        let result = self
            .call_with_retry("cancel", &key, || {
                self.provider.cancel(&intent.provider_intent_id, &key)
            })
            .await;
        self.settle_call(&intent, result).await
    }

    /// Refunds part or all of the captured amount. The key includes the
    /// amount already refunded, so equal partial refunds stay distinct.
    #[instrument(skip(self))]
    pub async fn refund(
        &self,
        intent_id: Uuid,
        amount: Decimal,
    ) -> Result<PaymentIntent, ServiceError> {
        let intent = self.intents.require(intent_id)?;
        if amount <= Decimal::ZERO || amount > intent.refundable() {
            return Err(ServiceError::ValidationError(format!(
                "Refund of {} exceeds refundable {}",
                amount,
                intent.refundable()
            )));
        }
        let key = format!(
            "{}:{}",
            idempotency_key("refund", intent.checkout_id, amount, intent.attempt),
            cents_label(intent.amount_refunded)
        );
        let result = self
            .call_with_retry("refund", &key, || {
                self.provider
                    .refund(&intent.provider_intent_id, amount, &key)
            })
            .await;
        self.settle_call(&intent, result).await
    }

    /// Pulls the gateway's view and applies whatever moved forward.
    #[instrument(skip(self))]
    pub async fn sync_status(&self, intent_id: Uuid) -> Result<PaymentIntent, ServiceError> {
        let intent = self.intents.require(intent_id)?;
        let remote = self
            .call_with_retry("get_status", "-", || {
                self.provider.get_status(&intent.provider_intent_id)
            })
            .await?;
        self.apply_remote(intent.id, &remote, None).await
    }

    /// Verifies, deduplicates and applies one provider webhook.
    ///
    /// Signature failures are rejected before anything is read. An event id
    /// that was already processed is a no-op. An event for an intent that is
    /// not known yet fails without being recorded, so the provider's retry
    /// can still land.
    #[instrument(skip(self, payload, signature))]
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<WebhookReceipt, ServiceError> {
        let event = match self.provider.process_webhook(payload, signature) {
            Ok(event) => event,
            Err(ProviderError::InvalidSignature(reason)) => {
                warn!("Rejected payment webhook: {}", reason);
                return Err(ServiceError::InvalidSignature);
            }
            Err(e) => {
                warn!("Unreadable payment webhook: {}", e);
                return Err(e.into());
            }
        };

        let seen = match self.processed_events.entry(event.event_id.clone()) {
            Entry::Occupied(slot) => Some(*slot.get()),
            Entry::Vacant(slot) => {
                slot.insert(EventMark::InFlight);
                None
            }
        };
        match seen {
            Some(EventMark::Processed(first_applied)) => {
                info!(event_id = %event.event_id, %first_applied, "Duplicate webhook ignored");
                return Ok(WebhookReceipt {
                    outcome: WebhookOutcome::Duplicate {
                        event_id: event.event_id.clone(),
                    },
                    event: Some(event),
                    intent: None,
                });
            }
            // the provider retries; by then the first delivery has either
            // been recorded or given up its claim
            Some(EventMark::InFlight) => {
                warn!(event_id = %event.event_id, "Webhook redelivered while still being applied");
                return Err(ServiceError::Conflict(format!(
                    "Webhook event {} is still being processed",
                    event.event_id
                )));
            }
            None => {}
        }

        let result = self.apply_webhook(&event).await;
        match &result {
            Ok(_) => {
                self.processed_events
                    .insert(event.event_id.clone(), EventMark::Processed(self.clock.now()));
            }
            Err(_) => {
                self.processed_events.remove(&event.event_id);
            }
        }
        let (outcome, intent) = result?;
        Ok(WebhookReceipt {
            outcome,
            event: Some(event),
            intent: Some(intent),
        })
    }

    async fn apply_webhook(
        &self,
        event: &WebhookEvent,
    ) -> Result<(WebhookOutcome, PaymentIntent), ServiceError> {
        let current = self
            .find_by_provider_id(&event.provider_intent_id)
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Payment intent {} not found",
                    event.provider_intent_id
                ))
            })?;

        let now = self.clock.now();
        let mut stale = false;
        let updated = self.intents.update_unchecked(current.id, |intent| {
            stale = !apply_event(intent, event)?;
            if !stale {
                intent.updated_at = now;
            }
            Ok(())
        })?;

        if stale {
            warn!(
                event_id = %event.event_id,
                intent_id = %updated.id,
                current = %current.status,
                event_type = %event.event_type,
                "Stale webhook ignored"
            );
            return Ok((
                WebhookOutcome::Stale {
                    intent_id: updated.id,
                    current: current.status,
                },
                current,
            ));
        }

        info!(
            event_id = %event.event_id,
            intent_id = %updated.id,
            action = %event.action,
            status = %updated.status,
            "Webhook applied"
        );
        self.emit_transition(&current, &updated).await;
        Ok((
            WebhookOutcome::Applied {
                intent_id: updated.id,
                status: updated.status,
            },
            updated,
        ))
    }

    /// Turns the result of an initiated call into local state.
    async fn settle_call(
        &self,
        intent: &PaymentIntent,
        result: Result<ProviderIntent, ProviderError>,
    ) -> Result<PaymentIntent, ServiceError> {
        match result {
            Ok(remote) if remote.status == PaymentStatus::Failed => {
                let updated = self
                    .apply_remote(intent.id, &remote, Some("payment failed".to_string()))
                    .await?;
                Err(ServiceError::PaymentDeclined(
                    updated
                        .last_error
                        .unwrap_or_else(|| "payment failed".to_string()),
                ))
            }
            Ok(remote) => self.apply_remote(intent.id, &remote, None).await,
            Err(ProviderError::Declined(reason)) => {
                // the gateway may have failed the intent; record that locally
                match self.provider.get_status(&intent.provider_intent_id).await {
                    Ok(remote) => {
                        self.apply_remote(intent.id, &remote, Some(reason.clone()))
                            .await?;
                    }
                    Err(_) => self.note_error(intent.id, &reason),
                }
                Err(ServiceError::PaymentDeclined(reason))
            }
            Err(ProviderError::Timeout) | Err(ProviderError::Unavailable(_)) => {
                self.reconcile_after_timeout(intent).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Attempts ran out without an answer. Ask the gateway what happened
    /// before declaring anything.
    async fn reconcile_after_timeout(
        &self,
        intent: &PaymentIntent,
    ) -> Result<PaymentIntent, ServiceError> {
        match self.provider.get_status(&intent.provider_intent_id).await {
            Ok(remote) if remote.status != intent.status => {
                info!(intent_id = %intent.id, status = %remote.status, "Recovered status after timeout");
                self.apply_remote(intent.id, &remote, None).await
            }
            Ok(_) | Err(_) => {
                warn!(intent_id = %intent.id, "Payment outcome unknown; pending reconciliation");
                self.note_error(intent.id, "provider did not answer; pending reconciliation");
                Err(ServiceError::PaymentPending(intent.id))
            }
        }
    }

    /// Merges a gateway reply into the mirror: forward status moves only,
    /// amounts never shrink.
    async fn apply_remote(
        &self,
        intent_id: Uuid,
        remote: &ProviderIntent,
        error_note: Option<String>,
    ) -> Result<PaymentIntent, ServiceError> {
        let before = self.intents.require(intent_id)?;
        let now = self.clock.now();
        let after = self.intents.update_unchecked(intent_id, |intent| {
            if intent.status.can_advance_to(remote.status) {
                intent.status = remote.status;
            }
            intent.amount_authorized = intent.amount_authorized.max(remote.amount_authorized);
            intent.amount_captured = intent.amount_captured.max(remote.amount_captured);
            intent.amount_refunded = intent.amount_refunded.max(remote.amount_refunded);
            if remote.payment_method.is_some() {
                intent.payment_method = remote.payment_method.clone();
            }
            intent.last_error = error_note.clone();
            intent.updated_at = now;
            check_amounts(intent)
        })?;
        self.emit_transition(&before, &after).await;
        Ok(after)
    }

    fn note_error(&self, intent_id: Uuid, message: &str) {
        let now = self.clock.now();
        if let Err(e) = self.intents.update_unchecked(intent_id, |intent| {
            intent.last_error = Some(message.to_string());
            intent.updated_at = now;
            Ok(())
        }) {
            error!(intent_id = %intent_id, "Failed to record payment error: {}", e);
        }
    }

    async fn emit_transition(&self, before: &PaymentIntent, after: &PaymentIntent) {
        let mut events = Vec::new();
        if before.status != after.status {
            match after.status {
                PaymentStatus::Processing if after.amount_authorized >= after.amount => {
                    events.push(Event::PaymentAuthorized(after.id))
                }
                PaymentStatus::Captured => events.push(Event::PaymentCaptured(after.id)),
                PaymentStatus::Failed => events.push(Event::PaymentFailed {
                    intent_id: after.id,
                    reason: after
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "payment failed".to_string()),
                }),
                PaymentStatus::Cancelled => events.push(Event::PaymentCancelled(after.id)),
                _ => {}
            }
        }
        if after.amount_refunded > before.amount_refunded {
            events.push(Event::PaymentRefunded {
                intent_id: after.id,
                amount: after.amount_refunded - before.amount_refunded,
            });
        }
        if after.disputed && !before.disputed {
            events.push(Event::PaymentDisputed(after.id));
        }
        for event in events {
            self.event_sender.send_or_log(event).await;
        }
    }

    /// Runs a provider call under the configured timeout, retrying timeouts
    /// and outages with the same idempotency key.
    async fn call_with_retry<F, Fut>(
        &self,
        operation: &str,
        key: &str,
        mut call: F,
    ) -> Result<ProviderIntent, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ProviderIntent, ProviderError>>,
    {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout),
            };
            match result {
                Err(ProviderError::Timeout) | Err(ProviderError::Unavailable(_))
                    if attempt < self.max_attempts =>
                {
                    warn!(
                        operation,
                        key,
                        attempt,
                        max_attempts = self.max_attempts,
                        "Provider call did not complete; retrying with the same key"
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// `{operation}:{checkout}:{amount in minor units}:{attempt}`
pub fn idempotency_key(operation: &str, checkout_id: Uuid, amount: Decimal, attempt: u32) -> String {
    format!(
        "{}:{}:{}:{}",
        operation,
        checkout_id,
        cents_label(amount),
        attempt
    )
}

/// Intent amounts always fit in cents; anything else keys on the decimal.
fn cents_label(amount: Decimal) -> String {
    to_minor_units(amount).map_or_else(|| round_money(amount).to_string(), |cents| cents.to_string())
}

fn check_amounts(intent: &PaymentIntent) -> Result<(), ServiceError> {
    if intent.amount_captured > intent.amount_authorized.max(intent.amount) {
        return Err(ServiceError::invariant(format!(
            "Intent {} captured {} of {} authorized",
            intent.id, intent.amount_captured, intent.amount_authorized
        )));
    }
    if intent.amount_refunded > intent.amount_captured {
        return Err(ServiceError::invariant(format!(
            "Intent {} refunded {} of {} captured",
            intent.id, intent.amount_refunded, intent.amount_captured
        )));
    }
    Ok(())
}

/// Applies a webhook to the mirror. Returns `false` when the event would
/// not move anything forward.
///
/// Capture and refund amounts are cumulative totals, so a webhook echoing
/// a call this service already applied changes nothing.
fn apply_event(intent: &mut PaymentIntent, event: &WebhookEvent) -> Result<bool, ServiceError> {
    match event.action {
        WebhookAction::MarkAsPaid => {
            let target = event.status.unwrap_or(PaymentStatus::Captured);
            if !intent.status.can_advance_to(target) {
                return Ok(false);
            }
            let amount = event.amount.unwrap_or(intent.amount);
            intent.amount_authorized = intent.amount_authorized.max(amount);
            if target.is_captured() {
                intent.amount_captured = intent.amount_captured.max(amount);
            }
            intent.status = target;
            if event.payment_method.is_some() {
                intent.payment_method = event.payment_method.clone();
            }
            intent.last_error = None;
        }
        WebhookAction::MarkAsFailed => {
            let target = event.status.unwrap_or(PaymentStatus::Failed);
            if !intent.status.can_advance_to(target) {
                return Ok(false);
            }
            intent.status = target;
            intent.last_error = event.failure_reason.clone();
        }
        WebhookAction::ProcessRefund => {
            let refunded = event.amount.unwrap_or(intent.amount_captured);
            if !intent.status.is_captured() || refunded <= intent.amount_refunded {
                return Ok(false);
            }
            if refunded > intent.amount_captured {
                return Err(ServiceError::invariant(format!(
                    "Webhook refunds {} of {} captured on intent {}",
                    refunded, intent.amount_captured, intent.id
                )));
            }
            let target = if refunded == intent.amount_captured {
                PaymentStatus::Refunded
            } else {
                PaymentStatus::PartiallyRefunded
            };
            if !intent.status.can_advance_to(target) {
                return Ok(false);
            }
            intent.amount_refunded = refunded;
            intent.status = target;
        }
        WebhookAction::UpdatePaymentMethod => match event.status {
            Some(target) if !intent.status.can_advance_to(target) => return Ok(false),
            Some(target) => {
                intent.status = target;
                if event.payment_method.is_some() {
                    intent.payment_method = event.payment_method.clone();
                }
            }
            None if event.payment_method.is_none()
                || event.payment_method == intent.payment_method =>
            {
                return Ok(false)
            }
            None => intent.payment_method = event.payment_method.clone(),
        },
        WebhookAction::ChargeDisputed => {
            if intent.disputed {
                return Ok(false);
            }
            intent.disputed = true;
        }
    }
    check_amounts(intent)?;
    Ok(true)
}
