use crate::{
    clock::SharedClock,
    config::AppConfig,
    errors::ServiceError,
    events::{Event, EventSender},
    models::{
        address::Address,
        checkout::{CheckoutSession, CheckoutStep},
        payment::{PaymentIntent, PaymentStatus, WebhookAction, WebhookOutcome},
        reservation::{ReleaseReason, ReservationLine},
        tax::ExemptionCertificate,
    },
    repositories::VersionedStore,
    services::{
        inventory_reservation_service::InventoryLedger,
        orders::OrderService,
        payments::{PaymentOrchestrator, WebhookReceipt},
    },
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::{
    cart_service::CartService,
    totals::{TotalsCalculator, TotalsInput},
};

/// Checkout session state machine.
///
/// `Information → Shipping → Payment → Review → Complete`, with `Cancelled`
/// and `Abandoned` reachable from any step before `Complete`. Stock is held
/// from entering `Payment` until the order is created or the session steps
/// back, is cancelled, or its hold expires.
///
/// Every caller-driven mutation carries the session version the caller last
/// saw; a stale version is rejected so the caller can refetch.
#[derive(Clone)]
pub struct CheckoutService {
    sessions: Arc<VersionedStore<CheckoutSession>>,
    carts: CartService,
    totals: TotalsCalculator,
    ledger: InventoryLedger,
    payments: PaymentOrchestrator,
    orders: OrderService,
    event_sender: Arc<EventSender>,
    clock: SharedClock,
    config: Arc<AppConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SetEmailInput {
    #[validate(email)]
    pub email: String,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<VersionedStore<CheckoutSession>>,
        carts: CartService,
        totals: TotalsCalculator,
        ledger: InventoryLedger,
        payments: PaymentOrchestrator,
        orders: OrderService,
        event_sender: Arc<EventSender>,
        clock: SharedClock,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            sessions,
            carts,
            totals,
            ledger,
            payments,
            orders,
            event_sender,
            clock,
            config,
        }
    }

    /// Start checkout session from a cart. The cart is locked against edits
    /// until the session finishes.
    #[instrument(skip(self))]
    pub async fn start_checkout(&self, cart_id: Uuid) -> Result<CheckoutSession, ServiceError> {
        let cart = self.carts.begin_checkout(cart_id)?;

        let now = self.clock.now();
        let mut session = CheckoutSession {
            id: Uuid::new_v4(),
            cart_id,
            customer_id: cart.owner.customer_id(),
            currency: cart.currency.clone(),
            email: None,
            lines: cart.lines.clone(),
            coupon_code: cart.coupon_code.clone(),
            shipping_address: cart.shipping_address.clone(),
            billing_address: cart.billing_address.clone(),
            shipping_method: cart.shipping_method.clone(),
            tax_exemption: None,
            totals: cart.totals.clone(),
            totals_stale: true,
            step: CheckoutStep::Information,
            reservation_id: None,
            payment_intent_id: None,
            order_id: None,
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.refresh_totals(&mut session).await;

        let session = match self.sessions.insert(session) {
            Ok(session) => session,
            Err(e) => {
                self.carts.end_checkout(cart_id, false);
                return Err(e);
            }
        };

        info!(session_id = %session.id, cart_id = %cart_id, "Checkout started");
        self.event_sender
            .send_or_log(Event::CheckoutStarted {
                cart_id,
                session_id: session.id,
            })
            .await;
        Ok(session)
    }

    pub fn get_session(&self, session_id: Uuid) -> Result<CheckoutSession, ServiceError> {
        self.sessions.require(session_id)
    }

    #[instrument(skip(self, input))]
    pub async fn set_email(
        &self,
        session_id: Uuid,
        expected_version: u64,
        input: SetEmailInput,
    ) -> Result<CheckoutSession, ServiceError> {
        input.validate()?;
        let mut draft = self.load(session_id, expected_version)?;
        draft.email = Some(input.email.trim().to_lowercase());
        self.save(draft, expected_version)
    }

    /// Sets the shipping address and reprices. From `Payment` or later the
    /// session first steps back to `Shipping`, since tax and shipping may
    /// change.
    #[instrument(skip(self, address))]
    pub async fn set_shipping_address(
        &self,
        session_id: Uuid,
        expected_version: u64,
        address: Address,
    ) -> Result<CheckoutSession, ServiceError> {
        address.validate()?;
        let mut draft = self.load(session_id, expected_version)?;
        let from = draft.step;
        self.regress_for_edit(&mut draft).await?;

        if let (Some(method), true) = (
            draft.shipping_method.clone(),
            draft.shipping_address.as_ref() != Some(&address),
        ) {
            // keep the method only if it still serves the new address
            let merchandise = draft.totals.subtotal - draft.totals.discount_total;
            if self
                .totals
                .quote_shipping(&address, &method, merchandise)
                .await
                .ok()
                .flatten()
                .is_none()
            {
                draft.shipping_method = None;
            }
        }
        draft.shipping_address = Some(address);
        draft.totals_stale = true;
        self.refresh_totals(&mut draft).await;

        let to = draft.step;
        let saved = self.save(draft, expected_version)?;
        self.emit_step(saved.id, from, to).await;
        Ok(saved)
    }

    #[instrument(skip(self, address))]
    pub async fn set_billing_address(
        &self,
        session_id: Uuid,
        expected_version: u64,
        address: Address,
    ) -> Result<CheckoutSession, ServiceError> {
        address.validate()?;
        let mut draft = self.load(session_id, expected_version)?;
        draft.billing_address = Some(address);
        self.save(draft, expected_version)
    }

    /// Picks a shipping method that serves the shipping address.
    #[instrument(skip(self))]
    pub async fn select_shipping_method(
        &self,
        session_id: Uuid,
        expected_version: u64,
        method_code: String,
    ) -> Result<CheckoutSession, ServiceError> {
        let mut draft = self.load(session_id, expected_version)?;
        let address = draft.shipping_address.clone().ok_or_else(|| {
            ServiceError::ValidationError("Set a shipping address first".to_string())
        })?;
        let merchandise = draft.totals.subtotal - draft.totals.discount_total;
        if self
            .totals
            .quote_shipping(&address, &method_code, merchandise)
            .await?
            .is_none()
        {
            return Err(ServiceError::ValidationError(format!(
                "Shipping method '{}' is not available for {}",
                method_code, address.country_code
            )));
        }

        let from = draft.step;
        if draft.shipping_method.as_deref() != Some(method_code.as_str()) {
            self.regress_for_edit(&mut draft).await?;
            draft.shipping_method = Some(method_code);
            draft.totals_stale = true;
            self.refresh_totals(&mut draft).await;
        }
        let to = draft.step;
        let saved = self.save(draft, expected_version)?;
        self.emit_step(saved.id, from, to).await;
        Ok(saved)
    }

    /// Attaches (or with `None`, removes) the customer's tax exemption
    /// certificate and reprices. Like an address edit, this steps a session
    /// at `Payment` or later back to `Shipping`.
    #[instrument(skip(self, certificate))]
    pub async fn set_tax_exemption(
        &self,
        session_id: Uuid,
        expected_version: u64,
        certificate: Option<ExemptionCertificate>,
    ) -> Result<CheckoutSession, ServiceError> {
        if let Some(certificate) = certificate.as_ref() {
            if certificate.certificate_id.trim().is_empty()
                || certificate.country_code.trim().is_empty()
            {
                return Err(ServiceError::ValidationError(
                    "Exemption certificate needs an id and a country".to_string(),
                ));
            }
            if certificate.expires_at.map_or(false, |e| e <= self.clock.now()) {
                return Err(ServiceError::ValidationError(format!(
                    "Exemption certificate {} has expired",
                    certificate.certificate_id
                )));
            }
        }

        let mut draft = self.load(session_id, expected_version)?;
        let from = draft.step;
        if draft.tax_exemption != certificate {
            self.regress_for_edit(&mut draft).await?;
            draft.tax_exemption = certificate;
            draft.totals_stale = true;
            self.refresh_totals(&mut draft).await;
        }
        let to = draft.step;
        let saved = self.save(draft, expected_version)?;
        self.emit_step(saved.id, from, to).await;
        Ok(saved)
    }

    /// Moves to the next step after checking what that step needs.
    #[instrument(skip(self))]
    pub async fn advance(
        &self,
        session_id: Uuid,
        expected_version: u64,
    ) -> Result<CheckoutSession, ServiceError> {
        let session = self.load(session_id, expected_version)?;
        match session.step {
            CheckoutStep::Information => self.advance_to_shipping(session, expected_version).await,
            CheckoutStep::Shipping => self.advance_to_payment(session, expected_version).await,
            CheckoutStep::Payment => self.advance_to_review(session, expected_version).await,
            CheckoutStep::Review => self.complete(session_id, expected_version).await,
            step => Err(ServiceError::InvalidTransition(format!(
                "Checkout {} is {}",
                session_id, step
            ))),
        }
    }

    async fn advance_to_shipping(
        &self,
        mut draft: CheckoutSession,
        expected_version: u64,
    ) -> Result<CheckoutSession, ServiceError> {
        let email_ok = draft
            .email
            .as_ref()
            .map(|email| {
                SetEmailInput {
                    email: email.clone(),
                }
                .validate()
                .is_ok()
            })
            .unwrap_or(false);
        if !email_ok {
            return Err(ServiceError::ValidationError(
                "A valid email is required".to_string(),
            ));
        }
        if draft.lines.is_empty() {
            return Err(ServiceError::ValidationError(
                "Checkout has no items".to_string(),
            ));
        }
        draft.step = CheckoutStep::Shipping;
        draft.last_error = None;
        let saved = self.save(draft, expected_version)?;
        self.emit_step(saved.id, CheckoutStep::Information, CheckoutStep::Shipping)
            .await;
        Ok(saved)
    }

    /// Shipping → Payment: fresh totals, then reserve stock. On a stock
    /// conflict the session stays at `Shipping` with the shortage recorded.
    async fn advance_to_payment(
        &self,
        mut draft: CheckoutSession,
        expected_version: u64,
    ) -> Result<CheckoutSession, ServiceError> {
        let address = draft.shipping_address.clone().ok_or_else(|| {
            ServiceError::ValidationError("A shipping address is required".to_string())
        })?;
        let method = draft.shipping_method.clone().ok_or_else(|| {
            ServiceError::ValidationError("A shipping method is required".to_string())
        })?;

        self.recompute_totals(&mut draft).await?;
        let merchandise = draft.totals.subtotal - draft.totals.discount_total;
        if self
            .totals
            .quote_shipping(&address, &method, merchandise)
            .await?
            .is_none()
        {
            return Err(ServiceError::ValidationError(format!(
                "Shipping method '{}' is not available for {}",
                method, address.country_code
            )));
        }

        let reservation = match self
            .ledger
            .reserve(draft.id, &reservation_lines(&draft))
            .await
        {
            Ok(reservation) => reservation,
            Err(e @ ServiceError::StockConflict(_)) => {
                draft.last_error = Some(e.to_string());
                if let Err(save_err) = self.save(draft, expected_version) {
                    warn!("Could not record stock conflict on session: {}", save_err);
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        draft.reservation_id = Some(reservation.id);
        draft.step = CheckoutStep::Payment;
        draft.last_error = None;
        let saved = match self.save(draft, expected_version) {
            Ok(saved) => saved,
            Err(e) => {
                // lost the race on the session; do not leak the hold
                self.release_quietly(reservation.id, ReleaseReason::Cancelled)
                    .await;
                return Err(e);
            }
        };
        self.emit_step(saved.id, CheckoutStep::Shipping, CheckoutStep::Payment)
            .await;
        Ok(saved)
    }

    /// Payment → Review: needs a live intent for the current total and a
    /// live hold. A hold lost to expiry is retaken here.
    async fn advance_to_review(
        &self,
        mut draft: CheckoutSession,
        expected_version: u64,
    ) -> Result<CheckoutSession, ServiceError> {
        let intent = self.current_intent(&draft)?.ok_or_else(|| {
            ServiceError::InvalidTransition("Create a payment before review".to_string())
        })?;
        if matches!(
            intent.status,
            PaymentStatus::Failed | PaymentStatus::Cancelled
        ) || intent.amount != draft.totals.grand_total
        {
            return Err(ServiceError::InvalidTransition(format!(
                "Payment intent {} is {} for {}; create a new payment",
                intent.id, intent.status, intent.amount
            )));
        }

        let mut new_hold = None;
        if !self.hold_is_live(&draft) {
            if let Some(stale) = draft.reservation_id.take() {
                self.release_quietly(stale, ReleaseReason::Expired).await;
            }
            let reservation = self
                .ledger
                .reserve(draft.id, &reservation_lines(&draft))
                .await?;
            draft.reservation_id = Some(reservation.id);
            new_hold = Some(reservation.id);
        }

        draft.step = CheckoutStep::Review;
        draft.last_error = None;
        let saved = match self.save(draft, expected_version) {
            Ok(saved) => saved,
            Err(e) => {
                if let Some(id) = new_hold {
                    self.release_quietly(id, ReleaseReason::Cancelled).await;
                }
                return Err(e);
            }
        };
        self.emit_step(saved.id, CheckoutStep::Payment, CheckoutStep::Review)
            .await;
        Ok(saved)
    }

    /// Steps back to an earlier step. Leaving the stock-holding steps
    /// releases the hold and cancels an unconfirmed payment.
    #[instrument(skip(self))]
    pub async fn go_back(
        &self,
        session_id: Uuid,
        expected_version: u64,
        target: CheckoutStep,
    ) -> Result<CheckoutSession, ServiceError> {
        let mut draft = self.load(session_id, expected_version)?;
        let from = draft.step;
        match (target.ordinal(), from.ordinal()) {
            (Some(to), Some(current)) if to < current => {}
            _ => {
                return Err(ServiceError::InvalidTransition(format!(
                    "Cannot go back from {} to {}",
                    from, target
                )))
            }
        }

        if from.holds_stock() && !target.holds_stock() {
            self.drop_payment(&mut draft).await?;
            if let Some(reservation_id) = draft.reservation_id.take() {
                self.ledger
                    .release(reservation_id, ReleaseReason::StepRegression)
                    .await?;
            }
        }
        draft.step = target;
        draft.last_error = None;
        let saved = self.save(draft, expected_version)?;
        self.emit_step(saved.id, from, target).await;
        Ok(saved)
    }

    /// Creates (or reuses) the payment intent for the current total and,
    /// when a payment method is given, confirms it.
    #[instrument(skip(self))]
    pub async fn create_payment(
        &self,
        session_id: Uuid,
        expected_version: u64,
        payment_method: Option<String>,
    ) -> Result<(CheckoutSession, PaymentIntent), ServiceError> {
        let mut draft = self.load(session_id, expected_version)?;
        if draft.step != CheckoutStep::Payment {
            return Err(ServiceError::InvalidTransition(format!(
                "Payments are taken at the payment step, checkout is at {}",
                draft.step
            )));
        }
        if draft.totals_stale {
            self.recompute_totals(&mut draft).await?;
        }

        let reusable = self.current_intent(&draft)?.filter(|intent| {
            intent.amount == draft.totals.grand_total
                && !matches!(
                    intent.status,
                    PaymentStatus::Failed | PaymentStatus::Cancelled
                )
        });
        let intent = match reusable {
            Some(intent) => intent,
            None => {
                let intent = self
                    .payments
                    .create_intent(draft.id, draft.totals.grand_total, &draft.currency)
                    .await?;
                draft.payment_intent_id = Some(intent.id);
                intent
            }
        };
        draft.last_error = None;
        let saved = self.save(draft, expected_version)?;

        let intent = match payment_method {
            Some(method) => match self.payments.confirm(intent.id, &method).await {
                Ok(intent) => intent,
                Err(e) => {
                    self.note_error(saved.id, &e)?;
                    return Err(e);
                }
            },
            None => intent,
        };
        Ok((saved, intent))
    }

    /// Review → Complete. Requires a captured or fully authorized payment and
    /// creates the order. If the stock hold cannot be committed the session
    /// goes back to `Payment` without an order.
    #[instrument(skip(self))]
    pub async fn complete(
        &self,
        session_id: Uuid,
        expected_version: u64,
    ) -> Result<CheckoutSession, ServiceError> {
        let session = self.load(session_id, expected_version)?;
        if session.step != CheckoutStep::Review {
            return Err(ServiceError::InvalidTransition(format!(
                "Checkout {} is at {}, not review",
                session_id, session.step
            )));
        }
        let mut intent = self.current_intent(&session)?.ok_or_else(|| {
            ServiceError::InvalidTransition("Checkout has no payment".to_string())
        })?;
        if !intent.is_settled_or_authorized() {
            // the webhook may not have landed yet
            intent = self.payments.sync_status(intent.id).await?;
        }
        if !intent.is_settled_or_authorized() {
            return Err(ServiceError::PaymentPending(intent.id));
        }
        self.finish(session, &intent).await
    }

    /// Creates the order and closes the session. Used by `complete` and by
    /// webhook-driven reconciliation.
    async fn finish(
        &self,
        session: CheckoutSession,
        intent: &PaymentIntent,
    ) -> Result<CheckoutSession, ServiceError> {
        let from = session.step;
        let order = match self.orders.create_from_checkout(&session, intent).await {
            Ok(order) => order,
            Err(e @ ServiceError::ReservationExpired(_))
            | Err(e @ ServiceError::InvalidTransition(_))
                if session.reservation_id.is_some() =>
            {
                warn!(session_id = %session.id, "Order not created, returning checkout to payment: {}", e);
                if let Some(stale) = session.reservation_id {
                    self.release_quietly(stale, ReleaseReason::Expired).await;
                }
                let now = self.clock.now();
                let message = e.to_string();
                self.sessions.update_unchecked(session.id, |s| {
                    s.step = CheckoutStep::Payment;
                    s.reservation_id = None;
                    s.last_error = Some(message);
                    s.updated_at = now;
                    Ok(())
                })?;
                self.emit_step(session.id, from, CheckoutStep::Payment).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let now = self.clock.now();
        let saved = self.sessions.update_unchecked(session.id, |s| {
            s.step = CheckoutStep::Complete;
            s.order_id = Some(order.id);
            s.last_error = None;
            s.updated_at = now;
            Ok(())
        })?;
        self.carts.end_checkout(saved.cart_id, true);
        info!(session_id = %saved.id, order_id = %order.id, "Checkout complete");
        self.emit_step(saved.id, from, CheckoutStep::Complete).await;
        Ok(saved)
    }

    /// Places the order for a session whose payment went through outside the
    /// interactive flow. A lapsed hold is taken again; if the stock is gone
    /// the payment is voided or refunded and the session cancelled.
    async fn settle_paid_session(
        &self,
        session: CheckoutSession,
        intent: &PaymentIntent,
    ) -> Result<CheckoutSession, ServiceError> {
        if intent.status == PaymentStatus::Refunded {
            let reason = ServiceError::InvalidTransition(format!(
                "Payment {} was refunded before the order was placed",
                intent.id
            ));
            return self.return_payment(session, intent, &reason).await;
        }
        if self.hold_is_live(&session) {
            return self.finish(session, intent).await;
        }
        if let Some(stale) = session.reservation_id {
            self.release_quietly(stale, ReleaseReason::Expired).await;
        }

        let reservation = match self
            .ledger
            .reserve(session.id, &reservation_lines(&session))
            .await
        {
            Ok(reservation) => reservation,
            Err(e @ ServiceError::StockConflict(_)) => {
                warn!(session_id = %session.id, intent_id = %intent.id, "Paid checkout lost its stock: {}", e);
                return self.return_payment(session, intent, &e).await;
            }
            Err(e) => return Err(e),
        };

        let now = self.clock.now();
        let held = self.sessions.update_unchecked(session.id, |s| {
            s.reservation_id = Some(reservation.id);
            s.updated_at = now;
            Ok(())
        });
        match held {
            Ok(session) => {
                info!(session_id = %session.id, reservation_id = %reservation.id, "Retook stock for paid checkout");
                self.finish(session, intent).await
            }
            Err(e) => {
                self.release_quietly(reservation.id, ReleaseReason::Cancelled)
                    .await;
                Err(e)
            }
        }
    }

    /// Voids or refunds the payment of a session that cannot be fulfilled
    /// and cancels it, recording why.
    async fn return_payment(
        &self,
        session: CheckoutSession,
        intent: &PaymentIntent,
        reason: &ServiceError,
    ) -> Result<CheckoutSession, ServiceError> {
        if intent.status.is_captured() {
            if intent.refundable() > Decimal::ZERO {
                self.payments.refund(intent.id, intent.refundable()).await?;
            }
        } else {
            self.payments.cancel(intent.id).await?;
        }
        if let Some(reservation_id) = session.reservation_id {
            self.release_quietly(reservation_id, ReleaseReason::Cancelled)
                .await;
        }

        let from = session.step;
        let now = self.clock.now();
        let message = reason.to_string();
        let saved = self.sessions.update_unchecked(session.id, |s| {
            s.step = CheckoutStep::Cancelled;
            s.reservation_id = None;
            s.last_error = Some(message);
            s.updated_at = now;
            Ok(())
        })?;
        self.carts.end_checkout(saved.cart_id, false);
        info!(session_id = %saved.id, intent_id = %intent.id, "Paid checkout cancelled and payment returned");
        self.emit_step(saved.id, from, CheckoutStep::Cancelled).await;
        self.event_sender
            .send_or_log(Event::CheckoutCancelled(saved.id))
            .await;
        Ok(saved)
    }

    /// Cancels the session: releases the hold, voids or refunds the payment,
    /// and hands the cart back.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        session_id: Uuid,
        expected_version: u64,
    ) -> Result<CheckoutSession, ServiceError> {
        let mut draft = self.load(session_id, expected_version)?;
        let from = draft.step;

        if let Some(intent) = self.current_intent(&draft)? {
            if intent.status.is_captured() && intent.refundable() > Decimal::ZERO {
                self.payments.refund(intent.id, intent.refundable()).await?;
            } else if !intent.status.is_terminal() && !intent.status.is_captured() {
                self.payments.cancel(intent.id).await?;
            }
        }
        if let Some(reservation_id) = draft.reservation_id.take() {
            self.ledger
                .release(reservation_id, ReleaseReason::Cancelled)
                .await?;
        }
        draft.step = CheckoutStep::Cancelled;
        let saved = self.save(draft, expected_version)?;
        self.carts.end_checkout(saved.cart_id, false);

        info!(session_id = %session_id, "Checkout cancelled");
        self.emit_step(saved.id, from, CheckoutStep::Cancelled).await;
        self.event_sender
            .send_or_log(Event::CheckoutCancelled(session_id))
            .await;
        Ok(saved)
    }

    /// Marks sessions idle for longer than the session TTL as abandoned.
    /// Their stock holds are left for the ledger's expiry sweep. Sessions
    /// whose payment already went through are settled instead: the order is
    /// placed if stock can still be held, otherwise the payment is returned.
    #[instrument(skip(self))]
    pub async fn expire_abandoned(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.config.checkout_session_ttl();
        let idle = self
            .sessions
            .find(|s| !s.step.is_terminal() && s.is_idle_since(cutoff));

        let mut abandoned = 0;
        for session in idle {
            if let Ok(Some(intent)) = self.current_intent(&session) {
                if intent.is_settled_or_authorized() {
                    if session.step.holds_stock() {
                        let session_id = session.id;
                        if let Err(e) = self.settle_paid_session(session, &intent).await {
                            warn!(session_id = %session_id, "Could not settle paid session: {}", e);
                        }
                    }
                    continue;
                }
            }
            let from = session.step;
            let result = self.sessions.update(session.id, session.version, |s| {
                s.step = CheckoutStep::Abandoned;
                s.updated_at = now;
                Ok(())
            });
            match result {
                Ok(saved) => {
                    abandoned += 1;
                    self.carts.end_checkout(saved.cart_id, false);
                    self.emit_step(saved.id, from, CheckoutStep::Abandoned).await;
                    self.event_sender
                        .send_or_log(Event::CheckoutAbandoned(saved.id))
                        .await;
                }
                // touched since the scan; not idle any more
                Err(ServiceError::ConcurrentModification { .. }) => {}
                Err(e) => error!(session_id = %session.id, "Failed to abandon session: {}", e),
            }
        }
        if abandoned > 0 {
            info!(abandoned, "Abandoned idle checkout sessions");
        }
        abandoned
    }

    /// Brings a session in line with a payment that moved outside the
    /// interactive flow (a webhook, a status sync).
    #[instrument(skip(self, intent), fields(intent_id = %intent.id))]
    pub async fn reconcile_payment(
        &self,
        intent: &PaymentIntent,
    ) -> Result<Option<CheckoutSession>, ServiceError> {
        let session = match self.sessions.get(intent.checkout_id) {
            Some(session) => session,
            None => return Ok(None),
        };
        if session.payment_intent_id != Some(intent.id) {
            // superseded by a newer attempt
            return Ok(Some(session));
        }

        match session.step {
            CheckoutStep::Payment | CheckoutStep::Review if intent.is_settled_or_authorized() => {
                self.settle_paid_session(session, intent).await.map(Some)
            }
            CheckoutStep::Complete => {
                if let Some(order_id) = session.order_id {
                    if intent.status.is_captured() {
                        self.orders.confirm_payment(order_id).await?;
                    }
                }
                Ok(Some(session))
            }
            _ if matches!(
                intent.status,
                PaymentStatus::Failed | PaymentStatus::Cancelled
            ) && !session.step.is_terminal() =>
            {
                let now = self.clock.now();
                let message = intent
                    .last_error
                    .clone()
                    .unwrap_or_else(|| format!("payment {}", intent.status));
                self.sessions
                    .update_unchecked(session.id, |s| {
                        s.last_error = Some(message);
                        s.updated_at = now;
                        Ok(())
                    })
                    .map(Some)
            }
            _ => Ok(Some(session)),
        }
    }

    /// Webhook ingress: verify and apply the event to the payment mirror,
    /// then carry the consequences to the checkout or the order.
    #[instrument(skip(self, payload, signature))]
    pub async fn handle_payment_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<WebhookReceipt, ServiceError> {
        let receipt = self.payments.handle_webhook(payload, signature).await?;
        let (intent, action) = match (&receipt.outcome, &receipt.intent, &receipt.event) {
            (WebhookOutcome::Applied { .. }, Some(intent), Some(event)) => (intent, event.action),
            _ => return Ok(receipt),
        };

        let result = match self.orders.find_by_payment_intent(intent.id) {
            Some(order) => match action {
                WebhookAction::ChargeDisputed => self.orders.apply_dispute(order.id).await,
                WebhookAction::ProcessRefund => {
                    self.orders.sync_provider_refund(order.id, intent).await
                }
                WebhookAction::MarkAsPaid if intent.status.is_captured() => {
                    self.orders.confirm_payment(order.id).await
                }
                WebhookAction::MarkAsFailed => {
                    self.orders
                        .payment_voided(order.id, format!("payment {}", intent.status))
                        .await
                }
                _ => Ok(order),
            }
            .map(|_| ()),
            None => self.reconcile_payment(intent).await.map(|_| ()),
        };
        if let Err(e) = result {
            // the payment mirror is already updated; the session or order
            // catches up on the next interactive call or status sync
            warn!(intent_id = %intent.id, "Webhook follow-up failed: {}", e);
        }
        Ok(receipt)
    }

    fn load(&self, session_id: Uuid, expected_version: u64) -> Result<CheckoutSession, ServiceError> {
        let session = self.sessions.require(session_id)?;
        if session.version != expected_version {
            return Err(ServiceError::ConcurrentModification {
                id: session_id,
                expected: expected_version,
                actual: session.version,
            });
        }
        if session.step.is_terminal() {
            return Err(ServiceError::InvalidTransition(format!(
                "Checkout {} is {}",
                session_id, session.step
            )));
        }
        Ok(session)
    }

    fn save(
        &self,
        mut draft: CheckoutSession,
        expected_version: u64,
    ) -> Result<CheckoutSession, ServiceError> {
        draft.updated_at = self.clock.now();
        self.sessions
            .update(draft.id, expected_version, move |session| {
                *session = draft;
                Ok(())
            })
    }

    fn note_error(&self, session_id: Uuid, err: &ServiceError) -> Result<CheckoutSession, ServiceError> {
        let now = self.clock.now();
        let message = err.to_string();
        self.sessions.update_unchecked(session_id, |s| {
            s.last_error = Some(message);
            s.updated_at = now;
            Ok(())
        })
    }

    fn current_intent(&self, session: &CheckoutSession) -> Result<Option<PaymentIntent>, ServiceError> {
        session
            .payment_intent_id
            .map(|id| self.payments.get_intent(id))
            .transpose()
    }

    fn hold_is_live(&self, session: &CheckoutSession) -> bool {
        let now = self.clock.now();
        session
            .reservation_id
            .and_then(|id| self.ledger.get_reservation(id).ok())
            .map(|r| r.is_held() && !r.is_expired_at(now))
            .unwrap_or(false)
    }

    /// Before an edit that changes what is being bought or where it goes,
    /// a session at `Payment` or `Review` returns to `Shipping`.
    async fn regress_for_edit(&self, draft: &mut CheckoutSession) -> Result<(), ServiceError> {
        if !draft.step.holds_stock() {
            return Ok(());
        }
        self.drop_payment(draft).await?;
        if let Some(reservation_id) = draft.reservation_id.take() {
            self.ledger
                .release(reservation_id, ReleaseReason::StepRegression)
                .await?;
        }
        draft.step = CheckoutStep::Shipping;
        Ok(())
    }

    /// Cancels an intent that has not taken money. Refuses if it has.
    async fn drop_payment(&self, draft: &mut CheckoutSession) -> Result<(), ServiceError> {
        let intent = match self.current_intent(draft)? {
            Some(intent) => intent,
            None => return Ok(()),
        };
        if intent.is_settled_or_authorized() {
            return Err(ServiceError::InvalidTransition(
                "Payment is already authorized; complete or cancel the checkout".to_string(),
            ));
        }
        if !intent.status.is_terminal() {
            self.payments.cancel(intent.id).await?;
        }
        draft.payment_intent_id = None;
        Ok(())
    }

    /// Recomputes totals, surfacing lookup failures.
    async fn recompute_totals(&self, draft: &mut CheckoutSession) -> Result<(), ServiceError> {
        let (totals, rejection) = self.totals.compute(session_totals_input(draft)).await?;
        if let (Some(rejection), Some(_)) = (rejection, draft.coupon_code.as_ref()) {
            info!(session_id = %draft.id, %rejection, "Dropping coupon that no longer applies");
            draft.coupon_code = None;
            let (mut totals, _) = self.totals.compute(session_totals_input(draft)).await?;
            totals.coupon_rejection = Some(rejection);
            draft.totals = totals;
        } else {
            draft.totals = totals;
        }
        draft.totals_stale = false;
        Ok(())
    }

    /// Recomputes totals when the rate lookups answer; otherwise keeps the
    /// old totals flagged stale so the edit itself still goes through.
    async fn refresh_totals(&self, draft: &mut CheckoutSession) {
        if let Err(e) = self.recompute_totals(draft).await {
            warn!(session_id = %draft.id, "Totals left stale: {}", e);
            draft.totals_stale = true;
        }
    }

    async fn release_quietly(&self, reservation_id: Uuid, reason: ReleaseReason) {
        if let Err(e) = self.ledger.release(reservation_id, reason).await {
            warn!(reservation_id = %reservation_id, "Failed to release reservation: {}", e);
        }
    }

    async fn emit_step(&self, session_id: Uuid, from: CheckoutStep, to: CheckoutStep) {
        if from != to {
            self.event_sender
                .send_or_log(Event::CheckoutStepChanged {
                    session_id,
                    from,
                    to,
                })
                .await;
        }
    }
}

fn session_totals_input(session: &CheckoutSession) -> TotalsInput<'_> {
    TotalsInput {
        lines: &session.lines,
        coupon_code: session.coupon_code.as_deref(),
        shipping_address: session.shipping_address.as_ref(),
        shipping_method: session.shipping_method.as_deref(),
        exemption: session.tax_exemption.as_ref(),
    }
}

fn reservation_lines(session: &CheckoutSession) -> Vec<ReservationLine> {
    session
        .lines
        .iter()
        .map(|line| ReservationLine {
            key: line.key(),
            quantity: line.quantity,
        })
        .collect()
}
