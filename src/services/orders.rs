use crate::{
    clock::SharedClock,
    errors::ServiceError,
    events::{Event, EventSender},
    models::{
        checkout::CheckoutSession,
        money::round_money,
        order::{
            Order, OrderLine, OrderPaymentStatus, OrderStatus, OrderTotals, RefundRecord,
        },
        payment::PaymentIntent,
        reservation::ReservationStatus,
    },
    repositories::VersionedStore,
    services::{
        commerce::pricing_service::PricingEngine,
        inventory_reservation_service::InventoryLedger, payments::PaymentOrchestrator,
    },
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ShipOrderRequest {
    #[validate(length(min = 1, max = 100, message = "Tracking number must be 1-100 characters"))]
    pub tracking_number: Option<String>,
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CancelOrderRequest {
    #[validate(length(min = 1, max = 500, message = "Reason is required"))]
    pub reason: String,
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RefundOrderRequest {
    pub amount: Decimal,
    #[validate(length(min = 1, max = 500, message = "Reason is required"))]
    pub reason: String,
    pub expected_version: Option<u64>,
}

/// Order lifecycle manager.
///
/// Orders are created once per checkout session and only ever move along
/// the edges of [`OrderStatus::can_transition_to`]. Lines and totals are
/// frozen at creation; refunds are appended as records.
#[derive(Clone)]
pub struct OrderService {
    orders: Arc<VersionedStore<Order>>,
    by_checkout: Arc<DashMap<Uuid, Uuid>>,
    ledger: InventoryLedger,
    payments: PaymentOrchestrator,
    pricing: PricingEngine,
    event_sender: Arc<EventSender>,
    clock: SharedClock,
    sequence: Arc<AtomicU64>,
    number_prefix: String,
}

impl OrderService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orders: Arc<VersionedStore<Order>>,
        ledger: InventoryLedger,
        payments: PaymentOrchestrator,
        pricing: PricingEngine,
        event_sender: Arc<EventSender>,
        clock: SharedClock,
        number_prefix: impl Into<String>,
    ) -> Self {
        Self {
            orders,
            by_checkout: Arc::new(DashMap::new()),
            ledger,
            payments,
            pricing,
            event_sender,
            clock,
            sequence: Arc::new(AtomicU64::new(0)),
            number_prefix: number_prefix.into(),
        }
    }

    pub fn get_order(&self, order_id: Uuid) -> Result<Order, ServiceError> {
        self.orders.require(order_id)
    }

    pub fn find_by_checkout(&self, checkout_id: Uuid) -> Option<Order> {
        self.by_checkout
            .get(&checkout_id)
            .and_then(|id| self.orders.get(*id))
    }

    pub fn find_by_payment_intent(&self, intent_id: Uuid) -> Option<Order> {
        self.orders
            .find(|o| o.payment_intent_id == intent_id)
            .into_iter()
            .next()
    }

    pub fn find_by_number(&self, order_number: &str) -> Option<Order> {
        self.orders
            .find(|o| o.order_number.eq_ignore_ascii_case(order_number))
            .into_iter()
            .next()
    }

    fn next_order_number(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{:06}", self.number_prefix, seq)
    }

    /// Materializes a checkout session and its payment into an order.
    ///
    /// Commits the session's reservation first; if that fails (most often
    /// because it expired) nothing is created and the error is returned for
    /// the checkout to handle. Calling again for the same session returns the
    /// existing order.
    #[instrument(skip(self, session, intent), fields(checkout_id = %session.id, intent_id = %intent.id))]
    pub async fn create_from_checkout(
        &self,
        session: &CheckoutSession,
        intent: &PaymentIntent,
    ) -> Result<Order, ServiceError> {
        if let Some(existing) = self.find_by_checkout(session.id) {
            return Ok(existing);
        }
        if !intent.is_settled_or_authorized() || intent.checkout_id != session.id {
            return Err(ServiceError::InvalidTransition(format!(
                "Payment intent {} does not cover checkout {}",
                intent.id, session.id
            )));
        }
        let reservation_id = session.reservation_id.ok_or_else(|| {
            ServiceError::InvalidTransition("Checkout holds no stock reservation".to_string())
        })?;
        let (shipping_address, shipping_method, email) = match (
            session.shipping_address.clone(),
            session.shipping_method.clone(),
            session.email.clone(),
        ) {
            (Some(address), Some(method), Some(email)) => (address, method, email),
            _ => {
                return Err(ServiceError::ValidationError(
                    "Checkout is missing address, shipping method or email".to_string(),
                ))
            }
        };

        let order_id = Uuid::new_v4();
        match self.by_checkout.entry(session.id) {
            Entry::Occupied(_) => {
                return self.find_by_checkout(session.id).ok_or_else(|| {
                    ServiceError::Conflict(format!(
                        "Order for checkout {} is being created",
                        session.id
                    ))
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(order_id);
            }
        }

        let reservation = match self.ledger.commit(reservation_id).await {
            Ok(reservation) => reservation,
            Err(e) => {
                self.by_checkout.remove(&session.id);
                warn!(reservation_id = %reservation_id, "Order aborted, reservation commit failed: {}", e);
                return Err(e);
            }
        };
        if reservation.status != ReservationStatus::Committed || reservation.owner_id != session.id
        {
            self.by_checkout.remove(&session.id);
            return Err(ServiceError::invariant(format!(
                "Reservation {} is {} for owner {} while creating order for checkout {}",
                reservation.id, reservation.status, reservation.owner_id, session.id
            )));
        }

        let now = self.clock.now();
        let captured = intent.status.is_captured();
        let mut order = Order {
            id: order_id,
            order_number: self.next_order_number(),
            checkout_id: session.id,
            customer_id: session.customer_id,
            email,
            billing_address: session
                .billing_address
                .clone()
                .unwrap_or_else(|| shipping_address.clone()),
            shipping_address,
            shipping_method,
            coupon_code: session.coupon_code.clone(),
            lines: order_lines(session),
            totals: OrderTotals {
                subtotal: session.totals.subtotal,
                discount_total: session.totals.discount_total,
                shipping_total: session.totals.shipping_total,
                tax_total: session.totals.tax_total,
                grand_total: session.totals.grand_total,
                currency: session.currency.clone(),
            },
            status: OrderStatus::Pending,
            held_from: None,
            payment_intent_id: intent.id,
            payment_status: if captured {
                OrderPaymentStatus::Paid
            } else {
                OrderPaymentStatus::Authorized
            },
            reservation_id,
            tracking_number: None,
            refunds: Vec::new(),
            history: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        };
        order.record(OrderStatus::Pending, "Order placed", now);
        if captured {
            order.record(OrderStatus::Confirmed, "Payment captured", now);
        }

        let order = match self.orders.insert(order) {
            Ok(order) => order,
            Err(e) => {
                // the reservation is already committed; this is a bug, not a retry case
                error!(order_id = %order_id, "Failed to store order after commit: {}", e);
                return Err(ServiceError::invariant(format!(
                    "Order {} could not be stored after its reservation was committed",
                    order_id
                )));
            }
        };

        for applied in &session.totals.discounts {
            if let Err(e) = self.pricing.record_usage(applied.discount_id).await {
                warn!(discount_id = %applied.discount_id, "Failed to record discount usage: {}", e);
            }
        }

        info!(order_id = %order.id, order_number = %order.order_number, status = %order.status, "Order created");
        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id: order.id,
                order_number: order.order_number.clone(),
            })
            .await;
        if captured {
            self.event_sender.send_or_log(Event::OrderPaid(order.id)).await;
        }
        Ok(order)
    }

    /// Marks an authorized order as paid. Safe to call any number of times;
    /// `OrderPaid` is emitted once.
    #[instrument(skip(self))]
    pub async fn confirm_payment(&self, order_id: Uuid) -> Result<Order, ServiceError> {
        let now = self.clock.now();
        let mut changed = false;
        let order = self.orders.update_unchecked(order_id, |order| {
            if order.payment_status != OrderPaymentStatus::Authorized {
                return Ok(());
            }
            order.payment_status = OrderPaymentStatus::Paid;
            if order.status == OrderStatus::Pending {
                order.record(OrderStatus::Confirmed, "Payment captured", now);
            } else {
                order.append_note("Payment captured", now);
            }
            changed = true;
            Ok(())
        })?;

        if changed {
            info!(order_id = %order_id, "Order paid");
            self.event_sender.send_or_log(Event::OrderPaid(order_id)).await;
            if order.status == OrderStatus::Confirmed {
                self.event_sender
                    .send_or_log(Event::OrderStatusChanged {
                        order_id,
                        from: OrderStatus::Pending,
                        to: OrderStatus::Confirmed,
                    })
                    .await;
            }
        }
        Ok(order)
    }

    /// Captures an authorized payment and confirms the order.
    #[instrument(skip(self))]
    pub async fn capture_payment(&self, order_id: Uuid) -> Result<Order, ServiceError> {
        let order = self.orders.require(order_id)?;
        if order.payment_status != OrderPaymentStatus::Authorized {
            return Ok(order);
        }
        let intent = self.payments.capture(order.payment_intent_id, None).await?;
        if !intent.status.is_captured() {
            return Err(ServiceError::PaymentPending(intent.id));
        }
        self.confirm_payment(order_id).await
    }

    pub async fn start_processing(
        &self,
        order_id: Uuid,
        expected_version: Option<u64>,
    ) -> Result<Order, ServiceError> {
        self.transition(
            order_id,
            expected_version,
            OrderStatus::Processing,
            "Fulfillment started".to_string(),
            |_| Ok(()),
        )
        .await
    }

    #[instrument(skip(self, request))]
    pub async fn ship(
        &self,
        order_id: Uuid,
        request: ShipOrderRequest,
    ) -> Result<Order, ServiceError> {
        request.validate()?;
        let tracking = request.tracking_number.clone();
        let order = self
            .transition(
                order_id,
                request.expected_version,
                OrderStatus::Shipped,
                match &tracking {
                    Some(number) => format!("Shipped, tracking {}", number),
                    None => "Shipped".to_string(),
                },
                |order| {
                    order.tracking_number = tracking.clone();
                    Ok(())
                },
            )
            .await?;
        self.event_sender
            .send_or_log(Event::OrderShipped {
                order_id,
                tracking_number: order.tracking_number.clone(),
            })
            .await;
        Ok(order)
    }

    pub async fn deliver(
        &self,
        order_id: Uuid,
        expected_version: Option<u64>,
    ) -> Result<Order, ServiceError> {
        let order = self
            .transition(
                order_id,
                expected_version,
                OrderStatus::Delivered,
                "Delivered".to_string(),
                |_| Ok(()),
            )
            .await?;
        self.event_sender
            .send_or_log(Event::OrderDelivered(order_id))
            .await;
        Ok(order)
    }

    pub async fn complete(
        &self,
        order_id: Uuid,
        expected_version: Option<u64>,
    ) -> Result<Order, ServiceError> {
        let order = self
            .transition(
                order_id,
                expected_version,
                OrderStatus::Completed,
                "Completed".to_string(),
                |_| Ok(()),
            )
            .await?;
        self.event_sender
            .send_or_log(Event::OrderCompleted(order_id))
            .await;
        Ok(order)
    }

    /// Puts the order on hold, remembering where it was.
    #[instrument(skip(self))]
    pub async fn hold(
        &self,
        order_id: Uuid,
        reason: String,
        expected_version: Option<u64>,
    ) -> Result<Order, ServiceError> {
        let order = self
            .transition(
                order_id,
                expected_version,
                OrderStatus::OnHold,
                format!("On hold: {}", reason),
                |order| {
                    order.held_from = order
                        .history
                        .last()
                        .and_then(|entry| entry.from);
                    Ok(())
                },
            )
            .await?;
        self.event_sender
            .send_or_log(Event::OrderOnHold { order_id, reason })
            .await;
        Ok(order)
    }

    /// Returns a held order to the status it had before the hold.
    #[instrument(skip(self))]
    pub async fn release_hold(
        &self,
        order_id: Uuid,
        expected_version: Option<u64>,
    ) -> Result<Order, ServiceError> {
        let now = self.clock.now();
        let order = self.update(order_id, expected_version, |order| {
            let previous = match (order.status, order.held_from) {
                (OrderStatus::OnHold, Some(previous)) => previous,
                _ => {
                    return Err(ServiceError::InvalidTransition(format!(
                        "Order {} is {} and not on hold",
                        order.id, order.status
                    )))
                }
            };
            order.record(previous, "Hold released", now);
            order.held_from = None;
            Ok(())
        })?;
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                from: OrderStatus::OnHold,
                to: order.status,
            })
            .await;
        Ok(order)
    }

    /// Marks the order failed and voids an uncaptured authorization.
    #[instrument(skip(self))]
    pub async fn fail(
        &self,
        order_id: Uuid,
        reason: String,
        expected_version: Option<u64>,
    ) -> Result<Order, ServiceError> {
        let order = self.load(order_id, expected_version)?;
        if !order.status.can_transition_to(OrderStatus::Failed) {
            return Err(invalid_edge(&order, OrderStatus::Failed));
        }
        let voided = self.void_authorization(&order).await?;
        self.transition(
            order_id,
            None,
            OrderStatus::Failed,
            format!("Failed: {}", reason),
            |order| {
                if voided {
                    order.payment_status = OrderPaymentStatus::Voided;
                }
                Ok(())
            },
        )
        .await
    }

    /// Cancels an order that has not shipped. An authorization is voided; a
    /// captured payment is refunded in full. Committed stock goes back on
    /// hand.
    #[instrument(skip(self, request))]
    pub async fn cancel(
        &self,
        order_id: Uuid,
        request: CancelOrderRequest,
    ) -> Result<Order, ServiceError> {
        request.validate()?;
        let order = self.load(order_id, request.expected_version)?;
        if !order.status.is_cancellable() || !order.status.can_transition_to(OrderStatus::Cancelled)
        {
            return Err(invalid_edge(&order, OrderStatus::Cancelled));
        }

        let voided = self.void_authorization(&order).await?;
        let refund_amount = order.refundable();
        if refund_amount > Decimal::ZERO {
            self.payments
                .refund(order.payment_intent_id, refund_amount)
                .await?;
        }

        let now = self.clock.now();
        let reason = request.reason.clone();
        let order = self
            .transition(
                order_id,
                None,
                OrderStatus::Cancelled,
                format!("Cancelled: {}", reason),
                |order| {
                    if voided {
                        order.payment_status = OrderPaymentStatus::Voided;
                    }
                    if refund_amount > Decimal::ZERO {
                        order.refunds.push(RefundRecord {
                            id: Uuid::new_v4(),
                            amount: refund_amount,
                            reason: format!("Cancelled: {}", reason),
                            created_at: now,
                        });
                        order.payment_status = OrderPaymentStatus::Refunded;
                    }
                    Ok(())
                },
            )
            .await?;

        self.restock(&order);
        self.event_sender
            .send_or_log(Event::OrderCancelled {
                order_id,
                reason: request.reason,
            })
            .await;
        if refund_amount > Decimal::ZERO {
            self.event_sender
                .send_or_log(Event::OrderRefunded {
                    order_id,
                    amount: refund_amount,
                    full: true,
                })
                .await;
        }
        Ok(order)
    }

    /// Refunds part or all of what was paid. A refund that brings the total
    /// refunded up to the grand total moves the order to `Refunded`.
    #[instrument(skip(self, request))]
    pub async fn refund(
        &self,
        order_id: Uuid,
        request: RefundOrderRequest,
    ) -> Result<Order, ServiceError> {
        request.validate()?;
        let amount = round_money(request.amount);
        let order = self.load(order_id, request.expected_version)?;
        if amount <= Decimal::ZERO || amount > order.refundable() {
            return Err(ServiceError::ValidationError(format!(
                "Refund of {} is outside the refundable {} for order {}",
                amount,
                order.refundable(),
                order.order_number
            )));
        }
        let full = amount == order.refundable();
        if full && !order.status.can_transition_to(OrderStatus::Refunded) {
            return Err(invalid_edge(&order, OrderStatus::Refunded));
        }

        self.payments
            .refund(order.payment_intent_id, amount)
            .await?;

        let order = self
            .record_refund(order_id, amount, request.reason)
            .await?;
        Ok(order)
    }

    /// Mirrors a refund made at the provider (dashboard, dispute loss) onto
    /// the order. Refunds already recorded here are not counted twice.
    #[instrument(skip(self, intent), fields(intent_id = %intent.id))]
    pub async fn sync_provider_refund(
        &self,
        order_id: Uuid,
        intent: &PaymentIntent,
    ) -> Result<Order, ServiceError> {
        let order = self.orders.require(order_id)?;
        let missing = intent.amount_refunded - order.refunded_total();
        if missing <= Decimal::ZERO {
            return Ok(order);
        }
        self.record_refund(order_id, missing, "Refunded at payment provider".to_string())
            .await
    }

    async fn record_refund(
        &self,
        order_id: Uuid,
        amount: Decimal,
        reason: String,
    ) -> Result<Order, ServiceError> {
        let now = self.clock.now();
        let mut moved_from = None;
        let order = self.orders.update_unchecked(order_id, |order| {
            if amount > order.refundable() {
                return Err(ServiceError::invariant(format!(
                    "Refund of {} exceeds refundable {} on order {}",
                    amount,
                    order.refundable(),
                    order.id
                )));
            }
            order.refunds.push(RefundRecord {
                id: Uuid::new_v4(),
                amount,
                reason: reason.clone(),
                created_at: now,
            });
            if order.refundable() == Decimal::ZERO {
                order.payment_status = OrderPaymentStatus::Refunded;
                if order.status.can_transition_to(OrderStatus::Refunded) {
                    moved_from = Some(order.status);
                    order.record(OrderStatus::Refunded, format!("Refunded: {}", reason), now);
                } else {
                    order.append_note(format!("Refunded {}: {}", amount, reason), now);
                }
            } else {
                order.payment_status = OrderPaymentStatus::PartiallyRefunded;
                order.append_note(format!("Partial refund {}: {}", amount, reason), now);
            }
            Ok(())
        })?;

        let full = order.payment_status == OrderPaymentStatus::Refunded;
        info!(order_id = %order_id, %amount, full, "Refund recorded");
        if let Some(from) = moved_from {
            self.event_sender
                .send_or_log(Event::OrderStatusChanged {
                    order_id,
                    from,
                    to: OrderStatus::Refunded,
                })
                .await;
        }
        self.event_sender
            .send_or_log(Event::OrderRefunded {
                order_id,
                amount,
                full,
            })
            .await;
        Ok(order)
    }

    /// A chargeback was opened. The order is held where the state machine
    /// allows it; otherwise the dispute is noted.
    #[instrument(skip(self))]
    pub async fn apply_dispute(&self, order_id: Uuid) -> Result<Order, ServiceError> {
        let order = self.orders.require(order_id)?;
        if order.status.can_transition_to(OrderStatus::OnHold) {
            return self
                .hold(order_id, "Payment disputed".to_string(), None)
                .await;
        }
        let now = self.clock.now();
        self.orders.update_unchecked(order_id, |order| {
            order.append_note("Payment disputed", now);
            Ok(())
        })
    }

    /// The authorization behind a pending order was cancelled or failed at
    /// the provider.
    #[instrument(skip(self))]
    pub async fn payment_voided(&self, order_id: Uuid, reason: String) -> Result<Order, ServiceError> {
        let order = self.orders.require(order_id)?;
        if order.payment_status != OrderPaymentStatus::Authorized {
            return Ok(order);
        }
        let now = self.clock.now();
        let mut moved = false;
        let order = self.orders.update_unchecked(order_id, |order| {
            order.payment_status = OrderPaymentStatus::Voided;
            if order.status.can_transition_to(OrderStatus::Failed) {
                order.record(OrderStatus::Failed, format!("Payment voided: {}", reason), now);
                moved = true;
            } else {
                order.append_note(format!("Payment voided: {}", reason), now);
            }
            Ok(())
        })?;
        if moved {
            self.event_sender
                .send_or_log(Event::OrderStatusChanged {
                    order_id,
                    from: OrderStatus::Pending,
                    to: OrderStatus::Failed,
                })
                .await;
        }
        Ok(order)
    }

    pub async fn add_note(
        &self,
        order_id: Uuid,
        note: String,
        expected_version: Option<u64>,
    ) -> Result<Order, ServiceError> {
        if note.trim().is_empty() {
            return Err(ServiceError::ValidationError("Note is empty".to_string()));
        }
        let now = self.clock.now();
        self.update(order_id, expected_version, |order| {
            order.append_note(note, now);
            Ok(())
        })
    }

    async fn void_authorization(&self, order: &Order) -> Result<bool, ServiceError> {
        if order.payment_status != OrderPaymentStatus::Authorized {
            return Ok(false);
        }
        self.payments.cancel(order.payment_intent_id).await?;
        Ok(true)
    }

    fn restock(&self, order: &Order) {
        for line in &order.lines {
            let key = crate::models::reservation::StockKey::new(line.product_id, line.variant_id);
            if let Err(e) = self.ledger.adjust_stock(key, line.quantity) {
                error!(order_id = %order.id, %key, "Failed to restock cancelled line: {}", e);
            }
        }
    }

    fn load(&self, order_id: Uuid, expected_version: Option<u64>) -> Result<Order, ServiceError> {
        let order = self.orders.require(order_id)?;
        match expected_version {
            Some(expected) if expected != order.version => {
                Err(ServiceError::ConcurrentModification {
                    id: order_id,
                    expected,
                    actual: order.version,
                })
            }
            _ => Ok(order),
        }
    }

    fn update<F>(
        &self,
        order_id: Uuid,
        expected_version: Option<u64>,
        f: F,
    ) -> Result<Order, ServiceError>
    where
        F: FnOnce(&mut Order) -> Result<(), ServiceError>,
    {
        match expected_version {
            Some(expected) => self.orders.update(order_id, expected, f),
            None => self.orders.update_unchecked(order_id, f),
        }
    }

    /// Moves the order along one edge, appends history and emits
    /// `OrderStatusChanged`.
    async fn transition<F>(
        &self,
        order_id: Uuid,
        expected_version: Option<u64>,
        to: OrderStatus,
        note: String,
        extra: F,
    ) -> Result<Order, ServiceError>
    where
        F: FnOnce(&mut Order) -> Result<(), ServiceError>,
    {
        let now = self.clock.now();
        let mut from = None;
        let order = self.update(order_id, expected_version, |order| {
            if !order.status.can_transition_to(to) {
                return Err(invalid_edge(order, to));
            }
            from = Some(order.status);
            order.record(to, note, now);
            extra(order)
        })?;

        if let Some(from) = from {
            info!(order_id = %order_id, %from, %to, "Order status changed");
            self.event_sender
                .send_or_log(Event::OrderStatusChanged { order_id, from, to })
                .await;
        }
        Ok(order)
    }
}

fn invalid_edge(order: &Order, to: OrderStatus) -> ServiceError {
    ServiceError::InvalidTransition(format!(
        "Order {} cannot move from {} to {}",
        order.order_number, order.status, to
    ))
}

/// Price-at-purchase lines with their share of discount and tax.
fn order_lines(session: &CheckoutSession) -> Vec<OrderLine> {
    session
        .lines
        .iter()
        .map(|line| {
            let subtotal = round_money(line.line_total());
            let discount = session
                .totals
                .allocations
                .iter()
                .find(|a| a.line_id == line.id)
                .map(|a| a.discount)
                .unwrap_or(Decimal::ZERO);
            let tax: Decimal = session
                .totals
                .tax
                .lines
                .iter()
                .filter(|t| t.line_id == Some(line.id))
                .map(|t| t.amount)
                .sum();
            OrderLine {
                id: Uuid::new_v4(),
                product_id: line.product_id,
                variant_id: line.variant_id,
                sku: line.sku.clone(),
                name: line.name.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price,
                subtotal,
                discount,
                tax,
                total: subtotal - discount + tax,
            }
        })
        .collect()
}
