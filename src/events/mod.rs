use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::checkout::CheckoutStep;
use crate::models::order::OrderStatus;
use crate::models::reservation::{ReleaseReason, ReservationLine, StockShortage};
use crate::notifications::{Notification, NotificationDispatcher};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender together with the receiving end for [`process_events`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends and logs on failure. Events are notifications about state that
    /// is already committed, so a closed channel never fails the caller.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("Dropping event: {}", e);
        }
    }
}

/// Domain events emitted by the core for collaborators to act on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    // Cart events
    CartCreated(Uuid),
    CartMerged {
        guest_cart_id: Uuid,
        customer_cart_id: Uuid,
    },
    CartDeleted(Uuid),

    // Checkout events
    CheckoutStarted {
        cart_id: Uuid,
        session_id: Uuid,
    },
    CheckoutStepChanged {
        session_id: Uuid,
        from: CheckoutStep,
        to: CheckoutStep,
    },
    CheckoutCancelled(Uuid),
    CheckoutAbandoned(Uuid),

    // Inventory events
    InventoryReserved {
        reservation_id: Uuid,
        owner_id: Uuid,
        lines: Vec<ReservationLine>,
        expires_at: DateTime<Utc>,
    },
    InventoryCommitted {
        reservation_id: Uuid,
        owner_id: Uuid,
    },
    InventoryReleased {
        reservation_id: Uuid,
        owner_id: Uuid,
        reason: ReleaseReason,
    },
    StockConflict {
        owner_id: Uuid,
        shortages: Vec<StockShortage>,
    },

    // Payment events
    PaymentIntentCreated {
        intent_id: Uuid,
        checkout_id: Uuid,
        amount: Decimal,
    },
    PaymentAuthorized(Uuid),
    PaymentCaptured(Uuid),
    PaymentFailed {
        intent_id: Uuid,
        reason: String,
    },
    PaymentCancelled(Uuid),
    PaymentRefunded {
        intent_id: Uuid,
        amount: Decimal,
    },
    PaymentDisputed(Uuid),

    // Order events
    OrderCreated {
        order_id: Uuid,
        order_number: String,
    },
    OrderPaid(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    },
    OrderShipped {
        order_id: Uuid,
        tracking_number: Option<String>,
    },
    OrderDelivered(Uuid),
    OrderCompleted(Uuid),
    OrderCancelled {
        order_id: Uuid,
        reason: String,
    },
    OrderRefunded {
        order_id: Uuid,
        amount: Decimal,
        full: bool,
    },
    OrderOnHold {
        order_id: Uuid,
        reason: String,
    },
}

/// Drains the event channel, forwarding customer-facing events to the
/// notification dispatcher and logging the rest.
pub async fn process_events(
    mut rx: mpsc::Receiver<Event>,
    dispatcher: Arc<dyn NotificationDispatcher>,
) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        debug!("Received event: {:?}", event);

        match &event {
            Event::StockConflict {
                owner_id,
                shortages,
            } => {
                warn!(
                    owner_id = %owner_id,
                    items = shortages.len(),
                    "Checkout blocked by insufficient stock"
                );
            }
            Event::PaymentFailed { intent_id, reason } => {
                warn!("Payment failed: intent_id={}, reason={}", intent_id, reason);
            }
            Event::PaymentDisputed(intent_id) => {
                warn!("Payment disputed: {}", intent_id);
            }
            Event::InventoryReleased {
                reservation_id,
                reason,
                ..
            } => {
                info!("Reservation {} released ({})", reservation_id, reason);
            }
            _ => {}
        }

        if let Some(notification) = Notification::from_event(&event, Utc::now()) {
            if let Err(e) = dispatcher.dispatch(notification).await {
                error!("Failed to dispatch notification for {:?}: {}", event, e);
            }
        }
    }

    warn!("Event processing loop has ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::{InMemoryNotificationDispatcher, NotificationKind};

    #[tokio::test]
    async fn order_events_become_notifications() {
        let (sender, rx) = EventSender::channel(16);
        let dispatcher = Arc::new(InMemoryNotificationDispatcher::default());
        let loop_handle = tokio::spawn(process_events(rx, dispatcher.clone()));

        let order_id = Uuid::new_v4();
        sender.send_or_log(Event::OrderPaid(order_id)).await;
        sender.send_or_log(Event::CartCreated(Uuid::new_v4())).await;
        drop(sender);
        loop_handle.await.unwrap();

        let sent = dispatcher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::OrderPaid);
        assert_eq!(sent[0].order_id, order_id);
    }
}
