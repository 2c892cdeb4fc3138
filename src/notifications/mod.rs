use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::events::Event;

/// Customer-facing notification derived from an order event.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Notification {
    pub id: Uuid,
    pub order_id: Uuid,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    OrderCreated,
    OrderPaid,
    OrderShipped,
    OrderDelivered,
    OrderCancelled,
    OrderRefunded,
    OrderOnHold,
}

impl Notification {
    /// Maps an event to a notification. Internal events map to `None`.
    pub fn from_event(event: &Event, at: DateTime<Utc>) -> Option<Self> {
        let (order_id, kind, message) = match event {
            Event::OrderCreated {
                order_id,
                order_number,
            } => (
                *order_id,
                NotificationKind::OrderCreated,
                format!("Order {} received", order_number),
            ),
            Event::OrderPaid(order_id) => (
                *order_id,
                NotificationKind::OrderPaid,
                "Payment received".to_string(),
            ),
            Event::OrderShipped {
                order_id,
                tracking_number,
            } => (
                *order_id,
                NotificationKind::OrderShipped,
                match tracking_number {
                    Some(tracking) => format!("Shipped, tracking {}", tracking),
                    None => "Shipped".to_string(),
                },
            ),
            Event::OrderDelivered(order_id) => (
                *order_id,
                NotificationKind::OrderDelivered,
                "Delivered".to_string(),
            ),
            Event::OrderCancelled { order_id, reason } => (
                *order_id,
                NotificationKind::OrderCancelled,
                format!("Cancelled: {}", reason),
            ),
            Event::OrderRefunded {
                order_id, amount, ..
            } => (
                *order_id,
                NotificationKind::OrderRefunded,
                format!("Refunded {}", amount),
            ),
            Event::OrderOnHold { order_id, reason } => (
                *order_id,
                NotificationKind::OrderOnHold,
                format!("On hold: {}", reason),
            ),
            _ => return None,
        };

        Some(Self {
            id: Uuid::new_v4(),
            order_id,
            kind,
            message,
            created_at: at,
        })
    }
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Outbound side of notifications. Delivery (email, merchant webhooks) lives
/// outside the core.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, notification: Notification) -> Result<(), NotificationError>;
}

/// Default dispatcher: writes each notification to the log.
#[derive(Debug, Default, Clone)]
pub struct LoggingNotificationDispatcher;

#[async_trait]
impl NotificationDispatcher for LoggingNotificationDispatcher {
    async fn dispatch(&self, notification: Notification) -> Result<(), NotificationError> {
        info!(
            order_id = %notification.order_id,
            kind = ?notification.kind,
            "{}",
            notification.message
        );
        Ok(())
    }
}

/// Keeps every dispatched notification in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryNotificationDispatcher {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl InMemoryNotificationDispatcher {
    pub fn sent(&self) -> Vec<Notification> {
        match self.sent.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl NotificationDispatcher for InMemoryNotificationDispatcher {
    async fn dispatch(&self, notification: Notification) -> Result<(), NotificationError> {
        let mut sent = match self.sent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sent.push(notification);
        Ok(())
    }
}
