use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use super::address::Address;
use crate::repositories::Versioned;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    Completed,
    Cancelled,
    Refunded,
    OnHold,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed
                | OrderStatus::Cancelled
                | OrderStatus::Refunded
                | OrderStatus::Failed
        )
    }

    /// Cancellation is only valid before the goods leave.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending
                | OrderStatus::Confirmed
                | OrderStatus::Processing
                | OrderStatus::OnHold
        )
    }

    /// Allowed edges of the order state machine. Leaving `OnHold` goes back to
    /// the status held before; that edge is checked against `held_from`.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, Confirmed | Cancelled | OnHold | Failed) => true,
            (Confirmed, Processing | Cancelled | OnHold | Refunded) => true,
            (Processing, Shipped | Cancelled | OnHold | Failed | Refunded) => true,
            (Shipped, Delivered | OnHold | Refunded) => true,
            (Delivered, Completed | Refunded) => true,
            (Completed, Refunded) => true,
            (OnHold, Cancelled | Refunded) => true,
            _ => false,
        }
    }
}

/// How far the order's money has moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderPaymentStatus {
    /// Authorized, capture pending.
    Authorized,
    Paid,
    PartiallyRefunded,
    Refunded,
    Voided,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub sku: String,
    pub name: String,
    pub quantity: i64,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub discount_total: Decimal,
    pub shipping_total: Decimal,
    pub tax_total: Decimal,
    pub grand_total: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub id: Uuid,
    pub amount: Decimal,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderHistoryEntry {
    pub at: DateTime<Utc>,
    pub from: Option<OrderStatus>,
    pub to: OrderStatus,
    pub note: String,
}

/// Immutable financial record. Totals and lines never change after
/// creation; refunds are appended to `refunds`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub checkout_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub email: String,
    pub shipping_address: Address,
    pub billing_address: Address,
    pub shipping_method: String,
    pub coupon_code: Option<String>,
    pub lines: Vec<OrderLine>,
    pub totals: OrderTotals,
    pub status: OrderStatus,
    /// Status to return to when a hold is released.
    pub held_from: Option<OrderStatus>,
    pub payment_intent_id: Uuid,
    pub payment_status: OrderPaymentStatus,
    pub reservation_id: Uuid,
    pub tracking_number: Option<String>,
    pub refunds: Vec<RefundRecord>,
    pub history: Vec<OrderHistoryEntry>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn refunded_total(&self) -> Decimal {
        self.refunds.iter().map(|r| r.amount).sum()
    }

    pub fn refundable(&self) -> Decimal {
        match self.payment_status {
            OrderPaymentStatus::Paid | OrderPaymentStatus::PartiallyRefunded => {
                self.totals.grand_total - self.refunded_total()
            }
            _ => Decimal::ZERO,
        }
    }

    pub fn record(&mut self, to: OrderStatus, note: impl Into<String>, at: DateTime<Utc>) {
        let from = if self.history.is_empty() {
            None
        } else {
            Some(self.status)
        };
        self.history.push(OrderHistoryEntry {
            at,
            from,
            to,
            note: note.into(),
        });
        self.status = to;
        self.updated_at = at;
    }

    pub fn append_note(&mut self, note: impl Into<String>, at: DateTime<Utc>) {
        self.history.push(OrderHistoryEntry {
            at,
            from: Some(self.status),
            to: self.status,
            note: note.into(),
        });
        self.updated_at = at;
    }
}

impl Versioned for Order {
    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}
