use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::repositories::Versioned;

/// Local mirror of the provider-side intent status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentStatus {
    Created,
    RequiresAction,
    Processing,
    Captured,
    PartiallyRefunded,
    Refunded,
    Cancelled,
    Failed,
}

impl PaymentStatus {
    /// Lifecycle position. Cancelled and Failed sit at the end of the
    /// pre-capture path; nothing moves out of them.
    fn stage(&self) -> u8 {
        match self {
            PaymentStatus::Created => 0,
            PaymentStatus::RequiresAction => 1,
            PaymentStatus::Processing => 2,
            PaymentStatus::Captured => 3,
            PaymentStatus::PartiallyRefunded => 4,
            PaymentStatus::Refunded => 5,
            PaymentStatus::Cancelled | PaymentStatus::Failed => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Refunded | PaymentStatus::Cancelled | PaymentStatus::Failed
        )
    }

    pub fn is_captured(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Captured | PaymentStatus::PartiallyRefunded | PaymentStatus::Refunded
        )
    }

    /// Forward-only guard. Anything that would move the mirror backwards (or
    /// out of a terminal state) is refused. `PartiallyRefunded` may repeat
    /// because each partial refund is its own forward step.
    pub fn can_advance_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        match (self, next) {
            (Refunded | Cancelled | Failed, _) => false,
            (PartiallyRefunded, PartiallyRefunded) => true,
            // once money moved, it can only be refunded
            (Captured | PartiallyRefunded, Cancelled | Failed) => false,
            (from, to) => to.stage() > from.stage(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: Uuid,
    pub checkout_id: Uuid,
    pub provider: String,
    pub provider_intent_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub amount_authorized: Decimal,
    pub amount_captured: Decimal,
    pub amount_refunded: Decimal,
    /// Intents created for this checkout before this one, plus one.
    pub attempt: u32,
    pub payment_method: Option<String>,
    pub client_secret: Option<String>,
    pub disputed: bool,
    pub last_error: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentIntent {
    /// Captured, or authorized in full and waiting on capture.
    pub fn is_settled_or_authorized(&self) -> bool {
        self.status.is_captured()
            || (self.status == PaymentStatus::Processing && self.amount_authorized >= self.amount)
    }

    pub fn refundable(&self) -> Decimal {
        self.amount_captured - self.amount_refunded
    }
}

impl Versioned for PaymentIntent {
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

/// What a verified provider webhook asks the core to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookAction {
    MarkAsPaid,
    MarkAsFailed,
    ProcessRefund,
    UpdatePaymentMethod,
    ChargeDisputed,
}

/// Provider webhook after signature verification and mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub provider_intent_id: String,
    pub action: WebhookAction,
    /// Status the event reports, when it carries one. An authorization
    /// event maps to `MarkAsPaid` with `Processing` here.
    pub status: Option<PaymentStatus>,
    pub amount: Option<Decimal>,
    pub payment_method: Option<String>,
    pub failure_reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Result of feeding one webhook through reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied {
        intent_id: Uuid,
        status: PaymentStatus,
    },
    Duplicate {
        event_id: String,
    },
    /// Verified but would move state backwards; recorded and ignored.
    Stale {
        intent_id: Uuid,
        current: PaymentStatus,
    },
}
