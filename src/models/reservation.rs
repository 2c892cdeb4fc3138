use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::Display;
use uuid::Uuid;

/// Inventory counter key: a product, optionally narrowed to a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockKey {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
}

impl StockKey {
    pub fn new(product_id: Uuid, variant_id: Option<Uuid>) -> Self {
        Self {
            product_id,
            variant_id,
        }
    }
}

impl fmt::Display for StockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.variant_id {
            Some(variant) => write!(f, "{}/{}", self.product_id, variant),
            None => write!(f, "{}", self.product_id),
        }
    }
}

/// Counters for one key. `held` counts units in Held reservations only;
/// committed units have already left `on_hand`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub on_hand: i64,
    pub held: i64,
}

impl StockLevel {
    pub fn available(&self) -> i64 {
        self.on_hand - self.held
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSnapshot {
    pub key: StockKey,
    pub on_hand: i64,
    pub held: i64,
    pub available: i64,
}

/// One line of a reserve request or of a held reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationLine {
    pub key: StockKey,
    pub quantity: i64,
}

/// Per-item shortfall reported when a reserve call cannot be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockShortage {
    pub key: StockKey,
    pub requested: i64,
    pub available: i64,
}

impl StockShortage {
    pub fn missing(&self) -> i64 {
        self.requested - self.available.max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReservationStatus {
    Held,
    Committed,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReleaseReason {
    Cancelled,
    Expired,
    StepRegression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockReservation {
    pub id: Uuid,
    /// Checkout session id until an order exists, then the order id.
    pub owner_id: Uuid,
    pub lines: Vec<ReservationLine>,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub release_reason: Option<ReleaseReason>,
}

impl StockReservation {
    pub fn is_held(&self) -> bool {
        self.status == ReservationStatus::Held
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn total_quantity(&self) -> i64 {
        self.lines.iter().map(|l| l.quantity).sum()
    }
}
