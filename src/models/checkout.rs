use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use super::address::Address;
use super::cart::{CartLine, CartTotals};
use super::tax::ExemptionCertificate;
use crate::repositories::Versioned;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CheckoutStep {
    Information,
    Shipping,
    Payment,
    Review,
    Complete,
    Cancelled,
    Abandoned,
}

impl CheckoutStep {
    /// Position on the forward path. Terminal side states have none.
    pub fn ordinal(&self) -> Option<u8> {
        match self {
            CheckoutStep::Information => Some(0),
            CheckoutStep::Shipping => Some(1),
            CheckoutStep::Payment => Some(2),
            CheckoutStep::Review => Some(3),
            CheckoutStep::Complete => Some(4),
            CheckoutStep::Cancelled | CheckoutStep::Abandoned => None,
        }
    }

    pub fn next(&self) -> Option<CheckoutStep> {
        match self {
            CheckoutStep::Information => Some(CheckoutStep::Shipping),
            CheckoutStep::Shipping => Some(CheckoutStep::Payment),
            CheckoutStep::Payment => Some(CheckoutStep::Review),
            CheckoutStep::Review => Some(CheckoutStep::Complete),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CheckoutStep::Complete | CheckoutStep::Cancelled | CheckoutStep::Abandoned
        )
    }

    /// Steps at which the session holds stock.
    pub fn holds_stock(&self) -> bool {
        matches!(self, CheckoutStep::Payment | CheckoutStep::Review)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: Uuid,
    pub cart_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub currency: String,
    pub email: Option<String>,
    /// Lines as they were when checkout started.
    pub lines: Vec<CartLine>,
    pub coupon_code: Option<String>,
    pub shipping_address: Option<Address>,
    pub billing_address: Option<Address>,
    pub shipping_method: Option<String>,
    /// Applied by the tax engine only while it covers the shipping address.
    #[serde(default)]
    pub tax_exemption: Option<ExemptionCertificate>,
    pub totals: CartTotals,
    /// True when an input changed after `totals` was computed.
    pub totals_stale: bool,
    pub step: CheckoutStep,
    pub reservation_id: Option<Uuid>,
    pub payment_intent_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    /// Structured reason the last transition was refused, if any.
    pub last_error: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckoutSession {
    pub fn is_idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.updated_at <= cutoff
    }
}

impl Versioned for CheckoutSession {
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
