use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use super::address::Address;
use super::discount::{AppliedDiscount, CouponRejection, LineAllocation};
use super::reservation::StockKey;
use super::tax::TaxSummary;
use crate::repositories::Versioned;

/// Who a cart belongs to. A guest cart is keyed by the storefront session
/// and can be merged into a customer cart on login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CartOwner {
    Guest { session_id: String },
    Customer { customer_id: Uuid },
}

impl CartOwner {
    pub fn customer_id(&self) -> Option<Uuid> {
        match self {
            CartOwner::Customer { customer_id } => Some(*customer_id),
            CartOwner::Guest { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CartStatus {
    Active,
    CheckingOut,
    Converted,
    /// Superseded by the customer cart it was merged into.
    Merged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartLine {
    pub id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub sku: String,
    pub name: String,
    pub quantity: i64,
    /// Price captured when the line was added.
    pub unit_price: Decimal,
    #[serde(default)]
    pub category_ids: Vec<Uuid>,
    pub tax_class: String,
}

impl CartLine {
    pub fn key(&self) -> StockKey {
        StockKey::new(self.product_id, self.variant_id)
    }

    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Result of the last recalculation. Never edited by hand; produced only by
/// the pricing pipeline from lines, coupon, addresses and shipping method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartTotals {
    pub subtotal: Decimal,
    pub discount_total: Decimal,
    pub shipping_total: Decimal,
    pub tax_total: Decimal,
    pub grand_total: Decimal,
    pub discounts: Vec<AppliedDiscount>,
    pub allocations: Vec<LineAllocation>,
    pub tax: TaxSummary,
    /// Set when the stored coupon no longer applies and was dropped.
    pub coupon_rejection: Option<CouponRejection>,
    pub computed_at: DateTime<Utc>,
}

impl CartTotals {
    pub fn zero(now: DateTime<Utc>) -> Self {
        Self {
            subtotal: Decimal::ZERO,
            discount_total: Decimal::ZERO,
            shipping_total: Decimal::ZERO,
            tax_total: Decimal::ZERO,
            grand_total: Decimal::ZERO,
            discounts: Vec::new(),
            allocations: Vec::new(),
            tax: TaxSummary::empty(),
            coupon_rejection: None,
            computed_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    pub id: Uuid,
    pub owner: CartOwner,
    pub status: CartStatus,
    pub currency: String,
    pub lines: Vec<CartLine>,
    pub coupon_code: Option<String>,
    pub shipping_address: Option<Address>,
    pub billing_address: Option<Address>,
    pub shipping_method: Option<String>,
    pub totals: CartTotals,
    pub merged_into: Option<Uuid>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Cart {
    pub fn line(&self, line_id: Uuid) -> Option<&CartLine> {
        self.lines.iter().find(|l| l.id == line_id)
    }

    pub fn line_for(&self, key: StockKey) -> Option<&CartLine> {
        self.lines.iter().find(|l| l.key() == key)
    }

    pub fn item_count(&self) -> i64 {
        self.lines.iter().map(|l| l.quantity).sum()
    }

    pub fn is_mutable(&self) -> bool {
        self.status == CartStatus::Active
    }
}

impl Versioned for Cart {
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
