use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountKind {
    /// `value` is a percentage, e.g. 10 for 10% off
    Percentage,
    /// `value` is an amount off the eligible subtotal
    FixedAmount,
}

/// Conditions a cart must meet for a discount to apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Eligibility {
    pub min_subtotal: Option<Decimal>,
    /// When non-empty, only lines in one of these categories count towards
    /// the discount and receive an allocation.
    #[serde(default)]
    pub category_ids: Vec<Uuid>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

/// A coupon (has a code) or an automatic discount (no code).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountRule {
    pub id: Uuid,
    pub name: String,
    pub code: Option<String>,
    pub kind: DiscountKind,
    pub value: Decimal,
    #[serde(default)]
    pub eligibility: Eligibility,
    pub usage_limit: Option<u32>,
    #[serde(default)]
    pub usage_count: u32,
    /// Combinable discounts stack; non-combinable ones compete and only the
    /// strongest survives.
    pub combinable: bool,
    pub created_at: DateTime<Utc>,
}

impl DiscountRule {
    pub fn is_coupon(&self) -> bool {
        self.code.is_some()
    }

    pub fn usage_exhausted(&self) -> bool {
        self.usage_limit
            .map(|limit| self.usage_count >= limit)
            .unwrap_or(false)
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        let started = self.eligibility.starts_at.map_or(true, |s| s <= now);
        let not_ended = self.eligibility.ends_at.map_or(true, |e| now < e);
        started && not_ended
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponRejectionReason {
    NotFound,
    NotYetActive,
    Expired,
    UsageLimitReached,
    MinimumNotMet,
    NoEligibleItems,
    /// A stronger non-combinable discount already applies.
    NotCombinable,
}

/// Typed, user-actionable reason a coupon could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponRejection {
    pub code: String,
    pub reason: CouponRejectionReason,
}

impl CouponRejection {
    pub fn new(code: impl Into<String>, reason: CouponRejectionReason) -> Self {
        Self {
            code: code.into(),
            reason,
        }
    }
}

impl fmt::Display for CouponRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self.reason {
            CouponRejectionReason::NotFound => "is not a valid code",
            CouponRejectionReason::NotYetActive => "is not active yet",
            CouponRejectionReason::Expired => "has expired",
            CouponRejectionReason::UsageLimitReached => "has reached its usage limit",
            CouponRejectionReason::MinimumNotMet => "requires a higher order subtotal",
            CouponRejectionReason::NoEligibleItems => "does not apply to any item in the cart",
            CouponRejectionReason::NotCombinable => {
                "cannot be combined with a better discount already applied"
            }
        };
        write!(f, "coupon '{}' {}", self.code, reason)
    }
}

/// One discount that made it into the calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedDiscount {
    pub discount_id: Uuid,
    pub name: String,
    pub code: Option<String>,
    pub amount: Decimal,
}

/// Share of the cart-level discount carried by one line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineAllocation {
    pub line_id: Uuid,
    pub pre_discount: Decimal,
    pub discount: Decimal,
    pub net: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartDiscountCalculation {
    pub subtotal: Decimal,
    pub total_discount: Decimal,
    pub applied: Vec<AppliedDiscount>,
    pub allocations: Vec<LineAllocation>,
    pub coupon_rejection: Option<CouponRejection>,
}

impl CartDiscountCalculation {
    pub fn discounted_subtotal(&self) -> Decimal {
        self.subtotal - self.total_discount
    }

    pub fn allocation_for(&self, line_id: Uuid) -> Option<&LineAllocation> {
        self.allocations.iter().find(|a| a.line_id == line_id)
    }
}
