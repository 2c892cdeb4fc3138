//! Discount evaluation and allocation.
//!
//! Candidates are the coupon on the cart (if any) plus every automatic
//! discount that is active and eligible. Non-combinable candidates compete:
//! the largest amount wins, then the earliest `created_at`, then the lowest
//! id. Combinable candidates stack on top of the winner in creation order.
//! Each applied discount is spread over its eligible lines in proportion to
//! what those lines still carry, in cents, so allocations always sum to the
//! discount exactly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    clock::SharedClock,
    errors::ServiceError,
    models::{
        cart::CartLine,
        discount::{
            AppliedDiscount, CartDiscountCalculation, CouponRejection, CouponRejectionReason,
            DiscountKind, DiscountRule, LineAllocation,
        },
        money::{allocate_proportionally, from_minor_units, round_money, to_minor_units},
    },
    services::bounded,
};

#[async_trait]
pub trait DiscountLookup: Send + Sync {
    async fn find_coupon(&self, code: &str) -> Result<Option<DiscountRule>, ServiceError>;
    async fn automatic_discounts(&self) -> Result<Vec<DiscountRule>, ServiceError>;
    /// Counts one redemption. Called when an order is placed.
    async fn record_usage(&self, discount_id: Uuid) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
pub struct InMemoryDiscounts {
    rules: DashMap<Uuid, DiscountRule>,
}

impl InMemoryDiscounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, rule: DiscountRule) {
        self.rules.insert(rule.id, rule);
    }

    pub fn get(&self, id: Uuid) -> Option<DiscountRule> {
        self.rules.get(&id).map(|r| r.value().clone())
    }
}

#[async_trait]
impl DiscountLookup for InMemoryDiscounts {
    async fn find_coupon(&self, code: &str) -> Result<Option<DiscountRule>, ServiceError> {
        Ok(self
            .rules
            .iter()
            .find(|r| {
                r.code
                    .as_deref()
                    .map_or(false, |c| c.eq_ignore_ascii_case(code.trim()))
            })
            .map(|r| r.value().clone()))
    }

    async fn automatic_discounts(&self) -> Result<Vec<DiscountRule>, ServiceError> {
        Ok(self
            .rules
            .iter()
            .filter(|r| !r.is_coupon())
            .map(|r| r.value().clone())
            .collect())
    }

    async fn record_usage(&self, discount_id: Uuid) -> Result<(), ServiceError> {
        let mut rule = self
            .rules
            .get_mut(&discount_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Discount {} not found", discount_id)))?;
        rule.usage_count += 1;
        if let Some(limit) = rule.usage_limit {
            if rule.usage_count > limit {
                warn!(
                    discount_id = %discount_id,
                    usage_count = rule.usage_count,
                    limit,
                    "Discount redeemed past its usage limit"
                );
            }
        }
        Ok(())
    }
}

/// Computes `CartDiscountCalculation`s for a set of lines and an optional
/// coupon code.
#[derive(Clone)]
pub struct PricingEngine {
    discounts: Arc<dyn DiscountLookup>,
    clock: SharedClock,
    lookup_timeout: Duration,
}

impl PricingEngine {
    pub fn new(discounts: Arc<dyn DiscountLookup>, clock: SharedClock, lookup_timeout: Duration) -> Self {
        Self {
            discounts,
            clock,
            lookup_timeout,
        }
    }

    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn calculate(
        &self,
        lines: &[CartLine],
        coupon_code: Option<&str>,
    ) -> Result<CartDiscountCalculation, ServiceError> {
        let automatic = bounded(
            self.lookup_timeout,
            "discount lookup",
            self.discounts.automatic_discounts(),
        )
        .await?;

        let coupon = match coupon_code {
            Some(code) => {
                let found = bounded(
                    self.lookup_timeout,
                    "discount lookup",
                    self.discounts.find_coupon(code),
                )
                .await?;
                Some(found.ok_or_else(|| {
                    CouponRejection::new(code, CouponRejectionReason::NotFound)
                }))
            }
            None => None,
        };

        calculate_discounts(lines, coupon, &automatic, self.clock.now())
    }

    pub async fn record_usage(&self, discount_id: Uuid) -> Result<(), ServiceError> {
        bounded(
            self.lookup_timeout,
            "discount lookup",
            self.discounts.record_usage(discount_id),
        )
        .await
    }
}

struct Candidate<'a> {
    rule: &'a DiscountRule,
    eligible: Vec<usize>,
    amount_cents: i64,
}

/// Pure discount calculation. `coupon` is the looked-up coupon, or the
/// rejection already known (e.g. unknown code).
///
/// Fails only when the line totals cannot be summed in cents. Every later
/// sum is bounded by the subtotal.
pub fn calculate_discounts(
    lines: &[CartLine],
    coupon: Option<Result<DiscountRule, CouponRejection>>,
    automatic: &[DiscountRule],
    now: DateTime<Utc>,
) -> Result<CartDiscountCalculation, ServiceError> {
    let out_of_range =
        || ServiceError::ValidationError("Cart total exceeds the supported amount".to_string());
    let line_cents = lines
        .iter()
        .map(|l| {
            l.unit_price
                .checked_mul(Decimal::from(l.quantity))
                .and_then(to_minor_units)
                .filter(|cents| *cents >= 0)
        })
        .collect::<Option<Vec<i64>>>()
        .ok_or_else(out_of_range)?;
    let subtotal_cents = line_cents
        .iter()
        .try_fold(0i64, |sum, cents| sum.checked_add(*cents))
        .ok_or_else(out_of_range)?;

    let mut coupon_rejection = None;
    let mut coupon_rule = None;
    match coupon {
        Some(Ok(rule)) => coupon_rule = Some(rule),
        Some(Err(rejection)) => coupon_rejection = Some(rejection),
        None => {}
    }

    let mut candidates: Vec<Candidate<'_>> = Vec::new();
    let mut coupon_eligible = false;
    if let Some(rule) = coupon_rule.as_ref() {
        match evaluate(rule, lines, &line_cents, subtotal_cents, now) {
            Ok(candidate) => {
                coupon_eligible = true;
                candidates.push(candidate)
            }
            Err(reason) => {
                coupon_rejection = Some(CouponRejection::new(
                    rule.code.clone().unwrap_or_default(),
                    reason,
                ))
            }
        }
    }
    for rule in automatic.iter().filter(|r| !r.is_coupon()) {
        match evaluate(rule, lines, &line_cents, subtotal_cents, now) {
            Ok(candidate) => candidates.push(candidate),
            Err(reason) => debug!(discount = %rule.name, ?reason, "Automatic discount skipped"),
        }
    }

    let (mut combinable, exclusive): (Vec<_>, Vec<_>) =
        candidates.into_iter().partition(|c| c.rule.combinable);

    let winner = exclusive.into_iter().min_by(|a, b| rank(a, b));
    if let (Some(rule), Some(winner)) = (coupon_rule.as_ref(), winner.as_ref()) {
        if coupon_eligible && !rule.combinable && winner.rule.id != rule.id {
            coupon_rejection = Some(CouponRejection::new(
                rule.code.clone().unwrap_or_default(),
                CouponRejectionReason::NotCombinable,
            ));
        }
    }

    combinable.sort_by(|a, b| {
        a.rule
            .created_at
            .cmp(&b.rule.created_at)
            .then_with(|| a.rule.id.cmp(&b.rule.id))
    });

    let mut remaining = line_cents.clone();
    let mut discount_cents = vec![0i64; lines.len()];
    let mut applied = Vec::new();

    for candidate in winner.into_iter().chain(combinable) {
        let weights: Vec<i64> = candidate.eligible.iter().map(|&i| remaining[i]).collect();
        let room: i64 = weights.iter().sum();
        let amount = candidate.amount_cents.min(room);
        if amount <= 0 {
            continue;
        }

        let shares = allocate_proportionally(amount, &weights);
        for (&idx, share) in candidate.eligible.iter().zip(shares) {
            remaining[idx] -= share;
            discount_cents[idx] += share;
        }
        applied.push(AppliedDiscount {
            discount_id: candidate.rule.id,
            name: candidate.rule.name.clone(),
            code: candidate.rule.code.clone(),
            amount: from_minor_units(amount),
        });
    }

    let allocations = lines
        .iter()
        .enumerate()
        .map(|(idx, line)| LineAllocation {
            line_id: line.id,
            pre_discount: from_minor_units(line_cents[idx]),
            discount: from_minor_units(discount_cents[idx]),
            net: from_minor_units(remaining[idx]),
        })
        .collect();

    Ok(CartDiscountCalculation {
        subtotal: from_minor_units(subtotal_cents),
        total_discount: from_minor_units(discount_cents.iter().sum()),
        applied,
        allocations,
        coupon_rejection,
    })
}

/// Larger amount first, then older, then lower id.
fn rank(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    b.amount_cents
        .cmp(&a.amount_cents)
        .then_with(|| a.rule.created_at.cmp(&b.rule.created_at))
        .then_with(|| a.rule.id.cmp(&b.rule.id))
}

fn evaluate<'a>(
    rule: &'a DiscountRule,
    lines: &[CartLine],
    line_cents: &[i64],
    subtotal_cents: i64,
    now: DateTime<Utc>,
) -> Result<Candidate<'a>, CouponRejectionReason> {
    let eligibility = &rule.eligibility;
    if eligibility.starts_at.map_or(false, |s| now < s) {
        return Err(CouponRejectionReason::NotYetActive);
    }
    if eligibility.ends_at.map_or(false, |e| now >= e) {
        return Err(CouponRejectionReason::Expired);
    }
    if rule.usage_exhausted() {
        return Err(CouponRejectionReason::UsageLimitReached);
    }
    if let Some(min) = eligibility.min_subtotal {
        if from_minor_units(subtotal_cents) < min {
            return Err(CouponRejectionReason::MinimumNotMet);
        }
    }

    let eligible: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(idx, line)| {
            line_cents[*idx] > 0
                && (eligibility.category_ids.is_empty()
                    || line
                        .category_ids
                        .iter()
                        .any(|c| eligibility.category_ids.contains(c)))
        })
        .map(|(idx, _)| idx)
        .collect();
    if eligible.is_empty() {
        return Err(CouponRejectionReason::NoEligibleItems);
    }

    let base: i64 = eligible.iter().map(|&i| line_cents[i]).sum();
    let amount = match rule.kind {
        DiscountKind::Percentage => {
            let pct = rule.value.max(Decimal::ZERO).min(Decimal::ONE_HUNDRED);
            to_minor_units(round_money(from_minor_units(base) * pct / Decimal::ONE_HUNDRED))
        }
        DiscountKind::FixedAmount => to_minor_units(rule.value.max(Decimal::ZERO)),
    }
    // capped at the eligible base below
    .unwrap_or(i64::MAX);

    Ok(Candidate {
        rule,
        eligible,
        amount_cents: amount.min(base),
    })
}
