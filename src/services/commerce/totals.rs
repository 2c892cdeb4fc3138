use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use super::{
    pricing_service::PricingEngine, shipping_service::ShippingRateLookup, tax_service::TaxEngine,
};
use crate::{
    clock::SharedClock,
    errors::ServiceError,
    models::{
        address::Address,
        cart::{CartLine, CartTotals},
        discount::CouponRejection,
        money::round_money,
        shipping::ShippingRate,
        tax::{ExemptionCertificate, TaxSummary, TaxableLine},
    },
    services::bounded,
};

/// Inputs that fully determine a set of totals.
#[derive(Debug, Clone, Copy)]
pub struct TotalsInput<'a> {
    pub lines: &'a [CartLine],
    pub coupon_code: Option<&'a str>,
    pub shipping_address: Option<&'a Address>,
    pub shipping_method: Option<&'a str>,
    pub exemption: Option<&'a ExemptionCertificate>,
}

/// Pricing, then shipping, then tax. Cart and checkout totals both come from
/// here and from nowhere else.
#[derive(Clone)]
pub struct TotalsCalculator {
    pricing: PricingEngine,
    tax: TaxEngine,
    shipping: Arc<dyn ShippingRateLookup>,
    clock: SharedClock,
    lookup_timeout: Duration,
}

impl TotalsCalculator {
    pub fn new(
        pricing: PricingEngine,
        tax: TaxEngine,
        shipping: Arc<dyn ShippingRateLookup>,
        clock: SharedClock,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            pricing,
            tax,
            shipping,
            clock,
            lookup_timeout,
        }
    }

    pub fn pricing(&self) -> &PricingEngine {
        &self.pricing
    }

    /// Rates offered for `address` at the given merchandise value.
    pub async fn shipping_rates(
        &self,
        address: &Address,
        subtotal: Decimal,
    ) -> Result<Vec<ShippingRate>, ServiceError> {
        bounded(
            self.lookup_timeout,
            "shipping rate lookup",
            self.shipping.rates(address, subtotal),
        )
        .await
    }

    /// The priced method, or `None` if it does not serve the address.
    pub async fn quote_shipping(
        &self,
        address: &Address,
        method: &str,
        subtotal: Decimal,
    ) -> Result<Option<ShippingRate>, ServiceError> {
        Ok(self
            .shipping_rates(address, subtotal)
            .await?
            .into_iter()
            .find(|r| r.method_code == method))
    }

    /// Returns the totals and, when the coupon did not apply, why.
    #[instrument(skip(self, input), fields(lines = input.lines.len()))]
    pub async fn compute(
        &self,
        input: TotalsInput<'_>,
    ) -> Result<(CartTotals, Option<CouponRejection>), ServiceError> {
        let now = self.clock.now();
        if input.lines.is_empty() {
            return Ok((CartTotals::zero(now), None));
        }

        let discounts = self.pricing.calculate(input.lines, input.coupon_code).await?;
        let merchandise = discounts.discounted_subtotal();

        let shipping_total = match (input.shipping_address, input.shipping_method) {
            (Some(address), Some(method)) => self
                .quote_shipping(address, method, merchandise)
                .await?
                .map(|rate| rate.amount)
                .unwrap_or(Decimal::ZERO),
            _ => Decimal::ZERO,
        };

        let tax = match input.shipping_address {
            Some(address) => {
                let taxable: Vec<TaxableLine> = input
                    .lines
                    .iter()
                    .map(|line| TaxableLine {
                        line_id: line.id,
                        amount: discounts
                            .allocation_for(line.id)
                            .map(|a| a.net)
                            .unwrap_or_else(|| round_money(line.line_total())),
                        tax_class: line.tax_class.clone(),
                    })
                    .collect();
                self.tax
                    .calculate(address, &taxable, shipping_total, input.exemption)
                    .await?
            }
            None => TaxSummary::empty(),
        };

        let totals = CartTotals {
            subtotal: discounts.subtotal,
            discount_total: discounts.total_discount,
            shipping_total,
            tax_total: tax.total_tax,
            grand_total: merchandise + shipping_total + tax.total_tax,
            discounts: discounts.applied.clone(),
            allocations: discounts.allocations.clone(),
            tax,
            coupon_rejection: discounts.coupon_rejection.clone(),
            computed_at: now,
        };
        Ok((totals, discounts.coupon_rejection))
    }
}
