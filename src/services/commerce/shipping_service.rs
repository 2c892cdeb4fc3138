use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::{
    errors::ServiceError,
    models::{
        address::Address,
        money::round_money,
        shipping::{ShippingMethod, ShippingRate},
    },
};

/// Pure lookup from destination and order value to the available rates.
#[async_trait]
pub trait ShippingRateLookup: Send + Sync {
    async fn rates(
        &self,
        address: &Address,
        subtotal: Decimal,
    ) -> Result<Vec<ShippingRate>, ServiceError>;
}

/// Fixed rate table: each method has a flat price per destination country and
/// an optional free-shipping threshold.
#[derive(Debug, Clone, Default)]
pub struct TableShippingRates {
    methods: Vec<ShippingMethod>,
}

impl TableShippingRates {
    pub fn new(methods: Vec<ShippingMethod>) -> Self {
        Self { methods }
    }
}

#[async_trait]
impl ShippingRateLookup for TableShippingRates {
    async fn rates(
        &self,
        address: &Address,
        subtotal: Decimal,
    ) -> Result<Vec<ShippingRate>, ServiceError> {
        Ok(self
            .methods
            .iter()
            .filter(|m| m.serves(&address.country_code))
            .map(|m| {
                let free = m.free_over.map_or(false, |threshold| subtotal >= threshold);
                ShippingRate {
                    method_code: m.code.clone(),
                    name: m.name.clone(),
                    amount: if free {
                        Decimal::ZERO
                    } else {
                        round_money(m.flat_rate)
                    },
                    estimated_days: m.estimated_days,
                }
            })
            .collect())
    }
}
