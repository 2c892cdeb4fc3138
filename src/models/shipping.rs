use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A shipping method offered for a set of destination countries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingMethod {
    pub code: String,
    pub name: String,
    /// ISO country codes this method ships to. Empty means everywhere.
    #[serde(default)]
    pub country_codes: Vec<String>,
    pub flat_rate: Decimal,
    /// Subtotal at or above which the method is free.
    pub free_over: Option<Decimal>,
    pub estimated_days: Option<u32>,
}

impl ShippingMethod {
    pub fn serves(&self, country_code: &str) -> bool {
        self.country_codes.is_empty()
            || self
                .country_codes
                .iter()
                .any(|c| c.eq_ignore_ascii_case(country_code))
    }
}

/// Priced shipping option for a concrete address and subtotal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingRate {
    pub method_code: String,
    pub name: String,
    pub amount: Decimal,
    pub estimated_days: Option<u32>,
}
