use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::reservation::StockKey;
use super::tax::TAX_CLASS_STANDARD;

/// Read-only view of a sellable product as the catalog reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub sku: String,
    pub name: String,
    pub unit_price: Decimal,
    #[serde(default)]
    pub category_ids: Vec<Uuid>,
    #[serde(default = "default_tax_class")]
    pub tax_class: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_tax_class() -> String {
    TAX_CLASS_STANDARD.to_string()
}

fn default_true() -> bool {
    true
}

impl ProductSnapshot {
    pub fn key(&self) -> StockKey {
        StockKey::new(self.product_id, self.variant_id)
    }
}
