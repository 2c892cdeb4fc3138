use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub const TAX_CLASS_STANDARD: &str = "standard";
pub const TAX_CLASS_EXEMPT: &str = "exempt";
pub const TAX_CLASS_SHIPPING: &str = "shipping";

/// How narrowly a zone matches an address. Higher is more specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneLevel {
    Country,
    Region,
    City,
    Postal,
}

/// A tax jurisdiction and its rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxZone {
    pub id: Uuid,
    pub name: String,
    pub country_code: String,
    pub region: Option<String>,
    pub city: Option<String>,
    pub postal_prefix: Option<String>,
    /// Tie-break between equally specific zones; higher wins.
    #[serde(default)]
    pub priority: i32,
    /// Compound zones stack on top of the base jurisdiction and are reported
    /// separately (e.g. a city tax on top of state tax).
    #[serde(default)]
    pub compound: bool,
    /// Rate per tax class as a fraction, e.g. 0.0725.
    pub rates: HashMap<String, Decimal>,
    #[serde(default)]
    pub shipping_taxable: bool,
}

impl TaxZone {
    pub fn level(&self) -> ZoneLevel {
        if self.postal_prefix.is_some() {
            ZoneLevel::Postal
        } else if self.city.is_some() {
            ZoneLevel::City
        } else if self.region.is_some() {
            ZoneLevel::Region
        } else {
            ZoneLevel::Country
        }
    }

    pub fn rate_for(&self, tax_class: &str) -> Option<Decimal> {
        self.rates.get(tax_class).copied()
    }
}

/// A line submitted for taxation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxableLine {
    pub line_id: Uuid,
    /// Net amount after discounts.
    pub amount: Decimal,
    pub tax_class: String,
}

/// Customer exemption certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExemptionCertificate {
    pub certificate_id: String,
    pub country_code: String,
    pub region: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JurisdictionTax {
    pub zone_id: Uuid,
    pub name: String,
    pub rate: Decimal,
    pub amount: Decimal,
}

/// Tax for one line (or for shipping, with `line_id == None`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineTax {
    pub line_id: Option<Uuid>,
    pub taxable_amount: Decimal,
    pub tax_class: String,
    pub is_exempt: bool,
    pub jurisdictions: Vec<JurisdictionTax>,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JurisdictionSummary {
    pub zone_id: Uuid,
    pub name: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxSummary {
    pub lines: Vec<LineTax>,
    pub jurisdictions: Vec<JurisdictionSummary>,
    pub total_tax: Decimal,
}

impl TaxSummary {
    pub fn empty() -> Self {
        Self {
            lines: Vec::new(),
            jurisdictions: Vec::new(),
            total_tax: Decimal::ZERO,
        }
    }
}
