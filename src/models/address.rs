use serde::{Deserialize, Serialize};
use validator::Validate;

/// Postal address. Orders keep their own copy; later edits to a cart or
/// customer address never reach a placed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Address {
    #[validate(length(min = 1, max = 100))]
    pub first_name: String,
    #[validate(length(min = 1, max = 100))]
    pub last_name: String,
    pub company: Option<String>,
    #[validate(length(min = 1, max = 255))]
    pub line1: String,
    pub line2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    /// State / province code, e.g. "CA"
    pub region: Option<String>,
    #[validate(length(min = 1, max = 20))]
    pub postal_code: String,
    /// ISO 3166-1 alpha-2
    #[validate(length(equal = 2))]
    pub country_code: String,
    pub phone: Option<String>,
}

impl Address {
    pub fn matches_country(&self, country: &str) -> bool {
        self.country_code.eq_ignore_ascii_case(country)
    }

    pub fn matches_region(&self, region: &str) -> bool {
        self.region
            .as_deref()
            .map(|r| r.eq_ignore_ascii_case(region))
            .unwrap_or(false)
    }

    pub fn matches_city(&self, city: &str) -> bool {
        self.city.trim().eq_ignore_ascii_case(city.trim())
    }
}

#[cfg(test)]
pub(crate) fn sample_address() -> Address {
    Address {
        first_name: "Ada".into(),
        last_name: "Lovelace".into(),
        company: None,
        line1: "1 Market St".into(),
        line2: None,
        city: "San Francisco".into(),
        region: Some("CA".into()),
        postal_code: "94105".into(),
        country_code: "US".into(),
        phone: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_country_code_length() {
        let mut address = sample_address();
        assert!(address.validate().is_ok());
        address.country_code = "USA".into();
        assert!(address.validate().is_err());
    }

    #[test]
    fn region_match_is_case_insensitive() {
        let address = sample_address();
        assert!(address.matches_region("ca"));
        assert!(!address.matches_region("NY"));
        assert!(address.matches_city(" san francisco "));
    }
}
