use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    clock::SharedClock,
    errors::ServiceError,
    models::{
        address::Address,
        money::round_money,
        tax::{
            ExemptionCertificate, JurisdictionSummary, JurisdictionTax, LineTax, TaxSummary,
            TaxZone, TaxableLine, TAX_CLASS_EXEMPT, TAX_CLASS_SHIPPING, TAX_CLASS_STANDARD,
        },
    },
    services::bounded,
};

/// Source of tax zones and rates.
#[async_trait]
pub trait TaxRateLookup: Send + Sync {
    async fn zones(&self, country_code: &str) -> Result<Vec<TaxZone>, ServiceError>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticTaxRates {
    zones: Vec<TaxZone>,
}

impl StaticTaxRates {
    pub fn new(zones: Vec<TaxZone>) -> Self {
        Self { zones }
    }
}

#[async_trait]
impl TaxRateLookup for StaticTaxRates {
    async fn zones(&self, country_code: &str) -> Result<Vec<TaxZone>, ServiceError> {
        Ok(self
            .zones
            .iter()
            .filter(|z| z.country_code.eq_ignore_ascii_case(country_code))
            .cloned()
            .collect())
    }
}

#[derive(Clone)]
pub struct TaxEngine {
    rates: Arc<dyn TaxRateLookup>,
    clock: SharedClock,
    lookup_timeout: Duration,
}

impl TaxEngine {
    pub fn new(rates: Arc<dyn TaxRateLookup>, clock: SharedClock, lookup_timeout: Duration) -> Self {
        Self {
            rates,
            clock,
            lookup_timeout,
        }
    }

    #[instrument(skip(self, address, lines), fields(country = %address.country_code))]
    pub async fn calculate(
        &self,
        address: &Address,
        lines: &[TaxableLine],
        shipping_amount: Decimal,
        exemption: Option<&ExemptionCertificate>,
    ) -> Result<TaxSummary, ServiceError> {
        let zones = bounded(
            self.lookup_timeout,
            "tax rate lookup",
            self.rates.zones(&address.country_code),
        )
        .await?;
        Ok(compute_tax(
            &zones,
            address,
            lines,
            shipping_amount,
            exemption,
            self.clock.now(),
        ))
    }
}

/// Zones that apply to `address`: the most specific non-compound zone, then
/// every matching compound zone from broadest to narrowest.
pub fn resolve_jurisdictions<'a>(zones: &'a [TaxZone], address: &Address) -> Vec<&'a TaxZone> {
    let matching: Vec<&TaxZone> = zones.iter().filter(|z| zone_matches(z, address)).collect();

    let base = matching
        .iter()
        .filter(|z| !z.compound)
        .max_by(|a, b| {
            a.level()
                .cmp(&b.level())
                .then_with(|| a.priority.cmp(&b.priority))
                .then_with(|| b.id.cmp(&a.id))
        })
        .copied();

    let mut stacked: Vec<&TaxZone> = matching.into_iter().filter(|z| z.compound).collect();
    stacked.sort_by(|a, b| {
        a.level()
            .cmp(&b.level())
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| a.id.cmp(&b.id))
    });

    base.into_iter().chain(stacked).collect()
}

fn zone_matches(zone: &TaxZone, address: &Address) -> bool {
    address.matches_country(&zone.country_code)
        && zone.region.as_deref().map_or(true, |r| address.matches_region(r))
        && zone.city.as_deref().map_or(true, |c| address.matches_city(c))
        && zone.postal_prefix.as_deref().map_or(true, |p| {
            address
                .postal_code
                .trim()
                .to_ascii_uppercase()
                .starts_with(&p.trim().to_ascii_uppercase())
        })
}

fn certificate_covers(
    certificate: &ExemptionCertificate,
    address: &Address,
    now: DateTime<Utc>,
) -> bool {
    address.matches_country(&certificate.country_code)
        && certificate
            .region
            .as_deref()
            .map_or(true, |r| address.matches_region(r))
        && certificate.expires_at.map_or(true, |e| now < e)
}

/// Per-line, per-jurisdiction tax. Each jurisdiction amount is rounded to the
/// cent on its own line, and every total is a sum of those rounded amounts.
pub fn compute_tax(
    zones: &[TaxZone],
    address: &Address,
    lines: &[TaxableLine],
    shipping_amount: Decimal,
    exemption: Option<&ExemptionCertificate>,
    now: DateTime<Utc>,
) -> TaxSummary {
    let jurisdictions = resolve_jurisdictions(zones, address);
    let exempt_customer = exemption.map_or(false, |c| certificate_covers(c, address, now));

    let mut out = Vec::with_capacity(lines.len() + 1);
    for line in lines {
        let exempt = exempt_customer || line.tax_class == TAX_CLASS_EXEMPT;
        out.push(tax_line(
            Some(line.line_id),
            line.amount,
            &line.tax_class,
            exempt,
            &jurisdictions,
            |zone, class| zone.rate_for(class).or_else(|| zone.rate_for(TAX_CLASS_STANDARD)),
        ));
    }

    if shipping_amount > Decimal::ZERO {
        out.push(tax_line(
            None,
            shipping_amount,
            TAX_CLASS_SHIPPING,
            exempt_customer,
            &jurisdictions,
            |zone, class| {
                if zone.shipping_taxable {
                    zone.rate_for(class).or_else(|| zone.rate_for(TAX_CLASS_STANDARD))
                } else {
                    None
                }
            },
        ));
    }

    let mut by_zone: BTreeMap<Uuid, (String, Decimal, usize)> = BTreeMap::new();
    for (order, zone) in jurisdictions.iter().enumerate() {
        by_zone.insert(zone.id, (zone.name.clone(), Decimal::ZERO, order));
    }
    for line in &out {
        for j in &line.jurisdictions {
            if let Some(entry) = by_zone.get_mut(&j.zone_id) {
                entry.1 += j.amount;
            }
        }
    }
    let mut summaries: Vec<(usize, JurisdictionSummary)> = by_zone
        .into_iter()
        .map(|(zone_id, (name, amount, order))| {
            (
                order,
                JurisdictionSummary {
                    zone_id,
                    name,
                    amount,
                },
            )
        })
        .collect();
    summaries.sort_by_key(|(order, _)| *order);

    let total_tax = out.iter().map(|l| l.amount).sum();
    TaxSummary {
        lines: out,
        jurisdictions: summaries.into_iter().map(|(_, s)| s).collect(),
        total_tax,
    }
}

fn tax_line<F>(
    line_id: Option<Uuid>,
    taxable_amount: Decimal,
    tax_class: &str,
    exempt: bool,
    jurisdictions: &[&TaxZone],
    rate_for: F,
) -> LineTax
where
    F: Fn(&TaxZone, &str) -> Option<Decimal>,
{
    let entries: Vec<JurisdictionTax> = if exempt {
        Vec::new()
    } else {
        jurisdictions
            .iter()
            .filter_map(|zone| {
                rate_for(*zone, tax_class).map(|rate| JurisdictionTax {
                    zone_id: zone.id,
                    name: zone.name.clone(),
                    rate,
                    amount: round_money(taxable_amount * rate),
                })
            })
            .collect()
    };

    LineTax {
        line_id,
        taxable_amount,
        tax_class: tax_class.to_string(),
        is_exempt: exempt,
        amount: entries.iter().map(|e| e.amount).sum(),
        jurisdictions: entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::address::sample_address;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn zone(name: &str, region: Option<&str>, city: Option<&str>, rate: Decimal, compound: bool) -> TaxZone {
        TaxZone {
            id: Uuid::new_v4(),
            name: name.into(),
            country_code: "US".into(),
            region: region.map(str::to_string),
            city: city.map(str::to_string),
            postal_prefix: None,
            priority: 0,
            compound,
            rates: HashMap::from([(TAX_CLASS_STANDARD.to_string(), rate)]),
            shipping_taxable: false,
        }
    }

    fn taxable(amount: Decimal) -> TaxableLine {
        TaxableLine {
            line_id: Uuid::new_v4(),
            amount,
            tax_class: TAX_CLASS_STANDARD.into(),
        }
    }

    #[test]
    fn more_specific_zone_wins_and_compound_stacks() {
        let country = zone("US", None, None, dec!(0.01), false);
        let state = zone("California", Some("CA"), None, dec!(0.0725), false);
        let city = zone("San Francisco", Some("CA"), Some("San Francisco"), dec!(0.0125), true);
        let zones = vec![country, state.clone(), city.clone()];

        let resolved = resolve_jurisdictions(&zones, &sample_address());
        let ids: Vec<Uuid> = resolved.iter().map(|z| z.id).collect();
        assert_eq!(ids, vec![state.id, city.id]);

        let summary = compute_tax(
            &zones,
            &sample_address(),
            &[taxable(dec!(90.00))],
            Decimal::ZERO,
            None,
            Utc::now(),
        );
        assert_eq!(summary.jurisdictions.len(), 2);
        assert_eq!(summary.jurisdictions[0].amount, dec!(6.53));
        assert_eq!(summary.jurisdictions[1].amount, dec!(1.13));
        assert_eq!(summary.total_tax, dec!(7.66));
    }

    #[test]
    fn per_line_rounding_sums_to_total() {
        let zones = vec![zone("CA", Some("CA"), None, dec!(0.0725), false)];
        let lines: Vec<TaxableLine> = [dec!(0.07), dec!(0.07), dec!(0.07)]
            .into_iter()
            .map(taxable)
            .collect();
        let summary = compute_tax(&zones, &sample_address(), &lines, Decimal::ZERO, None, Utc::now());

        let line_sum: Decimal = summary.lines.iter().map(|l| l.amount).sum();
        assert_eq!(line_sum, summary.total_tax);
        assert_eq!(summary.total_tax, dec!(0.03));
    }

    #[test]
    fn exempt_lines_stay_in_breakdown() {
        let zones = vec![zone("CA", Some("CA"), None, dec!(0.10), false)];
        let mut exempt = taxable(dec!(40.00));
        exempt.tax_class = TAX_CLASS_EXEMPT.into();
        let summary = compute_tax(
            &zones,
            &sample_address(),
            &[taxable(dec!(10.00)), exempt.clone()],
            Decimal::ZERO,
            None,
            Utc::now(),
        );

        assert_eq!(summary.lines.len(), 2);
        let exempt_line = &summary.lines[1];
        assert!(exempt_line.is_exempt);
        assert_eq!(exempt_line.amount, Decimal::ZERO);
        assert_eq!(summary.total_tax, dec!(1.00));
    }

    #[test]
    fn valid_certificate_exempts_everything() {
        let zones = vec![zone("CA", Some("CA"), None, dec!(0.10), false)];
        let certificate = ExemptionCertificate {
            certificate_id: "EX-1".into(),
            country_code: "US".into(),
            region: Some("CA".into()),
            expires_at: Some(Utc::now() + ChronoDuration::days(30)),
        };
        let summary = compute_tax(
            &zones,
            &sample_address(),
            &[taxable(dec!(10.00))],
            dec!(5.00),
            Some(&certificate),
            Utc::now(),
        );
        assert_eq!(summary.total_tax, Decimal::ZERO);
        assert!(summary.lines.iter().all(|l| l.is_exempt));

        let mut expired = certificate;
        expired.expires_at = Some(Utc::now() - ChronoDuration::days(1));
        let summary = compute_tax(
            &zones,
            &sample_address(),
            &[taxable(dec!(10.00))],
            Decimal::ZERO,
            Some(&expired),
            Utc::now(),
        );
        assert_eq!(summary.total_tax, dec!(1.00));
    }

    #[test]
    fn shipping_taxed_only_where_configured() {
        let mut state = zone("CA", Some("CA"), None, dec!(0.10), false);
        let summary = compute_tax(
            &[state.clone()],
            &sample_address(),
            &[],
            dec!(10.00),
            None,
            Utc::now(),
        );
        assert_eq!(summary.total_tax, Decimal::ZERO);

        state.shipping_taxable = true;
        let summary = compute_tax(&[state], &sample_address(), &[], dec!(10.00), None, Utc::now());
        assert_eq!(summary.total_tax, dec!(1.00));
        assert_eq!(summary.lines[0].line_id, None);
    }
}
