//! Money helpers.
//!
//! Amounts are carried as `Decimal` in major units. Anything that must sum
//! exactly (allocations, per-line tax) is computed in minor units (cents).

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// Digits after the decimal point for the smallest currency unit.
pub const CURRENCY_SCALE: u32 = 2;

/// Rounds to the smallest currency unit, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(CURRENCY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Whole cents, or `None` when the amount does not fit in an `i64`.
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    round_money(amount)
        .checked_mul(Decimal::ONE_HUNDRED)?
        .trunc()
        .to_i64()
}

pub fn from_minor_units(cents: i64) -> Decimal {
    Decimal::new(cents, CURRENCY_SCALE)
}

/// Splits `total` cents across `weights` proportionally. The result always
/// sums to `total`; the rounding remainder goes to the largest weight (first
/// one on ties).
pub fn allocate_proportionally(total: i64, weights: &[i64]) -> Vec<i64> {
    let mut shares = vec![0i64; weights.len()];
    let weight_sum: i128 = weights.iter().map(|w| i128::from((*w).max(0))).sum();
    if weights.is_empty() || weight_sum == 0 || total == 0 {
        return shares;
    }

    let mut allocated: i64 = 0;
    for (share, weight) in shares.iter_mut().zip(weights) {
        let exact = i128::from(total) * i128::from((*weight).max(0)) / weight_sum;
        *share = exact as i64;
        allocated += *share;
    }

    let largest = weights
        .iter()
        .enumerate()
        .fold(0usize, |best, (idx, w)| {
            if *w > weights[best] {
                idx
            } else {
                best
            }
        });
    shares[largest] += total - allocated;
    shares
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(round_money(dec!(1.005)), dec!(1.01));
        assert_eq!(round_money(dec!(1.004)), dec!(1.00));
    }

    #[test]
    fn minor_unit_conversion() {
        assert_eq!(to_minor_units(dec!(19.99)), Some(1999));
        assert_eq!(from_minor_units(1999), dec!(19.99));
    }

    #[test]
    fn amounts_beyond_i64_cents_are_not_representable() {
        assert_eq!(to_minor_units(dec!(92233720368547758.07)), Some(i64::MAX));
        assert_eq!(to_minor_units(dec!(92233720368547758.08)), None);
        assert_eq!(to_minor_units(Decimal::MAX), None);
        assert_eq!(to_minor_units(-dec!(1_000_000_000_000_000_000)), None);
    }

    #[test]
    fn remainder_lands_on_largest_line() {
        // 1000 split over three equal lines leaves 1 cent over.
        let shares = allocate_proportionally(1000, &[3000, 3000, 3000]);
        assert_eq!(shares, vec![334, 333, 333]);

        let shares = allocate_proportionally(1000, &[1000, 5000, 3000]);
        assert_eq!(shares.iter().sum::<i64>(), 1000);
        assert_eq!(shares[0], 111);
        assert_eq!(shares[2], 333);
        assert_eq!(shares[1], 556);
    }

    #[test]
    fn zero_weights_allocate_nothing() {
        assert_eq!(allocate_proportionally(500, &[0, 0]), vec![0, 0]);
        assert!(allocate_proportionally(500, &[]).is_empty());
    }
}
