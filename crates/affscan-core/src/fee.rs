//! Fee-rate validation.
//!
//! `actual_fee_bps = round(fee_in_input_terms / input_amount × 10_000)`,
//! rounded half away from zero. A rate that cannot be computed without
//! guessing a conversion is left unset and flagged, never defaulted to zero.

use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::types::CanonicalTransaction;

/// Converts an amount of one asset into another asset's native units.
pub trait FeeConversion: Send + Sync {
    fn convert(&self, from_asset: &str, to_asset: &str, amount: Decimal, at_time: i64)
        -> Option<Decimal>;
}

/// Annotates records with their actual fee rate and mismatch flags.
#[derive(Clone, Default)]
pub struct FeeValidator {
    tolerance_bps: i64,
    conversion: Option<Arc<dyn FeeConversion>>,
}

impl FeeValidator {
    pub fn new(tolerance_bps: i64) -> Self {
        Self {
            tolerance_bps: tolerance_bps.max(0),
            conversion: None,
        }
    }

    pub fn with_conversion(mut self, conversion: Arc<dyn FeeConversion>) -> Self {
        self.conversion = Some(conversion);
        self
    }

    pub fn tolerance_bps(&self) -> i64 {
        self.tolerance_bps
    }

    /// Pure annotation: computes `actual_fee_bps` and sets the fee flags.
    pub fn validate(&self, mut tx: CanonicalTransaction) -> CanonicalTransaction {
        tx.actual_fee_bps = self.actual_bps(&tx);
        tx.flags.fee_rate_unverifiable = tx.actual_fee_bps.is_none();
        tx.flags.fee_rate_mismatch = match tx.actual_fee_bps {
            Some(actual) => (actual - tx.expected_fee_bps).abs() > self.tolerance_bps,
            None => false,
        };
        tx
    }

    fn actual_bps(&self, tx: &CanonicalTransaction) -> Option<i64> {
        if tx.flags.affiliate_address_unresolved || tx.input_amount <= Decimal::ZERO {
            return None;
        }
        if tx.fee_amount.is_zero() {
            return Some(0);
        }
        let fee_asset = tx.fee_asset.as_deref()?;
        let fee_in_input = if fee_asset.eq_ignore_ascii_case(&tx.input_asset) {
            tx.fee_amount
        } else {
            // Cross-asset math on smallest units would compare different scales.
            if tx.flags.input_or_fee_unscaled() {
                return None;
            }
            self.conversion.as_ref()?.convert(
                fee_asset,
                &tx.input_asset,
                tx.fee_amount,
                tx.block_time,
            )?
        };
        bps(fee_in_input, tx.input_amount)
    }
}

/// `round(part / whole × 10_000)`, half away from zero.
pub fn bps(part: Decimal, whole: Decimal) -> Option<i64> {
    if whole.is_zero() {
        return None;
    }
    let ratio = part.checked_mul(Decimal::from(10_000))?.checked_div(whole)?;
    ratio
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_transaction;
    use crate::types::UnscaledAmounts;
    use std::str::FromStr;

    fn tx(input: &str, fee: &str, fee_asset: Option<&str>) -> CanonicalTransaction {
        let mut tx = sample_transaction("portals", "ethereum", "0xaa", 0, 1);
        tx.input_asset = "0xA".into();
        tx.input_amount = Decimal::from_str(input).unwrap();
        tx.fee_amount = Decimal::from_str(fee).unwrap();
        tx.fee_asset = fee_asset.map(str::to_string);
        tx.expected_fee_bps = 55;
        tx
    }

    struct FixedRate(Decimal);

    impl FeeConversion for FixedRate {
        fn convert(&self, _from: &str, _to: &str, amount: Decimal, _at: i64) -> Option<Decimal> {
            Some(amount * self.0)
        }
    }

    #[test]
    fn smallest_units_fee_rate() {
        let out = FeeValidator::new(1).validate(tx("100000", "550", Some("0xA")));
        assert_eq!(out.actual_fee_bps, Some(55));
        assert!(!out.flags.fee_rate_mismatch);
        assert!(!out.flags.fee_rate_unverifiable);
    }

    #[test]
    fn native_units_fee_rate() {
        let out = FeeValidator::new(0).validate(tx("1000", "5.5", Some("0xa")));
        assert_eq!(out.actual_fee_bps, Some(55));
    }

    #[test]
    fn zero_fee_is_a_mismatch_not_unverifiable() {
        let out = FeeValidator::new(2).validate(tx("1000", "0", None));
        assert_eq!(out.actual_fee_bps, Some(0));
        assert!(out.flags.fee_rate_mismatch);
        assert!(!out.flags.fee_rate_unverifiable);
    }

    #[test]
    fn different_asset_without_conversion_is_unverifiable() {
        let out = FeeValidator::new(2).validate(tx("1000", "5.5", Some("0xB")));
        assert_eq!(out.actual_fee_bps, None);
        assert!(out.flags.fee_rate_unverifiable);
        assert!(!out.flags.fee_rate_mismatch);
    }

    #[test]
    fn different_asset_with_conversion() {
        let v = FeeValidator::new(0)
            .with_conversion(Arc::new(FixedRate(Decimal::from_str("0.5").unwrap())));
        // 11 B = 5.5 A → 55 bps of 1000 A.
        let out = v.validate(tx("1000", "11", Some("0xB")));
        assert_eq!(out.actual_fee_bps, Some(55));
    }

    #[test]
    fn conversion_needs_input_and_fee_precision() {
        let v = FeeValidator::new(0)
            .with_conversion(Arc::new(FixedRate(Decimal::from_str("0.5").unwrap())));

        // Only the output asset is in smallest units; the rate is still computable.
        let mut t = tx("1000", "11", Some("0xB"));
        t.flags.unknown_precision = true;
        t.flags.unscaled = UnscaledAmounts { output: true, ..Default::default() };
        assert_eq!(v.validate(t).actual_fee_bps, Some(55));

        let mut t = tx("1000", "11", Some("0xB"));
        t.flags.unknown_precision = true;
        t.flags.unscaled = UnscaledAmounts { fee: true, ..Default::default() };
        let out = v.validate(t);
        assert_eq!(out.actual_fee_bps, None);
        assert!(out.flags.fee_rate_unverifiable);

        // No per-amount detail: any unknown precision blocks the conversion.
        let mut t = tx("1000", "11", Some("0xB"));
        t.flags.unknown_precision = true;
        assert_eq!(v.validate(t).actual_fee_bps, None);
    }

    #[test]
    fn unresolved_affiliate_is_unverifiable() {
        let mut t = tx("1000", "0", None);
        t.flags.affiliate_address_unresolved = true;
        let out = FeeValidator::new(2).validate(t);
        assert_eq!(out.actual_fee_bps, None);
        assert!(out.flags.fee_rate_unverifiable);
    }

    #[test]
    fn tolerance_absorbs_rounding() {
        let v = FeeValidator::new(1);
        assert!(!v.validate(tx("1000", "5.6", Some("0xA"))).flags.fee_rate_mismatch); // 56
        assert!(v.validate(tx("1000", "5.7", Some("0xA"))).flags.fee_rate_mismatch); // 57
    }

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(bps(Decimal::from(1), Decimal::from(20_000)), Some(1)); // 0.5
        assert_eq!(bps(Decimal::from(1), Decimal::from(30_000)), Some(0)); // 0.33
        assert_eq!(bps(Decimal::from(1), Decimal::ZERO), None);
    }
}
