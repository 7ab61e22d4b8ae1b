//! USD price lookup collaborator.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::types::CanonicalTransaction;

/// `asset × amount × time → USD`. `None` means "unknown", never zero.
pub trait PriceSource: Send + Sync {
    fn price_usd(&self, asset: &str, amount: Decimal, at_time: i64) -> Option<Decimal>;
}

/// Prices nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrices;

impl PriceSource for NoPrices {
    fn price_usd(&self, _asset: &str, _amount: Decimal, _at_time: i64) -> Option<Decimal> {
        None
    }
}

/// Fixed USD-per-unit table, keyed case-insensitively by asset id.
#[derive(Debug, Clone, Default)]
pub struct StaticPrices {
    per_unit: HashMap<String, Decimal>,
}

impl StaticPrices {
    pub fn new(per_unit: impl IntoIterator<Item = (String, Decimal)>) -> Self {
        Self {
            per_unit: per_unit
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
        }
    }
}

impl PriceSource for StaticPrices {
    fn price_usd(&self, asset: &str, amount: Decimal, _at_time: i64) -> Option<Decimal> {
        self.per_unit
            .get(&asset.to_ascii_lowercase())
            .and_then(|unit| unit.checked_mul(amount))
    }
}

/// Fill `usd_volume` / `usd_fee`. Amounts still in smallest units are not priced.
pub fn apply_prices(mut tx: CanonicalTransaction, prices: &dyn PriceSource) -> CanonicalTransaction {
    if tx.flags.unknown_precision {
        return tx;
    }
    tx.usd_volume = prices.price_usd(&tx.input_asset, tx.input_amount, tx.block_time);
    tx.usd_fee = match tx.fee_asset.as_deref() {
        Some(asset) => prices.price_usd(asset, tx.fee_amount, tx.block_time),
        None if tx.fee_amount.is_zero() => Some(Decimal::ZERO),
        None => None,
    };
    tx
}
