//! Swap actions → canonical transactions.

use rust_decimal::Decimal;

use affscan_core::precision::scale_digits;
use affscan_core::{
    CanonicalTransaction, ChainContext, DecodedSwap, EventDecoder, LogFilter, Precision,
    RawPayload, RawRecord, ScaledAmount, ScanError,
};

use crate::action::{Action, Coin};

/// Midgard reports every amount in 1e8 base units.
pub const MIDGARD_DECIMALS: u32 = 8;

/// Decodes Midgard swap actions for one protocol.
///
/// An action is relevant when it pays one of the context's affiliate
/// addresses, or when its memo names one of `affiliate_codes` (or an
/// affiliate address) even if the payout cannot be found.
#[derive(Debug, Clone, Default)]
pub struct MidgardSwapDecoder {
    affiliate_codes: Vec<String>,
}

impl MidgardSwapDecoder {
    pub fn new<I, S>(affiliate_codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            affiliate_codes: affiliate_codes.into_iter().map(Into::into).collect(),
        }
    }

    fn names_our_affiliate(&self, name: &str, ctx: &ChainContext) -> bool {
        !name.is_empty()
            && (ctx.is_affiliate(name) || self.affiliate_codes.iter().any(|c| c.eq_ignore_ascii_case(name)))
    }

    fn malformed(raw: &RawRecord, what: impl std::fmt::Display) -> ScanError {
        ScanError::MalformedRecord(format!("action {} at {}: {what}", raw.tx_id, raw.block_height))
    }

    fn amount(raw: &RawRecord, coin: &Coin) -> Result<ScaledAmount, ScanError> {
        scale_digits(&coin.amount, Precision::Known(MIDGARD_DECIMALS))
            .map_err(|e| Self::malformed(raw, format!("{} amount: {e}", coin.asset)))
    }
}

impl EventDecoder for MidgardSwapDecoder {
    fn name(&self) -> &str {
        "midgard-swap"
    }

    fn filter(&self, _ctx: &ChainContext) -> LogFilter {
        LogFilter::default().affiliates(self.affiliate_codes.iter().cloned())
    }

    fn decode(&self, raw: &RawRecord, ctx: &ChainContext) -> Result<Option<CanonicalTransaction>, ScanError> {
        let RawPayload::Json { body } = &raw.payload else {
            return Err(Self::malformed(raw, "not a JSON action"));
        };
        let action: Action = serde_json::from_value(body.clone()).map_err(|e| Self::malformed(raw, e))?;
        if action.kind != "swap" || !action.status.eq_ignore_ascii_case("success") {
            return Ok(None);
        }

        let named = action
            .metadata
            .swap
            .as_ref()
            .map(|s| self.names_our_affiliate(&s.affiliate_address, ctx))
            .unwrap_or(false);
        let fee_outputs: Vec<_> = action.outputs.iter().filter(|o| ctx.is_affiliate(&o.address)).collect();
        if !named && fee_outputs.is_empty() {
            return Ok(None);
        }

        let height: u64 = action
            .height
            .parse()
            .map_err(|_| Self::malformed(raw, format!("height '{}' is not a number", action.height)))?;
        if height != raw.block_height {
            return Err(Self::malformed(raw, format!("height {height} does not match record height")));
        }

        let input = action.inputs.first().ok_or_else(|| Self::malformed(raw, "no inputs"))?;
        let input_coin = input.coins.first().ok_or_else(|| Self::malformed(raw, "input has no coins"))?;
        let output = action
            .outputs
            .iter()
            .find(|o| !ctx.is_affiliate(&o.address) && !o.coins.is_empty())
            .ok_or_else(|| Self::malformed(raw, "no output to the swapper"))?;
        let output_coin = &output.coins[0];

        let (affiliate_address, fee_asset, fee_amount) = match fee_outputs.first() {
            Some(first) => {
                let fee_coin = first.coins.first().ok_or_else(|| Self::malformed(raw, "affiliate output has no coins"))?;
                let mut total = Decimal::ZERO;
                for coin in fee_outputs.iter().flat_map(|o| o.coins.iter()).filter(|c| c.asset == fee_coin.asset) {
                    total += Self::amount(raw, coin)?.value;
                }
                (
                    Some(first.address.clone()),
                    Some(fee_coin.asset.clone()),
                    ScaledAmount { value: total, precision_known: true },
                )
            }
            None => (None, None, ScaledAmount { value: Decimal::ZERO, precision_known: true }),
        };

        DecodedSwap {
            tx_id: (!input.tx_id.is_empty()).then(|| input.tx_id.clone()),
            input_asset: input_coin.asset.clone(),
            output_asset: output_coin.asset.clone(),
            input_amount: Self::amount(raw, input_coin)?,
            output_amount: Self::amount(raw, output_coin)?,
            sender: input.address.clone(),
            recipient: output.address.clone(),
            affiliate_unresolved: affiliate_address.is_none(),
            affiliate_address,
            fee_asset,
            fee_amount,
        }
        .into_transaction(raw, ctx)
        .map(Some)
    }
}
