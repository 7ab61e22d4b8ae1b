//! Protocol decoders: raw record → canonical transaction.

use crate::error::ScanError;
use crate::precision::ScaledAmount;
use crate::types::{
    CanonicalTransaction, ChainContext, LogFilter, RawRecord, RecordFlags, UnscaledAmounts,
};

/// Protocol-specific decoding of raw records.
///
/// `decode` returns:
/// - `Ok(Some(tx))` for an affiliate-bearing swap,
/// - `Ok(None)` for a structurally valid record that is irrelevant (other
///   event variant, no affiliate party, foreign affiliate),
/// - `Err(ScanError::MalformedRecord)` when the record has the expected shape
///   but its fields cannot be extracted. The scanner counts and skips these.
pub trait EventDecoder: Send + Sync {
    /// Decoder family name, for logs (e.g. `"evm-affiliate-swap"`).
    fn name(&self) -> &str;

    /// Server-side filter for `ChainClient::get_logs`.
    fn filter(&self, ctx: &ChainContext) -> LogFilter;

    fn decode(
        &self,
        raw: &RawRecord,
        ctx: &ChainContext,
    ) -> Result<Option<CanonicalTransaction>, ScanError>;
}

/// Protocol-agnostic swap fields a decoder extracted from one record.
#[derive(Debug, Clone)]
pub struct DecodedSwap {
    /// Overrides `raw.tx_id` when the protocol carries its own id.
    pub tx_id: Option<String>,
    pub input_asset: String,
    pub output_asset: String,
    pub input_amount: ScaledAmount,
    pub output_amount: ScaledAmount,
    pub sender: String,
    pub recipient: String,
    pub affiliate_address: Option<String>,
    /// An affiliate was named but its fee transfer was not found.
    pub affiliate_unresolved: bool,
    pub fee_asset: Option<String>,
    pub fee_amount: ScaledAmount,
}

impl DecodedSwap {
    /// Build the canonical record. Fee-rate fields and USD values are left
    /// for the validator and pricing steps.
    pub fn into_transaction(
        self,
        raw: &RawRecord,
        ctx: &ChainContext,
    ) -> Result<CanonicalTransaction, ScanError> {
        if self.input_asset.is_empty() || self.output_asset.is_empty() {
            return Err(ScanError::MalformedRecord(format!(
                "swap in {} has an empty asset identifier",
                raw.tx_id
            )));
        }
        let unscaled = UnscaledAmounts {
            input: !self.input_amount.precision_known,
            output: !self.output_amount.precision_known,
            fee: self.fee_asset.is_some() && !self.fee_amount.precision_known,
        };

        Ok(CanonicalTransaction {
            source_protocol: ctx.protocol.clone(),
            chain: ctx.chain.clone(),
            tx_id: self.tx_id.unwrap_or_else(|| raw.tx_id.clone()),
            log_index: raw.log_index,
            block_height: raw.block_height,
            block_time: raw.block_time.unwrap_or_default(),
            input_asset: self.input_asset,
            output_asset: self.output_asset,
            input_amount: self.input_amount.value,
            output_amount: self.output_amount.value,
            sender: self.sender,
            recipient: self.recipient,
            affiliate_address: self.affiliate_address,
            fee_asset: self.fee_asset,
            fee_amount: self.fee_amount.value,
            expected_fee_bps: ctx.expected_fee_bps,
            actual_fee_bps: None,
            usd_volume: None,
            usd_fee: None,
            ingested_at: chrono::Utc::now().timestamp(),
            flags: RecordFlags {
                affiliate_address_unresolved: self.affiliate_unresolved,
                unknown_precision: unscaled.any(),
                unscaled,
                ..Default::default()
            },
        })
    }
}
