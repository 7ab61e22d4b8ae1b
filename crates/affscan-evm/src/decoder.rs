//! Decoder for the router's `AffiliateSwap` event.
//!
//! ```text
//! AffiliateSwap(address indexed sender, address indexed recipient,
//!               address indexed affiliate, address inputToken, uint256 inputAmount,
//!               address outputToken, uint256 outputAmount,
//!               address feeToken, uint256 feeAmount)
//! ```

use std::str::FromStr;

use alloy_primitives::{keccak256, Address, B256, U256};

use affscan_core::precision::scale_units;
use affscan_core::{
    AssetPrecisions, CanonicalTransaction, ChainContext, DecodedSwap, EventDecoder, LogFilter,
    RawPayload, RawRecord, ScaledAmount, ScanError,
};

/// Canonical event signature.
pub const AFFILIATE_SWAP_SIGNATURE: &str =
    "AffiliateSwap(address,address,address,address,uint256,address,uint256,address,uint256)";

const WORD: usize = 32;
const DATA_WORDS: usize = 6;

/// `0x`-prefixed keccak256 of [`AFFILIATE_SWAP_SIGNATURE`].
pub fn affiliate_swap_topic0() -> String {
    format!("0x{}", hex::encode(keccak256(AFFILIATE_SWAP_SIGNATURE.as_bytes())))
}

fn lower_hex(addr: &Address) -> String {
    format!("0x{}", hex::encode(addr.as_slice()))
}

/// Decodes `AffiliateSwap` logs from one router contract.
pub struct AffiliateSwapDecoder {
    contract: String,
    topic0: String,
    precisions: AssetPrecisions,
}

impl AffiliateSwapDecoder {
    pub fn new(contract: impl Into<String>, precisions: AssetPrecisions) -> Self {
        Self {
            contract: contract.into(),
            topic0: affiliate_swap_topic0(),
            precisions,
        }
    }

    /// Use a different topic0 (e.g. a fork that renamed the event).
    pub fn with_topic0(mut self, topic0: impl Into<String>) -> Self {
        self.topic0 = topic0.into();
        self
    }

    pub fn topic0(&self) -> &str {
        &self.topic0
    }

    fn malformed(raw: &RawRecord, what: impl std::fmt::Display) -> ScanError {
        ScanError::MalformedRecord(format!("{} log {}: {what}", raw.tx_id, raw.log_index))
    }

    /// Indexed address topic: 12 zero bytes followed by the address.
    fn topic_address(raw: &RawRecord, topic: &str) -> Result<Address, ScanError> {
        let word = B256::from_str(topic).map_err(|e| Self::malformed(raw, format!("topic '{topic}': {e}")))?;
        Self::word_address(raw, word.as_slice())
    }

    fn word_address(raw: &RawRecord, word: &[u8]) -> Result<Address, ScanError> {
        if word[..12].iter().any(|b| *b != 0) {
            return Err(Self::malformed(raw, "address word has dirty high bytes"));
        }
        Ok(Address::from_slice(&word[12..]))
    }

    fn word_amount(&self, raw: &RawRecord, word: &[u8], asset: &str) -> Result<ScaledAmount, ScanError> {
        let value = U256::from_be_slice(word);
        if value.bit_len() > 128 {
            return Err(Self::malformed(raw, format!("amount {value} out of range")));
        }
        let limbs = value.as_limbs();
        let units = u128::from(limbs[0]) | (u128::from(limbs[1]) << 64);
        scale_units(units, self.precisions.resolve(asset))
    }
}

impl EventDecoder for AffiliateSwapDecoder {
    fn name(&self) -> &str {
        "evm-affiliate-swap"
    }

    fn filter(&self, ctx: &ChainContext) -> LogFilter {
        LogFilter::address(self.contract.clone())
            .topic0(self.topic0.clone())
            .affiliates(ctx.affiliate_addresses.iter().cloned())
    }

    fn decode(&self, raw: &RawRecord, ctx: &ChainContext) -> Result<Option<CanonicalTransaction>, ScanError> {
        let RawPayload::EvmLog { data } = &raw.payload else {
            return Err(Self::malformed(raw, "not an EVM log"));
        };
        let Some(topic0) = raw.topics.first() else {
            return Err(Self::malformed(raw, "log has no topics"));
        };
        if !topic0.eq_ignore_ascii_case(&self.topic0) {
            return Ok(None);
        }
        if raw.topics.len() < 4 {
            return Err(Self::malformed(raw, format!("expected 4 topics, got {}", raw.topics.len())));
        }

        let affiliate = Self::topic_address(raw, &raw.topics[3])?;
        if affiliate == Address::ZERO {
            return Ok(None);
        }
        let affiliate = lower_hex(&affiliate);
        if !ctx.is_affiliate(&affiliate) {
            return Ok(None);
        }
        let sender = lower_hex(&Self::topic_address(raw, &raw.topics[1])?);
        let recipient = lower_hex(&Self::topic_address(raw, &raw.topics[2])?);

        let bytes = hex::decode(data.strip_prefix("0x").unwrap_or(data))
            .map_err(|e| Self::malformed(raw, format!("data is not hex: {e}")))?;
        if bytes.len() < DATA_WORDS * WORD {
            return Err(Self::malformed(raw, format!("data is {} bytes, expected {}", bytes.len(), DATA_WORDS * WORD)));
        }
        let word = |i: usize| &bytes[i * WORD..(i + 1) * WORD];

        let input_asset = lower_hex(&Self::word_address(raw, word(0))?);
        let output_asset = lower_hex(&Self::word_address(raw, word(2))?);
        let fee_asset = lower_hex(&Self::word_address(raw, word(4))?);

        DecodedSwap {
            tx_id: None,
            input_amount: self.word_amount(raw, word(1), &input_asset)?,
            output_amount: self.word_amount(raw, word(3), &output_asset)?,
            fee_amount: self.word_amount(raw, word(5), &fee_asset)?,
            input_asset,
            output_asset,
            sender,
            recipient,
            affiliate_address: Some(affiliate),
            affiliate_unresolved: false,
            fee_asset: Some(fee_asset),
        }
        .into_transaction(raw, ctx)
        .map(Some)
    }
}

/// ABI-encode an `AffiliateSwap` log; used by tests and fixtures.
pub mod encode {
    use super::*;

    fn address_word(addr: &str) -> [u8; WORD] {
        let mut word = [0u8; WORD];
        if let Ok(a) = Address::from_str(addr) {
            word[12..].copy_from_slice(a.as_slice());
        }
        word
    }

    fn amount_word(amount: u128) -> [u8; WORD] {
        U256::from(amount).to_be_bytes::<WORD>()
    }

    /// Indexed address topic for `addr`.
    pub fn address_topic(addr: &str) -> String {
        format!("0x{}", hex::encode(address_word(addr)))
    }

    /// Fields of one encoded event.
    #[derive(Debug, Clone)]
    pub struct SwapLog<'a> {
        pub sender: &'a str,
        pub recipient: &'a str,
        pub affiliate: &'a str,
        pub input_token: &'a str,
        pub input_amount: u128,
        pub output_token: &'a str,
        pub output_amount: u128,
        pub fee_token: &'a str,
        pub fee_amount: u128,
    }

    impl SwapLog<'_> {
        pub fn topics(&self) -> Vec<String> {
            vec![
                affiliate_swap_topic0(),
                address_topic(self.sender),
                address_topic(self.recipient),
                address_topic(self.affiliate),
            ]
        }

        pub fn data(&self) -> String {
            let mut out = Vec::with_capacity(DATA_WORDS * WORD);
            out.extend_from_slice(&address_word(self.input_token));
            out.extend_from_slice(&amount_word(self.input_amount));
            out.extend_from_slice(&address_word(self.output_token));
            out.extend_from_slice(&amount_word(self.output_amount));
            out.extend_from_slice(&address_word(self.fee_token));
            out.extend_from_slice(&amount_word(self.fee_amount));
            format!("0x{}", hex::encode(out))
        }

        pub fn record(&self, chain: &str, emitter: &str, block_height: u64, tx_id: &str, log_index: u32) -> RawRecord {
            RawRecord {
                chain: chain.to_string(),
                block_height,
                block_time: None,
                tx_id: tx_id.to_string(),
                log_index,
                emitter: emitter.to_string(),
                topics: self.topics(),
                payload: RawPayload::EvmLog { data: self.data() },
                removed: false,
            }
        }
    }
}
