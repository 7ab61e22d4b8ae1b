//! Shared types for the ingestion pipeline.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ─── DedupKey ─────────────────────────────────────────────────────────────────

/// Uniquely identifies one affiliate event across repeated scans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub chain: String,
    pub tx_id: String,
    pub log_index: u32,
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.chain, self.tx_id, self.log_index)
    }
}

// ─── RecordFlags ──────────────────────────────────────────────────────────────

/// Data-quality and fraud-detection annotations carried with every record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFlags {
    /// The protocol named an affiliate but the fee transfer could not be located.
    #[serde(default)]
    pub affiliate_address_unresolved: bool,
    /// No way to express the fee in input-asset terms.
    #[serde(default)]
    pub fee_rate_unverifiable: bool,
    /// Actual rate deviates from the expected rate by more than the tolerance.
    #[serde(default)]
    pub fee_rate_mismatch: bool,
    /// At least one amount is in smallest units because the asset's decimals are unknown.
    #[serde(default)]
    pub unknown_precision: bool,
    /// Which amounts `unknown_precision` refers to. Not persisted.
    #[serde(skip)]
    pub unscaled: UnscaledAmounts,
}

/// Amounts of a record left in smallest units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnscaledAmounts {
    pub input: bool,
    pub output: bool,
    pub fee: bool,
}

impl UnscaledAmounts {
    pub fn any(&self) -> bool {
        self.input || self.output || self.fee
    }
}

impl RecordFlags {
    /// Whether the input or fee amount is in smallest units. Records read
    /// back from storage carry no per-amount detail, so any unknown
    /// precision counts for them.
    pub fn input_or_fee_unscaled(&self) -> bool {
        if self.unscaled.any() {
            self.unscaled.input || self.unscaled.fee
        } else {
            self.unknown_precision
        }
    }
}

// ─── CanonicalTransaction ─────────────────────────────────────────────────────

/// One affiliate-bearing swap, normalised across protocols and chains.
///
/// Records are immutable once written; the ledger never updates a row in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalTransaction {
    pub source_protocol: String,
    pub chain: String,
    /// Chain-native transaction id (hash or equivalent).
    pub tx_id: String,
    /// Log index (EVM) or sequence index within the transaction.
    pub log_index: u32,
    pub block_height: u64,
    /// Unix seconds.
    pub block_time: i64,
    pub input_asset: String,
    pub output_asset: String,
    /// Native token units (smallest units when `flags.unknown_precision`).
    pub input_amount: Decimal,
    pub output_amount: Decimal,
    pub sender: String,
    pub recipient: String,
    pub affiliate_address: Option<String>,
    pub fee_asset: Option<String>,
    pub fee_amount: Decimal,
    pub expected_fee_bps: i64,
    pub actual_fee_bps: Option<i64>,
    pub usd_volume: Option<Decimal>,
    pub usd_fee: Option<Decimal>,
    /// Unix seconds at which this engine produced the record.
    pub ingested_at: i64,
    #[serde(default)]
    pub flags: RecordFlags,
}

impl CanonicalTransaction {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            chain: self.chain.clone(),
            tx_id: self.tx_id.clone(),
            log_index: self.log_index,
        }
    }
}

// ─── RawRecord ────────────────────────────────────────────────────────────────

/// Chain-specific body of a raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawPayload {
    /// ABI-encoded log data (`0x…`).
    EvmLog { data: String },
    /// A JSON document from an explorer API.
    Json { body: serde_json::Value },
    /// Something the client received but could not turn into a record. The
    /// scanner counts it as malformed and moves on.
    Unparsable {
        reason: String,
        body: serde_json::Value,
    },
}

/// A raw log or explorer record, as returned by a `ChainClient`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub chain: String,
    pub block_height: u64,
    /// Present when the source already carries the block time.
    pub block_time: Option<i64>,
    pub tx_id: String,
    pub log_index: u32,
    /// Emitting contract, or the explorer endpoint for API records.
    pub emitter: String,
    /// EVM topics (`0x…`); empty for explorer records.
    pub topics: Vec<String>,
    pub payload: RawPayload,
    /// `true` if the provider reports the log as dropped by a reorg.
    #[serde(default)]
    pub removed: bool,
}

// ─── LogFilter ────────────────────────────────────────────────────────────────

/// Which logs/records a decoder wants from `ChainClient::get_logs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    /// Emitting contracts (empty = all).
    pub addresses: Vec<String>,
    /// Accepted topic0 values (empty = all).
    pub topic0_values: Vec<String>,
    /// Affiliate identifiers, for APIs that filter server-side.
    pub affiliates: Vec<String>,
}

impl LogFilter {
    /// Filter for a single emitting contract.
    pub fn address(addr: impl Into<String>) -> Self {
        Self {
            addresses: vec![addr.into()],
            ..Default::default()
        }
    }

    /// Add a topic0 filter (event signature hash).
    pub fn topic0(mut self, topic: impl Into<String>) -> Self {
        self.topic0_values.push(topic.into());
        self
    }

    /// Add affiliate identifiers.
    pub fn affiliates<I, S>(mut self, affiliates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.affiliates.extend(affiliates.into_iter().map(Into::into));
        self
    }

    pub fn matches_address(&self, address: &str) -> bool {
        self.addresses.is_empty()
            || self.addresses.iter().any(|a| a.eq_ignore_ascii_case(address))
    }

    pub fn matches_topic0(&self, topic0: &str) -> bool {
        self.topic0_values.is_empty()
            || self.topic0_values.iter().any(|t| t.eq_ignore_ascii_case(topic0))
    }

    /// Returns `true` if `record` passes the address and topic0 filters.
    pub fn matches(&self, record: &RawRecord) -> bool {
        self.matches_address(&record.emitter)
            && record
                .topics
                .first()
                .map(|t| self.matches_topic0(t))
                .unwrap_or(self.topic0_values.is_empty())
    }
}

// ─── ChainContext ─────────────────────────────────────────────────────────────

/// Per-(protocol, chain) context handed to decoders.
#[derive(Debug, Clone)]
pub struct ChainContext {
    pub protocol: String,
    pub chain: String,
    pub expected_fee_bps: i64,
    pub affiliate_addresses: Vec<String>,
}

impl ChainContext {
    /// Case-insensitive membership in the configured affiliate set.
    pub fn is_affiliate(&self, address: &str) -> bool {
        self.affiliate_addresses
            .iter()
            .any(|a| a.eq_ignore_ascii_case(address))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(emitter: &str, topic0: Option<&str>) -> RawRecord {
        RawRecord {
            chain: "ethereum".into(),
            block_height: 1,
            block_time: None,
            tx_id: "0xaa".into(),
            log_index: 0,
            emitter: emitter.into(),
            topics: topic0.map(|t| vec![t.to_string()]).unwrap_or_default(),
            payload: RawPayload::EvmLog { data: "0x".into() },
            removed: false,
        }
    }

    #[test]
    fn filter_matches_address_case_insensitive() {
        let f = LogFilter::address("0xAbCdEf");
        assert!(f.matches_address("0xabcdef"));
        assert!(!f.matches_address("0x111111"));
    }

    #[test]
    fn filter_requires_topic_when_configured() {
        let f = LogFilter::address("0xabc").topic0("0xdead");
        assert!(f.matches(&raw("0xABC", Some("0xDEAD"))));
        assert!(!f.matches(&raw("0xabc", Some("0xbeef"))));
        assert!(!f.matches(&raw("0xabc", None)));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let f = LogFilter::default();
        assert!(f.matches(&raw("0xanything", None)));
    }

    #[test]
    fn dedup_key_display() {
        let key = DedupKey {
            chain: "base".into(),
            tx_id: "0xff".into(),
            log_index: 7,
        };
        assert_eq!(key.to_string(), "base:0xff:7");
    }

    #[test]
    fn affiliate_membership_is_case_insensitive() {
        let ctx = ChainContext {
            protocol: "portals".into(),
            chain: "ethereum".into(),
            expected_fee_bps: 55,
            affiliate_addresses: vec!["0xAFF".into()],
        };
        assert!(ctx.is_affiliate("0xaff"));
        assert!(!ctx.is_affiliate("0xbad"));
    }
}
