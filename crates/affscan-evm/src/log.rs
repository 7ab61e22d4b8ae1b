//! `eth_getLogs` wire format and conversion into `RawRecord`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use affscan_core::{RawPayload, RawRecord, ScanError};

/// A hex quantity or data field that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HexError {
    #[error("empty hex quantity")]
    Empty,
    #[error("invalid hex quantity '{0}'")]
    Invalid(String),
}

impl From<HexError> for ScanError {
    fn from(e: HexError) -> Self {
        ScanError::MalformedRecord(e.to_string())
    }
}

/// Parse a `0x`-prefixed (or bare) hex quantity.
pub fn parse_hex_u64(s: &str) -> Result<u64, HexError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return Err(HexError::Empty);
    }
    u64::from_str_radix(digits, 16).map_err(|_| HexError::Invalid(s.to_string()))
}

/// A raw EVM log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "blockHash", default)]
    pub block_hash: Option<String>,
    #[serde(rename = "blockTimestamp", default)]
    pub block_timestamp: Option<String>,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    #[serde(default)]
    pub removed: Option<bool>,
}

impl RawLog {
    pub fn block_number_u64(&self) -> Result<u64, HexError> {
        parse_hex_u64(&self.block_number)
    }

    pub fn log_index_u32(&self) -> Result<u32, HexError> {
        let idx = parse_hex_u64(&self.log_index)?;
        u32::try_from(idx).map_err(|_| HexError::Invalid(self.log_index.clone()))
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }

    /// Convert into the chain-agnostic record. Some providers include the
    /// block timestamp in each log, which saves a block lookup.
    pub fn into_record(self, chain: &str) -> Result<RawRecord, ScanError> {
        let block_time = match &self.block_timestamp {
            Some(ts) => Some(parse_hex_u64(ts)? as i64),
            None => None,
        };
        Ok(RawRecord {
            chain: chain.to_string(),
            block_height: self.block_number_u64()?,
            block_time,
            log_index: self.log_index_u32()?,
            removed: self.is_removed(),
            tx_id: self.tx_hash,
            emitter: self.address,
            topics: self.topics,
            payload: RawPayload::EvmLog { data: self.data },
        })
    }
}

/// Convert one entry of an `eth_getLogs` result.
///
/// An entry that cannot be parsed still becomes a record, carrying the raw
/// JSON as `RawPayload::Unparsable`, so it is counted and skipped instead of
/// failing its range. Its position falls back to `fallback_height` and log
/// index 0 where the entry itself gives none.
pub fn record_from_value(value: serde_json::Value, chain: &str, fallback_height: u64) -> RawRecord {
    let reason = match RawLog::deserialize(&value) {
        Ok(log) => match log.into_record(chain) {
            Ok(record) => return record,
            Err(ScanError::MalformedRecord(reason)) => reason,
            Err(e) => e.to_string(),
        },
        Err(e) => format!("unreadable log: {e}"),
    };

    let field = |name: &str| value.get(name).and_then(serde_json::Value::as_str);
    let block_height = field("blockNumber")
        .and_then(|s| parse_hex_u64(s).ok())
        .unwrap_or(fallback_height);
    let log_index = field("logIndex")
        .and_then(|s| parse_hex_u64(s).ok())
        .and_then(|i| u32::try_from(i).ok())
        .unwrap_or(0);
    let tx_id = field("transactionHash").unwrap_or_default().to_string();
    let emitter = field("address").unwrap_or_default().to_string();
    RawRecord {
        chain: chain.to_string(),
        block_height,
        block_time: None,
        tx_id,
        log_index,
        emitter,
        topics: Vec::new(),
        payload: RawPayload::Unparsable { reason, body: value },
        removed: false,
    }
}
