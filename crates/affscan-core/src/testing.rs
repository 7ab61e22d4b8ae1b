//! In-process fakes for exercising scanners without a network.
//!
//! `ScriptedChainClient` serves records from memory, enforces `max_range` like
//! a real provider, and can be told to fail the next calls. `FixtureDecoder`
//! understands a small JSON swap shape so pipelines can be tested end to end.

use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};

use crate::client::ChainClient;
use crate::decoder::{DecodedSwap, EventDecoder};
use crate::error::ScanError;
use crate::precision::{scale_digits, Precision};
use crate::types::{
    CanonicalTransaction, ChainContext, LogFilter, RawPayload, RawRecord, RecordFlags,
};

/// Block time of `height` on every scripted chain.
pub const fn scripted_block_time(height: u64) -> i64 {
    1_700_000_000 + (height as i64) * 12
}

#[derive(Default)]
struct Script {
    head: u64,
    records: Vec<RawRecord>,
    head_failures: VecDeque<ScanError>,
    log_failures: VecDeque<ScanError>,
    requested: Vec<(u64, u64)>,
}

/// A `ChainClient` backed by an in-memory script.
pub struct ScriptedChainClient {
    chain: String,
    max_range: u64,
    script: Mutex<Script>,
    get_logs_calls: AtomicUsize,
    timestamp_calls: AtomicUsize,
}

impl ScriptedChainClient {
    pub fn new(chain: impl Into<String>, max_range: u64) -> Self {
        Self {
            chain: chain.into(),
            max_range,
            script: Mutex::new(Script::default()),
            get_logs_calls: AtomicUsize::new(0),
            timestamp_calls: AtomicUsize::new(0),
        }
    }

    /// The chain has produced `blocks`; the head is its last block.
    pub fn with_blocks(self, blocks: RangeInclusive<u64>) -> Self {
        self.set_head(*blocks.end());
        self
    }

    pub fn with_record(self, record: RawRecord) -> Self {
        self.script().records.push(record);
        self
    }

    /// Fail the next `get_logs` calls, in order.
    pub fn failing_get_logs(self, errors: impl IntoIterator<Item = ScanError>) -> Self {
        self.script().log_failures.extend(errors);
        self
    }

    /// Fail the next `latest_block` calls, in order.
    pub fn failing_latest_block(self, errors: impl IntoIterator<Item = ScanError>) -> Self {
        self.script().head_failures.extend(errors);
        self
    }

    /// Move the head, e.g. to simulate new blocks between runs.
    pub fn set_head(&self, head: u64) {
        self.script().head = head;
    }

    pub fn push_record(&self, record: RawRecord) {
        self.script().records.push(record);
    }

    pub fn get_logs_calls(&self) -> usize {
        self.get_logs_calls.load(Ordering::SeqCst)
    }

    pub fn timestamp_calls(&self) -> usize {
        self.timestamp_calls.load(Ordering::SeqCst)
    }

    /// Every `[from, to]` passed to a successful or failed `get_logs`.
    pub fn requested_ranges(&self) -> Vec<(u64, u64)> {
        self.script().requested.clone()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl ChainClient for ScriptedChainClient {
    fn chain(&self) -> &str {
        &self.chain
    }

    fn max_range(&self) -> u64 {
        self.max_range
    }

    async fn latest_block(&self) -> Result<u64, ScanError> {
        let mut script = self.script();
        match script.head_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(script.head),
        }
    }

    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<RawRecord>, ScanError> {
        self.get_logs_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script();
        script.requested.push((from, to));
        if to.saturating_sub(from) > self.max_range {
            return Err(ScanError::RangeTooLarge {
                from,
                to,
                max_range: self.max_range,
            });
        }
        if let Some(err) = script.log_failures.pop_front() {
            return Err(err);
        }
        Ok(script
            .records
            .iter()
            .filter(|r| (from..=to).contains(&r.block_height) && filter.matches(r))
            .cloned()
            .collect())
    }

    async fn block_timestamp(&self, height: u64) -> Result<i64, ScanError> {
        self.timestamp_calls.fetch_add(1, Ordering::SeqCst);
        Ok(scripted_block_time(height))
    }
}

// ─── Fixture records ──────────────────────────────────────────────────────────

/// JSON body of a fixture swap: 1000 `A` in, 990 `B` out, 5.5 `A` fee paid to
/// `affiliate`. Amounts are smallest units with 3 decimals.
pub fn fixture_swap(affiliate: &str) -> Value {
    json!({
        "event": "swap",
        "input_asset": "A",
        "input_amount": "1000000",
        "output_asset": "B",
        "output_amount": "990000",
        "decimals": 3,
        "fee_asset": "A",
        "fee_amount": "5500",
        "sender": "alice",
        "recipient": "bob",
        "affiliate": affiliate,
    })
}

/// A raw explorer-style record carrying `body`, without a block time.
pub fn fixture_record(chain: &str, block_height: u64, tx_id: &str, log_index: u32, body: Value) -> RawRecord {
    RawRecord {
        chain: chain.to_string(),
        block_height,
        block_time: None,
        tx_id: tx_id.to_string(),
        log_index,
        emitter: "fixture".to_string(),
        topics: Vec::new(),
        payload: RawPayload::Json { body },
        removed: false,
    }
}

/// Decodes records built by [`fixture_record`].
///
/// `event != "swap"` and unknown affiliates are irrelevant; missing fields are
/// malformed. A missing `decimals` means unknown precision.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixtureDecoder;

impl FixtureDecoder {
    fn field<'a>(body: &'a Value, name: &str, raw: &RawRecord) -> Result<&'a str, ScanError> {
        body.get(name).and_then(Value::as_str).ok_or_else(|| {
            ScanError::MalformedRecord(format!("{}: missing field '{name}'", raw.tx_id))
        })
    }
}

impl EventDecoder for FixtureDecoder {
    fn name(&self) -> &str {
        "fixture-swap"
    }

    fn filter(&self, ctx: &ChainContext) -> LogFilter {
        LogFilter::address("fixture").affiliates(ctx.affiliate_addresses.iter().cloned())
    }

    fn decode(&self, raw: &RawRecord, ctx: &ChainContext) -> Result<Option<CanonicalTransaction>, ScanError> {
        let RawPayload::Json { body } = &raw.payload else {
            return Err(ScanError::MalformedRecord(format!("{}: not a JSON record", raw.tx_id)));
        };
        if body.get("event").and_then(Value::as_str) != Some("swap") {
            return Ok(None);
        }
        let affiliate = match body.get("affiliate").and_then(Value::as_str) {
            Some(a) if ctx.is_affiliate(a) => a.to_string(),
            _ => return Ok(None),
        };

        let precision = match body.get("decimals").and_then(Value::as_u64) {
            Some(d) => Precision::Known(d as u32),
            None => Precision::Unknown,
        };
        let fee_asset = body.get("fee_asset").and_then(Value::as_str).map(str::to_string);
        let fee_amount = body.get("fee_amount").and_then(Value::as_str).unwrap_or("0");

        DecodedSwap {
            tx_id: None,
            input_asset: Self::field(body, "input_asset", raw)?.to_string(),
            output_asset: Self::field(body, "output_asset", raw)?.to_string(),
            input_amount: scale_digits(Self::field(body, "input_amount", raw)?, precision)?,
            output_amount: scale_digits(Self::field(body, "output_amount", raw)?, precision)?,
            sender: Self::field(body, "sender", raw)?.to_string(),
            recipient: Self::field(body, "recipient", raw)?.to_string(),
            affiliate_address: Some(affiliate),
            affiliate_unresolved: fee_asset.is_none(),
            fee_asset,
            fee_amount: scale_digits(fee_amount, precision)?,
        }
        .into_transaction(raw, ctx)
        .map(Some)
    }
}

/// A plausible, fully-populated ledger row.
pub fn sample_transaction(
    protocol: &str,
    chain: &str,
    tx_id: &str,
    log_index: u32,
    block_height: u64,
) -> CanonicalTransaction {
    CanonicalTransaction {
        source_protocol: protocol.to_string(),
        chain: chain.to_string(),
        tx_id: tx_id.to_string(),
        log_index,
        block_height,
        block_time: scripted_block_time(block_height),
        input_asset: "0xin".to_string(),
        output_asset: "0xout".to_string(),
        input_amount: Decimal::from(1000),
        output_amount: Decimal::from(990),
        sender: "0xsender".to_string(),
        recipient: "0xrecipient".to_string(),
        affiliate_address: Some("0xaff".to_string()),
        fee_asset: Some("0xin".to_string()),
        fee_amount: Decimal::new(55, 1),
        expected_fee_bps: 55,
        actual_fee_bps: Some(55),
        usd_volume: None,
        usd_fee: None,
        ingested_at: 1_700_000_000,
        flags: RecordFlags::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ChainContext {
        ChainContext {
            protocol: "fixture".into(),
            chain: "testnet".into(),
            expected_fee_bps: 55,
            affiliate_addresses: vec!["aff".into()],
        }
    }

    #[tokio::test]
    async fn scripted_client_enforces_max_range() {
        let client = ScriptedChainClient::new("testnet", 10).with_blocks(0..=100);
        let err = client.get_logs(0, 11, &LogFilter::default()).await.unwrap_err();
        assert!(matches!(err, ScanError::RangeTooLarge { max_range: 10, .. }));
        assert!(client.get_logs(0, 10, &LogFilter::default()).await.is_ok());
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let client = ScriptedChainClient::new("testnet", 10)
            .with_blocks(0..=5)
            .failing_latest_block([ScanError::TransientNetwork("reset".into())]);
        assert!(client.latest_block().await.is_err());
        assert_eq!(client.latest_block().await.unwrap(), 5);
    }

    #[test]
    fn fixture_decoder_decodes_affiliate_swap() {
        let raw = fixture_record("testnet", 7, "0x01", 0, fixture_swap("aff"));
        let tx = FixtureDecoder.decode(&raw, &ctx()).unwrap().unwrap();
        assert_eq!(tx.input_amount, Decimal::from(1000));
        assert_eq!(tx.fee_amount, Decimal::new(55, 1));
        assert_eq!(tx.affiliate_address.as_deref(), Some("aff"));
    }

    #[test]
    fn fixture_decoder_ignores_foreign_affiliate_and_rejects_missing_fields() {
        let foreign = fixture_record("testnet", 7, "0x01", 0, fixture_swap("someone-else"));
        assert!(FixtureDecoder.decode(&foreign, &ctx()).unwrap().is_none());

        let mut body = fixture_swap("aff");
        body.as_object_mut().unwrap().remove("input_amount");
        let broken = fixture_record("testnet", 7, "0x02", 0, body);
        assert!(matches!(
            FixtureDecoder.decode(&broken, &ctx()),
            Err(ScanError::MalformedRecord(_))
        ));
    }
}
