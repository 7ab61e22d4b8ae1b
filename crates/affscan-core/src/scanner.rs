//! The chunked, resumable scanner for one (protocol, chain) pair.
//!
//! ```text
//! Idle → Fetching(range) → Decoding → Committing → Idle → …
//!   └──────────────→ Failed (terminal for this run)
//! ```
//!
//! Each chunk is appended to the ledger before the progress cursor moves, so
//! a crash between the two only causes the chunk to be scanned again; the
//! ledger's dedup key turns the second write into a no-op.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::{split_range, ChainClient};
use crate::decoder::EventDecoder;
use crate::error::ScanError;
use crate::fee::FeeValidator;
use crate::price::{apply_prices, NoPrices, PriceSource};
use crate::progress::{ProgressStore, ProgressTracker};
use crate::retry::RetryPolicy;
use crate::sink::LedgerSink;
use crate::types::{CanonicalTransaction, ChainContext, LogFilter, RawPayload, RawRecord};

// ─── Cancellation ─────────────────────────────────────────────────────────────

/// Cooperative cancellation, checked before each chunk starts.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ─── State / results ──────────────────────────────────────────────────────────

/// Where the scanner is in its chunk loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerState {
    Idle,
    Fetching { from: u64, to: u64 },
    Decoding { from: u64, to: u64 },
    Committing { from: u64, to: u64 },
    Failed,
}

impl std::fmt::Display for ScannerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Fetching { from, to } => write!(f, "fetching {from}..={to}"),
            Self::Decoding { from, to } => write!(f, "decoding {from}..={to}"),
            Self::Committing { from, to } => write!(f, "committing {from}..={to}"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// How a scanner run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScanOutcome {
    Completed,
    Cancelled,
    Failed { code: String, reason: String },
}

impl ScanOutcome {
    fn failed(err: &ScanError) -> Self {
        Self::Failed {
            code: err.reason_code().to_string(),
            reason: err.to_string(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Output of one scanner run (not persisted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub protocol: String,
    pub chain: String,
    /// Records decoded and committed by this run, in block order.
    pub records: Vec<CanonicalTransaction>,
    pub blocks_scanned: u64,
    /// Ledger rows that did not exist before this run.
    pub records_ingested: usize,
    /// Structurally valid records with no affiliate swap in them.
    pub records_ignored: u64,
    /// Skipped records by reason code.
    pub skipped: BTreeMap<String, u64>,
    /// Retried chain calls (transient errors and rate limits).
    pub retries: u64,
    pub start_cursor: Option<u64>,
    pub final_cursor: Option<u64>,
    /// Highest block this run was allowed to reach (`head - confirmation_lag`).
    pub target_block: Option<u64>,
    pub caught_up: bool,
    pub outcome: ScanOutcome,
}

impl ScanResult {
    /// A result with nothing scanned yet.
    pub(crate) fn empty(ctx: &ChainContext) -> Self {
        Self {
            protocol: ctx.protocol.clone(),
            chain: ctx.chain.clone(),
            records: Vec::new(),
            blocks_scanned: 0,
            records_ingested: 0,
            records_ignored: 0,
            skipped: BTreeMap::new(),
            retries: 0,
            start_cursor: None,
            final_cursor: None,
            target_block: None,
            caught_up: false,
            outcome: ScanOutcome::Completed,
        }
    }

    /// Number of records the decoders produced.
    pub fn records_found(&self) -> usize {
        self.records.len()
    }

    pub fn skipped_total(&self) -> u64 {
        self.skipped.values().sum()
    }

    fn skip(&mut self, reason: &str) {
        *self.skipped.entry(reason.to_string()).or_default() += 1;
    }
}

// ─── ScanWindow ───────────────────────────────────────────────────────────────

/// Block-range settings for one (protocol, chain) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanWindow {
    /// First block to scan when there is no cursor yet.
    pub deployment_block: u64,
    /// Blocks per chunk (one commit per chunk).
    pub chunk_size: u64,
    /// Blocks held back from the head.
    pub confirmation_lag: u64,
}

impl ScanWindow {
    /// Inclusive end of the chunk starting at `from`, capped at `target`.
    pub fn chunk_end(&self, from: u64, target: u64) -> u64 {
        from.saturating_add(self.chunk_size.max(1) - 1).min(target)
    }

    /// Highest scannable block for a given head, `None` while the chain is
    /// shorter than the lag.
    pub fn target(&self, head: u64) -> Option<u64> {
        head.checked_sub(self.confirmation_lag)
    }
}

// ─── ChainScanner ─────────────────────────────────────────────────────────────

/// Drives one (protocol, chain) pair from its cursor to the confirmed head.
pub struct ChainScanner {
    ctx: ChainContext,
    window: ScanWindow,
    client: Arc<dyn ChainClient>,
    decoder: Arc<dyn EventDecoder>,
    progress: ProgressTracker,
    sink: Arc<dyn LedgerSink>,
    validator: FeeValidator,
    prices: Arc<dyn PriceSource>,
    retry: RetryPolicy,
    cancel: CancellationFlag,
    state: ScannerState,
}

impl ChainScanner {
    pub fn new(
        ctx: ChainContext,
        window: ScanWindow,
        client: Arc<dyn ChainClient>,
        decoder: Arc<dyn EventDecoder>,
        progress: Arc<dyn ProgressStore>,
        sink: Arc<dyn LedgerSink>,
    ) -> Self {
        Self {
            progress: ProgressTracker::new(progress, &ctx.protocol, &ctx.chain),
            ctx,
            window,
            client,
            decoder,
            sink,
            validator: FeeValidator::default(),
            prices: Arc::new(NoPrices),
            retry: RetryPolicy::default(),
            cancel: CancellationFlag::new(),
            state: ScannerState::Idle,
        }
    }

    pub fn with_validator(mut self, validator: FeeValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_prices(mut self, prices: Arc<dyn PriceSource>) -> Self {
        self.prices = prices;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    pub fn context(&self) -> &ChainContext {
        &self.ctx
    }

    /// Scan every confirmed chunk after the cursor. Never returns an error:
    /// failures end the run with `ScanOutcome::Failed`, keeping whatever
    /// chunks were already committed.
    pub async fn run(&mut self) -> ScanResult {
        let mut result = ScanResult::empty(&self.ctx);
        match self.run_inner(&mut result).await {
            Ok(outcome) => {
                self.state = ScannerState::Idle;
                result.outcome = outcome;
            }
            Err(e) => {
                self.state = ScannerState::Failed;
                warn!(
                    protocol = %self.ctx.protocol,
                    chain = %self.ctx.chain,
                    error = %e,
                    cursor = ?self.progress.observed(),
                    "scanner failed"
                );
                result.outcome = ScanOutcome::failed(&e);
            }
        }
        result.final_cursor = self.progress.observed();
        result.caught_up = match (result.final_cursor, result.target_block) {
            (Some(cursor), Some(target)) => cursor >= target,
            (_, None) => !result.outcome.is_failed(),
            (None, Some(target)) => target < self.window.deployment_block,
        };
        result
    }

    async fn run_inner(&mut self, result: &mut ScanResult) -> Result<ScanOutcome, ScanError> {
        result.start_cursor = self.progress.load().await?;

        let client = self.client.clone();
        let head = with_retry(&self.retry, &self.ctx, "latest_block", &mut result.retries, || {
            client.latest_block()
        })
        .await?;
        let target = match self.window.target(head) {
            Some(t) => t,
            None => {
                debug!(chain = %self.ctx.chain, head, "chain shorter than confirmation lag");
                return Ok(ScanOutcome::Completed);
            }
        };
        result.target_block = Some(target);
        let filter = self.decoder.filter(&self.ctx);

        info!(
            protocol = %self.ctx.protocol,
            chain = %self.ctx.chain,
            decoder = self.decoder.name(),
            cursor = ?result.start_cursor,
            head,
            target,
            "scan starting"
        );

        loop {
            if self.cancel.is_cancelled() {
                info!(protocol = %self.ctx.protocol, chain = %self.ctx.chain, "scan cancelled between chunks");
                return Ok(ScanOutcome::Cancelled);
            }

            let from = self.progress.next_block(self.window.deployment_block);
            if from > target {
                break;
            }
            let to = self.window.chunk_end(from, target);

            self.state = ScannerState::Fetching { from, to };
            let raw = self.fetch_chunk(from, to, &filter, result).await?;

            self.state = ScannerState::Decoding { from, to };
            let records = self.decode_chunk(&raw, result).await?;

            self.state = ScannerState::Committing { from, to };
            let appended = self.sink.append(&records).await?;
            self.progress.commit(to).await?;

            info!(
                protocol = %self.ctx.protocol,
                chain = %self.ctx.chain,
                from,
                to,
                logs = raw.len(),
                records = records.len(),
                inserted = appended.inserted,
                duplicates = appended.duplicates,
                "chunk committed"
            );

            result.blocks_scanned += to - from + 1;
            result.records_ingested += appended.inserted;
            result.records.extend(records);
            self.state = ScannerState::Idle;
        }

        Ok(ScanOutcome::Completed)
    }

    /// `get_logs` over `[from, to]`, split to the client's `max_range`.
    async fn fetch_chunk(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
        result: &mut ScanResult,
    ) -> Result<Vec<RawRecord>, ScanError> {
        let client = self.client.clone();
        let mut all = Vec::new();
        for (start, end) in split_range(from, to, client.max_range()) {
            let logs = with_retry(&self.retry, &self.ctx, "get_logs", &mut result.retries, || {
                client.get_logs(start, end, filter)
            })
            .await?;
            all.extend(logs);
        }
        all.sort_by_key(|r| (r.block_height, r.log_index));
        Ok(all)
    }

    async fn decode_chunk(
        &self,
        raw: &[RawRecord],
        result: &mut ScanResult,
    ) -> Result<Vec<CanonicalTransaction>, ScanError> {
        let mut records = Vec::new();
        for record in raw {
            if record.removed {
                result.skip("removed_by_reorg");
                continue;
            }
            let decoded = match &record.payload {
                RawPayload::Unparsable { reason, .. } => Err(ScanError::MalformedRecord(reason.clone())),
                _ => self.decoder.decode(record, &self.ctx),
            };
            let tx = match decoded {
                Ok(Some(tx)) => tx,
                Ok(None) => {
                    result.records_ignored += 1;
                    continue;
                }
                Err(e) => {
                    warn!(
                        protocol = %self.ctx.protocol,
                        chain = %self.ctx.chain,
                        block = record.block_height,
                        tx = %record.tx_id,
                        log_index = record.log_index,
                        error = %e,
                        "skipping record"
                    );
                    result.skip(e.reason_code());
                    continue;
                }
            };
            let tx = self.with_block_time(tx, record, result).await?;
            let tx = self.validator.validate(tx);
            if tx.flags.fee_rate_mismatch {
                warn!(
                    protocol = %tx.source_protocol,
                    chain = %tx.chain,
                    tx = %tx.tx_id,
                    expected_bps = tx.expected_fee_bps,
                    actual_bps = ?tx.actual_fee_bps,
                    "affiliate fee rate mismatch"
                );
            }
            records.push(apply_prices(tx, self.prices.as_ref()));
        }
        Ok(records)
    }

    async fn with_block_time(
        &self,
        mut tx: CanonicalTransaction,
        record: &RawRecord,
        result: &mut ScanResult,
    ) -> Result<CanonicalTransaction, ScanError> {
        if record.block_time.is_none() {
            let client = self.client.clone();
            let height = record.block_height;
            tx.block_time = with_retry(&self.retry, &self.ctx, "block_timestamp", &mut result.retries, || {
                client.block_timestamp(height)
            })
            .await?;
        }
        Ok(tx)
    }
}

/// Run `op` until it succeeds, a non-retryable error occurs, or the retry
/// budget for the error kind is spent.
async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    ctx: &ChainContext,
    op: &'static str,
    retries: &mut u64,
    mut call: F,
) -> Result<T, ScanError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ScanError>>,
{
    let mut transient = 0u32;
    let mut limited = 0u32;
    loop {
        let err = match call().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        match &err {
            ScanError::RateLimited { .. } => limited += 1,
            ScanError::TransientNetwork(_) => transient += 1,
            _ => return Err(err),
        }
        let Some(delay) = policy.delay_for(&err, transient, limited) else {
            warn!(chain = %ctx.chain, op, error = %err, "retries exhausted");
            return Err(err);
        };
        *retries += 1;
        warn!(
            chain = %ctx.chain,
            op,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying chain call"
        );
        tokio::time::sleep(delay).await;
    }
}
