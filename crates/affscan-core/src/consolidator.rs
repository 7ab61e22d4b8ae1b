//! Cross-protocol consolidation into the unified ledger.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ScanError;
use crate::scanner::ScanResult;
use crate::sink::{LedgerQuery, LedgerSink};
use crate::types::{CanonicalTransaction, DedupKey};

/// Summary statistics for one (protocol, chain) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PairStats {
    pub protocol: String,
    pub chain: String,
    pub record_count: u64,
    /// Sum of known `usd_volume`.
    pub total_usd_volume: Decimal,
    /// Sum of known `usd_fee`.
    pub total_usd_fee: Decimal,
    /// Records whose volume could not be priced.
    pub unpriced_records: u64,
    /// Input volume per asset, in native units.
    pub volume_by_asset: BTreeMap<String, Decimal>,
    /// Affiliate fee per asset, in native units.
    pub fee_by_asset: BTreeMap<String, Decimal>,
    pub fee_rate_mismatches: u64,
    pub fee_rate_unverifiable: u64,
    pub affiliate_unresolved: u64,
    pub unknown_precision: u64,
}

impl PairStats {
    fn new(protocol: &str, chain: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            chain: chain.to_string(),
            ..Default::default()
        }
    }

    fn add(&mut self, tx: &CanonicalTransaction) {
        self.record_count += 1;
        match tx.usd_volume {
            Some(v) => self.total_usd_volume += v,
            None => self.unpriced_records += 1,
        }
        if let Some(fee) = tx.usd_fee {
            self.total_usd_fee += fee;
        }
        *self.volume_by_asset.entry(tx.input_asset.clone()).or_default() += tx.input_amount;
        if let Some(asset) = &tx.fee_asset {
            *self.fee_by_asset.entry(asset.clone()).or_default() += tx.fee_amount;
        }
        self.fee_rate_mismatches += u64::from(tx.flags.fee_rate_mismatch);
        self.fee_rate_unverifiable += u64::from(tx.flags.fee_rate_unverifiable);
        self.affiliate_unresolved += u64::from(tx.flags.affiliate_address_unresolved);
        self.unknown_precision += u64::from(tx.flags.unknown_precision);
    }
}

/// Output of `Consolidator::merge`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Consolidation {
    /// Distinct records across all results.
    pub unique_records: usize,
    /// Records produced twice within this merge (same dedup key).
    pub merged_duplicates: usize,
    /// Ledger rows written by the merge itself.
    pub ledger_inserted: usize,
    /// Rows that were already in the ledger (first write wins).
    pub ledger_existing: usize,
    pub pairs: Vec<PairStats>,
}

/// Folds records into per-pair statistics, ordered by (protocol, chain).
pub fn pair_stats<'a>(records: impl IntoIterator<Item = &'a CanonicalTransaction>) -> Vec<PairStats> {
    let mut by_pair: BTreeMap<(String, String), PairStats> = BTreeMap::new();
    for tx in records {
        by_pair
            .entry((tx.source_protocol.clone(), tx.chain.clone()))
            .or_insert_with(|| PairStats::new(&tx.source_protocol, &tx.chain))
            .add(tx);
    }
    by_pair.into_values().collect()
}

/// Merges scan results into the unified, deduplicated ledger.
pub struct Consolidator {
    ledger: Arc<dyn LedgerSink>,
}

impl Consolidator {
    pub fn new(ledger: Arc<dyn LedgerSink>) -> Self {
        Self { ledger }
    }

    /// Deduplicate by `(chain, tx_id, log_index)` across results (first
    /// occurrence wins), append to the ledger, and summarise.
    ///
    /// Order-independent with respect to ledger contents: re-merging the same
    /// results writes nothing.
    pub async fn merge(&self, results: &[ScanResult]) -> Result<Consolidation, ScanError> {
        let mut seen: HashSet<DedupKey> = HashSet::new();
        let mut unified: Vec<CanonicalTransaction> = Vec::new();
        let mut merged_duplicates = 0usize;

        for tx in results.iter().flat_map(|r| r.records.iter()) {
            if seen.insert(tx.dedup_key()) {
                unified.push(tx.clone());
            } else {
                merged_duplicates += 1;
            }
        }

        let outcome = self.ledger.append(&unified).await?;
        let pairs = pair_stats(&unified);

        info!(
            unique = unified.len(),
            merged_duplicates,
            inserted = outcome.inserted,
            existing = outcome.duplicates,
            pairs = pairs.len(),
            "consolidation complete"
        );

        Ok(Consolidation {
            unique_records: unified.len(),
            merged_duplicates,
            ledger_inserted: outcome.inserted,
            ledger_existing: outcome.duplicates,
            pairs,
        })
    }

    /// Statistics over everything in the ledger.
    pub async fn ledger_stats(&self) -> Result<Vec<PairStats>, ScanError> {
        let rows = self.ledger.records(&LedgerQuery::all()).await?;
        Ok(pair_stats(&rows))
    }
}
