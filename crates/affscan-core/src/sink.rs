//! Append-only ledger of canonical transactions.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::ScanError;
use crate::types::{CanonicalTransaction, DedupKey};

/// Result of one `append` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Rows written by this call.
    pub inserted: usize,
    /// Rows whose dedup key already existed (left untouched).
    pub duplicates: usize,
}

/// Selects rows for read-back.
#[derive(Debug, Clone, Default)]
pub struct LedgerQuery {
    pub protocol: Option<String>,
    pub chain: Option<String>,
}

impl LedgerQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_pair(protocol: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            protocol: Some(protocol.into()),
            chain: Some(chain.into()),
        }
    }

    pub fn matches(&self, tx: &CanonicalTransaction) -> bool {
        self.protocol.as_deref().map_or(true, |p| p == tx.source_protocol)
            && self.chain.as_deref().map_or(true, |c| c == tx.chain)
    }
}

/// Durable, append-only ledger.
///
/// `append` is atomic per call: either every new row of the batch is written
/// or none is. Rows whose dedup key already exists are skipped (first write
/// wins). Implementations must tolerate concurrent appends from many scanners.
#[async_trait]
pub trait LedgerSink: Send + Sync {
    async fn append(&self, records: &[CanonicalTransaction]) -> Result<AppendOutcome, ScanError>;

    /// Rows matching `query`, ordered by (chain, block_height, tx_id, log_index).
    async fn records(&self, query: &LedgerQuery) -> Result<Vec<CanonicalTransaction>, ScanError>;

    /// Number of rows matching `query`.
    async fn count(&self, query: &LedgerQuery) -> Result<u64, ScanError> {
        Ok(self.records(query).await?.len() as u64)
    }
}

// ─── In-memory ledger ─────────────────────────────────────────────────────────

#[derive(Default)]
struct LedgerState {
    rows: Vec<CanonicalTransaction>,
    keys: HashSet<DedupKey>,
}

/// In-memory ledger for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LedgerSink for MemoryLedger {
    async fn append(&self, records: &[CanonicalTransaction]) -> Result<AppendOutcome, ScanError> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let mut outcome = AppendOutcome::default();
        for tx in records {
            if state.keys.insert(tx.dedup_key()) {
                state.rows.push(tx.clone());
                outcome.inserted += 1;
            } else {
                outcome.duplicates += 1;
            }
        }
        Ok(outcome)
    }

    async fn records(&self, query: &LedgerQuery) -> Result<Vec<CanonicalTransaction>, ScanError> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let mut rows: Vec<CanonicalTransaction> =
            state.rows.iter().filter(|tx| query.matches(tx)).cloned().collect();
        rows.sort_by(|a, b| {
            (&a.chain, a.block_height, &a.tx_id, a.log_index)
                .cmp(&(&b.chain, b.block_height, &b.tx_id, b.log_index))
        });
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_transaction;

    #[tokio::test]
    async fn first_write_wins() {
        let ledger = MemoryLedger::new();
        let original = sample_transaction("portals", "ethereum", "0xaa", 0, 105);
        let mut rewrite = original.clone();
        rewrite.recipient = "0xsomeoneelse".into();

        let first = ledger.append(&[original.clone()]).await.unwrap();
        let second = ledger.append(&[rewrite]).await.unwrap();
        assert_eq!(first, AppendOutcome { inserted: 1, duplicates: 0 });
        assert_eq!(second, AppendOutcome { inserted: 0, duplicates: 1 });

        let rows = ledger.records(&LedgerQuery::all()).await.unwrap();
        assert_eq!(rows, vec![original]);
    }

    #[tokio::test]
    async fn duplicates_within_one_batch() {
        let ledger = MemoryLedger::new();
        let tx = sample_transaction("portals", "ethereum", "0xaa", 0, 105);
        let other_log = sample_transaction("portals", "ethereum", "0xaa", 1, 105);
        let outcome = ledger.append(&[tx.clone(), tx, other_log]).await.unwrap();
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.duplicates, 1);
    }

    #[tokio::test]
    async fn query_by_pair() {
        let ledger = MemoryLedger::new();
        ledger
            .append(&[
                sample_transaction("portals", "ethereum", "0x01", 0, 10),
                sample_transaction("portals", "base", "0x02", 0, 11),
                sample_transaction("thorchain", "thorchain", "AB", 0, 12),
            ])
            .await
            .unwrap();
        let q = LedgerQuery::for_pair("portals", "base");
        assert_eq!(ledger.count(&q).await.unwrap(), 1);
        assert_eq!(ledger.count(&LedgerQuery::all()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn concurrent_appends_never_duplicate() {
        let ledger = std::sync::Arc::new(MemoryLedger::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let batch: Vec<_> = (0..50)
                    .map(|i| sample_transaction("portals", "ethereum", &format!("0x{i:02x}"), 0, i))
                    .collect();
                ledger.append(&batch).await.unwrap()
            }));
        }
        let mut inserted = 0;
        for h in handles {
            inserted += h.await.unwrap().inserted;
        }
        assert_eq!(inserted, 50);
        assert_eq!(ledger.len(), 50);
    }
}
