//! In-memory storage backend.
//!
//! Keeps scan cursors and ledger rows in RAM. Useful for tests, dry runs and
//! short-lived scans that don't need persistence.

use async_trait::async_trait;

use affscan_core::{
    AppendOutcome, CanonicalTransaction, LedgerQuery, LedgerSink, MemoryLedger,
    MemoryProgressStore, ProgressStore, ScanError, ScanProgress,
};

/// In-memory cursors + ledger behind one handle.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    progress: MemoryProgressStore,
    ledger: MemoryLedger,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ledger rows.
    pub fn ledger_len(&self) -> usize {
        self.ledger.len()
    }
}

#[async_trait]
impl ProgressStore for InMemoryStorage {
    async fn get(&self, protocol: &str, chain: &str) -> Result<Option<ScanProgress>, ScanError> {
        self.progress.get(protocol, chain).await
    }

    async fn advance(
        &self,
        protocol: &str,
        chain: &str,
        expected: Option<u64>,
        new_last_block: u64,
    ) -> Result<ScanProgress, ScanError> {
        self.progress.advance(protocol, chain, expected, new_last_block).await
    }

    async fn reset(&self, protocol: &str, chain: &str, to: Option<u64>) -> Result<(), ScanError> {
        self.progress.reset(protocol, chain, to).await
    }

    async fn list(&self) -> Result<Vec<ScanProgress>, ScanError> {
        self.progress.list().await
    }
}

#[async_trait]
impl LedgerSink for InMemoryStorage {
    async fn append(&self, records: &[CanonicalTransaction]) -> Result<AppendOutcome, ScanError> {
        self.ledger.append(records).await
    }

    async fn records(&self, query: &LedgerQuery) -> Result<Vec<CanonicalTransaction>, ScanError> {
        self.ledger.records(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use affscan_core::testing::sample_transaction;

    #[tokio::test]
    async fn cursor_and_ledger_share_one_handle() {
        let store = InMemoryStorage::new();
        store
            .append(&[sample_transaction("portals", "ethereum", "0xaa", 0, 100)])
            .await
            .unwrap();
        store.advance("portals", "ethereum", None, 100).await.unwrap();

        assert_eq!(store.ledger_len(), 1);
        let p = store.get("portals", "ethereum").await.unwrap().unwrap();
        assert_eq!(p.last_processed_block, 100);
    }

    #[tokio::test]
    async fn reset_rewinds_cursor_only() {
        let store = InMemoryStorage::new();
        store
            .append(&[sample_transaction("portals", "ethereum", "0xaa", 0, 100)])
            .await
            .unwrap();
        store.advance("portals", "ethereum", None, 150).await.unwrap();

        store.reset("portals", "ethereum", Some(90)).await.unwrap();
        assert_eq!(
            store.get("portals", "ethereum").await.unwrap().unwrap().last_processed_block,
            90
        );
        store.reset("portals", "ethereum", None).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(store.ledger_len(), 1);
    }
}
