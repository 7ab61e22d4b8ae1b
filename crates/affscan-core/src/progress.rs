//! Progress store: the per-(protocol, chain) scan cursor.
//!
//! The cursor is the highest block whose records are durably in the ledger.
//! It only moves through a compare-and-set `advance`, so two writers for the
//! same key cannot both succeed, and it only moves backwards through an
//! explicit `reset`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// A persisted scan cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanProgress {
    pub protocol: String,
    pub chain: String,
    pub last_processed_block: u64,
    /// Unix seconds of the last advance.
    pub updated_at: i64,
}

/// Storage for scan cursors.
///
/// Implementations: `MemoryProgressStore` (here) and `SqliteStorage`
/// (`affscan-storage`, feature `sqlite`).
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Load the cursor; `None` if the pair has never been scanned.
    async fn get(&self, protocol: &str, chain: &str) -> Result<Option<ScanProgress>, ScanError>;

    /// Move the cursor from `expected` to `new_last_block`.
    ///
    /// Fails with `ConcurrentModification` if the stored value is not
    /// `expected`. Panics if `new_last_block` does not move forward from
    /// `expected`; implementations call [`assert_forward`] first.
    async fn advance(
        &self,
        protocol: &str,
        chain: &str,
        expected: Option<u64>,
        new_last_block: u64,
    ) -> Result<ScanProgress, ScanError>;

    /// Explicit reprocessing request: set the cursor to `to`, or forget it.
    async fn reset(&self, protocol: &str, chain: &str, to: Option<u64>) -> Result<(), ScanError>;

    /// All cursors, ordered by (protocol, chain).
    async fn list(&self) -> Result<Vec<ScanProgress>, ScanError>;
}

/// Cursor regressions through `advance` are a caller bug, never a runtime condition.
pub fn assert_forward(protocol: &str, chain: &str, expected: Option<u64>, new_last_block: u64) {
    if let Some(prev) = expected {
        assert!(
            new_last_block > prev,
            "progress for {protocol}/{chain} must advance: {new_last_block} <= {prev}"
        );
    }
}

// ─── ProgressTracker ──────────────────────────────────────────────────────────

/// Binds a store to one (protocol, chain) key and remembers the value it last
/// observed, which becomes the `expected` side of the next compare-and-set.
pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    protocol: String,
    chain: String,
    observed: Option<u64>,
}

impl ProgressTracker {
    pub fn new(
        store: Arc<dyn ProgressStore>,
        protocol: impl Into<String>,
        chain: impl Into<String>,
    ) -> Self {
        Self {
            store,
            protocol: protocol.into(),
            chain: chain.into(),
            observed: None,
        }
    }

    /// Read the stored cursor and remember it.
    pub async fn load(&mut self) -> Result<Option<u64>, ScanError> {
        self.observed = self
            .store
            .get(&self.protocol, &self.chain)
            .await?
            .map(|p| p.last_processed_block);
        Ok(self.observed)
    }

    /// Last value read or written by this tracker.
    pub fn observed(&self) -> Option<u64> {
        self.observed
    }

    /// First block to scan: cursor + 1, or the deployment block.
    pub fn next_block(&self, deployment_block: u64) -> u64 {
        match self.observed {
            Some(last) => (last + 1).max(deployment_block),
            None => deployment_block,
        }
    }

    /// Compare-and-set the cursor to `new_last_block`.
    pub async fn commit(&mut self, new_last_block: u64) -> Result<(), ScanError> {
        let progress = self
            .store
            .advance(&self.protocol, &self.chain, self.observed, new_last_block)
            .await?;
        self.observed = Some(progress.last_processed_block);
        Ok(())
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// In-memory progress store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryProgressStore {
    data: Mutex<HashMap<(String, String), ScanProgress>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(protocol: &str, chain: &str) -> (String, String) {
        (protocol.to_string(), chain.to_string())
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn get(&self, protocol: &str, chain: &str) -> Result<Option<ScanProgress>, ScanError> {
        let data = self.data.lock().unwrap_or_else(|p| p.into_inner());
        Ok(data.get(&Self::key(protocol, chain)).cloned())
    }

    async fn advance(
        &self,
        protocol: &str,
        chain: &str,
        expected: Option<u64>,
        new_last_block: u64,
    ) -> Result<ScanProgress, ScanError> {
        assert_forward(protocol, chain, expected, new_last_block);

        let mut data = self.data.lock().unwrap_or_else(|p| p.into_inner());
        let key = Self::key(protocol, chain);
        let found = data.get(&key).map(|p| p.last_processed_block);
        if found != expected {
            return Err(ScanError::ConcurrentModification {
                protocol: protocol.to_string(),
                chain: chain.to_string(),
                expected,
                found,
            });
        }
        let progress = ScanProgress {
            protocol: protocol.to_string(),
            chain: chain.to_string(),
            last_processed_block: new_last_block,
            updated_at: chrono::Utc::now().timestamp(),
        };
        data.insert(key, progress.clone());
        Ok(progress)
    }

    async fn reset(&self, protocol: &str, chain: &str, to: Option<u64>) -> Result<(), ScanError> {
        let mut data = self.data.lock().unwrap_or_else(|p| p.into_inner());
        let key = Self::key(protocol, chain);
        match to {
            Some(block) => {
                data.insert(
                    key,
                    ScanProgress {
                        protocol: protocol.to_string(),
                        chain: chain.to_string(),
                        last_processed_block: block,
                        updated_at: chrono::Utc::now().timestamp(),
                    },
                );
            }
            None => {
                data.remove(&key);
            }
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ScanProgress>, ScanError> {
        let data = self.data.lock().unwrap_or_else(|p| p.into_inner());
        let mut all: Vec<ScanProgress> = data.values().cloned().collect();
        all.sort_by(|a, b| (&a.protocol, &a.chain).cmp(&(&b.protocol, &b.chain)));
        Ok(all)
    }
}
