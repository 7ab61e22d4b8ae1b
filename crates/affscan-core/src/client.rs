//! The `ChainClient` trait: read-only access to one chain endpoint.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::ScanError;
use crate::types::{LogFilter, RawRecord};

/// Read-only RPC/API surface of a single chain.
///
/// Implementations contain every chain-specific quirk (topic encoding,
/// pagination tokens, error code mapping). `get_logs` must reject ranges with
/// `to - from > max_range()`; callers chunk with [`split_range`].
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Chain slug this client talks to (e.g. `"ethereum"`).
    fn chain(&self) -> &str;

    /// Largest `to - from` accepted by `get_logs`.
    fn max_range(&self) -> u64;

    /// Current head height.
    async fn latest_block(&self) -> Result<u64, ScanError>;

    /// All records in `[from, to]` matching `filter`.
    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<RawRecord>, ScanError>;

    /// Unix timestamp of block `height`.
    async fn block_timestamp(&self, height: u64) -> Result<i64, ScanError>;
}

/// Split `[from, to]` into contiguous, non-overlapping ranges whose span
/// (`end - start`) never exceeds `max_range`.
pub fn split_range(from: u64, to: u64, max_range: u64) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    if to < from {
        return ranges;
    }
    let mut start = from;
    loop {
        let end = start.saturating_add(max_range).min(to);
        ranges.push((start, end));
        if end == to {
            break;
        }
        start = end + 1;
    }
    ranges
}

// ─── Timestamp cache ──────────────────────────────────────────────────────────

/// Wraps a client and memoises `block_timestamp`; finalized block times never change.
pub struct CachedTimestamps<C> {
    inner: C,
    cache: Mutex<HashMap<u64, i64>>,
    capacity: usize,
}

impl<C: ChainClient> CachedTimestamps<C> {
    pub fn new(inner: C, capacity: usize) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    fn cached(&self, height: u64) -> Option<i64> {
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&height)
            .copied()
    }

    fn remember(&self, height: u64, ts: i64) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        if cache.len() >= self.capacity {
            // Scans move forward; the lowest heights are the least useful.
            let mut heights: Vec<u64> = cache.keys().copied().collect();
            heights.sort_unstable();
            for h in heights.into_iter().take(self.capacity / 2 + 1) {
                cache.remove(&h);
            }
        }
        cache.insert(height, ts);
    }
}

#[async_trait]
impl<C: ChainClient> ChainClient for CachedTimestamps<C> {
    fn chain(&self) -> &str {
        self.inner.chain()
    }

    fn max_range(&self) -> u64 {
        self.inner.max_range()
    }

    async fn latest_block(&self) -> Result<u64, ScanError> {
        self.inner.latest_block().await
    }

    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<RawRecord>, ScanError> {
        self.inner.get_logs(from, to, filter).await
    }

    async fn block_timestamp(&self, height: u64) -> Result<i64, ScanError> {
        if let Some(ts) = self.cached(height) {
            return Ok(ts);
        }
        let ts = self.inner.block_timestamp(height).await?;
        self.remember(height, ts);
        Ok(ts)
    }
}
