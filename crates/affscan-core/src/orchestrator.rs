//! `Orchestrator` runs every configured scanner, then consolidates.
//!
//! Scanners run as Tokio tasks, at most `max_concurrency` at a time. Jobs that
//! share an endpoint take turns so a single provider is never hit by two
//! scanners at once. A failing scanner never stops the others.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::consolidator::{Consolidation, Consolidator};
use crate::error::ScanError;
use crate::scanner::{CancellationFlag, ChainScanner, ScanOutcome, ScanResult};
use crate::sink::LedgerSink;

/// One scanner plus the endpoint it talks to.
pub struct ScannerJob {
    pub scanner: ChainScanner,
    /// Endpoint key (usually the chain name); jobs sharing it run one at a time.
    pub endpoint: String,
}

impl ScannerJob {
    pub fn new(scanner: ChainScanner, endpoint: impl Into<String>) -> Self {
        Self {
            scanner,
            endpoint: endpoint.into(),
        }
    }
}

/// Per-scanner line of a run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerReport {
    pub protocol: String,
    pub chain: String,
    pub blocks_scanned: u64,
    pub records_found: usize,
    pub records_ingested: usize,
    pub records_ignored: u64,
    pub skipped: BTreeMap<String, u64>,
    pub retries: u64,
    pub final_cursor: Option<u64>,
    pub caught_up: bool,
    pub outcome: ScanOutcome,
}

impl From<&ScanResult> for ScannerReport {
    fn from(r: &ScanResult) -> Self {
        Self {
            protocol: r.protocol.clone(),
            chain: r.chain.clone(),
            blocks_scanned: r.blocks_scanned,
            records_found: r.records_found(),
            records_ingested: r.records_ingested,
            records_ignored: r.records_ignored,
            skipped: r.skipped.clone(),
            retries: r.retries,
            final_cursor: r.final_cursor,
            caught_up: r.caught_up,
            outcome: r.outcome.clone(),
        }
    }
}

/// Result of one orchestrated run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub scanners: Vec<ScannerReport>,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub records_ingested: usize,
    pub consolidation: Consolidation,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}

/// Runs scanner jobs concurrently and merges their output.
pub struct Orchestrator {
    ledger: Arc<dyn LedgerSink>,
    max_concurrency: usize,
    cancel: CancellationFlag,
}

impl Orchestrator {
    pub fn new(ledger: Arc<dyn LedgerSink>, max_concurrency: usize) -> Self {
        Self {
            ledger,
            max_concurrency: max_concurrency.max(1),
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle that stops every scanner of this orchestrator between chunks.
    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    /// Run all jobs to completion, then consolidate.
    ///
    /// Only setup errors (duplicate jobs) and ledger failures during
    /// consolidation are returned as `Err`; scanner failures are reported in
    /// the summary.
    pub async fn run(&self, jobs: Vec<ScannerJob>) -> Result<RunSummary, ScanError> {
        let mut pairs = HashSet::new();
        for job in &jobs {
            let ctx = job.scanner.context();
            if !pairs.insert((ctx.protocol.clone(), ctx.chain.clone())) {
                return Err(ScanError::FatalConfig(format!(
                    "two scanners configured for {}/{}",
                    ctx.protocol, ctx.chain
                )));
            }
        }

        info!(scanners = jobs.len(), max_concurrency = self.max_concurrency, "run starting");

        let slots = Arc::new(Semaphore::new(self.max_concurrency));
        let mut endpoints: HashMap<String, Arc<Semaphore>> = HashMap::new();
        let mut handles = Vec::with_capacity(jobs.len());

        for job in jobs {
            let ctx = job.scanner.context().clone();
            let endpoint = endpoints
                .entry(job.endpoint.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone();
            let slots = Arc::clone(&slots);
            let mut scanner = job.scanner.with_cancellation(self.cancel.clone());

            let handle = tokio::spawn(async move {
                // Endpoint first: a job waiting for its provider must not hold a global slot.
                let _endpoint = endpoint.acquire_owned().await;
                let _slot = slots.acquire_owned().await;
                scanner.run().await
            });
            handles.push((ctx, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        let joined = futures::future::join_all(handles.into_iter().map(|(ctx, h)| async move {
            (ctx, h.await)
        }))
        .await;
        for (ctx, joined) in joined {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!(protocol = %ctx.protocol, chain = %ctx.chain, error = %e, "scanner task aborted");
                    let mut result = ScanResult::empty(&ctx);
                    result.outcome = ScanOutcome::Failed {
                        code: "task_aborted".to_string(),
                        reason: e.to_string(),
                    };
                    results.push(result);
                }
            }
        }

        let consolidation = Consolidator::new(Arc::clone(&self.ledger)).merge(&results).await?;
        let summary = summarize(&results, consolidation);

        for report in summary.scanners.iter().filter(|r| r.outcome.is_failed()) {
            warn!(
                protocol = %report.protocol,
                chain = %report.chain,
                outcome = ?report.outcome,
                cursor = ?report.final_cursor,
                "scanner did not complete"
            );
        }
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            ingested = summary.records_ingested,
            unique = summary.consolidation.unique_records,
            "run complete"
        );
        Ok(summary)
    }
}

fn summarize(results: &[ScanResult], consolidation: Consolidation) -> RunSummary {
    let scanners: Vec<ScannerReport> = results.iter().map(ScannerReport::from).collect();
    let count = |f: fn(&ScanOutcome) -> bool| scanners.iter().filter(|r| f(&r.outcome)).count();
    RunSummary {
        succeeded: count(|o| matches!(o, ScanOutcome::Completed)),
        failed: count(ScanOutcome::is_failed),
        cancelled: count(|o| matches!(o, ScanOutcome::Cancelled)),
        records_ingested: scanners.iter().map(|r| r.records_ingested).sum(),
        scanners,
        consolidation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ChainClient;
    use crate::progress::{MemoryProgressStore, ProgressStore};
    use crate::scanner::ScanWindow;
    use crate::sink::MemoryLedger;
    use crate::testing::{fixture_record, fixture_swap, FixtureDecoder, ScriptedChainClient};
    use crate::types::ChainContext;

    fn ctx(protocol: &str, chain: &str) -> ChainContext {
        ChainContext {
            protocol: protocol.into(),
            chain: chain.into(),
            expected_fee_bps: 55,
            affiliate_addresses: vec!["aff".into()],
        }
    }

    fn job(
        protocol: &str,
        client: ScriptedChainClient,
        progress: Arc<MemoryProgressStore>,
        ledger: Arc<MemoryLedger>,
    ) -> ScannerJob {
        let chain = client.chain().to_string();
        let scanner = ChainScanner::new(
            ctx(protocol, &chain),
            ScanWindow {
                deployment_block: 1,
                chunk_size: 10,
                confirmation_lag: 0,
            },
            Arc::new(client),
            Arc::new(FixtureDecoder),
            progress,
            ledger,
        );
        ScannerJob::new(scanner, chain)
    }

    #[tokio::test]
    async fn one_failing_scanner_does_not_stop_the_others() {
        let ledger = Arc::new(MemoryLedger::new());
        let progress = Arc::new(MemoryProgressStore::new());

        let healthy = ScriptedChainClient::new("alpha", 100)
            .with_blocks(1..=20)
            .with_record(fixture_record("alpha", 5, "0x01", 0, fixture_swap("aff")));
        let broken = ScriptedChainClient::new("beta", 100)
            .with_blocks(1..=20)
            .failing_latest_block([ScanError::FatalConfig("bad url".into())]);

        let orchestrator = Orchestrator::new(ledger.clone(), 2);
        let summary = orchestrator
            .run(vec![
                job("p", healthy, progress.clone(), ledger.clone()),
                job("p", broken, progress.clone(), ledger.clone()),
            ])
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.records_ingested, 1);
        assert_eq!(ledger.len(), 1);
        let beta = summary.scanners.iter().find(|r| r.chain == "beta").unwrap();
        assert!(matches!(&beta.outcome, ScanOutcome::Failed { code, .. } if code == "fatal_config"));
    }

    #[tokio::test]
    async fn duplicate_pairs_are_rejected() {
        let ledger = Arc::new(MemoryLedger::new());
        let progress = Arc::new(MemoryProgressStore::new());
        let a = ScriptedChainClient::new("alpha", 100).with_blocks(1..=2);
        let b = ScriptedChainClient::new("alpha", 100).with_blocks(1..=2);

        let err = Orchestrator::new(ledger.clone(), 1)
            .run(vec![
                job("p", a, progress.clone(), ledger.clone()),
                job("p", b, progress, ledger),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::FatalConfig(_)));
    }

    #[tokio::test]
    async fn cancelled_before_start_scans_nothing() {
        let ledger = Arc::new(MemoryLedger::new());
        let progress = Arc::new(MemoryProgressStore::new());
        let client = ScriptedChainClient::new("alpha", 100)
            .with_blocks(1..=20)
            .with_record(fixture_record("alpha", 5, "0x01", 0, fixture_swap("aff")));

        let orchestrator = Orchestrator::new(ledger.clone(), 1);
        orchestrator.cancellation().cancel();
        let summary = orchestrator
            .run(vec![job("p", client, progress.clone(), ledger.clone())])
            .await
            .unwrap();

        assert_eq!(summary.cancelled, 1);
        assert!(ledger.is_empty());
        assert!(progress.list().await.unwrap().is_empty());
    }
}
