//! Builds stores, clients, decoders and scanner jobs from an `EngineConfig`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;

use affscan_core::{
    AssetPrecisions, CachedTimestamps, CancellationFlag, ChainClient, ChainScanner, DecoderSpec,
    EndpointConfig, EngineConfig, EventDecoder, FeeValidator, LedgerSink, ProgressStore,
    RetryPolicy, ScanPlan, ScannerJob, StorageBackend,
};
use affscan_evm::{AffiliateSwapDecoder, EvmClientConfig, HttpEvmClient};
use affscan_midgard::{MidgardClient, MidgardClientConfig, MidgardSwapDecoder};
use affscan_storage::{InMemoryStorage, SqliteStorage};

/// Timestamps kept per client.
const TIMESTAMP_CACHE: usize = 10_000;

/// Cursor store and ledger, usually the same backend.
pub struct Stores {
    pub progress: Arc<dyn ProgressStore>,
    pub ledger: Arc<dyn LedgerSink>,
}

pub async fn open_stores(config: &EngineConfig) -> Result<Stores> {
    match config.storage.backend {
        StorageBackend::Memory => {
            let store = Arc::new(InMemoryStorage::new());
            Ok(Stores {
                progress: store.clone(),
                ledger: store,
            })
        }
        StorageBackend::Sqlite => {
            let Some(path) = config.storage.path.as_deref() else {
                bail!("storage.path is required for the sqlite backend");
            };
            let store = Arc::new(
                SqliteStorage::open(path)
                    .await
                    .with_context(|| format!("opening SQLite store at {path}"))?,
            );
            info!(path, "sqlite storage opened");
            Ok(Stores {
                progress: store.clone(),
                ledger: store,
            })
        }
    }
}

fn client_for(chain: &str, endpoint: &EndpointConfig) -> Result<Arc<dyn ChainClient>> {
    let client: Arc<dyn ChainClient> = match endpoint {
        EndpointConfig::Evm {
            rpc_url,
            max_range,
            request_timeout_ms,
            ..
        } => {
            let config = EvmClientConfig {
                max_range: *max_range,
                request_timeout: Duration::from_millis(*request_timeout_ms),
            };
            Arc::new(CachedTimestamps::new(
                HttpEvmClient::new(chain, rpc_url.as_str(), config)?,
                TIMESTAMP_CACHE,
            ))
        }
        EndpointConfig::Midgard {
            base_url,
            page_size,
            max_range,
            request_timeout_ms,
        } => {
            let config = MidgardClientConfig {
                page_size: *page_size,
                max_range: *max_range,
                request_timeout: Duration::from_millis(*request_timeout_ms),
            };
            Arc::new(CachedTimestamps::new(
                MidgardClient::new(chain, base_url.as_str(), config)?,
                TIMESTAMP_CACHE,
            ))
        }
    };
    Ok(client)
}

fn precisions(endpoint: &EndpointConfig) -> AssetPrecisions {
    match endpoint {
        EndpointConfig::Evm {
            native_decimals,
            assets,
            ..
        } => {
            let mut table = AssetPrecisions::new(*native_decimals);
            for (asset, decimals) in assets {
                table.insert(asset, *decimals);
            }
            table
        }
        EndpointConfig::Midgard { .. } => AssetPrecisions::default(),
    }
}

fn decoder_for(plan: &ScanPlan, endpoint: &EndpointConfig) -> Result<Arc<dyn EventDecoder>> {
    let decoder: Arc<dyn EventDecoder> = match &plan.decoder {
        DecoderSpec::EvmAffiliateSwap { topic0 } => {
            let Some(contract) = plan.contract.as_deref() else {
                bail!("{}/{}: EVM decoders need a contract address", plan.context.protocol, plan.context.chain);
            };
            let decoder = AffiliateSwapDecoder::new(contract, precisions(endpoint));
            match topic0 {
                Some(t) => Arc::new(decoder.with_topic0(t.as_str())),
                None => Arc::new(decoder),
            }
        }
        DecoderSpec::MidgardSwap { affiliate_codes } => {
            Arc::new(MidgardSwapDecoder::new(affiliate_codes.iter().cloned()))
        }
    };
    Ok(decoder)
}

/// One job per configured (protocol, chain) pair. Clients are shared by
/// every protocol on the same chain, and jobs are keyed by that chain so the
/// orchestrator never drives one endpoint from two scanners at once.
pub fn build_jobs(config: &EngineConfig, stores: &Stores, cancel: &CancellationFlag) -> Result<Vec<ScannerJob>> {
    let validator = FeeValidator::new(config.fee_tolerance_bps);
    let prices = Arc::new(config.static_prices());
    let retry = RetryPolicy::new(config.retry.clone());

    let mut clients: std::collections::BTreeMap<&str, Arc<dyn ChainClient>> = Default::default();
    let mut jobs = Vec::new();
    for plan in config.scan_plans() {
        let chain = plan.context.chain.clone();
        let Some((chain_key, endpoint)) = config.chains.get_key_value(&chain) else {
            bail!("{}/{chain}: undeclared chain", plan.context.protocol);
        };
        let client = match clients.get(chain_key.as_str()) {
            Some(c) => c.clone(),
            None => {
                let c = client_for(chain_key, endpoint)?;
                clients.insert(chain_key.as_str(), c.clone());
                c
            }
        };
        let decoder = decoder_for(&plan, endpoint)?;

        let scanner = ChainScanner::new(
            plan.context,
            plan.window,
            client,
            decoder,
            stores.progress.clone(),
            stores.ledger.clone(),
        )
        .with_validator(validator.clone())
        .with_prices(prices.clone())
        .with_retry(retry.clone())
        .with_cancellation(cancel.clone());

        jobs.push(ScannerJob::new(scanner, chain));
    }
    Ok(jobs)
}
