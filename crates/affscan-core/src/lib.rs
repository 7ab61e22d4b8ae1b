//! affscan-core: foundation for the multi-chain affiliate-fee ingestion engine.
//!
//! # Architecture
//!
//! ```text
//! EngineConfig → Orchestrator
//!                    ├── ChainScanner × (protocol, chain)
//!                    │       ├── ChainClient      (EVM JSON-RPC / Midgard REST)
//!                    │       ├── EventDecoder     (raw record → CanonicalTransaction)
//!                    │       ├── FeeValidator     (actual vs expected bps)
//!                    │       ├── PriceSource      (optional USD values)
//!                    │       └── ProgressTracker  (compare-and-set cursor)
//!                    └── Consolidator → LedgerSink (deduplicated, append-only)
//! ```
//!
//! Chain-specific clients and decoders live in `affscan-evm` and
//! `affscan-midgard`; durable storage lives in `affscan-storage`.

pub mod client;
pub mod config;
pub mod consolidator;
pub mod decoder;
pub mod error;
pub mod fee;
pub mod orchestrator;
pub mod precision;
pub mod price;
pub mod progress;
pub mod retry;
pub mod scanner;
pub mod sink;
pub mod testing;
pub mod types;

pub use client::{split_range, CachedTimestamps, ChainClient};
pub use config::{DecoderSpec, EndpointConfig, EngineConfig, LogConfig, ScanPlan, StorageBackend};
pub use consolidator::{Consolidation, Consolidator, PairStats};
pub use decoder::{DecodedSwap, EventDecoder};
pub use error::ScanError;
pub use fee::{FeeConversion, FeeValidator};
pub use orchestrator::{Orchestrator, RunSummary, ScannerJob, ScannerReport};
pub use precision::{AssetPrecisions, Precision, ScaledAmount};
pub use price::{NoPrices, PriceSource, StaticPrices};
pub use progress::{MemoryProgressStore, ProgressStore, ProgressTracker, ScanProgress};
pub use retry::{RetryConfig, RetryPolicy};
pub use scanner::{CancellationFlag, ChainScanner, ScanOutcome, ScanResult, ScanWindow, ScannerState};
pub use sink::{AppendOutcome, LedgerQuery, LedgerSink, MemoryLedger};
pub use types::{
    CanonicalTransaction, ChainContext, DedupKey, LogFilter, RawPayload, RawRecord, RecordFlags,
    UnscaledAmounts,
};
