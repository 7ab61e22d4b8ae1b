//! Engine configuration.
//!
//! Loaded from YAML or JSON (by file extension) and passed by value into each
//! run, so a long-lived process can reload it between runs.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::price::StaticPrices;
use crate::retry::RetryConfig;
use crate::scanner::ScanWindow;
use crate::types::ChainContext;

// ─── Logging / storage ────────────────────────────────────────────────────────

/// Log level per component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per component: component_name → level
    #[serde(default)]
    pub components: BTreeMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: BTreeMap::new(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Database file for the `sqlite` backend.
    #[serde(default)]
    pub path: Option<String>,
}

// ─── Endpoints ────────────────────────────────────────────────────────────────

/// One chain endpoint, keyed by chain name in `EngineConfig::chains`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EndpointConfig {
    /// EVM JSON-RPC over HTTP.
    Evm {
        rpc_url: String,
        #[serde(default = "default_evm_max_range")]
        max_range: u64,
        /// Decimals of the native coin (used for the zero / `0xeee…` sentinels).
        #[serde(default)]
        native_decimals: Option<u32>,
        /// Token address → decimals.
        #[serde(default)]
        assets: BTreeMap<String, u32>,
        #[serde(default = "default_timeout_ms")]
        request_timeout_ms: u64,
    },
    /// Midgard-style REST explorer.
    Midgard {
        base_url: String,
        #[serde(default = "default_page_size")]
        page_size: u32,
        #[serde(default = "default_midgard_max_range")]
        max_range: u64,
        #[serde(default = "default_timeout_ms")]
        request_timeout_ms: u64,
    },
}

fn default_evm_max_range() -> u64 { 2_000 }
fn default_midgard_max_range() -> u64 { 10_000 }
fn default_page_size() -> u32 { 50 }
fn default_timeout_ms() -> u64 { 30_000 }

impl EndpointConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Evm { .. } => "evm",
            Self::Midgard { .. } => "midgard",
        }
    }
}

// ─── Protocols ────────────────────────────────────────────────────────────────

/// Which decoder family a protocol uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DecoderSpec {
    /// `AffiliateSwap` router events on EVM chains.
    EvmAffiliateSwap {
        /// Override of the event's topic0.
        #[serde(default)]
        topic0: Option<String>,
    },
    /// Swap actions from a Midgard explorer.
    MidgardSwap {
        /// Affiliate codes the explorer filters by (e.g. THORNames).
        #[serde(default)]
        affiliate_codes: Vec<String>,
    },
}

impl DecoderSpec {
    /// Endpoint kind this decoder understands.
    pub fn endpoint_kind(&self) -> &'static str {
        match self {
            Self::EvmAffiliateSwap { .. } => "evm",
            Self::MidgardSwap { .. } => "midgard",
        }
    }
}

/// Per-chain settings of a protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolChainConfig {
    pub chain: String,
    pub deployment_block: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_confirmation_lag")]
    pub confirmation_lag: u64,
    /// Emitting contract (EVM decoders).
    #[serde(default)]
    pub contract: Option<String>,
}

fn default_chunk_size() -> u64 { 1_000 }
fn default_confirmation_lag() -> u64 { 12 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub name: String,
    pub expected_fee_bps: i64,
    #[serde(default)]
    pub affiliate_addresses: Vec<String>,
    pub decoder: DecoderSpec,
    pub chains: Vec<ProtocolChainConfig>,
}

// ─── EngineConfig ─────────────────────────────────────────────────────────────

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "default_tolerance_bps")]
    pub fee_tolerance_bps: i64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub retry: RetryConfig,
    /// chain name → endpoint
    pub chains: BTreeMap<String, EndpointConfig>,
    /// asset → USD per native unit
    #[serde(default)]
    pub prices: BTreeMap<String, Decimal>,
    pub protocols: Vec<ProtocolConfig>,
}

fn default_tolerance_bps() -> i64 { 1 }
fn default_max_concurrency() -> usize { 4 }

/// Everything needed to build one scanner.
#[derive(Debug, Clone)]
pub struct ScanPlan {
    pub context: ChainContext,
    pub window: ScanWindow,
    pub decoder: DecoderSpec,
    pub contract: Option<String>,
}

impl EngineConfig {
    /// Load from a `.yaml`/`.yml` or `.json` file and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScanError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ScanError::FatalConfig(format!("reading {}: {e}", path.display())))?;
        let is_json = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_yaml_str(&text)
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ScanError> {
        let cfg: Self = serde_yaml::from_str(text)
            .map_err(|e| ScanError::FatalConfig(format!("invalid YAML config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ScanError> {
        let cfg: Self = serde_json::from_str(text)
            .map_err(|e| ScanError::FatalConfig(format!("invalid JSON config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that would make scanners misbehave.
    pub fn validate(&self) -> Result<(), ScanError> {
        let fatal = |msg: String| Err(ScanError::FatalConfig(msg));

        if self.max_concurrency == 0 {
            return fatal("max_concurrency must be at least 1".into());
        }
        if self.fee_tolerance_bps < 0 {
            return fatal("fee_tolerance_bps must not be negative".into());
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.path.is_none() {
            return fatal("storage.path is required for the sqlite backend".into());
        }

        let mut pairs = HashSet::new();
        for protocol in &self.protocols {
            if protocol.name.trim().is_empty() {
                return fatal("protocol name must not be empty".into());
            }
            if protocol.chains.is_empty() {
                return fatal(format!("protocol '{}' has no chains", protocol.name));
            }
            if protocol.expected_fee_bps < 0 {
                return fatal(format!("protocol '{}' has a negative expected_fee_bps", protocol.name));
            }
            for chain in &protocol.chains {
                let Some(endpoint) = self.chains.get(&chain.chain) else {
                    return fatal(format!(
                        "protocol '{}' references undeclared chain '{}'",
                        protocol.name, chain.chain
                    ));
                };
                if endpoint.kind() != protocol.decoder.endpoint_kind() {
                    return fatal(format!(
                        "protocol '{}' uses a {} decoder on {} chain '{}'",
                        protocol.name,
                        protocol.decoder.endpoint_kind(),
                        endpoint.kind(),
                        chain.chain
                    ));
                }
                if chain.chunk_size == 0 {
                    return fatal(format!(
                        "{}/{}: chunk_size must be at least 1",
                        protocol.name, chain.chain
                    ));
                }
                if matches!(protocol.decoder, DecoderSpec::EvmAffiliateSwap { .. })
                    && chain.contract.is_none()
                {
                    return fatal(format!(
                        "{}/{}: EVM decoders need a contract address",
                        protocol.name, chain.chain
                    ));
                }
                if !pairs.insert((protocol.name.as_str(), chain.chain.as_str())) {
                    return fatal(format!(
                        "duplicate scanner for {}/{}",
                        protocol.name, chain.chain
                    ));
                }
            }
        }
        Ok(())
    }

    /// One plan per configured (protocol, chain) pair, in config order.
    pub fn scan_plans(&self) -> Vec<ScanPlan> {
        self.protocols
            .iter()
            .flat_map(|p| {
                p.chains.iter().map(move |c| ScanPlan {
                    context: ChainContext {
                        protocol: p.name.clone(),
                        chain: c.chain.clone(),
                        expected_fee_bps: p.expected_fee_bps,
                        affiliate_addresses: p.affiliate_addresses.clone(),
                    },
                    window: ScanWindow {
                        deployment_block: c.deployment_block,
                        chunk_size: c.chunk_size,
                        confirmation_lag: c.confirmation_lag,
                    },
                    decoder: p.decoder.clone(),
                    contract: c.contract.clone(),
                })
            })
            .collect()
    }

    pub fn static_prices(&self) -> StaticPrices {
        StaticPrices::new(self.prices.iter().map(|(k, v)| (k.clone(), *v)))
    }
}
