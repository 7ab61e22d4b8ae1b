//! affscan-evm: EVM chain support for affscan.
//!
//! - [`HttpEvmClient`]: `ChainClient` over JSON-RPC (`eth_blockNumber`,
//!   `eth_getLogs`, `eth_getBlockByNumber`) with provider error classification.
//! - [`AffiliateSwapDecoder`]: turns router `AffiliateSwap` logs into
//!   canonical transactions.

pub mod client;
pub mod decoder;
pub mod log;
pub mod rpc;

pub use client::{EvmClientConfig, HttpEvmClient};
pub use decoder::{affiliate_swap_topic0, AffiliateSwapDecoder, AFFILIATE_SWAP_SIGNATURE};
pub use log::{parse_hex_u64, record_from_value, HexError, RawLog};
