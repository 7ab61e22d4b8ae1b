//! affscan-midgard: Midgard-style explorer support for affscan.
//!
//! - [`MidgardClient`]: `ChainClient` over `/v2/health` and paginated
//!   `/v2/actions`, with 1e8 base-unit actions kept as raw JSON.
//! - [`MidgardSwapDecoder`]: swap actions with an affiliate payout (or an
//!   affiliate named in the memo) → canonical transactions.

pub mod action;
pub mod client;
pub mod decoder;

pub use action::{Action, ActionsPage, Coin, Health, Transfer};
pub use client::{MidgardClient, MidgardClientConfig};
pub use decoder::{MidgardSwapDecoder, MIDGARD_DECIMALS};
