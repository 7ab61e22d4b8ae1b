//! Midgard `/v2/actions` and `/v2/health` wire types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One page of `/v2/actions`. Actions are kept as raw JSON so the decoder
/// sees exactly what the API returned.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionsPage {
    #[serde(default)]
    pub actions: Vec<Value>,
    #[serde(default)]
    pub meta: Option<PageMeta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageMeta {
    #[serde(rename = "nextPageToken", default)]
    pub next_page_token: Option<String>,
}

impl ActionsPage {
    /// Token for the following page, if any.
    pub fn next_page(&self) -> Option<&str> {
        self.meta
            .as_ref()
            .and_then(|m| m.next_page_token.as_deref())
            .filter(|t| !t.is_empty())
    }
}

/// A swap (or other) action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status: String,
    /// Block height, as a decimal string.
    pub height: String,
    /// Nanoseconds since the epoch, as a decimal string.
    #[serde(default)]
    pub date: String,
    #[serde(rename = "in", default)]
    pub inputs: Vec<Transfer>,
    #[serde(rename = "out", default)]
    pub outputs: Vec<Transfer>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transfer {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub coins: Vec<Coin>,
    #[serde(rename = "txID", default)]
    pub tx_id: String,
}

/// An amount in 1e8 base units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coin {
    pub amount: String,
    pub asset: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub swap: Option<SwapMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwapMetadata {
    /// Affiliate name or address from the memo; empty when none.
    #[serde(rename = "affiliateAddress", default)]
    pub affiliate_address: String,
    /// Basis points requested in the memo.
    #[serde(rename = "affiliateFee", default)]
    pub affiliate_fee: String,
    #[serde(default)]
    pub memo: String,
}

/// Header fields the client needs before decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionHeader {
    pub height: Option<u64>,
    pub time: Option<i64>,
}

impl ActionHeader {
    /// Lenient extraction: anything unparsable is left for the decoder to reject.
    pub fn of(action: &Value) -> Self {
        Self {
            height: action["height"].as_str().and_then(|h| h.parse().ok()),
            time: action["date"]
                .as_str()
                .and_then(|d| d.parse::<i64>().ok())
                .map(|ns| ns / 1_000_000_000),
        }
    }

    /// `in[0].txID`, or empty.
    pub fn tx_id(action: &Value) -> String {
        action["in"][0]["txID"].as_str().unwrap_or_default().to_string()
    }
}

/// `/v2/health`, only the fields used to find the head.
#[derive(Debug, Clone, Deserialize)]
pub struct Health {
    #[serde(rename = "scannerHeight", default)]
    pub scanner_height: Option<Value>,
    #[serde(rename = "lastThorNode", default)]
    pub last_thor_node: Option<NodeHeight>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeHeight {
    pub height: Value,
}

fn as_height(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

impl Health {
    pub fn height(&self) -> Option<u64> {
        self.scanner_height
            .as_ref()
            .and_then(as_height)
            .or_else(|| self.last_thor_node.as_ref().and_then(|n| as_height(&n.height)))
    }
}
