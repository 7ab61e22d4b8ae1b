//! HTTP JSON-RPC `ChainClient` for EVM chains, backed by `reqwest`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use affscan_core::{ChainClient, LogFilter, RawRecord, ScanError};

use crate::log::{parse_hex_u64, record_from_value};
use crate::rpc::{classify_rpc_error, classify_transport, JsonRpcRequest, JsonRpcResponse};

/// Configuration for `HttpEvmClient`.
#[derive(Debug, Clone)]
pub struct EvmClientConfig {
    /// Largest `to - from` sent in one `eth_getLogs`.
    pub max_range: u64,
    pub request_timeout: Duration,
}

impl Default for EvmClientConfig {
    fn default() -> Self {
        Self {
            max_range: 2_000,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Read-only EVM JSON-RPC client.
///
/// Retries are left to the scanner; every failure is classified into a
/// `ScanError` so the scanner knows whether retrying can help.
pub struct HttpEvmClient {
    chain: String,
    url: String,
    http: reqwest::Client,
    max_range: u64,
    next_id: AtomicU64,
}

impl HttpEvmClient {
    /// Create a client for `url`. Invalid URLs are a `FatalConfig`.
    pub fn new(chain: impl Into<String>, url: impl Into<String>, config: EvmClientConfig) -> Result<Self, ScanError> {
        let url = url.into();
        reqwest::Url::parse(&url)
            .map_err(|e| ScanError::FatalConfig(format!("invalid RPC url '{url}': {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ScanError::FatalConfig(format!("building HTTP client: {e}")))?;
        Ok(Self {
            chain: chain.into(),
            url,
            http,
            max_range: config.max_range,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: Vec<Value>, range: Option<(u64, u64)>) -> Result<Value, ScanError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = resp.text().await.unwrap_or_default();
            return Err(ScanError::from_http_status(status.as_u16(), retry_after.as_deref(), &body));
        }

        let body: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| ScanError::TransientNetwork(format!("{method}: unreadable response: {e}")))?;
        body.into_result()
            .map_err(|e| classify_rpc_error(&e, range, self.max_range))
    }

    fn quantity(value: &Value, what: &str) -> Result<u64, ScanError> {
        let s = value
            .as_str()
            .ok_or_else(|| ScanError::TransientNetwork(format!("{what}: expected a hex string, got {value}")))?;
        parse_hex_u64(s).map_err(|e| ScanError::TransientNetwork(format!("{what}: {e}")))
    }
}

/// `eth_getLogs` filter object.
pub fn logs_params(from: u64, to: u64, filter: &LogFilter) -> Value {
    let mut params = json!({
        "fromBlock": format!("0x{from:x}"),
        "toBlock": format!("0x{to:x}"),
    });
    if !filter.addresses.is_empty() {
        params["address"] = json!(filter.addresses);
    }
    if !filter.topic0_values.is_empty() {
        params["topics"] = json!([filter.topic0_values]);
    }
    params
}

#[async_trait]
impl ChainClient for HttpEvmClient {
    fn chain(&self) -> &str {
        &self.chain
    }

    fn max_range(&self) -> u64 {
        self.max_range
    }

    async fn latest_block(&self) -> Result<u64, ScanError> {
        let v = self.call("eth_blockNumber", vec![], None).await?;
        Self::quantity(&v, "eth_blockNumber")
    }

    async fn get_logs(&self, from: u64, to: u64, filter: &LogFilter) -> Result<Vec<RawRecord>, ScanError> {
        if to < from {
            return Ok(Vec::new());
        }
        if to - from > self.max_range {
            return Err(ScanError::RangeTooLarge {
                from,
                to,
                max_range: self.max_range,
            });
        }

        let v = self
            .call("eth_getLogs", vec![logs_params(from, to, filter)], Some((from, to)))
            .await?;
        let logs = match v {
            Value::Array(logs) => logs,
            other => {
                return Err(ScanError::TransientNetwork(format!("eth_getLogs: expected an array, got {other}")))
            }
        };
        debug!(chain = %self.chain, from, to, logs = logs.len(), "eth_getLogs");

        Ok(logs
            .into_iter()
            .map(|l| record_from_value(l, &self.chain, from))
            .collect())
    }

    async fn block_timestamp(&self, height: u64) -> Result<i64, ScanError> {
        let v = self
            .call("eth_getBlockByNumber", vec![json!(format!("0x{height:x}")), json!(false)], None)
            .await?;
        if v.is_null() {
            return Err(ScanError::TransientNetwork(format!("block {height} not available yet")));
        }
        Self::quantity(&v["timestamp"], "block timestamp").map(|ts| ts as i64)
    }
}
