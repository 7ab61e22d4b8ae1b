//! Midgard REST explorer as a `ChainClient`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use affscan_core::{ChainClient, LogFilter, RawPayload, RawRecord, ScanError};

use crate::action::{ActionHeader, ActionsPage, Health};

/// Configuration for `MidgardClient`.
#[derive(Debug, Clone)]
pub struct MidgardClientConfig {
    /// `limit` per `/v2/actions` page.
    pub page_size: u32,
    /// Largest `to - from` per `get_logs`.
    pub max_range: u64,
    pub request_timeout: Duration,
}

impl Default for MidgardClientConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_range: 10_000,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Read-only Midgard client.
pub struct MidgardClient {
    chain: String,
    base_url: String,
    http: reqwest::Client,
    config: MidgardClientConfig,
    /// Block times seen in actions, for `block_timestamp`.
    times: Mutex<HashMap<u64, i64>>,
}

impl MidgardClient {
    pub fn new(chain: impl Into<String>, base_url: impl Into<String>, config: MidgardClientConfig) -> Result<Self, ScanError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url)
            .map_err(|e| ScanError::FatalConfig(format!("invalid Midgard url '{base_url}': {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ScanError::FatalConfig(format!("building HTTP client: {e}")))?;
        Ok(Self {
            chain: chain.into(),
            base_url,
            http,
            config,
            times: Mutex::new(HashMap::new()),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ScanError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    ScanError::FatalConfig(format!("invalid request to {url}: {e}"))
                } else {
                    ScanError::TransientNetwork(e.to_string())
                }
            })?;

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
        resp.json()
            .await
            .map_err(|e| ScanError::TransientNetwork(format!("{path}: unreadable response: {e}")))
    }

    fn remember_time(&self, height: u64, time: i64) {
        self.times
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(height, time);
    }

    /// Turn the actions of one range into records. `log_index` is the
    /// ordinal among actions sharing a height and tx id, oldest first, so
    /// it does not depend on how the scanned range was chunked.
    fn records_from(&self, actions: Vec<Value>, from: u64) -> Vec<RawRecord> {
        // The API lists newest first.
        let mut staged: Vec<(u64, String, Option<i64>, Value)> = actions
            .into_iter()
            .rev()
            .map(|a| {
                let header = ActionHeader::of(&a);
                // Records without a usable height stay in range; the decoder rejects them.
                (header.height.unwrap_or(from), ActionHeader::tx_id(&a), header.time, a)
            })
            .collect();
        staged.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        let mut ordinals: BTreeMap<(u64, String), u32> = BTreeMap::new();
        staged
            .into_iter()
            .map(|(height, tx_id, time, body)| {
                if let Some(t) = time {
                    self.remember_time(height, t);
                }
                let ordinal = ordinals.entry((height, tx_id.clone())).or_insert(0);
                let log_index = *ordinal;
                *ordinal += 1;
                RawRecord {
                    chain: self.chain.clone(),
                    block_height: height,
                    block_time: time,
                    tx_id,
                    log_index,
                    emitter: self.base_url.clone(),
                    topics: Vec::new(),
                    payload: RawPayload::Json { body },
                    removed: false,
                }
            })
            .collect()
    }
}

#[async_trait]
impl ChainClient for MidgardClient {
    fn chain(&self) -> &str {
        &self.chain
    }

    fn max_range(&self) -> u64 {
        self.config.max_range
    }

    async fn latest_block(&self) -> Result<u64, ScanError> {
        let health: Health = self.get("/v2/health", &[]).await?;
        health
            .height()
            .ok_or_else(|| ScanError::TransientNetwork("health response has no height".into()))
    }

    async fn get_logs(&self, from: u64, to: u64, filter: &LogFilter) -> Result<Vec<RawRecord>, ScanError> {
        if to < from {
            return Ok(Vec::new());
        }
        if to - from > self.config.max_range {
            return Err(ScanError::RangeTooLarge {
                from,
                to,
                max_range: self.config.max_range,
            });
        }

        let mut query = vec![
            ("type", "swap".to_string()),
            ("fromHeight", from.to_string()),
            ("toHeight", to.to_string()),
            ("limit", self.config.page_size.to_string()),
        ];
        if !filter.affiliates.is_empty() {
            query.push(("affiliate", filter.affiliates.join(",")));
        }

        let mut actions = Vec::new();
        let mut token: Option<String> = None;
        let mut pages = 0u32;
        loop {
            let mut q = query.clone();
            if let Some(t) = &token {
                q.push(("nextPageToken", t.clone()));
            }
            let page: ActionsPage = self.get("/v2/actions", &q).await?;
            pages += 1;
            let next = page.next_page().map(str::to_string);
            let empty = page.actions.is_empty();
            actions.extend(page.actions);
            match next {
                Some(n) if !empty && token.as_deref() != Some(n.as_str()) => token = Some(n),
                _ => break,
            }
        }
        debug!(chain = %self.chain, from, to, pages, actions = actions.len(), "midgard actions");

        Ok(self.records_from(actions, from))
    }

    async fn block_timestamp(&self, height: u64) -> Result<i64, ScanError> {
        let cached = self.times.lock().unwrap_or_else(|p| p.into_inner()).get(&height).copied();
        if let Some(t) = cached {
            return Ok(t);
        }
        let page: ActionsPage = self
            .get(
                "/v2/actions",
                &[
                    ("fromHeight", height.to_string()),
                    ("toHeight", height.to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        page.actions
            .first()
            .map(ActionHeader::of)
            .and_then(|h| h.time)
            .ok_or_else(|| ScanError::TransientNetwork(format!("no block time known yet for height {height}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `responses` in order, one per connection; returns the base URL
    /// and a handle yielding the request lines received.
    async fn serve(responses: Vec<(u16, String)>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let text = String::from_utf8_lossy(&buf);
                seen.push(text.lines().next().unwrap_or_default().to_string());
                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
            }
            seen
        });
        (format!("http://{addr}"), handle)
    }

    fn action(height: u64, tx: &str, ns: i64) -> Value {
        json!({
            "type": "swap",
            "status": "success",
            "height": height.to_string(),
            "date": ns.to_string(),
            "in": [{ "address": "bc1sender", "txID": tx, "coins": [{ "asset": "BTC.BTC", "amount": "100000000" }] }],
            "out": [],
            "metadata": { "swap": { "affiliateAddress": "ss", "affiliateFee": "55" } }
        })
    }

    fn client(url: String) -> MidgardClient {
        MidgardClient::new("thorchain", url, MidgardClientConfig { max_range: 100, ..Default::default() }).unwrap()
    }

    #[tokio::test]
    async fn latest_block_from_health() {
        let (url, _h) = serve(vec![(200, json!({ "scannerHeight": "15000000" }).to_string())]).await;
        assert_eq!(client(url).latest_block().await.unwrap(), 15_000_000);
    }

    #[tokio::test]
    async fn follows_page_tokens_and_orders_oldest_first() {
        let page1 = json!({
            "actions": [action(12, "CC", 12_000_000_000), action(11, "AA", 11_000_000_000)],
            "meta": { "nextPageToken": "p2" }
        });
        let page2 = json!({
            "actions": [action(11, "AA", 11_000_000_000), action(10, "BB", 10_000_000_000)],
            "meta": { "nextPageToken": "" }
        });
        let (url, handle) = serve(vec![(200, page1.to_string()), (200, page2.to_string())]).await;
        let c = client(url);

        let filter = LogFilter::default().affiliates(["ss", "t"]);
        let records = c.get_logs(10, 20, &filter).await.unwrap();
        let keys: Vec<(u64, &str, u32)> = records
            .iter()
            .map(|r| (r.block_height, r.tx_id.as_str(), r.log_index))
            .collect();
        assert_eq!(keys, vec![(10, "BB", 0), (11, "AA", 0), (11, "AA", 1), (12, "CC", 0)]);
        assert_eq!(records[0].block_time, Some(10));

        let requests = handle.await.unwrap();
        assert!(requests[0].contains("fromHeight=10"));
        assert!(requests[0].contains("affiliate=ss%2Ct"));
        assert!(requests[1].contains("nextPageToken=p2"));

        // Block times seen in actions are served without another request.
        assert_eq!(c.block_timestamp(12).await.unwrap(), 12);
    }

    #[test]
    fn log_index_does_not_depend_on_range_split() {
        let c = client("http://127.0.0.1:9".into());
        // Newest first, as the API returns them.
        let actions = vec![
            action(12, "CC", 12_000_000_000),
            action(11, "AA", 11_000_000_000),
            action(11, "AA", 11_000_000_000),
            action(10, "BB", 10_000_000_000),
        ];
        let keys = |records: Vec<RawRecord>| -> Vec<(u64, String, u32)> {
            records.into_iter().map(|r| (r.block_height, r.tx_id, r.log_index)).collect()
        };

        let whole = keys(c.records_from(actions.clone(), 10));
        let mut split = keys(c.records_from(actions[3..].to_vec(), 10));
        split.extend(keys(c.records_from(actions[1..3].to_vec(), 11)));
        split.extend(keys(c.records_from(actions[..1].to_vec(), 12)));

        assert_eq!(whole, split);
        assert_eq!(
            whole,
            vec![
                (10, "BB".to_string(), 0),
                (11, "AA".to_string(), 0),
                (11, "AA".to_string(), 1),
                (12, "CC".to_string(), 0),
            ]
        );
    }

    #[tokio::test]
    async fn missing_block_time_is_retryable() {
        let (url, _h) = serve(vec![(200, json!({ "actions": [] }).to_string())]).await;
        let err = client(url).block_timestamp(77).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn range_is_checked_locally() {
        let c = client("http://127.0.0.1:9".into());
        assert!(matches!(
            c.get_logs(0, 101, &LogFilter::default()).await,
            Err(ScanError::RangeTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn rate_limit_and_server_errors_are_classified() {
        let (url, _h) = serve(vec![(429, "{}".into()), (502, "bad gateway".into())]).await;
        let c = client(url);
        assert!(matches!(c.latest_block().await, Err(ScanError::RateLimited { .. })));
        assert!(matches!(c.latest_block().await, Err(ScanError::TransientNetwork(_))));
    }
}
