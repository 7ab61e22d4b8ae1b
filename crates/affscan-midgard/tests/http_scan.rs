//! Scanner + `MidgardClient` against a local Midgard-style server.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use affscan_core::{
    ChainContext, ChainScanner, DedupKey, FeeValidator, LedgerQuery, LedgerSink, MemoryLedger,
    MemoryProgressStore, ScanOutcome, ScanWindow,
};
use affscan_midgard::{MidgardClient, MidgardClientConfig, MidgardSwapDecoder};

const AFFILIATE: &str = "thor1affiliate";
const HEAD: u64 = 1_012;

fn swap(height: u64, tx: &str, fee_units: u64) -> Value {
    json!({
        "type": "swap",
        "status": "success",
        "height": height.to_string(),
        "date": (1_700_000_000_000_000_000i64 + height as i64 * 6_000_000_000).to_string(),
        "in": [{ "address": "bc1sender", "txID": tx, "coins": [{ "asset": "BTC.BTC", "amount": "100000000" }] }],
        "out": [
            { "address": "0xrecipient", "txID": "OUT", "coins": [{ "asset": "ETH.ETH", "amount": "1500000000" }] },
            { "address": AFFILIATE, "txID": "", "coins": [{ "asset": "BTC.BTC", "amount": fee_units.to_string() }] }
        ],
        "metadata": { "swap": { "affiliateAddress": "t", "affiliateFee": "55" } }
    })
}

/// Oldest first; the server answers newest first like Midgard does.
fn chain_actions() -> Vec<Value> {
    vec![
        swap(1_003, "AA", 550_000),
        // Two legs of one inbound tx in the same block.
        swap(1_007, "BB", 550_000),
        swap(1_007, "BB", 560_000),
        swap(1_010, "CC", 550_000),
    ]
}

fn query_param(request_line: &str, name: &str) -> Option<u64> {
    let target = request_line.split_whitespace().nth(1)?;
    let (_, query) = target.split_once('?')?;
    query
        .split('&')
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| *k == name)
        .and_then(|(_, v)| v.parse().ok())
}

fn answer(request_line: &str) -> Value {
    if request_line.contains("/v2/health") {
        return json!({ "scannerHeight": HEAD.to_string() });
    }
    let from = query_param(request_line, "fromHeight").unwrap_or(0);
    let to = query_param(request_line, "toHeight").unwrap_or(u64::MAX);
    let actions: Vec<Value> = chain_actions()
        .into_iter()
        .rev()
        .filter(|a| {
            let h: u64 = a["height"].as_str().and_then(|h| h.parse().ok()).unwrap_or(0);
            (from..=to).contains(&h)
        })
        .collect();
    json!({ "actions": actions, "meta": { "nextPageToken": "" } })
}

/// Answer GET requests, one per connection, until the test ends.
async fn serve_midgard() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
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
            let text = String::from_utf8_lossy(&buf).to_string();
            let body = answer(text.lines().next().unwrap_or_default()).to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        }
    });
    format!("http://{addr}")
}

fn scanner(url: &str, chunk_size: u64, ledger: Arc<MemoryLedger>) -> ChainScanner {
    let client = MidgardClient::new("thorchain", url, MidgardClientConfig::default()).unwrap();
    ChainScanner::new(
        ChainContext {
            protocol: "thorswap".into(),
            chain: "thorchain".into(),
            expected_fee_bps: 55,
            affiliate_addresses: vec![AFFILIATE.into()],
        },
        ScanWindow {
            deployment_block: 1_000,
            chunk_size,
            confirmation_lag: 0,
        },
        Arc::new(client),
        Arc::new(MidgardSwapDecoder::new(["t"])),
        Arc::new(MemoryProgressStore::new()),
        ledger,
    )
    .with_validator(FeeValidator::new(1))
}

async fn ledger_keys(ledger: &MemoryLedger) -> Vec<DedupKey> {
    let mut keys: Vec<DedupKey> = ledger
        .records(&LedgerQuery::all())
        .await
        .unwrap()
        .iter()
        .map(|r| r.dedup_key())
        .collect();
    keys.sort();
    keys
}

#[tokio::test]
async fn rescan_with_other_chunk_size_adds_nothing() {
    let url = serve_midgard().await;
    let ledger = Arc::new(MemoryLedger::new());

    let first = scanner(&url, 10, ledger.clone()).run().await;
    assert_eq!(first.outcome, ScanOutcome::Completed);
    assert_eq!(first.final_cursor, Some(HEAD));
    assert_eq!(first.records_ingested, 4);
    let keys = ledger_keys(&ledger).await;
    assert_eq!(
        keys.iter().map(|k| (k.tx_id.as_str(), k.log_index)).collect::<Vec<_>>(),
        vec![("AA", 0), ("BB", 0), ("BB", 1), ("CC", 0)]
    );

    // Fresh cursor, one block per chunk: every action maps to the same key.
    let second = scanner(&url, 1, ledger.clone()).run().await;
    assert_eq!(second.outcome, ScanOutcome::Completed);
    assert_eq!(second.records_found(), 4);
    assert_eq!(second.records_ingested, 0);
    assert_eq!(ledger.len(), 4);
    assert_eq!(ledger_keys(&ledger).await, keys);
}
