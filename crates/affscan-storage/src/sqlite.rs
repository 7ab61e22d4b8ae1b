//! SQLite storage backend for affscan.
//!
//! Persists scan cursors and the affiliate ledger to a single SQLite file.
//! Decimal amounts are stored as TEXT so no precision is lost.
//!
//! # Usage
//! ```rust,no_run
//! use affscan_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./affscan.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use affscan_core::progress::assert_forward;
use affscan_core::{
    AppendOutcome, CanonicalTransaction, LedgerQuery, LedgerSink, ProgressStore, RecordFlags,
    ScanError, ScanProgress,
};

fn db_err(e: sqlx::Error) -> ScanError {
    ScanError::Storage(e.to_string())
}

/// SQLite-backed cursors and ledger.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./affscan.db"`) or a full
    /// SQLite URL (`"sqlite:./affscan.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, ScanError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(db_err)?;

        let storage = Self { pool };
        storage.init_schema(true).await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every pooled connection to `:memory:` is its own database, so the
    /// pool holds exactly one.
    pub async fn in_memory() -> Result<Self, ScanError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;

        let storage = Self { pool };
        storage.init_schema(false).await?;
        Ok(storage)
    }

    async fn init_schema(&self, wal: bool) -> Result<(), ScanError> {
        if wal {
            sqlx::query("PRAGMA journal_mode=WAL;")
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS scan_progress (
                protocol             TEXT    NOT NULL,
                chain                TEXT    NOT NULL,
                last_processed_block INTEGER NOT NULL,
                updated_at           INTEGER NOT NULL,
                PRIMARY KEY (protocol, chain)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS affiliate_ledger (
                source_protocol               TEXT    NOT NULL,
                chain                         TEXT    NOT NULL,
                tx_id                         TEXT    NOT NULL,
                log_index                     INTEGER NOT NULL,
                block_height                  INTEGER NOT NULL,
                block_time                    INTEGER NOT NULL,
                input_asset                   TEXT    NOT NULL,
                output_asset                  TEXT    NOT NULL,
                input_amount                  TEXT    NOT NULL,
                output_amount                 TEXT    NOT NULL,
                sender                        TEXT    NOT NULL,
                recipient                     TEXT    NOT NULL,
                affiliate_address             TEXT,
                fee_asset                     TEXT,
                fee_amount                    TEXT    NOT NULL,
                expected_fee_bps              INTEGER NOT NULL,
                actual_fee_bps                INTEGER,
                usd_volume                    TEXT,
                usd_fee                       TEXT,
                ingested_at                   INTEGER NOT NULL,
                affiliate_address_unresolved  INTEGER NOT NULL,
                fee_rate_unverifiable         INTEGER NOT NULL,
                fee_rate_mismatch             INTEGER NOT NULL,
                unknown_precision             INTEGER NOT NULL,
                UNIQUE (chain, tx_id, log_index)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ledger_pair ON affiliate_ledger (source_protocol, chain);",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn current(&self, protocol: &str, chain: &str) -> Result<Option<u64>, ScanError> {
        Ok(self
            .get(protocol, chain)
            .await?
            .map(|p| p.last_processed_block))
    }
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

fn decimal(row: &SqliteRow, column: &str) -> Result<Decimal, ScanError> {
    let text: String = row.try_get(column).map_err(db_err)?;
    Decimal::from_str(&text)
        .map_err(|e| ScanError::Storage(format!("column {column} holds '{text}': {e}")))
}

fn opt_decimal(row: &SqliteRow, column: &str) -> Result<Option<Decimal>, ScanError> {
    let text: Option<String> = row.try_get(column).map_err(db_err)?;
    text.map(|t| {
        Decimal::from_str(&t)
            .map_err(|e| ScanError::Storage(format!("column {column} holds '{t}': {e}")))
    })
    .transpose()
}

fn transaction_from_row(row: &SqliteRow) -> Result<CanonicalTransaction, ScanError> {
    Ok(CanonicalTransaction {
        source_protocol: row.try_get("source_protocol").map_err(db_err)?,
        chain: row.try_get("chain").map_err(db_err)?,
        tx_id: row.try_get("tx_id").map_err(db_err)?,
        log_index: row.try_get::<i64, _>("log_index").map_err(db_err)? as u32,
        block_height: row.try_get::<i64, _>("block_height").map_err(db_err)? as u64,
        block_time: row.try_get("block_time").map_err(db_err)?,
        input_asset: row.try_get("input_asset").map_err(db_err)?,
        output_asset: row.try_get("output_asset").map_err(db_err)?,
        input_amount: decimal(row, "input_amount")?,
        output_amount: decimal(row, "output_amount")?,
        sender: row.try_get("sender").map_err(db_err)?,
        recipient: row.try_get("recipient").map_err(db_err)?,
        affiliate_address: row.try_get("affiliate_address").map_err(db_err)?,
        fee_asset: row.try_get("fee_asset").map_err(db_err)?,
        fee_amount: decimal(row, "fee_amount")?,
        expected_fee_bps: row.try_get("expected_fee_bps").map_err(db_err)?,
        actual_fee_bps: row.try_get("actual_fee_bps").map_err(db_err)?,
        usd_volume: opt_decimal(row, "usd_volume")?,
        usd_fee: opt_decimal(row, "usd_fee")?,
        ingested_at: row.try_get("ingested_at").map_err(db_err)?,
        flags: RecordFlags {
            affiliate_address_unresolved: row.try_get("affiliate_address_unresolved").map_err(db_err)?,
            fee_rate_unverifiable: row.try_get("fee_rate_unverifiable").map_err(db_err)?,
            fee_rate_mismatch: row.try_get("fee_rate_mismatch").map_err(db_err)?,
            unknown_precision: row.try_get("unknown_precision").map_err(db_err)?,
            ..Default::default()
        },
    })
}

fn progress_from_row(row: &SqliteRow) -> Result<ScanProgress, ScanError> {
    Ok(ScanProgress {
        protocol: row.try_get("protocol").map_err(db_err)?,
        chain: row.try_get("chain").map_err(db_err)?,
        last_processed_block: row.try_get::<i64, _>("last_processed_block").map_err(db_err)? as u64,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

// ─── ProgressStore impl ──────────────────────────────────────────────────────

#[async_trait]
impl ProgressStore for SqliteStorage {
    async fn get(&self, protocol: &str, chain: &str) -> Result<Option<ScanProgress>, ScanError> {
        let row = sqlx::query(
            "SELECT protocol, chain, last_processed_block, updated_at
             FROM scan_progress WHERE protocol = ? AND chain = ?",
        )
        .bind(protocol)
        .bind(chain)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(progress_from_row).transpose()
    }

    async fn advance(
        &self,
        protocol: &str,
        chain: &str,
        expected: Option<u64>,
        new_last_block: u64,
    ) -> Result<ScanProgress, ScanError> {
        assert_forward(protocol, chain, expected, new_last_block);
        let now = chrono::Utc::now().timestamp();

        // Compare-and-set: the write only lands if the stored value is `expected`.
        let result = match expected {
            Some(prev) => sqlx::query(
                "UPDATE scan_progress SET last_processed_block = ?, updated_at = ?
                 WHERE protocol = ? AND chain = ? AND last_processed_block = ?",
            )
            .bind(new_last_block as i64)
            .bind(now)
            .bind(protocol)
            .bind(chain)
            .bind(prev as i64)
            .execute(&self.pool)
            .await
            .map_err(db_err)?,
            None => sqlx::query(
                "INSERT INTO scan_progress (protocol, chain, last_processed_block, updated_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (protocol, chain) DO NOTHING",
            )
            .bind(protocol)
            .bind(chain)
            .bind(new_last_block as i64)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_err)?,
        };

        if result.rows_affected() != 1 {
            return Err(ScanError::ConcurrentModification {
                protocol: protocol.to_string(),
                chain: chain.to_string(),
                expected,
                found: self.current(protocol, chain).await?,
            });
        }

        debug!(protocol, chain, block = new_last_block, "progress advanced");
        Ok(ScanProgress {
            protocol: protocol.to_string(),
            chain: chain.to_string(),
            last_processed_block: new_last_block,
            updated_at: now,
        })
    }

    async fn reset(&self, protocol: &str, chain: &str, to: Option<u64>) -> Result<(), ScanError> {
        match to {
            Some(block) => {
                sqlx::query(
                    "INSERT OR REPLACE INTO scan_progress
                     (protocol, chain, last_processed_block, updated_at)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(protocol)
                .bind(chain)
                .bind(block as i64)
                .bind(chrono::Utc::now().timestamp())
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
            }
            None => {
                sqlx::query("DELETE FROM scan_progress WHERE protocol = ? AND chain = ?")
                    .bind(protocol)
                    .bind(chain)
                    .execute(&self.pool)
                    .await
                    .map_err(db_err)?;
            }
        }
        debug!(protocol, chain, to = ?to, "progress reset");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ScanProgress>, ScanError> {
        let rows = sqlx::query(
            "SELECT protocol, chain, last_processed_block, updated_at
             FROM scan_progress ORDER BY protocol, chain",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(progress_from_row).collect()
    }
}

// ─── LedgerSink impl ─────────────────────────────────────────────────────────

#[async_trait]
impl LedgerSink for SqliteStorage {
    async fn append(&self, records: &[CanonicalTransaction]) -> Result<AppendOutcome, ScanError> {
        let mut outcome = AppendOutcome::default();
        if records.is_empty() {
            return Ok(outcome);
        }

        let mut dbtx = self.pool.begin().await.map_err(db_err)?;
        for tx in records {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO affiliate_ledger (
                    source_protocol, chain, tx_id, log_index, block_height, block_time,
                    input_asset, output_asset, input_amount, output_amount, sender, recipient,
                    affiliate_address, fee_asset, fee_amount, expected_fee_bps, actual_fee_bps,
                    usd_volume, usd_fee, ingested_at,
                    affiliate_address_unresolved, fee_rate_unverifiable, fee_rate_mismatch,
                    unknown_precision
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&tx.source_protocol)
            .bind(&tx.chain)
            .bind(&tx.tx_id)
            .bind(tx.log_index as i64)
            .bind(tx.block_height as i64)
            .bind(tx.block_time)
            .bind(&tx.input_asset)
            .bind(&tx.output_asset)
            .bind(tx.input_amount.to_string())
            .bind(tx.output_amount.to_string())
            .bind(&tx.sender)
            .bind(&tx.recipient)
            .bind(&tx.affiliate_address)
            .bind(&tx.fee_asset)
            .bind(tx.fee_amount.to_string())
            .bind(tx.expected_fee_bps)
            .bind(tx.actual_fee_bps)
            .bind(tx.usd_volume.map(|d| d.to_string()))
            .bind(tx.usd_fee.map(|d| d.to_string()))
            .bind(tx.ingested_at)
            .bind(tx.flags.affiliate_address_unresolved)
            .bind(tx.flags.fee_rate_unverifiable)
            .bind(tx.flags.fee_rate_mismatch)
            .bind(tx.flags.unknown_precision)
            .execute(&mut *dbtx)
            .await
            .map_err(db_err)?;

            if result.rows_affected() == 1 {
                outcome.inserted += 1;
            } else {
                outcome.duplicates += 1;
            }
        }
        dbtx.commit().await.map_err(db_err)?;

        debug!(inserted = outcome.inserted, duplicates = outcome.duplicates, "ledger append");
        Ok(outcome)
    }

    async fn records(&self, query: &LedgerQuery) -> Result<Vec<CanonicalTransaction>, ScanError> {
        let rows = sqlx::query(
            "SELECT * FROM affiliate_ledger
             WHERE (?1 IS NULL OR source_protocol = ?1) AND (?2 IS NULL OR chain = ?2)
             ORDER BY chain, block_height, tx_id, log_index",
        )
        .bind(query.protocol.as_deref())
        .bind(query.chain.as_deref())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(transaction_from_row).collect()
    }

    async fn count(&self, query: &LedgerQuery) -> Result<u64, ScanError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM affiliate_ledger
             WHERE (?1 IS NULL OR source_protocol = ?1) AND (?2 IS NULL OR chain = ?2)",
        )
        .bind(query.protocol.as_deref())
        .bind(query.chain.as_deref())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let cnt: i64 = row.try_get("cnt").map_err(db_err)?;
        Ok(cnt as u64)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use affscan_core::testing::sample_transaction;

    // ── ProgressStore ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn progress_advance_and_load() {
        let store = SqliteStorage::in_memory().await.unwrap();
        assert!(store.get("portals", "ethereum").await.unwrap().is_none());

        store.advance("portals", "ethereum", None, 104).await.unwrap();
        store.advance("portals", "ethereum", Some(104), 110).await.unwrap();

        let loaded = store.get("portals", "ethereum").await.unwrap().unwrap();
        assert_eq!(loaded.last_processed_block, 110);
    }

    #[tokio::test]
    async fn progress_compare_and_set() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.advance("portals", "ethereum", None, 100).await.unwrap();

        // Stale writer that still believes the pair was never scanned.
        let err = store.advance("portals", "ethereum", None, 120).await.unwrap_err();
        assert!(matches!(
            err,
            ScanError::ConcurrentModification { expected: None, found: Some(100), .. }
        ));

        // Stale writer with an old cursor.
        let err = store.advance("portals", "ethereum", Some(90), 120).await.unwrap_err();
        assert!(matches!(
            err,
            ScanError::ConcurrentModification { expected: Some(90), found: Some(100), .. }
        ));

        assert_eq!(
            store.get("portals", "ethereum").await.unwrap().unwrap().last_processed_block,
            100
        );
    }

    #[tokio::test]
    #[should_panic(expected = "must advance")]
    async fn progress_regression_panics() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.advance("portals", "ethereum", None, 100).await.unwrap();
        let _ = store.advance("portals", "ethereum", Some(100), 100).await;
    }

    #[tokio::test]
    async fn progress_reset_and_list() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.advance("thorswap", "thorchain", None, 500).await.unwrap();
        store.advance("portals", "ethereum", None, 100).await.unwrap();

        store.reset("thorswap", "thorchain", Some(400)).await.unwrap();
        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].protocol, "portals");
        assert_eq!(all[1].last_processed_block, 400);

        store.reset("thorswap", "thorchain", None).await.unwrap();
        assert!(store.get("thorswap", "thorchain").await.unwrap().is_none());
    }

    // ── LedgerSink ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn ledger_roundtrip_keeps_decimals_and_flags() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut tx = sample_transaction("portals", "ethereum", "0xaa", 3, 105);
        tx.usd_volume = Some(Decimal::from_str("1234.567890123456789").unwrap());
        tx.actual_fee_bps = Some(55);
        tx.flags.fee_rate_mismatch = true;

        store.append(&[tx.clone()]).await.unwrap();
        let rows = store.records(&LedgerQuery::all()).await.unwrap();
        assert_eq!(rows, vec![tx]);
    }

    #[tokio::test]
    async fn ledger_first_write_wins() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let original = sample_transaction("portals", "ethereum", "0xaa", 0, 105);
        let mut rewrite = original.clone();
        rewrite.recipient = "0xsomeoneelse".into();

        let first = store.append(&[original.clone(), original.clone()]).await.unwrap();
        assert_eq!(first, AppendOutcome { inserted: 1, duplicates: 1 });
        let second = store.append(&[rewrite]).await.unwrap();
        assert_eq!(second, AppendOutcome { inserted: 0, duplicates: 1 });

        let rows = store.records(&LedgerQuery::all()).await.unwrap();
        assert_eq!(rows, vec![original]);
    }

    #[tokio::test]
    async fn ledger_query_by_pair_is_ordered() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store
            .append(&[
                sample_transaction("portals", "ethereum", "0x02", 0, 11),
                sample_transaction("portals", "ethereum", "0x01", 1, 10),
                sample_transaction("portals", "base", "0x03", 0, 12),
                sample_transaction("thorswap", "thorchain", "AB", 0, 12),
            ])
            .await
            .unwrap();

        let rows = store.records(&LedgerQuery::for_pair("portals", "ethereum")).await.unwrap();
        let heights: Vec<u64> = rows.iter().map(|r| r.block_height).collect();
        assert_eq!(heights, vec![10, 11]);
        assert_eq!(store.count(&LedgerQuery::all()).await.unwrap(), 4);
        assert_eq!(
            store.count(&LedgerQuery::for_pair("thorswap", "thorchain")).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn file_backed_store_persists() {
        let path = std::env::temp_dir().join(format!("affscan-test-{}.db", std::process::id()));
        let path_str = path.to_string_lossy().to_string();
        {
            let store = SqliteStorage::open(&path_str).await.unwrap();
            store
                .append(&[sample_transaction("portals", "ethereum", "0xaa", 0, 105)])
                .await
                .unwrap();
            store.advance("portals", "ethereum", None, 105).await.unwrap();
        }
        let reopened = SqliteStorage::open(&path_str).await.unwrap();
        assert_eq!(reopened.count(&LedgerQuery::all()).await.unwrap(), 1);
        assert_eq!(
            reopened.get("portals", "ethereum").await.unwrap().unwrap().last_processed_block,
            105
        );
        drop(reopened);
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{path_str}{suffix}"));
        }
    }
}
