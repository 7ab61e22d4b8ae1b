//! affscan-storage: progress store and ledger backends for affscan.
//!
//! Backends:
//! - [`memory`]: in-memory (dev/testing, no persistence)
//! - [`sqlite`]: SQLite via `sqlx` (single-file persistence, feature `sqlite`)
//!
//! Every backend implements both `ProgressStore` and `LedgerSink`, so one
//! handle serves the scanners' cursors and the shared ledger.

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryStorage;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
