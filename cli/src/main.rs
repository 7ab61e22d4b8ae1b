//! affscan CLI: run affiliate fee reconciliation and manage scan progress.
//!
//! # Commands
//! ```text
//! affscan run    --config <path>
//! affscan status --config <path>
//! affscan reset  --config <path> --protocol <p> --chain <c> [--to <block>]
//! affscan version
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use affscan_core::{
    CancellationFlag, Consolidator, EngineConfig, LedgerQuery, Orchestrator, PairStats,
    ScanProgress,
};

mod logging;
mod wiring;

#[derive(Parser)]
#[command(
    name = "affscan",
    about = "Multi-chain affiliate fee ingestion and reconciliation",
    long_about = "
affscan scans every configured (protocol, chain) pair from its stored cursor,
decodes affiliate-bearing swaps, validates fee rates against the expected
basis points and appends the results to a deduplicated ledger.

The run summary is printed to stdout as JSON; logs go to stderr.
RUST_LOG overrides the `log` section of the config.
",
    version
)]
struct Cli {
    /// Engine configuration (.yaml / .yml / .json)
    #[arg(short, long, global = true, default_value = "affscan.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan every configured pair once, then consolidate
    Run,

    /// Show the cursor of every pair and ledger totals
    Status,

    /// Move a pair's cursor back for reprocessing
    Reset {
        #[arg(long)]
        protocol: String,
        #[arg(long)]
        chain: String,
        /// New cursor; omit to rescan from the deployment block
        #[arg(long)]
        to: Option<u64>,
    },

    /// Print version
    Version,
}

#[derive(Serialize)]
struct StatusReport {
    progress: Vec<ScanProgress>,
    ledger_rows: u64,
    pairs: Vec<PairStats>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    if let Commands::Version = cli.command {
        println!("affscan {}", env!("CARGO_PKG_VERSION"));
        return Ok(ExitCode::SUCCESS);
    }

    let config = EngineConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init_tracing(&config.log)?;

    match cli.command {
        Commands::Run => cmd_run(&config).await,
        Commands::Status => cmd_status(&config).await,
        Commands::Reset { protocol, chain, to } => cmd_reset(&config, &protocol, &chain, to).await,
        Commands::Version => Ok(ExitCode::SUCCESS),
    }
}

async fn cmd_run(config: &EngineConfig) -> Result<ExitCode> {
    let stores = wiring::open_stores(config).await?;
    let cancel = CancellationFlag::new();
    let jobs = wiring::build_jobs(config, &stores, &cancel)?;

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current chunk");
            on_signal.cancel();
        }
    });

    let orchestrator =
        Orchestrator::new(stores.ledger.clone(), config.max_concurrency).with_cancellation(cancel);
    let summary = orchestrator.run(jobs).await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.all_succeeded() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

async fn cmd_status(config: &EngineConfig) -> Result<ExitCode> {
    let stores = wiring::open_stores(config).await?;
    let report = StatusReport {
        progress: stores.progress.list().await?,
        ledger_rows: stores.ledger.count(&LedgerQuery::all()).await?,
        pairs: Consolidator::new(stores.ledger.clone()).ledger_stats().await?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

async fn cmd_reset(config: &EngineConfig, protocol: &str, chain: &str, to: Option<u64>) -> Result<ExitCode> {
    let known = config
        .scan_plans()
        .iter()
        .any(|p| p.context.protocol == protocol && p.context.chain == chain);
    if !known {
        bail!("{protocol}/{chain} is not a configured pair");
    }

    let stores = wiring::open_stores(config).await?;
    stores.progress.reset(protocol, chain, to).await?;
    info!(protocol, chain, to = ?to, "progress reset");
    match to {
        Some(block) => println!("{protocol}/{chain}: cursor set to {block}"),
        None => println!("{protocol}/{chain}: cursor cleared"),
    }
    Ok(ExitCode::SUCCESS)
}
