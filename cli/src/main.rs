//! meterindex CLI: inspect and manage consumer heads.
//!
//! Usage:
//! ```bash
//! meterindex info     [--config meterindex.json]
//! meterindex heads    --db ./meterindex.db
//! meterindex rollback --db ./meterindex.db --key account --to 1200 [--hash 0x...]
//! ```
//!
//! The SQLite file holds heads and transfer rows only. `rollback` rewinds
//! both; balances and auction state kept elsewhere are rewound through
//! `SyncEngine::rollback` in the process that owns them.

mod logging;

use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::process;

use meterindex_core::types::Token;
use meterindex_core::{Head, HeadStore, IndexerConfig, SyncConfig, TransferRepo};
use meterindex_ledger::{LEDGER_KEY, LEDGER_TOKENS, TOKEN_KEY, TOKEN_TOKENS};
use meterindex_storage::SqliteStorage;

/// Value following `name` in `args`, if present.
fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn required<'a>(args: &'a [String], name: &str) -> Result<&'a str> {
    flag(args, name).ok_or_else(|| anyhow!("missing required argument {name}"))
}

/// Transfer rows written by the consumer named `key`.
fn owned_tokens(key: &str) -> &'static [Token] {
    match key {
        LEDGER_KEY => LEDGER_TOKENS,
        TOKEN_KEY => TOKEN_TOKENS,
        _ => &[],
    }
}

fn load_config(args: &[String]) -> Result<IndexerConfig> {
    match flag(args, "--config") {
        Some(path) => IndexerConfig::from_file(path).with_context(|| format!("loading {path}")),
        None => Ok(IndexerConfig::default()),
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "info" => cmd_info(&args),
        "heads" => cmd_heads(&args).await,
        "rollback" => cmd_rollback(&args).await,
        "version" | "--version" | "-V" => {
            println!("meterindex {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("meterindex {}", env!("CARGO_PKG_VERSION"));
    println!("Block consumers for the Meter explorer\n");
    println!("USAGE:");
    println!("    meterindex <COMMAND> [OPTIONS]\n");
    println!("COMMANDS:");
    println!("    info      Show resolved configuration   [--config FILE]");
    println!("    heads     List consumer heads           --db FILE");
    println!("    rollback  Move a head back and delete the transfers it wrote after it");
    println!("              --db FILE --key KEY --to N [--hash HASH]");
    println!("    version   Print version");
    println!("    help      Print this help");
}

fn cmd_info(args: &[String]) -> Result<()> {
    let config = load_config(args)?;
    let defaults = SyncConfig::default();

    println!("MeterIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default window: {} blocks", defaults.window);
    println!("  Default catch-up interval: {} ms", defaults.fast_forward_interval_ms);
    println!("  Default steady interval: {} ms", defaults.steady_interval_ms);
    println!("  Storage backends: memory, SQLite");
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn cmd_heads(args: &[String]) -> Result<()> {
    let store = SqliteStorage::open(required(args, "--db")?).await?;
    let heads = store.list().await?;
    if heads.is_empty() {
        println!("no heads recorded");
        return Ok(());
    }
    println!("{:<16} {:>12}  HASH", "KEY", "BLOCK");
    for head in heads {
        println!("{:<16} {:>12}  {}", head.key, head.num, head.hash);
    }
    Ok(())
}

async fn cmd_rollback(args: &[String]) -> Result<()> {
    let config = load_config(args)?;
    logging::init_tracing(&config.log);

    let db = required(args, "--db")?;
    let key = required(args, "--key")?;
    let to: u64 = required(args, "--to")?
        .parse()
        .context("--to must be a block number")?;
    let hash = flag(args, "--hash").unwrap_or_default();

    let store = SqliteStorage::open(db).await?;
    let Some(current) = store.load(key).await? else {
        bail!("no head recorded for '{key}'");
    };
    if to > current.num {
        bail!("'{key}' is at block {}, cannot roll forward to {to}", current.num);
    }

    store.rollback(&Head::new(key, to, hash)).await?;
    let removed = store.delete_transfers_after(to, owned_tokens(key)).await?;
    tracing::info!(key, from = current.num, to, removed, "head rolled back");
    println!("{key}: {} -> {to} ({removed} transfers removed)", current.num);
    Ok(())
}
