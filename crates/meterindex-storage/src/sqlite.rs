//! SQLite storage backend for MeterIndex.
//!
//! Persists consumer heads and ledger transfers to a single SQLite file.
//! Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use meterindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./meterindex.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use meterindex_core::amount::U256;
use meterindex_core::cursor::Head;
use meterindex_core::error::{IndexerError, IntegrityViolation};
use meterindex_core::store::{HeadStore, TransferRepo};
use meterindex_core::types::{BlockRef, Token, Transfer};

fn storage_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// SQLite-backed storage for heads and transfers.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./meterindex.db"`) or a full
    /// SQLite URL (`"sqlite:./meterindex.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Uses a single connection, since every connection to `:memory:` sees
    /// its own database. All data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS heads (
                key        TEXT    PRIMARY KEY,
                num        INTEGER NOT NULL,
                hash       TEXT    NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transfers (
                tx_hash         TEXT    NOT NULL,
                clause_index    INTEGER NOT NULL,
                log_index       INTEGER NOT NULL,
                sender          TEXT    NOT NULL,
                recipient       TEXT    NOT NULL,
                amount          TEXT    NOT NULL,
                token           TEXT    NOT NULL,
                token_address   TEXT,
                block_number    INTEGER NOT NULL,
                block_hash      TEXT    NOT NULL,
                block_timestamp INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_transfers_key
             ON transfers (tx_hash, clause_index, log_index);",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transfers_block ON transfers (block_number);")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(())
    }

    // ─── Transfer queries ────────────────────────────────────────────────────────

    /// Transfers recorded for one block, in key order.
    pub async fn transfers_in_block(&self, block_number: u64) -> Result<Vec<Transfer>, IndexerError> {
        let rows = sqlx::query(
            "SELECT * FROM transfers WHERE block_number = ?
             ORDER BY tx_hash, clause_index, log_index",
        )
        .bind(block_number as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(row_to_transfer).collect()
    }

    pub async fn transfer_count(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM transfers")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;

        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }
}

fn token_tag(token: Token) -> &'static str {
    match token {
        Token::Mtr => "mtr",
        Token::Mtrg => "mtrg",
        Token::Erc20 => "erc20",
    }
}

fn parse_token(tag: &str) -> Result<Token, IndexerError> {
    match tag {
        "mtr" => Ok(Token::Mtr),
        "mtrg" => Ok(Token::Mtrg),
        "erc20" => Ok(Token::Erc20),
        other => Err(IndexerError::Storage(format!("unknown token tag '{other}'"))),
    }
}

fn row_to_transfer(row: &SqliteRow) -> Result<Transfer, IndexerError> {
    let amount: String = row.get("amount");
    let token: String = row.get("token");
    Ok(Transfer {
        from: row.get("sender"),
        to: row.get("recipient"),
        amount: U256::from_str_radix(&amount, 10)
            .map_err(|e| IndexerError::Storage(format!("bad amount '{amount}': {e}")))?,
        token: parse_token(&token)?,
        token_address: row.get("token_address"),
        block: BlockRef {
            number: row.get::<i64, _>("block_number") as u64,
            hash: row.get("block_hash"),
            timestamp: row.get("block_timestamp"),
        },
        tx_hash: row.get("tx_hash"),
        clause_index: row.get::<i64, _>("clause_index") as u32,
        log_index: row.get::<i64, _>("log_index") as u32,
    })
}

fn row_to_head(row: &SqliteRow) -> Head {
    Head::new(
        row.get::<String, _>("key"),
        row.get::<i64, _>("num") as u64,
        row.get::<String, _>("hash"),
    )
}

// ─── HeadStore impl ──────────────────────────────────────────────────────────

#[async_trait]
impl HeadStore for SqliteStorage {
    async fn load(&self, key: &str) -> Result<Option<Head>, IndexerError> {
        let row = sqlx::query("SELECT key, num, hash FROM heads WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(row.as_ref().map(row_to_head))
    }

    async fn save(&self, head: &Head) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let current = sqlx::query("SELECT num FROM heads WHERE key = ?")
            .bind(&head.key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?
            .map(|r| r.get::<i64, _>("num") as u64);

        if let Some(current) = current {
            if head.num < current {
                return Err(IntegrityViolation::HeadRegression {
                    key: head.key.clone(),
                    current,
                    requested: head.num,
                }
                .into());
            }
        }

        sqlx::query(
            "INSERT OR REPLACE INTO heads (key, num, hash, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&head.key)
        .bind(head.num as i64)
        .bind(&head.hash)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;

        debug!(key = %head.key, block = head.num, "head saved");
        Ok(())
    }

    async fn rollback(&self, head: &Head) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO heads (key, num, hash, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&head.key)
        .bind(head.num as i64)
        .bind(&head.hash)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        tracing::warn!(key = %head.key, block = head.num, "head rolled back");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Head>, IndexerError> {
        let rows = sqlx::query("SELECT key, num, hash FROM heads ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(rows.iter().map(row_to_head).collect())
    }
}

// ─── TransferRepo impl ───────────────────────────────────────────────────────

#[async_trait]
impl TransferRepo for SqliteStorage {
    async fn insert_transfers(&self, transfers: &[Transfer]) -> Result<usize, IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let mut inserted = 0;

        for t in transfers {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO transfers
                 (tx_hash, clause_index, log_index, sender, recipient, amount, token,
                  token_address, block_number, block_hash, block_timestamp)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&t.tx_hash)
            .bind(t.clause_index as i64)
            .bind(t.log_index as i64)
            .bind(&t.from)
            .bind(&t.to)
            .bind(t.amount.to_string())
            .bind(token_tag(t.token))
            .bind(&t.token_address)
            .bind(t.block.number as i64)
            .bind(&t.block.hash)
            .bind(t.block.timestamp)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

            inserted += result.rows_affected() as usize;
        }

        tx.commit().await.map_err(storage_err)?;
        debug!(offered = transfers.len(), inserted, "transfers stored");
        Ok(inserted)
    }

    async fn delete_transfers_after(
        &self,
        block_number: u64,
        tokens: &[Token],
    ) -> Result<usize, IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let mut removed = 0;

        for token in tokens {
            let result = sqlx::query("DELETE FROM transfers WHERE block_number > ? AND token = ?")
                .bind(block_number as i64)
                .bind(token_tag(*token))
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            removed += result.rows_affected() as usize;
        }

        tx.commit().await.map_err(storage_err)?;
        debug!(block_number, removed, "transfers rolled back");
        Ok(removed)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
