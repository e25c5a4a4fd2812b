//! Account store: balances, rank points, and the append-only wallet ledger.

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// User wallet account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub balance: i64,
    pub rank_points: i64,
    pub games_played: i64,
    /// Simulation accounts never qualify as winners.
    pub is_synthetic: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Ledger transaction kind. Amounts are signed: debits negative, credits
/// positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    Deposit,
    EntryFee,
    Prize,
    Refund,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Deposit => "deposit",
            LedgerKind::EntryFee => "entry_fee",
            LedgerKind::Prize => "prize",
            LedgerKind::Refund => "refund",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "deposit" => LedgerKind::Deposit,
            "entry_fee" => LedgerKind::EntryFee,
            "prize" => LedgerKind::Prize,
            "refund" => LedgerKind::Refund,
            other => bail!("unknown ledger kind: {other}"),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: String,
    pub cycle_id: Option<String>,
    pub kind: LedgerKind,
    pub amount: i64,
    pub created_at: i64,
}

/// Wallet database manager.
#[derive(Clone)]
pub struct AccountStore {
    conn: Arc<Mutex<Connection>>,
}

impl AccountStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open wallet db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                user_id TEXT PRIMARY KEY,
                balance INTEGER NOT NULL DEFAULT 0,
                rank_points INTEGER NOT NULL DEFAULT 0,
                games_played INTEGER NOT NULL DEFAULT 0,
                is_synthetic INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS wallet_ledger (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                cycle_id TEXT,
                kind TEXT NOT NULL,
                amount INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_wallet_ledger_user_ts
             ON wallet_ledger(user_id, created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_wallet_ledger_cycle
             ON wallet_ledger(cycle_id)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn get_or_create(&self, user_id: &str, now: i64) -> Result<Account> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO accounts (user_id, created_at, updated_at)
             VALUES (?1, ?2, ?2)",
            params![user_id, now],
        )?;
        let mut stmt = conn.prepare_cached(
            "SELECT user_id, balance, rank_points, games_played, is_synthetic, created_at, updated_at
             FROM accounts WHERE user_id = ?1",
        )?;
        let account = stmt.query_row(params![user_id], row_to_account)?;
        Ok(account)
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<Account>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT user_id, balance, rank_points, games_played, is_synthetic, created_at, updated_at
             FROM accounts WHERE user_id = ?1",
        )?;
        let account = stmt
            .query_row(params![user_id], row_to_account)
            .optional()?;
        Ok(account)
    }

    pub async fn mark_synthetic(&self, user_id: &str, synthetic: bool, now: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE accounts SET is_synthetic = ?1, updated_at = ?2 WHERE user_id = ?3",
            params![synthetic as i64, now, user_id],
        )?;
        Ok(())
    }

    pub async fn is_synthetic(&self, user_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT is_synthetic FROM accounts WHERE user_id = ?1")?;
        let flag: Option<i64> = stmt
            .query_row(params![user_id], |row| row.get(0))
            .optional()?;
        Ok(flag.unwrap_or(0) == 1)
    }

    /// Atomic credit plus ledger row. `amount` must be non-negative.
    pub async fn credit(
        &self,
        user_id: &str,
        amount: i64,
        cycle_id: Option<&str>,
        kind: LedgerKind,
        now: i64,
    ) -> Result<()> {
        if amount < 0 {
            bail!("credit amount must be non-negative, got {amount}");
        }
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE accounts SET balance = balance + ?1, updated_at = ?2 WHERE user_id = ?3",
            params![amount, now, user_id],
        )?;
        if changed == 0 {
            bail!("credit target account {user_id} does not exist");
        }
        conn.execute(
            "INSERT INTO wallet_ledger (user_id, cycle_id, kind, amount, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, cycle_id, kind.as_str(), amount, now],
        )?;
        Ok(())
    }

    /// Conditional debit: succeeds only if the balance covers the amount.
    /// Returns false (no side effects) when it does not.
    pub async fn try_debit(
        &self,
        user_id: &str,
        amount: i64,
        cycle_id: Option<&str>,
        kind: LedgerKind,
        now: i64,
    ) -> Result<bool> {
        if amount < 0 {
            bail!("debit amount must be non-negative, got {amount}");
        }
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE accounts SET balance = balance - ?1, updated_at = ?2
             WHERE user_id = ?3 AND balance >= ?1",
            params![amount, now, user_id],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        conn.execute(
            "INSERT INTO wallet_ledger (user_id, cycle_id, kind, amount, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, cycle_id, kind.as_str(), -amount, now],
        )?;
        Ok(true)
    }

    pub async fn add_rank_points(&self, user_id: &str, points: i64, now: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE accounts SET rank_points = rank_points + ?1, updated_at = ?2
             WHERE user_id = ?3",
            params![points, now, user_id],
        )?;
        Ok(())
    }

    /// Participation credit: one game played plus a flat rank award, in a
    /// single increment.
    pub async fn record_game_played(&self, user_id: &str, points: i64, now: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE accounts SET games_played = games_played + 1,
                                 rank_points = rank_points + ?1,
                                 updated_at = ?2
             WHERE user_id = ?3",
            params![points, now, user_id],
        )?;
        Ok(())
    }

    pub async fn balance(&self, user_id: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT balance FROM accounts WHERE user_id = ?1")?;
        let balance: Option<i64> = stmt
            .query_row(params![user_id], |row| row.get(0))
            .optional()?;
        Ok(balance.unwrap_or(0))
    }

    /// All ledger rows attributed to one cycle, oldest first. Used by
    /// reconciliation and tests.
    pub async fn ledger_for_cycle(&self, cycle_id: &str) -> Result<Vec<LedgerEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, cycle_id, kind, amount, created_at
             FROM wallet_ledger WHERE cycle_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![cycle_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, user_id, cycle_id, kind, amount, created_at) = row?;
            out.push(LedgerEntry {
                id,
                user_id,
                cycle_id,
                kind: LedgerKind::parse(&kind)?,
                amount,
                created_at,
            });
        }
        Ok(out)
    }
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        user_id: row.get(0)?,
        balance: row.get(1)?,
        rank_points: row.get(2)?,
        games_played: row.get(3)?,
        is_synthetic: row.get::<_, i64>(4)? == 1,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}
