use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension as _, Row, params};
use uuid::Uuid;

use super::{Direction, LedgerEntry, ReferenceKind, Wallet};
use crate::db::{ts_from_sql, ts_to_sql};

const WALLET_COLUMNS: &str = "id, user_id, balance, version, created_at, updated_at";

const ENTRY_COLUMNS: &str = r#"
  id,
  wallet_id,
  direction,
  amount,
  balance_before,
  balance_after,
  reference_kind,
  reference_id,
  description,
  metadata,
  prev_hash,
  entry_hash,
  created_at
"#;

pub fn find_wallet(conn: &Connection, user_id: &str) -> Result<Option<Wallet>> {
    conn.query_row(
        &format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE user_id = ?1"),
        params![user_id],
        wallet_from_row,
    )
    .optional()
    .with_context(|| format!("get wallet for user {user_id}"))
}

pub fn get_or_create_wallet(
    conn: &Connection,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<Wallet> {
    conn.execute(
        r#"
INSERT INTO wallets (id, user_id, balance, version, created_at, updated_at)
VALUES (?1, ?2, 0, 0, ?3, ?3)
ON CONFLICT(user_id) DO NOTHING
"#,
        params![Uuid::new_v4().to_string(), user_id, ts_to_sql(&now)],
    )
    .with_context(|| format!("create wallet for user {user_id}"))?;

    find_wallet(conn, user_id)?.with_context(|| format!("wallet missing after create: {user_id}"))
}

pub fn wallet_user_id(conn: &Connection, wallet_id: &str) -> Result<String> {
    conn.query_row(
        "SELECT user_id FROM wallets WHERE id = ?1",
        params![wallet_id],
        |row| row.get(0),
    )
    .with_context(|| format!("get owner of wallet {wallet_id}"))
}

/// Writes the new balance, guarded by the version read in the same
/// transaction.
pub fn update_wallet_balance(
    conn: &Connection,
    wallet: &Wallet,
    balance: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let rows = conn
        .execute(
            r#"
UPDATE wallets
SET balance = ?2, version = version + 1, updated_at = ?4
WHERE id = ?1 AND version = ?3
"#,
            params![wallet.id, balance, wallet.version, ts_to_sql(&now)],
        )
        .with_context(|| format!("update wallet balance {}", wallet.id))?;
    anyhow::ensure!(
        rows == 1,
        "wallet {} was modified concurrently (expected version {})",
        wallet.id,
        wallet.version
    );
    Ok(())
}

pub fn insert_entry(conn: &Connection, entry: &LedgerEntry) -> Result<()> {
    let metadata = serde_json::to_string(&entry.metadata).context("encode entry metadata")?;
    conn.execute(
        &format!(
            "INSERT INTO ledger_entries ({ENTRY_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        params![
            &entry.id,
            &entry.wallet_id,
            direction_to_str(entry.direction),
            entry.amount,
            entry.balance_before,
            entry.balance_after,
            reference_kind_to_str(entry.reference_kind),
            &entry.reference_id,
            &entry.description,
            metadata,
            &entry.prev_hash,
            &entry.entry_hash,
            ts_to_sql(&entry.created_at),
        ],
    )
    .with_context(|| format!("insert ledger entry {}", entry.id))?;
    Ok(())
}

pub fn last_entry_hash(conn: &Connection, wallet_id: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT entry_hash FROM ledger_entries WHERE wallet_id = ?1 ORDER BY rowid DESC LIMIT 1",
        params![wallet_id],
        |row| row.get(0),
    )
    .optional()
    .with_context(|| format!("get last entry hash for wallet {wallet_id}"))
}

pub fn get_entry(conn: &Connection, entry_id: &str) -> Result<Option<LedgerEntry>> {
    conn.query_row(
        &format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE id = ?1"),
        params![entry_id],
        entry_from_row,
    )
    .optional()
    .with_context(|| format!("get ledger entry {entry_id}"))
}

pub fn list_entries(conn: &Connection, wallet_id: &str) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE wallet_id = ?1 ORDER BY rowid"
        ))
        .context("prepare list entries")?;
    let rows = stmt
        .query_map(params![wallet_id], entry_from_row)
        .context("query list entries")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("read ledger entry row")?);
    }
    Ok(out)
}

pub fn entries_for_reference(
    conn: &Connection,
    kind: ReferenceKind,
    reference_id: &str,
) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
             WHERE reference_kind = ?1 AND reference_id = ?2 ORDER BY rowid"
        ))
        .context("prepare entries for reference")?;
    let rows = stmt
        .query_map(
            params![reference_kind_to_str(kind), reference_id],
            entry_from_row,
        )
        .context("query entries for reference")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("read ledger entry row")?);
    }
    Ok(out)
}

pub fn entry_exists_for_reference(
    conn: &Connection,
    kind: ReferenceKind,
    reference_id: &str,
) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM ledger_entries WHERE reference_kind = ?1 AND reference_id = ?2",
            params![reference_kind_to_str(kind), reference_id],
            |row| row.get(0),
        )
        .context("count entries for reference")?;
    Ok(count > 0)
}

fn wallet_from_row(row: &Row<'_>) -> rusqlite::Result<Wallet> {
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(Wallet {
        id: row.get(0)?,
        user_id: row.get(1)?,
        balance: row.get(2)?,
        version: row.get(3)?,
        created_at: ts_from_sql(&created_at, 4)?,
        updated_at: ts_from_sql(&updated_at, 5)?,
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let direction: String = row.get(2)?;
    let reference_kind: String = row.get(6)?;
    let metadata: String = row.get(9)?;
    let created_at: String = row.get(12)?;
    Ok(LedgerEntry {
        id: row.get(0)?,
        wallet_id: row.get(1)?,
        direction: direction_from_str(&direction, 2)?,
        amount: row.get(3)?,
        balance_before: row.get(4)?,
        balance_after: row.get(5)?,
        reference_kind: reference_kind_from_str(&reference_kind, 6)?,
        reference_id: row.get(7)?,
        description: row.get(8)?,
        metadata: serde_json::from_str(&metadata).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?,
        prev_hash: row.get(10)?,
        entry_hash: row.get(11)?,
        created_at: ts_from_sql(&created_at, 12)?,
    })
}

pub fn direction_to_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Credit => "CREDIT",
        Direction::Debit => "DEBIT",
    }
}

fn direction_from_str(s: &str, col: usize) -> rusqlite::Result<Direction> {
    match s {
        "CREDIT" => Ok(Direction::Credit),
        "DEBIT" => Ok(Direction::Debit),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown entry direction: {other}").into(),
        )),
    }
}

pub fn reference_kind_to_str(kind: ReferenceKind) -> &'static str {
    match kind {
        ReferenceKind::Deposit => "DEPOSIT",
        ReferenceKind::Bonus => "BONUS",
        ReferenceKind::Invoice => "INVOICE",
        ReferenceKind::Refund => "REFUND",
        ReferenceKind::Adjustment => "ADJUSTMENT",
    }
}

fn reference_kind_from_str(s: &str, col: usize) -> rusqlite::Result<ReferenceKind> {
    match s {
        "DEPOSIT" => Ok(ReferenceKind::Deposit),
        "BONUS" => Ok(ReferenceKind::Bonus),
        "INVOICE" => Ok(ReferenceKind::Invoice),
        "REFUND" => Ok(ReferenceKind::Refund),
        "ADJUSTMENT" => Ok(ReferenceKind::Adjustment),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown reference kind: {other}").into(),
        )),
    }
}
