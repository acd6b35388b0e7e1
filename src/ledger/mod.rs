pub mod store;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use uuid::Uuid;

use crate::db::{Isolation, now, ts_to_sql};
use crate::error::{BillingError, Result};

/// Hash the first entry of every wallet chains from.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Credit,
    Debit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferenceKind {
    Deposit,
    Bonus,
    Invoice,
    Refund,
    Adjustment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: String,
    pub user_id: String,
    pub balance: i64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One immutable row of a wallet's transaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub wallet_id: String,
    pub direction: Direction,
    /// Signed: positive for credits, negative for debits.
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub reference_kind: ReferenceKind,
    pub reference_id: String,
    pub description: String,
    pub metadata: serde_json::Value,
    pub prev_hash: String,
    pub entry_hash: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// SHA-256 over the previous hash and every immutable field of the entry.
    pub fn compute_hash(&self) -> String {
        let amount = self.amount.to_string();
        let before = self.balance_before.to_string();
        let after = self.balance_after.to_string();
        let metadata = self.metadata.to_string();
        let created_at = ts_to_sql(&self.created_at);
        let fields: [&str; 12] = [
            &self.prev_hash,
            &self.id,
            &self.wallet_id,
            store::direction_to_str(self.direction),
            &amount,
            &before,
            &after,
            store::reference_kind_to_str(self.reference_kind),
            &self.reference_id,
            &self.description,
            &metadata,
            &created_at,
        ];

        let mut hasher = Sha256::new();
        for part in fields {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        hex::encode(hasher.finalize())
    }
}

/// A requested balance movement. `amount` is always the positive magnitude;
/// the direction comes from the ledger operation.
#[derive(Debug, Clone)]
pub struct Posting {
    pub user_id: String,
    pub amount: i64,
    pub reference_kind: ReferenceKind,
    pub reference_id: String,
    pub description: String,
    pub metadata: serde_json::Value,
}

impl Posting {
    pub fn new(
        user_id: impl Into<String>,
        amount: i64,
        reference_kind: ReferenceKind,
        reference_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            amount,
            reference_kind,
            reference_id: reference_id.into(),
            description: String::new(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Result of re-checking a wallet's log against its balance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerAudit {
    pub user_id: String,
    pub wallet_balance: i64,
    pub entry_sum: i64,
    pub entries_checked: usize,
    pub violations: Vec<String>,
}

impl LedgerAudit {
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Balance ledger. Every mutation runs in a single transaction at the
/// configured isolation, writes exactly one entry and bumps the wallet
/// version.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ledger {
    isolation: Isolation,
}

impl Ledger {
    pub fn new(isolation: Isolation) -> Self {
        Self { isolation }
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    pub fn credit(&self, conn: &mut Connection, posting: &Posting) -> Result<LedgerEntry> {
        let tx = conn
            .transaction_with_behavior(self.isolation.behavior())
            .context("begin credit transaction")?;
        let entry = apply(&tx, Direction::Credit, posting)?;
        tx.commit().context("commit credit")?;
        tracing::debug!(
            user_id = %posting.user_id,
            amount = posting.amount,
            balance_after = entry.balance_after,
            "ledger credit"
        );
        Ok(entry)
    }

    /// Applies several credits in one transaction: all of them land or none
    /// does.
    pub fn credit_all(
        &self,
        conn: &mut Connection,
        postings: &[Posting],
    ) -> Result<Vec<LedgerEntry>> {
        let tx = conn
            .transaction_with_behavior(self.isolation.behavior())
            .context("begin credit transaction")?;
        let mut entries = Vec::with_capacity(postings.len());
        for posting in postings {
            entries.push(apply(&tx, Direction::Credit, posting)?);
        }
        tx.commit().context("commit credits")?;
        Ok(entries)
    }

    pub fn debit(&self, conn: &mut Connection, posting: &Posting) -> Result<LedgerEntry> {
        let tx = conn
            .transaction_with_behavior(self.isolation.behavior())
            .context("begin debit transaction")?;
        let entry = apply(&tx, Direction::Debit, posting)?;
        tx.commit().context("commit debit")?;
        tracing::debug!(
            user_id = %posting.user_id,
            amount = posting.amount,
            balance_after = entry.balance_after,
            "ledger debit"
        );
        Ok(entry)
    }

    /// Credits back the magnitude of a prior debit. A debit can be refunded
    /// at most once.
    pub fn refund(
        &self,
        conn: &mut Connection,
        original_entry_id: &str,
        reason: &str,
    ) -> Result<LedgerEntry> {
        let tx = conn
            .transaction_with_behavior(self.isolation.behavior())
            .context("begin refund transaction")?;

        let original = store::get_entry(&tx, original_entry_id)?
            .ok_or_else(|| BillingError::EntryNotFound(original_entry_id.to_string()))?;
        if original.direction != Direction::Debit {
            return Err(BillingError::InvalidRefund {
                entry_id: original.id,
                reason: "only debits can be refunded".into(),
            });
        }
        if store::entry_exists_for_reference(&tx, ReferenceKind::Refund, &original.id)? {
            return Err(BillingError::InvalidRefund {
                entry_id: original.id,
                reason: "already refunded".into(),
            });
        }
        let user_id = store::wallet_user_id(&tx, &original.wallet_id)?;

        let posting = Posting::new(
            user_id,
            original.amount.abs(),
            ReferenceKind::Refund,
            original.id.clone(),
        )
        .description(format!("Refund: {reason}"))
        .metadata(serde_json::json!({
            "original_reference_kind": original.reference_kind,
            "original_reference_id": original.reference_id,
            "reason": reason,
        }));
        let entry = apply(&tx, Direction::Credit, &posting)?;
        tx.commit().context("commit refund")?;

        tracing::info!(
            original_entry_id,
            amount = entry.amount,
            reason,
            "refunded ledger debit"
        );
        Ok(entry)
    }

    /// Get-or-create.
    pub fn wallet(&self, conn: &mut Connection, user_id: &str) -> Result<Wallet> {
        let tx = conn
            .transaction_with_behavior(self.isolation.behavior())
            .context("begin wallet transaction")?;
        let wallet = store::get_or_create_wallet(&tx, user_id, now())?;
        tx.commit().context("commit wallet")?;
        Ok(wallet)
    }

    pub fn balance(&self, conn: &Connection, user_id: &str) -> Result<i64> {
        Ok(store::find_wallet(conn, user_id)?
            .map(|w| w.balance)
            .unwrap_or(0))
    }

    /// Entries for a user's wallet, oldest first.
    pub fn entries(&self, conn: &Connection, user_id: &str) -> Result<Vec<LedgerEntry>> {
        match store::find_wallet(conn, user_id)? {
            Some(wallet) => Ok(store::list_entries(conn, &wallet.id)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn entries_for_reference(
        &self,
        conn: &Connection,
        kind: ReferenceKind,
        reference_id: &str,
    ) -> Result<Vec<LedgerEntry>> {
        Ok(store::entries_for_reference(conn, kind, reference_id)?)
    }

    pub fn verify(&self, conn: &mut Connection, user_id: &str) -> Result<LedgerAudit> {
        let tx = conn
            .transaction_with_behavior(Isolation::ReadCommitted.behavior())
            .context("begin verify transaction")?;
        let Some(wallet) = store::find_wallet(&tx, user_id)? else {
            return Ok(LedgerAudit {
                user_id: user_id.to_string(),
                ..Default::default()
            });
        };
        let entries = store::list_entries(&tx, &wallet.id)?;
        tx.finish().context("finish verify transaction")?;
        Ok(audit(wallet, &entries))
    }
}

fn apply(conn: &Connection, direction: Direction, posting: &Posting) -> Result<LedgerEntry> {
    if posting.amount <= 0 {
        return Err(BillingError::InvalidAmount {
            amount: posting.amount,
        });
    }

    let now = now();
    let wallet = match direction {
        Direction::Credit => store::get_or_create_wallet(conn, &posting.user_id, now)?,
        Direction::Debit => store::find_wallet(conn, &posting.user_id)?.ok_or_else(|| {
            BillingError::WalletNotFound {
                user_id: posting.user_id.clone(),
            }
        })?,
    };

    let signed = match direction {
        Direction::Credit => posting.amount,
        Direction::Debit => {
            if wallet.balance < posting.amount {
                return Err(BillingError::InsufficientBalance {
                    current: wallet.balance,
                    required: posting.amount,
                });
            }
            -posting.amount
        }
    };
    let balance_after =
        wallet
            .balance
            .checked_add(signed)
            .ok_or(BillingError::InvalidAmount {
                amount: posting.amount,
            })?;

    let prev_hash =
        store::last_entry_hash(conn, &wallet.id)?.unwrap_or_else(|| GENESIS_HASH.to_string());

    let mut entry = LedgerEntry {
        id: Uuid::new_v4().to_string(),
        wallet_id: wallet.id.clone(),
        direction,
        amount: signed,
        balance_before: wallet.balance,
        balance_after,
        reference_kind: posting.reference_kind,
        reference_id: posting.reference_id.clone(),
        description: posting.description.clone(),
        metadata: posting.metadata.clone(),
        prev_hash,
        entry_hash: String::new(),
        created_at: now,
    };
    entry.entry_hash = entry.compute_hash();

    store::update_wallet_balance(conn, &wallet, balance_after, now)?;
    store::insert_entry(conn, &entry)?;
    Ok(entry)
}

fn audit(wallet: Wallet, entries: &[LedgerEntry]) -> LedgerAudit {
    let mut violations = Vec::new();
    let mut expected_prev = GENESIS_HASH.to_string();
    let mut running = 0i64;
    let mut entry_sum = Some(0i64);

    for entry in entries {
        if entry.balance_before.checked_add(entry.amount) != Some(entry.balance_after) {
            violations.push(format!("entry {} is not additive", entry.id));
        }
        entry_sum = entry_sum.and_then(|sum| sum.checked_add(entry.amount));
        if entry.balance_before != running {
            violations.push(format!(
                "entry {} starts at {} but previous balance was {}",
                entry.id, entry.balance_before, running
            ));
        }
        if entry.balance_after < 0 {
            violations.push(format!("entry {} leaves a negative balance", entry.id));
        }
        if entry.prev_hash != expected_prev {
            violations.push(format!("entry {} breaks the hash chain", entry.id));
        }
        if entry.entry_hash != entry.compute_hash() {
            violations.push(format!("entry {} hash does not match its contents", entry.id));
        }
        running = entry.balance_after;
        expected_prev = entry.entry_hash.clone();
    }

    let entry_sum = match entry_sum {
        Some(sum) => {
            if sum != wallet.balance {
                violations.push(format!(
                    "entries sum to {sum} but wallet balance is {}",
                    wallet.balance
                ));
            }
            sum
        }
        None => {
            violations.push("entry amounts overflow when summed".to_string());
            entries
                .iter()
                .fold(0i64, |sum, e| sum.saturating_add(e.amount))
        }
    };

    LedgerAudit {
        user_id: wallet.user_id,
        wallet_balance: wallet.balance,
        entry_sum,
        entries_checked: entries.len(),
        violations,
    }
}
