use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension as _, Row, params};

use super::{Deposit, DepositStatus, Invoice, InvoiceStatus, PaymentRecord, PaymentSnapshot};
use crate::db::{opt_ts_from_sql, ts_from_sql, ts_to_sql};

const DEPOSIT_COLUMNS: &str = r#"
  id,
  user_id,
  merchant_ref,
  idempotency_key,
  amount,
  fee,
  total_amount,
  bonus_amount,
  total_credit,
  status,
  channel,
  provider_reference,
  pay_code,
  checkout_url,
  expires_at,
  processed_at,
  paid_at,
  needs_reconciliation,
  failure_reason,
  created_at,
  updated_at
"#;

const INVOICE_COLUMNS: &str = r#"
  id,
  order_id,
  user_id,
  invoice_number,
  amount,
  currency,
  description,
  status,
  payment_method,
  payment_channel,
  payment_code,
  payment_url,
  fee,
  provider_reference,
  paid_amount,
  paid_at,
  callback_payload,
  expires_at,
  needs_reconciliation,
  failure_reason,
  created_at,
  updated_at
"#;

const PAYMENT_RECORD_COLUMNS: &str =
    "id, invoice_id, amount, channel, provider_reference, status, raw_payload, created_at";

// Deposits

pub fn insert_deposit(conn: &Connection, d: &Deposit) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO deposits ({DEPOSIT_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)"
        ),
        params![
            &d.id,
            &d.user_id,
            &d.merchant_ref,
            &d.idempotency_key,
            d.amount,
            d.fee,
            d.total_amount,
            d.bonus_amount,
            d.total_credit,
            deposit_status_to_str(d.status),
            &d.channel,
            d.provider_reference.as_deref(),
            d.pay_code.as_deref(),
            d.checkout_url.as_deref(),
            ts_to_sql(&d.expires_at),
            d.processed_at.as_ref().map(ts_to_sql),
            d.paid_at.as_ref().map(ts_to_sql),
            d.needs_reconciliation,
            d.failure_reason.as_deref(),
            ts_to_sql(&d.created_at),
            ts_to_sql(&d.updated_at),
        ],
    )
    .with_context(|| format!("insert deposit {}", d.id))?;
    Ok(())
}

/// Compensating delete for a deposit whose provider transaction never
/// materialized. Only an unclaimed PENDING row is removed.
pub fn delete_pending_deposit(conn: &Connection, deposit_id: &str) -> Result<bool> {
    let rows = conn
        .execute(
            "DELETE FROM deposits WHERE id = ?1 AND status = 'PENDING' AND processed_at IS NULL",
            params![deposit_id],
        )
        .with_context(|| format!("delete deposit {deposit_id}"))?;
    Ok(rows == 1)
}

pub fn get_deposit(conn: &Connection, deposit_id: &str) -> Result<Option<Deposit>> {
    conn.query_row(
        &format!("SELECT {DEPOSIT_COLUMNS} FROM deposits WHERE id = ?1"),
        params![deposit_id],
        deposit_from_row,
    )
    .optional()
    .with_context(|| format!("get deposit {deposit_id}"))
}

pub fn find_deposit_by_reference(conn: &Connection, reference: &str) -> Result<Option<Deposit>> {
    conn.query_row(
        &format!("SELECT {DEPOSIT_COLUMNS} FROM deposits WHERE provider_reference = ?1"),
        params![reference],
        deposit_from_row,
    )
    .optional()
    .with_context(|| format!("get deposit by reference {reference}"))
}

pub fn find_deposit_by_merchant_ref(
    conn: &Connection,
    merchant_ref: &str,
) -> Result<Option<Deposit>> {
    conn.query_row(
        &format!("SELECT {DEPOSIT_COLUMNS} FROM deposits WHERE merchant_ref = ?1"),
        params![merchant_ref],
        deposit_from_row,
    )
    .optional()
    .with_context(|| format!("get deposit by merchant ref {merchant_ref}"))
}

pub fn find_deposit_by_idempotency_key(conn: &Connection, key: &str) -> Result<Option<Deposit>> {
    conn.query_row(
        &format!("SELECT {DEPOSIT_COLUMNS} FROM deposits WHERE idempotency_key = ?1"),
        params![key],
        deposit_from_row,
    )
    .optional()
    .with_context(|| format!("get deposit by idempotency key {key}"))
}

pub fn count_deposits_for_user(conn: &Connection, user_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM deposits WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )
    .with_context(|| format!("count deposits for user {user_id}"))
}

/// Persists the channel, fee and provider transaction details of a freshly
/// opened deposit.
pub fn attach_deposit_transaction(conn: &Connection, d: &Deposit, now: DateTime<Utc>) -> Result<()> {
    let rows = conn
        .execute(
            r#"
UPDATE deposits
SET channel = ?2, fee = ?3, total_amount = ?4,
    provider_reference = ?5, pay_code = ?6, checkout_url = ?7, updated_at = ?8
WHERE id = ?1 AND status = 'PENDING'
"#,
            params![
                &d.id,
                &d.channel,
                d.fee,
                d.total_amount,
                d.provider_reference.as_deref(),
                d.pay_code.as_deref(),
                d.checkout_url.as_deref(),
                ts_to_sql(&now),
            ],
        )
        .with_context(|| format!("attach provider transaction to deposit {}", d.id))?;
    anyhow::ensure!(rows == 1, "deposit {} is no longer pending", d.id);
    Ok(())
}

/// The settlement guard. Returns true for exactly one caller per deposit.
pub fn claim_deposit(conn: &Connection, deposit_id: &str, now: DateTime<Utc>) -> Result<bool> {
    let now = ts_to_sql(&now);
    let rows = conn
        .execute(
            r#"
UPDATE deposits
SET processed_at = ?2, updated_at = ?2
WHERE id = ?1 AND processed_at IS NULL AND status = 'PENDING'
"#,
            params![deposit_id, now],
        )
        .with_context(|| format!("claim deposit {deposit_id}"))?;
    Ok(rows == 1)
}

pub fn complete_deposit(
    conn: &Connection,
    deposit_id: &str,
    bonus_amount: i64,
    total_credit: i64,
    paid_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    let rows = conn
        .execute(
            r#"
UPDATE deposits
SET status = 'PAID', bonus_amount = ?2, total_credit = ?3, paid_at = ?4, updated_at = ?5
WHERE id = ?1 AND status = 'PENDING' AND processed_at IS NOT NULL
"#,
            params![
                deposit_id,
                bonus_amount,
                total_credit,
                ts_to_sql(&paid_at),
                ts_to_sql(&now)
            ],
        )
        .with_context(|| format!("complete deposit {deposit_id}"))?;
    anyhow::ensure!(rows == 1, "deposit {deposit_id} not in claimed state");
    Ok(())
}

/// Post-claim failure: the claim stays set and the row is flagged for an
/// operator.
pub fn fail_claimed_deposit(
    conn: &Connection,
    deposit_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        r#"
UPDATE deposits
SET status = 'FAILED', needs_reconciliation = 1, failure_reason = ?2, updated_at = ?3
WHERE id = ?1 AND processed_at IS NOT NULL
"#,
        params![deposit_id, reason, ts_to_sql(&now)],
    )
    .with_context(|| format!("mark deposit {deposit_id} failed"))?;
    Ok(())
}

/// Moves an unclaimed PENDING deposit to a terminal status without settling
/// it. Uses the same predicate as the claim so it cannot overtake one.
pub fn close_unclaimed_deposit(
    conn: &Connection,
    deposit_id: &str,
    status: DepositStatus,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let rows = conn
        .execute(
            r#"
UPDATE deposits
SET status = ?2, failure_reason = COALESCE(?3, failure_reason), updated_at = ?4
WHERE id = ?1 AND processed_at IS NULL AND status = 'PENDING'
"#,
            params![
                deposit_id,
                deposit_status_to_str(status),
                reason,
                ts_to_sql(&now)
            ],
        )
        .with_context(|| format!("close deposit {deposit_id}"))?;
    Ok(rows == 1)
}

pub fn expire_overdue_deposits(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    let now = ts_to_sql(&now);
    conn.execute(
        r#"
UPDATE deposits
SET status = 'EXPIRED', updated_at = ?1
WHERE status = 'PENDING' AND processed_at IS NULL AND expires_at <= ?1
"#,
        params![now],
    )
    .context("expire overdue deposits")
}

/// Deposits flagged after a post-claim failure, plus deposits claimed but
/// never completed.
pub fn list_deposits_needing_reconciliation(conn: &Connection) -> Result<Vec<Deposit>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {DEPOSIT_COLUMNS} FROM deposits \
             WHERE needs_reconciliation = 1 \
                OR (status = 'PENDING' AND processed_at IS NOT NULL) \
             ORDER BY created_at"
        ))
        .context("prepare deposits needing reconciliation")?;
    let rows = stmt
        .query_map([], deposit_from_row)
        .context("query deposits needing reconciliation")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("read deposit row")?);
    }
    Ok(out)
}

// Invoices

pub fn insert_invoice(conn: &Connection, inv: &Invoice) -> Result<()> {
    let payment = inv.payment.as_ref();
    conn.execute(
        &format!(
            "INSERT INTO invoices ({INVOICE_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)"
        ),
        params![
            &inv.id,
            &inv.order_id,
            &inv.user_id,
            &inv.invoice_number,
            inv.amount,
            &inv.currency,
            inv.description.as_deref(),
            invoice_status_to_str(inv.status),
            payment.map(|p| p.method.as_str()),
            payment.map(|p| p.channel.as_str()),
            payment.and_then(|p| p.code.as_deref()),
            payment.and_then(|p| p.url.as_deref()),
            payment.map(|p| p.fee),
            payment.map(|p| p.provider_reference.as_str()),
            inv.paid_amount,
            inv.paid_at.as_ref().map(ts_to_sql),
            inv.callback_payload.as_deref(),
            ts_to_sql(&inv.expires_at),
            inv.needs_reconciliation,
            inv.failure_reason.as_deref(),
            ts_to_sql(&inv.created_at),
            ts_to_sql(&inv.updated_at),
        ],
    )
    .with_context(|| format!("insert invoice {}", inv.id))?;
    Ok(())
}

pub fn get_invoice(conn: &Connection, invoice_id: &str) -> Result<Option<Invoice>> {
    conn.query_row(
        &format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?1"),
        params![invoice_id],
        invoice_from_row,
    )
    .optional()
    .with_context(|| format!("get invoice {invoice_id}"))
}

pub fn find_invoice_by_number(conn: &Connection, number: &str) -> Result<Option<Invoice>> {
    conn.query_row(
        &format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE invoice_number = ?1"),
        params![number],
        invoice_from_row,
    )
    .optional()
    .with_context(|| format!("get invoice by number {number}"))
}

pub fn find_invoice_by_order(conn: &Connection, order_id: &str) -> Result<Option<Invoice>> {
    conn.query_row(
        &format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE order_id = ?1"),
        params![order_id],
        invoice_from_row,
    )
    .optional()
    .with_context(|| format!("get invoice for order {order_id}"))
}

/// Stores the payment snapshot while the invoice is still open. Returns false
/// when the invoice moved on in the meantime.
pub fn set_invoice_payment(
    conn: &Connection,
    invoice_id: &str,
    payment: &PaymentSnapshot,
    now: DateTime<Utc>,
) -> Result<bool> {
    let rows = conn
        .execute(
            r#"
UPDATE invoices
SET payment_method = ?2, payment_channel = ?3, payment_code = ?4, payment_url = ?5,
    fee = ?6, provider_reference = ?7, updated_at = ?8
WHERE id = ?1 AND status = 'PENDING'
"#,
            params![
                invoice_id,
                &payment.method,
                &payment.channel,
                payment.code.as_deref(),
                payment.url.as_deref(),
                payment.fee,
                &payment.provider_reference,
                ts_to_sql(&now),
            ],
        )
        .with_context(|| format!("set payment on invoice {invoice_id}"))?;
    Ok(rows == 1)
}

/// Claims an open invoice as paid. Returns true for exactly one caller.
pub fn claim_invoice_paid(
    conn: &Connection,
    invoice_id: &str,
    paid_amount: i64,
    paid_at: DateTime<Utc>,
    provider_reference: &str,
    callback_payload: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let rows = conn
        .execute(
            r#"
UPDATE invoices
SET status = 'PAID', paid_amount = ?2, paid_at = ?3,
    provider_reference = ?4, callback_payload = ?5, updated_at = ?6
WHERE id = ?1 AND status = 'PENDING'
"#,
            params![
                invoice_id,
                paid_amount,
                ts_to_sql(&paid_at),
                provider_reference,
                callback_payload,
                ts_to_sql(&now),
            ],
        )
        .with_context(|| format!("claim invoice {invoice_id}"))?;
    Ok(rows == 1)
}

pub fn close_pending_invoice(
    conn: &Connection,
    invoice_id: &str,
    status: InvoiceStatus,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let rows = conn
        .execute(
            r#"
UPDATE invoices
SET status = ?2, failure_reason = COALESCE(?3, failure_reason), updated_at = ?4
WHERE id = ?1 AND status = 'PENDING'
"#,
            params![
                invoice_id,
                invoice_status_to_str(status),
                reason,
                ts_to_sql(&now)
            ],
        )
        .with_context(|| format!("close invoice {invoice_id}"))?;
    Ok(rows == 1)
}

pub fn flag_invoice_for_reconciliation(
    conn: &Connection,
    invoice_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        r#"
UPDATE invoices
SET needs_reconciliation = 1, failure_reason = ?2, updated_at = ?3
WHERE id = ?1
"#,
        params![invoice_id, reason, ts_to_sql(&now)],
    )
    .with_context(|| format!("flag invoice {invoice_id}"))?;
    Ok(())
}

pub fn list_overdue_invoices(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<Invoice>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices \
             WHERE status = 'PENDING' AND expires_at <= ?1 ORDER BY expires_at"
        ))
        .context("prepare overdue invoices")?;
    let rows = stmt
        .query_map(params![ts_to_sql(&now)], invoice_from_row)
        .context("query overdue invoices")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("read invoice row")?);
    }
    Ok(out)
}

pub fn list_invoices_needing_reconciliation(conn: &Connection) -> Result<Vec<Invoice>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE needs_reconciliation = 1 ORDER BY created_at"
        ))
        .context("prepare invoices needing reconciliation")?;
    let rows = stmt
        .query_map([], invoice_from_row)
        .context("query invoices needing reconciliation")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("read invoice row")?);
    }
    Ok(out)
}

// Payment records

pub fn insert_payment_record(conn: &Connection, record: &PaymentRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO payment_records ({PAYMENT_RECORD_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        ),
        params![
            &record.id,
            &record.invoice_id,
            record.amount,
            record.channel.as_deref(),
            &record.provider_reference,
            &record.status,
            &record.raw_payload,
            ts_to_sql(&record.created_at),
        ],
    )
    .with_context(|| format!("insert payment record for invoice {}", record.invoice_id))?;
    Ok(())
}

pub fn list_payment_records(conn: &Connection, invoice_id: &str) -> Result<Vec<PaymentRecord>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {PAYMENT_RECORD_COLUMNS} FROM payment_records \
             WHERE invoice_id = ?1 ORDER BY rowid"
        ))
        .context("prepare list payment records")?;
    let rows = stmt
        .query_map(params![invoice_id], payment_record_from_row)
        .context("query payment records")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("read payment record row")?);
    }
    Ok(out)
}

fn deposit_from_row(row: &Row<'_>) -> rusqlite::Result<Deposit> {
    let status: String = row.get(9)?;
    let expires_at: String = row.get(14)?;
    let created_at: String = row.get(19)?;
    let updated_at: String = row.get(20)?;
    Ok(Deposit {
        id: row.get(0)?,
        user_id: row.get(1)?,
        merchant_ref: row.get(2)?,
        idempotency_key: row.get(3)?,
        amount: row.get(4)?,
        fee: row.get(5)?,
        total_amount: row.get(6)?,
        bonus_amount: row.get(7)?,
        total_credit: row.get(8)?,
        status: deposit_status_from_str(&status, 9)?,
        channel: row.get(10)?,
        provider_reference: row.get(11)?,
        pay_code: row.get(12)?,
        checkout_url: row.get(13)?,
        expires_at: ts_from_sql(&expires_at, 14)?,
        processed_at: opt_ts_from_sql(row.get(15)?, 15)?,
        paid_at: opt_ts_from_sql(row.get(16)?, 16)?,
        needs_reconciliation: row.get(17)?,
        failure_reason: row.get(18)?,
        created_at: ts_from_sql(&created_at, 19)?,
        updated_at: ts_from_sql(&updated_at, 20)?,
    })
}

fn invoice_from_row(row: &Row<'_>) -> rusqlite::Result<Invoice> {
    let status: String = row.get(7)?;
    let method: Option<String> = row.get(8)?;
    let provider_reference: Option<String> = row.get(13)?;
    let expires_at: String = row.get(17)?;
    let created_at: String = row.get(20)?;
    let updated_at: String = row.get(21)?;

    let payment = match (method, provider_reference) {
        (Some(method), Some(provider_reference)) => Some(PaymentSnapshot {
            method,
            channel: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
            code: row.get(10)?,
            url: row.get(11)?,
            fee: row.get::<_, Option<i64>>(12)?.unwrap_or(0),
            provider_reference,
        }),
        _ => None,
    };

    Ok(Invoice {
        id: row.get(0)?,
        order_id: row.get(1)?,
        user_id: row.get(2)?,
        invoice_number: row.get(3)?,
        amount: row.get(4)?,
        currency: row.get(5)?,
        description: row.get(6)?,
        status: invoice_status_from_str(&status, 7)?,
        payment,
        paid_amount: row.get(14)?,
        paid_at: opt_ts_from_sql(row.get(15)?, 15)?,
        callback_payload: row.get(16)?,
        expires_at: ts_from_sql(&expires_at, 17)?,
        needs_reconciliation: row.get(18)?,
        failure_reason: row.get(19)?,
        created_at: ts_from_sql(&created_at, 20)?,
        updated_at: ts_from_sql(&updated_at, 21)?,
    })
}

fn payment_record_from_row(row: &Row<'_>) -> rusqlite::Result<PaymentRecord> {
    let created_at: String = row.get(7)?;
    Ok(PaymentRecord {
        id: row.get(0)?,
        invoice_id: row.get(1)?,
        amount: row.get(2)?,
        channel: row.get(3)?,
        provider_reference: row.get(4)?,
        status: row.get(5)?,
        raw_payload: row.get(6)?,
        created_at: ts_from_sql(&created_at, 7)?,
    })
}

pub fn deposit_status_to_str(status: DepositStatus) -> &'static str {
    match status {
        DepositStatus::Pending => "PENDING",
        DepositStatus::Paid => "PAID",
        DepositStatus::Expired => "EXPIRED",
        DepositStatus::Failed => "FAILED",
    }
}

fn deposit_status_from_str(s: &str, col: usize) -> rusqlite::Result<DepositStatus> {
    match s {
        "PENDING" => Ok(DepositStatus::Pending),
        "PAID" => Ok(DepositStatus::Paid),
        "EXPIRED" => Ok(DepositStatus::Expired),
        "FAILED" => Ok(DepositStatus::Failed),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown deposit status: {other}").into(),
        )),
    }
}

pub fn invoice_status_to_str(status: InvoiceStatus) -> &'static str {
    match status {
        InvoiceStatus::Pending => "PENDING",
        InvoiceStatus::Paid => "PAID",
        InvoiceStatus::Expired => "EXPIRED",
        InvoiceStatus::Failed => "FAILED",
        InvoiceStatus::Refund => "REFUND",
    }
}

fn invoice_status_from_str(s: &str, col: usize) -> rusqlite::Result<InvoiceStatus> {
    match s {
        "PENDING" => Ok(InvoiceStatus::Pending),
        "PAID" => Ok(InvoiceStatus::Paid),
        "EXPIRED" => Ok(InvoiceStatus::Expired),
        "FAILED" => Ok(InvoiceStatus::Failed),
        "REFUND" => Ok(InvoiceStatus::Refund),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown invoice status: {other}").into(),
        )),
    }
}
