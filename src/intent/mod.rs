pub mod issuer;
pub mod store;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, Result};

/// Prefix shared by every invoice number; callbacks are routed on it.
pub const INVOICE_PREFIX: &str = "INV-";
pub const DEPOSIT_PREFIX: &str = "DEP-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DepositStatus {
    Pending,
    Paid,
    Expired,
    Failed,
}

impl DepositStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, DepositStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Expired,
    Failed,
    Refund,
}

impl InvoiceStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InvoiceStatus::Pending)
    }
}

/// A request to add funds to a user's wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: String,
    pub user_id: String,
    pub merchant_ref: String,
    pub idempotency_key: String,
    pub amount: i64,
    pub fee: i64,
    /// What the payer is charged: `amount + fee`.
    pub total_amount: i64,
    pub bonus_amount: i64,
    pub total_credit: i64,
    pub status: DepositStatus,
    pub channel: String,
    pub provider_reference: Option<String>,
    pub pay_code: Option<String>,
    pub checkout_url: Option<String>,
    pub expires_at: DateTime<Utc>,
    /// Set exactly once, by whoever wins the settlement claim.
    pub processed_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub needs_reconciliation: bool,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deposit {
    pub fn is_claimed(&self) -> bool {
        self.processed_at.is_some()
    }
}

/// Payment details captured when the payer picks a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSnapshot {
    pub method: String,
    pub channel: String,
    pub code: Option<String>,
    pub url: Option<String>,
    pub fee: i64,
    pub provider_reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub order_id: String,
    pub user_id: String,
    pub invoice_number: String,
    pub amount: i64,
    pub currency: String,
    pub description: Option<String>,
    pub status: InvoiceStatus,
    pub payment: Option<PaymentSnapshot>,
    pub paid_amount: Option<i64>,
    pub paid_at: Option<DateTime<Utc>>,
    pub callback_payload: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub needs_reconciliation: bool,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Rejects invoices that can no longer take a payment.
    pub fn ensure_payable(&self) -> Result<()> {
        match self.status {
            InvoiceStatus::Pending => Ok(()),
            InvoiceStatus::Paid => Err(BillingError::InvoiceAlreadyPaid(self.id.clone())),
            InvoiceStatus::Expired => Err(BillingError::InvoiceExpired(self.id.clone())),
            status => Err(BillingError::InvoiceNotPayable {
                invoice_id: self.id.clone(),
                status: store::invoice_status_to_str(status).to_string(),
            }),
        }
    }

    /// Rejects access when `user_id` is given and does not own the invoice.
    pub fn ensure_owner(&self, user_id: Option<&str>) -> Result<()> {
        match user_id {
            Some(user_id) if user_id != self.user_id => Err(BillingError::AccessDenied),
            _ => Ok(()),
        }
    }
}

/// Audit row for one provider callback against an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    pub invoice_id: String,
    pub amount: Option<i64>,
    pub channel: Option<String>,
    pub provider_reference: String,
    /// Status as reported by the provider.
    pub status: String,
    pub raw_payload: String,
    pub created_at: DateTime<Utc>,
}

/// `INV-YYYYMMDD-XXXXXX`, six random uppercase alphanumerics.
pub fn generate_invoice_number(now: DateTime<Utc>, rng: &mut impl Rng) -> String {
    let suffix: String = rng
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect();
    format!("{INVOICE_PREFIX}{}-{suffix}", now.format("%Y%m%d"))
}

pub fn generate_merchant_ref() -> String {
    format!("{DEPOSIT_PREFIX}{}", uuid::Uuid::new_v4().simple())
}
