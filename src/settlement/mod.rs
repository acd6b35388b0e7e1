pub mod bonus;
pub mod engine;

use chrono::{DateTime, SubsecRound as _, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, Result};
use crate::intent::{Deposit, DepositStatus, Invoice};
use crate::ledger::LedgerEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallbackStatus {
    Paid,
    Expired,
    Failed,
    Refund,
    Unpaid,
}

impl CallbackStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CallbackStatus::Paid => "PAID",
            CallbackStatus::Expired => "EXPIRED",
            CallbackStatus::Failed => "FAILED",
            CallbackStatus::Refund => "REFUND",
            CallbackStatus::Unpaid => "UNPAID",
        }
    }
}

/// Payment notification pushed by the provider. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderCallback {
    pub reference: String,
    pub merchant_ref: String,
    pub status: CallbackStatus,
    #[serde(default)]
    pub amount_received: Option<i64>,
    #[serde(default)]
    pub total_amount: Option<i64>,
    #[serde(default)]
    pub payment_method_code: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub paid_at: Option<i64>,
    #[serde(default)]
    pub note: Option<String>,
}

impl ProviderCallback {
    pub fn parse(raw_body: &[u8]) -> Result<Self> {
        let callback: ProviderCallback = serde_json::from_slice(raw_body)
            .map_err(|e| BillingError::InvalidPayload(e.to_string()))?;
        if callback.reference.trim().is_empty() || callback.merchant_ref.trim().is_empty() {
            return Err(BillingError::InvalidPayload(
                "reference and merchant_ref are required".into(),
            ));
        }
        Ok(callback)
    }

    pub fn paid_at(&self) -> Option<DateTime<Utc>> {
        self.paid_at
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|ts| ts.trunc_subsecs(3))
    }

    /// Amount the provider says was paid, if it said.
    pub fn amount(&self) -> Option<i64> {
        self.amount_received.or(self.total_amount)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Settlement {
    DepositCredited {
        deposit_id: String,
        user_id: String,
        amount: i64,
        bonus: i64,
        balance_after: i64,
    },
    DepositClosed {
        deposit_id: String,
        status: DepositStatus,
    },
    InvoicePaid {
        invoice_id: String,
        order_id: String,
        paid_amount: i64,
    },
    InvoiceExpired {
        invoice_id: String,
        order_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// No deposit or invoice matches the callback.
    UnknownIntent,
    /// The intent already reached a terminal status or was claimed.
    AlreadySettled,
    /// Another worker won the conditional claim.
    ClaimLost,
    /// The status carries no transition; it was only recorded.
    StatusRecorded,
}

/// What handling a callback did. Both variants are success for the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Applied(Settlement),
    Ignored(IgnoreReason),
}

impl SettlementOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, SettlementOutcome::Applied(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub deposits_expired: usize,
    pub invoices_expired: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalancePayment {
    pub invoice: Invoice,
    pub entry: LedgerEntry,
}

/// Intents an operator has to look at by hand.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    pub deposits: Vec<Deposit>,
    pub invoices: Vec<Invoice>,
}

impl ReconciliationReport {
    pub fn is_empty(&self) -> bool {
        self.deposits.is_empty() && self.invoices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_callback_and_ignores_unknown_fields() {
        let raw = br#"{
            "reference": "T1234",
            "merchant_ref": "INV-20260101-ABC123",
            "status": "PAID",
            "amount_received": 150000,
            "paid_at": 1767225600,
            "is_closed_payment": 1,
            "fee_merchant": 0
        }"#;
        let cb = ProviderCallback::parse(raw).unwrap();
        assert_eq!(cb.status, CallbackStatus::Paid);
        assert_eq!(cb.amount(), Some(150_000));
        assert_eq!(cb.paid_at().unwrap().timestamp(), 1_767_225_600);
    }

    #[test]
    fn rejects_malformed_callbacks() {
        assert!(matches!(
            ProviderCallback::parse(b"not json"),
            Err(BillingError::InvalidPayload(_))
        ));
        assert!(matches!(
            ProviderCallback::parse(br#"{"reference":"","merchant_ref":"x","status":"PAID"}"#),
            Err(BillingError::InvalidPayload(_))
        ));
        assert!(matches!(
            ProviderCallback::parse(br#"{"reference":"T","merchant_ref":"x","status":"WEIRD"}"#),
            Err(BillingError::InvalidPayload(_))
        ));
    }
}
