use std::sync::Arc;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::bonus::BonusPolicy;
use super::{
    BalancePayment, CallbackStatus, IgnoreReason, ProviderCallback, ReconciliationReport,
    Settlement, SettlementOutcome, SweepReport,
};
use crate::db::{Database, Isolation, now};
use crate::error::{BillingError, Result};
use crate::gate::SignatureGate;
use crate::intent::{
    Deposit, DepositStatus, INVOICE_PREFIX, Invoice, InvoiceStatus, PaymentRecord, store,
};
use crate::ledger::{Ledger, LedgerEntry, Posting, ReferenceKind};
use crate::notifier::order::{OrderNotifier, OrderPaymentStatus, OrderPaymentUpdate};

/// Applies provider callbacks to deposits and invoices exactly once.
///
/// Every settlement is a conditional claim followed by the ledger work, in
/// separate transactions. A claim is never released: if the work after it
/// fails, the intent is marked FAILED and flagged for reconciliation.
#[derive(Clone)]
pub struct SettlementEngine {
    db: Database,
    ledger: Ledger,
    gate: Option<SignatureGate>,
    notifier: Arc<dyn OrderNotifier>,
    bonus: BonusPolicy,
}

impl SettlementEngine {
    pub fn new(
        db: Database,
        ledger: Ledger,
        gate: SignatureGate,
        notifier: Arc<dyn OrderNotifier>,
        bonus: BonusPolicy,
    ) -> Self {
        Self {
            db,
            ledger,
            gate: Some(gate),
            notifier,
            bonus,
        }
    }

    /// Engine for sweeps and reconciliation only. It has no callback key, so
    /// every callback handed to it is rejected.
    pub fn maintenance(db: Database, ledger: Ledger, notifier: Arc<dyn OrderNotifier>) -> Self {
        Self {
            db,
            ledger,
            gate: None,
            notifier,
            bonus: BonusPolicy::default(),
        }
    }

    /// Entry point for the provider's webhook. The signature is checked over
    /// the raw bytes before anything is parsed or read from storage.
    pub async fn handle_callback(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<SettlementOutcome> {
        let verified = match &self.gate {
            Some(gate) => gate.verify(raw_body, signature),
            None => Err(BillingError::SignatureInvalid),
        };
        if let Err(err) = verified {
            tracing::warn!(body_len = raw_body.len(), "rejected callback with bad signature");
            return Err(err);
        }
        let callback = ProviderCallback::parse(raw_body)?;
        let raw_payload = String::from_utf8_lossy(raw_body).into_owned();
        self.settle(&callback, raw_payload).await
    }

    /// Routes an authenticated callback to the invoice or deposit path.
    pub async fn settle(
        &self,
        callback: &ProviderCallback,
        raw_payload: String,
    ) -> Result<SettlementOutcome> {
        tracing::info!(
            reference = %callback.reference,
            merchant_ref = %callback.merchant_ref,
            status = callback.status.as_str(),
            "callback received"
        );
        let outcome = if callback.merchant_ref.starts_with(INVOICE_PREFIX) {
            self.settle_invoice(callback, raw_payload).await?
        } else {
            self.settle_deposit(callback).await?
        };
        tracing::debug!(reference = %callback.reference, ?outcome, "callback handled");
        Ok(outcome)
    }

    async fn settle_deposit(&self, callback: &ProviderCallback) -> Result<SettlementOutcome> {
        let reference = callback.reference.clone();
        let merchant_ref = callback.merchant_ref.clone();
        let deposit = self
            .db
            .run(move |conn| {
                Ok(match store::find_deposit_by_reference(conn, &reference)? {
                    Some(d) => Some(d),
                    None => store::find_deposit_by_merchant_ref(conn, &merchant_ref)?,
                })
            })
            .await?;

        let Some(deposit) = deposit else {
            tracing::info!(
                reference = %callback.reference,
                merchant_ref = %callback.merchant_ref,
                "callback for unknown deposit"
            );
            return Ok(SettlementOutcome::Ignored(IgnoreReason::UnknownIntent));
        };
        if deposit.status.is_terminal() || deposit.is_claimed() {
            tracing::debug!(deposit_id = %deposit.id, status = ?deposit.status, "deposit already settled");
            return Ok(SettlementOutcome::Ignored(IgnoreReason::AlreadySettled));
        }

        match callback.status {
            CallbackStatus::Paid => self.credit_deposit(deposit, callback).await,
            CallbackStatus::Expired => {
                self.close_deposit(deposit, DepositStatus::Expired, callback)
                    .await
            }
            CallbackStatus::Failed => {
                self.close_deposit(deposit, DepositStatus::Failed, callback)
                    .await
            }
            CallbackStatus::Refund | CallbackStatus::Unpaid => {
                tracing::info!(
                    deposit_id = %deposit.id,
                    reference = %callback.reference,
                    status = callback.status.as_str(),
                    "deposit callback recorded without transition"
                );
                Ok(SettlementOutcome::Ignored(IgnoreReason::StatusRecorded))
            }
        }
    }

    async fn credit_deposit(
        &self,
        deposit: Deposit,
        callback: &ProviderCallback,
    ) -> Result<SettlementOutcome> {
        let bonus = self.bonus.bonus_for(deposit.amount);
        let total_credit = deposit
            .amount
            .checked_add(bonus)
            .ok_or(BillingError::InvalidAmount {
                amount: deposit.amount,
            })?;

        let deposit_id = deposit.id.clone();
        let claimed = self
            .db
            .run(move |conn| Ok(store::claim_deposit(conn, &deposit_id, now())?))
            .await?;
        if !claimed {
            tracing::info!(deposit_id = %deposit.id, "deposit claimed by another worker");
            return Ok(SettlementOutcome::Ignored(IgnoreReason::ClaimLost));
        }

        if let Some(paid) = callback.total_amount
            && paid != deposit.total_amount
        {
            tracing::warn!(
                deposit_id = %deposit.id,
                expected = deposit.total_amount,
                paid,
                "provider reported a different paid amount"
            );
        }

        let paid_at = callback.paid_at().unwrap_or_else(now);
        let mut postings = vec![
            Posting::new(
                &deposit.user_id,
                deposit.amount,
                ReferenceKind::Deposit,
                &deposit.id,
            )
            .description(format!("Deposit via {}", deposit.channel))
            .metadata(serde_json::json!({
                "reference": callback.reference,
                "merchant_ref": deposit.merchant_ref,
                "channel": deposit.channel,
            })),
        ];
        if bonus > 0 {
            postings.push(
                Posting::new(&deposit.user_id, bonus, ReferenceKind::Bonus, &deposit.id)
                    .description("Deposit bonus")
                    .metadata(serde_json::json!({ "deposit_amount": deposit.amount })),
            );
        }

        let ledger = self.ledger;
        let credited = self
            .db
            .run(move |conn| ledger.credit_all(conn, &postings))
            .await;
        let entries = match credited {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(
                    deposit_id = %deposit.id,
                    reference = %callback.reference,
                    amount = deposit.amount,
                    bonus,
                    error = %err,
                    "ledger credit failed after claim, deposit needs reconciliation"
                );
                let deposit_id = deposit.id.clone();
                let reason = format!("ledger credit failed: {err}");
                if let Err(mark) = self
                    .db
                    .run(move |conn| {
                        Ok(store::fail_claimed_deposit(conn, &deposit_id, &reason, now())?)
                    })
                    .await
                {
                    tracing::error!(
                        deposit_id = %deposit.id,
                        error = %mark,
                        "could not mark deposit failed"
                    );
                }
                return Err(err);
            }
        };

        let deposit_id = deposit.id.clone();
        if let Err(err) = self
            .db
            .run(move |conn| {
                Ok(store::complete_deposit(
                    conn,
                    &deposit_id,
                    bonus,
                    total_credit,
                    paid_at,
                    now(),
                )?)
            })
            .await
        {
            // the credit stands; the deposit stays claimed and shows up in
            // the reconciliation listing
            tracing::error!(
                deposit_id = %deposit.id,
                reference = %callback.reference,
                amount = deposit.amount,
                error = %err,
                "deposit credited but not marked paid"
            );
        }

        let balance_after = entries.last().map(|e| e.balance_after).unwrap_or_default();
        tracing::info!(
            deposit_id = %deposit.id,
            user_id = %deposit.user_id,
            reference = %callback.reference,
            amount = deposit.amount,
            bonus,
            balance_after,
            "deposit settled"
        );
        Ok(SettlementOutcome::Applied(Settlement::DepositCredited {
            deposit_id: deposit.id,
            user_id: deposit.user_id,
            amount: deposit.amount,
            bonus,
            balance_after,
        }))
    }

    async fn close_deposit(
        &self,
        deposit: Deposit,
        status: DepositStatus,
        callback: &ProviderCallback,
    ) -> Result<SettlementOutcome> {
        let deposit_id = deposit.id.clone();
        let reason = callback.note.clone();
        let closed = self
            .db
            .run(move |conn| {
                Ok(store::close_unclaimed_deposit(
                    conn,
                    &deposit_id,
                    status,
                    reason.as_deref(),
                    now(),
                )?)
            })
            .await?;
        if !closed {
            return Ok(SettlementOutcome::Ignored(IgnoreReason::ClaimLost));
        }
        tracing::info!(deposit_id = %deposit.id, ?status, "deposit closed by provider");
        Ok(SettlementOutcome::Applied(Settlement::DepositClosed {
            deposit_id: deposit.id,
            status,
        }))
    }

    async fn settle_invoice(
        &self,
        callback: &ProviderCallback,
        raw_payload: String,
    ) -> Result<SettlementOutcome> {
        let number = callback.merchant_ref.clone();
        let record = PaymentRecord {
            id: Uuid::new_v4().to_string(),
            invoice_id: String::new(),
            amount: callback.amount(),
            channel: callback.payment_method_code.clone(),
            provider_reference: callback.reference.clone(),
            status: callback.status.as_str().to_string(),
            raw_payload: raw_payload.clone(),
            created_at: now(),
        };
        let invoice = self
            .db
            .run(move |conn| {
                let Some(invoice) = store::find_invoice_by_number(conn, &number)? else {
                    return Ok(None);
                };
                store::insert_payment_record(
                    conn,
                    &PaymentRecord {
                        invoice_id: invoice.id.clone(),
                        ..record
                    },
                )?;
                Ok(Some(invoice))
            })
            .await?;

        let Some(invoice) = invoice else {
            tracing::info!(
                reference = %callback.reference,
                merchant_ref = %callback.merchant_ref,
                "callback for unknown invoice"
            );
            return Ok(SettlementOutcome::Ignored(IgnoreReason::UnknownIntent));
        };
        if invoice.status.is_terminal() {
            tracing::debug!(invoice_id = %invoice.id, status = ?invoice.status, "invoice already settled");
            return Ok(SettlementOutcome::Ignored(IgnoreReason::AlreadySettled));
        }

        match callback.status {
            CallbackStatus::Paid => {
                let paid_amount = callback.amount().unwrap_or(invoice.amount);
                let paid_at = callback.paid_at().unwrap_or_else(now);
                let invoice_id = invoice.id.clone();
                let reference = callback.reference.clone();
                let claimed = self
                    .db
                    .run(move |conn| {
                        Ok(store::claim_invoice_paid(
                            conn,
                            &invoice_id,
                            paid_amount,
                            paid_at,
                            &reference,
                            &raw_payload,
                            now(),
                        )?)
                    })
                    .await?;
                if !claimed {
                    tracing::info!(invoice_id = %invoice.id, "invoice claimed by another worker");
                    return Ok(SettlementOutcome::Ignored(IgnoreReason::ClaimLost));
                }

                tracing::info!(
                    invoice_id = %invoice.id,
                    order_id = %invoice.order_id,
                    reference = %callback.reference,
                    paid_amount,
                    "invoice paid"
                );
                self.notify_order(
                    &invoice,
                    OrderPaymentStatus::Paid,
                    &callback.reference,
                    Some(paid_at),
                )
                .await;
                Ok(SettlementOutcome::Applied(Settlement::InvoicePaid {
                    invoice_id: invoice.id,
                    order_id: invoice.order_id,
                    paid_amount,
                }))
            }
            CallbackStatus::Expired => {
                let invoice_id = invoice.id.clone();
                let closed = self
                    .db
                    .run(move |conn| {
                        Ok(store::close_pending_invoice(
                            conn,
                            &invoice_id,
                            InvoiceStatus::Expired,
                            None,
                            now(),
                        )?)
                    })
                    .await?;
                if !closed {
                    return Ok(SettlementOutcome::Ignored(IgnoreReason::ClaimLost));
                }
                tracing::info!(invoice_id = %invoice.id, "invoice expired by provider");
                self.notify_order(
                    &invoice,
                    OrderPaymentStatus::Failed,
                    &callback.reference,
                    None,
                )
                .await;
                Ok(SettlementOutcome::Applied(Settlement::InvoiceExpired {
                    invoice_id: invoice.id,
                    order_id: invoice.order_id,
                }))
            }
            CallbackStatus::Failed | CallbackStatus::Refund | CallbackStatus::Unpaid => {
                tracing::info!(
                    invoice_id = %invoice.id,
                    reference = %callback.reference,
                    status = callback.status.as_str(),
                    "invoice callback recorded without transition"
                );
                Ok(SettlementOutcome::Ignored(IgnoreReason::StatusRecorded))
            }
        }
    }

    /// Pays an invoice out of the user's wallet. The debit runs first; if the
    /// invoice is claimed by someone else in the meantime the debit is
    /// refunded.
    pub async fn pay_invoice_from_balance(
        &self,
        invoice_id: &str,
        user_id: &str,
    ) -> Result<BalancePayment> {
        let id = invoice_id.to_string();
        let invoice = self
            .db
            .run(move |conn| Ok(store::get_invoice(conn, &id)?))
            .await?
            .ok_or_else(|| BillingError::InvoiceNotFound(invoice_id.to_string()))?;
        invoice.ensure_owner(Some(user_id))?;
        invoice.ensure_payable()?;
        if invoice.is_overdue(now()) {
            self.expire_invoices(vec![invoice.clone()]).await?;
            return Err(BillingError::InvoiceExpired(invoice.id));
        }

        let ledger = self.ledger;
        let posting = Posting::new(
            user_id,
            invoice.amount,
            ReferenceKind::Invoice,
            &invoice.id,
        )
        .description(format!("Payment for invoice {}", invoice.invoice_number))
        .metadata(serde_json::json!({
            "invoice_number": invoice.invoice_number,
            "order_id": invoice.order_id,
        }));
        let entry = self
            .db
            .run(move |conn| ledger.debit(conn, &posting))
            .await?;

        let reference = format!("BALANCE-{}", entry.id);
        let payload = serde_json::json!({
            "source": "balance",
            "entry_id": entry.id,
        })
        .to_string();
        let paid_at = entry.created_at;
        let record = PaymentRecord {
            id: Uuid::new_v4().to_string(),
            invoice_id: invoice.id.clone(),
            amount: Some(invoice.amount),
            channel: Some("BALANCE".into()),
            provider_reference: reference.clone(),
            status: CallbackStatus::Paid.as_str().to_string(),
            raw_payload: payload.clone(),
            created_at: paid_at,
        };
        let (invoice_id, amount, r) = (invoice.id.clone(), invoice.amount, reference.clone());
        let claimed = self
            .db
            .run(move |conn| {
                let tx = conn
                    .transaction_with_behavior(Isolation::Serializable.behavior())
                    .context("begin invoice claim transaction")?;
                let claimed =
                    store::claim_invoice_paid(&tx, &invoice_id, amount, paid_at, &r, &payload, now())?;
                if claimed {
                    store::insert_payment_record(&tx, &record)?;
                }
                tx.commit().context("commit invoice claim")?;
                Ok(claimed)
            })
            .await;

        match claimed {
            Ok(true) => {}
            Ok(false) => {
                self.refund_balance_debit(&invoice, &entry, "invoice settled concurrently")
                    .await?;
                let id = invoice.id.clone();
                let current = self
                    .db
                    .run(move |conn| Ok(store::get_invoice(conn, &id)?))
                    .await?
                    .ok_or_else(|| BillingError::InvoiceNotFound(invoice.id.clone()))?;
                current.ensure_payable()?;
                return Err(BillingError::InvoiceNotPayable {
                    invoice_id: current.id,
                    status: "CLOSED".into(),
                });
            }
            Err(err) => {
                tracing::error!(
                    invoice_id = %invoice.id,
                    entry_id = %entry.id,
                    amount = invoice.amount,
                    error = %err,
                    "invoice claim failed after balance debit"
                );
                self.refund_balance_debit(&invoice, &entry, "invoice claim failed")
                    .await?;
                return Err(err);
            }
        }

        tracing::info!(
            invoice_id = %invoice.id,
            user_id,
            amount = invoice.amount,
            balance_after = entry.balance_after,
            "invoice paid from balance"
        );
        self.notify_order(
            &invoice,
            OrderPaymentStatus::Paid,
            &reference,
            Some(paid_at),
        )
        .await;

        let id = invoice.id.clone();
        let invoice = self
            .db
            .run(move |conn| Ok(store::get_invoice(conn, &id)?))
            .await?
            .ok_or_else(|| BillingError::InvoiceNotFound(invoice.id.clone()))?;
        Ok(BalancePayment { invoice, entry })
    }

    /// Gives back a balance debit whose invoice was not claimed. When the
    /// refund itself fails the invoice is flagged for reconciliation and the
    /// refund error is returned.
    async fn refund_balance_debit(
        &self,
        invoice: &Invoice,
        entry: &LedgerEntry,
        reason: &'static str,
    ) -> Result<()> {
        let ledger = self.ledger;
        let entry_id = entry.id.clone();
        let refunded = self
            .db
            .run(move |conn| ledger.refund(conn, &entry_id, reason))
            .await;
        let Err(err) = refunded else {
            tracing::info!(invoice_id = %invoice.id, entry_id = %entry.id, reason, "balance debit refunded");
            return Ok(());
        };

        tracing::error!(
            invoice_id = %invoice.id,
            entry_id = %entry.id,
            amount = invoice.amount,
            error = %err,
            "balance debit could not be refunded"
        );
        let invoice_id = invoice.id.clone();
        let flag = format!("orphaned balance debit {}: {err}", entry.id);
        self.db
            .run(move |conn| {
                Ok(store::flag_invoice_for_reconciliation(
                    conn,
                    &invoice_id,
                    &flag,
                    now(),
                )?)
            })
            .await?;
        Err(err)
    }

    /// Marks overdue PENDING intents EXPIRED. Uses the claim predicates, so a
    /// deposit being settled right now is never expired under it.
    pub async fn expire_overdue(&self, at: DateTime<Utc>) -> Result<SweepReport> {
        let deposits_expired = self
            .db
            .run(move |conn| Ok(store::expire_overdue_deposits(conn, at)?))
            .await?;
        let overdue = self
            .db
            .run(move |conn| Ok(store::list_overdue_invoices(conn, at)?))
            .await?;
        let invoices_expired = self.expire_invoices(overdue).await?;

        let report = SweepReport {
            deposits_expired,
            invoices_expired,
        };
        if report != SweepReport::default() {
            tracing::info!(deposits_expired, invoices_expired, "expiry sweep");
        }
        Ok(report)
    }

    async fn expire_invoices(&self, invoices: Vec<Invoice>) -> Result<usize> {
        let mut expired = 0;
        for invoice in invoices {
            let invoice_id = invoice.id.clone();
            let closed = self
                .db
                .run(move |conn| {
                    Ok(store::close_pending_invoice(
                        conn,
                        &invoice_id,
                        InvoiceStatus::Expired,
                        Some("payment window elapsed"),
                        now(),
                    )?)
                })
                .await?;
            if !closed {
                continue;
            }
            expired += 1;
            tracing::info!(invoice_id = %invoice.id, order_id = %invoice.order_id, "invoice expired");
            self.notify_order(
                &invoice,
                OrderPaymentStatus::Failed,
                &invoice.invoice_number,
                None,
            )
            .await;
        }
        Ok(expired)
    }

    pub async fn reconciliation(&self) -> Result<ReconciliationReport> {
        self.db
            .run(|conn| {
                Ok(ReconciliationReport {
                    deposits: store::list_deposits_needing_reconciliation(conn)?,
                    invoices: store::list_invoices_needing_reconciliation(conn)?,
                })
            })
            .await
    }

    /// Best-effort: a failed notification never undoes a settlement.
    async fn notify_order(
        &self,
        invoice: &Invoice,
        status: OrderPaymentStatus,
        reference: &str,
        paid_at: Option<DateTime<Utc>>,
    ) {
        let update = OrderPaymentUpdate {
            order_id: invoice.order_id.clone(),
            status,
            reference: reference.to_string(),
            paid_at,
        };
        if let Err(err) = self.notifier.notify(&update).await {
            tracing::warn!(
                invoice_id = %invoice.id,
                order_id = %invoice.order_id,
                ?status,
                error = %err,
                "order notification failed"
            );
        }
    }
}
