use std::sync::Arc;

use anyhow::Context as _;
use serde::Deserialize;
use uuid::Uuid;

use super::{
    Deposit, DepositStatus, Invoice, InvoiceStatus, PaymentSnapshot, generate_invoice_number,
    generate_merchant_ref, store,
};
use crate::config::BillingConfig;
use crate::db::{Database, Isolation, now};
use crate::error::{BillingError, Result};
use crate::notifier::order::{OrderNotifier, OrderPaymentStatus, OrderPaymentUpdate};
use crate::provider::{CustomerInfo, OrderItem, PaymentProvider, TransactionRequest, find_channel};

#[derive(Debug, Clone, Deserialize)]
pub struct NewDeposit {
    pub user_id: String,
    pub amount: i64,
    pub channel: String,
    pub customer: CustomerInfo,
    #[serde(default)]
    pub return_url: Option<String>,
    /// Client-supplied key; a fresh one is generated when absent.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewInvoice {
    pub order_id: String,
    pub user_id: String,
    pub amount: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentRequest {
    pub channel: String,
    /// When present, the invoice must belong to this user.
    #[serde(default)]
    pub user_id: Option<String>,
    pub customer: CustomerInfo,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub return_url: Option<String>,
}

/// Creates deposits and invoices and opens provider transactions for them.
#[derive(Clone)]
pub struct IntentIssuer {
    cfg: BillingConfig,
    db: Database,
    provider: Arc<dyn PaymentProvider>,
    notifier: Arc<dyn OrderNotifier>,
}

impl IntentIssuer {
    pub fn new(
        cfg: BillingConfig,
        db: Database,
        provider: Arc<dyn PaymentProvider>,
        notifier: Arc<dyn OrderNotifier>,
    ) -> Self {
        Self {
            cfg,
            db,
            provider,
            notifier,
        }
    }

    /// Creates a PENDING deposit and a provider transaction for it. If anything
    /// after the insert fails, the row is deleted again before the error is
    /// returned.
    pub async fn create_deposit(&self, req: NewDeposit) -> Result<Deposit> {
        if req.amount <= 0 {
            return Err(BillingError::InvalidAmount { amount: req.amount });
        }
        if req.amount < self.cfg.min_deposit_amount {
            return Err(BillingError::AmountBelowMinimum {
                amount: req.amount,
                minimum: self.cfg.min_deposit_amount,
            });
        }

        let created_at = now();
        let expires_at = created_at
            + chrono::Duration::from_std(self.cfg.deposit_expiry)
                .context("deposit expiry out of range")?;
        let mut deposit = Deposit {
            id: Uuid::new_v4().to_string(),
            user_id: req.user_id.clone(),
            merchant_ref: generate_merchant_ref(),
            idempotency_key: req
                .idempotency_key
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            amount: req.amount,
            fee: 0,
            total_amount: req.amount,
            bonus_amount: 0,
            total_credit: 0,
            status: DepositStatus::Pending,
            channel: req.channel.clone(),
            provider_reference: None,
            pay_code: None,
            checkout_url: None,
            expires_at,
            processed_at: None,
            paid_at: None,
            needs_reconciliation: false,
            failure_reason: None,
            created_at,
            updated_at: created_at,
        };

        let row = deposit.clone();
        let existing = self
            .db
            .run(move |conn| {
                let tx = conn
                    .transaction_with_behavior(Isolation::Serializable.behavior())
                    .context("begin deposit insert transaction")?;
                let existing = store::find_deposit_by_idempotency_key(&tx, &row.idempotency_key)?;
                if existing.is_none() {
                    store::insert_deposit(&tx, &row)?;
                }
                tx.commit().context("commit deposit insert")?;
                Ok(existing)
            })
            .await?;
        if let Some(existing) = existing {
            return replay_deposit(existing, &req);
        }

        match self.open_deposit_transaction(&mut deposit, &req).await {
            Ok(()) => {
                tracing::info!(
                    deposit_id = %deposit.id,
                    user_id = %deposit.user_id,
                    amount = deposit.amount,
                    fee = deposit.fee,
                    channel = %deposit.channel,
                    reference = deposit.provider_reference.as_deref().unwrap_or_default(),
                    "deposit created"
                );
                Ok(deposit)
            }
            Err(err) => {
                let deposit_id = deposit.id.clone();
                let removed = self
                    .db
                    .run(move |conn| Ok(store::delete_pending_deposit(conn, &deposit_id)?))
                    .await;
                match removed {
                    Ok(_) => tracing::warn!(
                        deposit_id = %deposit.id,
                        user_id = %deposit.user_id,
                        error = %err,
                        "deposit rolled back after provider failure"
                    ),
                    Err(cleanup) => tracing::error!(
                        deposit_id = %deposit.id,
                        error = %err,
                        cleanup_error = %cleanup,
                        "failed to roll back deposit"
                    ),
                }
                Err(err)
            }
        }
    }

    async fn open_deposit_transaction(&self, deposit: &mut Deposit, req: &NewDeposit) -> Result<()> {
        let channel = find_channel(self.provider.as_ref(), &req.channel).await?;
        deposit.channel = channel.code.clone();
        deposit.fee = channel.fee_for(deposit.amount);
        deposit.total_amount = deposit
            .amount
            .checked_add(deposit.fee)
            .ok_or(BillingError::InvalidAmount {
                amount: deposit.amount,
            })?;

        let tx = self
            .provider
            .create_transaction(&TransactionRequest {
                method: channel.code.clone(),
                merchant_ref: deposit.merchant_ref.clone(),
                amount: deposit.total_amount,
                customer: req.customer.clone(),
                order_items: vec![OrderItem {
                    sku: Some("DEPOSIT".into()),
                    name: "Balance deposit".into(),
                    price: deposit.total_amount,
                    quantity: 1,
                }],
                return_url: req.return_url.clone(),
                expired_time: deposit.expires_at,
            })
            .await?;

        deposit.provider_reference = Some(tx.reference);
        deposit.pay_code = tx.pay_code;
        deposit.checkout_url = tx.checkout_url;

        let row = deposit.clone();
        self.db
            .run(move |conn| Ok(store::attach_deposit_transaction(conn, &row, now())?))
            .await?;
        Ok(())
    }

    /// Returns the existing invoice when one was already issued for the order.
    pub async fn create_invoice(&self, req: NewInvoice) -> Result<Invoice> {
        if req.amount <= 0 {
            return Err(BillingError::InvalidAmount { amount: req.amount });
        }
        let created_at = now();
        let expires_at = created_at
            + chrono::Duration::from_std(self.cfg.invoice_expiry)
                .context("invoice expiry out of range")?;
        let invoice = Invoice {
            id: Uuid::new_v4().to_string(),
            order_id: req.order_id.clone(),
            user_id: req.user_id,
            invoice_number: generate_invoice_number(created_at, &mut rand::thread_rng()),
            amount: req.amount,
            currency: req
                .currency
                .unwrap_or_else(|| self.cfg.default_currency.clone()),
            description: req.description,
            status: InvoiceStatus::Pending,
            payment: None,
            paid_amount: None,
            paid_at: None,
            callback_payload: None,
            expires_at,
            needs_reconciliation: false,
            failure_reason: None,
            created_at,
            updated_at: created_at,
        };

        let (invoice, created) = self
            .db
            .run(move |conn| {
                let tx = conn
                    .transaction_with_behavior(Isolation::Serializable.behavior())
                    .context("begin invoice transaction")?;
                if let Some(existing) = store::find_invoice_by_order(&tx, &invoice.order_id)? {
                    return Ok((existing, false));
                }
                store::insert_invoice(&tx, &invoice)?;
                tx.commit().context("commit invoice")?;
                Ok((invoice, true))
            })
            .await?;

        if created {
            tracing::info!(
                invoice_id = %invoice.id,
                invoice_number = %invoice.invoice_number,
                order_id = %invoice.order_id,
                amount = invoice.amount,
                "invoice created"
            );
        } else {
            tracing::debug!(order_id = %invoice.order_id, "invoice already exists for order");
        }
        Ok(invoice)
    }

    /// Opens a provider transaction for an existing invoice. The invoice is
    /// never deleted on failure; it stays payable.
    pub async fn initiate_payment(&self, invoice_id: &str, req: PaymentRequest) -> Result<Invoice> {
        let id = invoice_id.to_string();
        let invoice = self
            .db
            .run(move |conn| Ok(store::get_invoice(conn, &id)?))
            .await?
            .ok_or_else(|| BillingError::InvoiceNotFound(invoice_id.to_string()))?;

        invoice.ensure_owner(req.user_id.as_deref())?;
        invoice.ensure_payable()?;
        if invoice.is_overdue(now()) {
            self.expire_invoice(&invoice).await?;
            return Err(BillingError::InvoiceExpired(invoice.id));
        }

        let channel = find_channel(self.provider.as_ref(), &req.channel).await?;
        let fee = channel.fee_for(invoice.amount);
        let amount = invoice
            .amount
            .checked_add(fee)
            .ok_or(BillingError::InvalidAmount {
                amount: invoice.amount,
            })?;
        let order_items = if req.items.is_empty() {
            vec![OrderItem {
                sku: None,
                name: invoice
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("Invoice {}", invoice.invoice_number)),
                price: amount,
                quantity: 1,
            }]
        } else {
            req.items.clone()
        };

        let tx = self
            .provider
            .create_transaction(&TransactionRequest {
                method: channel.code.clone(),
                merchant_ref: invoice.invoice_number.clone(),
                amount,
                customer: req.customer.clone(),
                order_items,
                return_url: req.return_url.clone(),
                expired_time: invoice.expires_at,
            })
            .await?;

        let snapshot = PaymentSnapshot {
            method: channel.name.clone(),
            channel: channel.code.clone(),
            code: tx.pay_code.clone(),
            url: tx.checkout_url.clone(),
            fee,
            provider_reference: tx.reference.clone(),
        };
        let id = invoice.id.clone();
        let stored = snapshot.clone();
        let updated = self
            .db
            .run(move |conn| {
                if !store::set_invoice_payment(conn, &id, &stored, now())? {
                    return Ok(None);
                }
                Ok(store::get_invoice(conn, &id)?)
            })
            .await?;

        let Some(updated) = updated else {
            // settled or expired while the provider call was in flight
            tracing::warn!(
                invoice_id = %invoice.id,
                reference = %tx.reference,
                "invoice left PENDING during payment initiation"
            );
            return Err(BillingError::InvoiceNotPayable {
                invoice_id: invoice.id,
                status: "CLOSED".into(),
            });
        };

        tracing::info!(
            invoice_id = %updated.id,
            channel = %snapshot.channel,
            fee,
            reference = %snapshot.provider_reference,
            "invoice payment initiated"
        );
        Ok(updated)
    }

    async fn expire_invoice(&self, invoice: &Invoice) -> Result<()> {
        let id = invoice.id.clone();
        let expired = self
            .db
            .run(move |conn| {
                Ok(store::close_pending_invoice(
                    conn,
                    &id,
                    InvoiceStatus::Expired,
                    None,
                    now(),
                )?)
            })
            .await?;
        if !expired {
            return Ok(());
        }

        tracing::info!(invoice_id = %invoice.id, "invoice expired on payment attempt");
        let update = OrderPaymentUpdate {
            order_id: invoice.order_id.clone(),
            status: OrderPaymentStatus::Failed,
            reference: invoice.invoice_number.clone(),
            paid_at: None,
        };
        if let Err(err) = self.notifier.notify(&update).await {
            tracing::warn!(
                invoice_id = %invoice.id,
                order_id = %invoice.order_id,
                error = %err,
                "order notification failed"
            );
        }
        Ok(())
    }
}

/// A request that reuses an idempotency key gets the deposit the key already
/// created, provided it asks for the same thing and that deposit has its
/// provider transaction.
fn replay_deposit(existing: Deposit, req: &NewDeposit) -> Result<Deposit> {
    let same_request = existing.user_id == req.user_id
        && existing.amount == req.amount
        && existing.channel.eq_ignore_ascii_case(&req.channel);
    if !same_request || existing.provider_reference.is_none() {
        return Err(BillingError::IdempotencyConflict(existing.idempotency_key));
    }
    tracing::info!(
        deposit_id = %existing.id,
        user_id = %existing.user_id,
        idempotency_key = %existing.idempotency_key,
        "deposit request replayed"
    );
    Ok(existing)
}
